//! SlaveManager: feature-level orchestration on top of [`Master`].
//!
//! Every operation here absorbs its failures: spawn errors, refusals and
//! timeouts are logged and the caller only ever sees a returned value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::bridge::protocol::{Msg, Role, SlaveCommand};
use crate::config::{MasterConfig, SlaveManagerConfig};
use crate::launcher::{LauncherKind, select_launcher};
use crate::master::{Launchers, Master, MessageHandler};
use crate::registry::CreateOutcome;
use crate::session::{InteractiveSession, SystemSession};
use crate::state::{ChoiceFlags, SlaveStates};

/// Routes replies from slaves to the request waiting for them.
#[derive(Default)]
struct ReplyRouter {
    pending_choice: StdMutex<Option<oneshot::Sender<ChoiceFlags>>>,
}

impl ReplyRouter {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<ChoiceFlags>>> {
        self.pending_choice
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn arm(&self, tx: oneshot::Sender<ChoiceFlags>) {
        if self.slot().replace(tx).is_some() {
            tracing::debug!("Discarding stale access dialog reply slot");
        }
    }

    fn disarm(&self) {
        self.slot().take();
    }
}

impl MessageHandler for ReplyRouter {
    fn handle_message(&self, role: Role, msg: &Msg) -> bool {
        if role != Role::AccessDialog {
            return false;
        }
        match SlaveCommand::try_from(msg) {
            Ok(SlaveCommand::ReportChoice { choice_flags }) if choice_flags < 0 => {
                // Negative means the dialog has no answer yet.
                tracing::debug!(choice_flags, "Access dialog reported no choice yet");
                false
            }
            Ok(SlaveCommand::ReportChoice { choice_flags }) => {
                let choice = ChoiceFlags::from_bits(choice_flags);
                match self.slot().take() {
                    Some(tx) => {
                        if tx.send(choice).is_err() {
                            tracing::debug!(?choice, "Access dialog caller gave up before the answer");
                        }
                    }
                    None => {
                        tracing::warn!(?choice, "Access dialog reported a choice nobody asked for");
                    }
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(%role, error = %e, "Malformed message from slave");
                false
            }
        }
    }
}

/// Cleans up an access dialog query whose caller went away mid-wait.
struct PendingDialog<'a> {
    manager: &'a SlaveManager,
    active: bool,
}

impl PendingDialog<'_> {
    fn finish(mut self) {
        self.active = false;
    }
}

impl Drop for PendingDialog<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        tracing::info!("Access dialog query cancelled, stopping dialog");
        self.manager.replies.disarm();
        self.manager
            .master
            .stop_slave_in_background(Role::AccessDialog);
    }
}

pub struct SlaveManager {
    master: Master,
    replies: Arc<ReplyRouter>,
    lock_with_desktop_switching: AtomicBool,
    access_dialog_timeout: Duration,
    /// One access dialog query at a time; later callers queue.
    access_dialog: tokio::sync::Mutex<()>,
}

impl SlaveManager {
    /// Must be called inside a tokio runtime.
    pub fn new(
        master_config: MasterConfig,
        config: SlaveManagerConfig,
        session: Arc<dyn InteractiveSession>,
    ) -> Self {
        Self::with_launchers(master_config, config, session, Launchers::default())
    }

    pub fn with_launchers(
        master_config: MasterConfig,
        config: SlaveManagerConfig,
        session: Arc<dyn InteractiveSession>,
        launchers: Launchers,
    ) -> Self {
        let replies = Arc::new(ReplyRouter::default());
        let master = Master::new(master_config, session, launchers, replies.clone());
        Self {
            master,
            replies,
            lock_with_desktop_switching: AtomicBool::new(config.lock_with_desktop_switching),
            access_dialog_timeout: config.access_dialog_timeout,
            access_dialog: tokio::sync::Mutex::new(()),
        }
    }

    /// Configuration and session from the environment.
    pub fn from_env() -> std::io::Result<Self> {
        Ok(Self::new(
            MasterConfig::from_env()?,
            SlaveManagerConfig::from_env(),
            Arc::new(SystemSession),
        ))
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    pub fn lock_with_desktop_switching(&self) -> bool {
        self.lock_with_desktop_switching.load(Ordering::Relaxed)
    }

    pub fn set_lock_with_desktop_switching(&self, enabled: bool) {
        self.lock_with_desktop_switching
            .store(enabled, Ordering::Relaxed);
    }

    /// A host presenting a demo must not also receive one (feedback loop).
    fn refused_by_demo_server(&self, what: &str) -> bool {
        let running = self.master.is_slave_running(Role::DemoServer);
        if running {
            tracing::info!(operation = what, "Refusing while demo server is running");
        }
        running
    }

    /// Create `role`; true if a live instance exists afterwards.
    async fn ensure_slave(&self, role: Role, launcher: LauncherKind) -> bool {
        match self.master.create_slave(role, launcher).await {
            Ok(CreateOutcome::Spawned | CreateOutcome::AlreadyRunning) => true,
            Ok(CreateOutcome::NoInteractiveUser) => false,
            Err(e) => {
                tracing::error!(%role, error = %e, "Failed to start slave");
                false
            }
        }
    }

    pub async fn start_demo(&self, master_host: &str, fullscreen: bool) {
        if self.refused_by_demo_server("start_demo") {
            return;
        }
        let launcher = select_launcher(
            Role::DemoClient,
            fullscreen,
            self.lock_with_desktop_switching(),
        );
        if !self.ensure_slave(Role::DemoClient, launcher).await {
            return;
        }
        self.master.send_message(
            Role::DemoClient,
            SlaveCommand::StartDemo {
                master_host: master_host.to_string(),
                full_screen: fullscreen,
            },
        );
    }

    pub async fn stop_demo(&self) {
        self.master.stop_slave(Role::DemoClient).await;
    }

    pub async fn lock_screen(&self) {
        if self.refused_by_demo_server("lock_screen") {
            return;
        }
        let launcher = select_launcher(Role::ScreenLock, true, self.lock_with_desktop_switching());
        self.ensure_slave(Role::ScreenLock, launcher).await;
    }

    pub async fn unlock_screen(&self) {
        self.master.stop_slave(Role::ScreenLock).await;
    }

    pub async fn lock_input(&self) {
        self.ensure_slave(Role::InputLock, LauncherKind::Default).await;
    }

    pub async fn unlock_input(&self) {
        self.master.stop_slave(Role::InputLock).await;
    }

    pub async fn start_demo_server(&self, source_port: u16, destination_port: u16, common_secret: &str) {
        if !self.ensure_slave(Role::DemoServer, LauncherKind::Default).await {
            return;
        }
        self.master.send_message(
            Role::DemoServer,
            SlaveCommand::StartDemoServer {
                source_port,
                destination_port,
                common_secret: common_secret.to_string(),
            },
        );
    }

    pub fn update_demo_server_allowed_hosts(&self, allowed_hosts: &[String]) {
        if !self.master.is_slave_running(Role::DemoServer) {
            tracing::debug!("Demo server not running, allowed hosts not sent");
            return;
        }
        self.master.send_message(
            Role::DemoServer,
            SlaveCommand::UpdateAllowedHosts {
                allowed_hosts: allowed_hosts.to_vec(),
            },
        );
    }

    pub async fn stop_demo_server(&self) {
        self.master.stop_slave(Role::DemoServer).await;
    }

    /// Ask the logged-on user whether `user` at `host` may access the desktop.
    ///
    /// Waits for the dialog's answer without blocking message dispatch. If no
    /// answer arrives within the configured timeout the dialog is stopped and
    /// [`ChoiceFlags::DEFAULT_DENY`] is returned; the same applies when the
    /// dialog cannot be shown at all.
    ///
    /// A `ReportChoice` with a negative value is not an answer; the query
    /// keeps waiting. Dropping the returned future stops the dialog.
    pub async fn exec_access_dialog(
        &self,
        user: &str,
        host: &str,
        choice_flags: ChoiceFlags,
    ) -> ChoiceFlags {
        let _one_at_a_time = self.access_dialog.lock().await;

        if !self.ensure_slave(Role::AccessDialog, LauncherKind::Default).await {
            return ChoiceFlags::DEFAULT_DENY;
        }

        // Armed only once the instance that will answer exists, so a reply
        // still queued from an earlier dialog is filtered out as stale.
        let (tx, rx) = oneshot::channel();
        self.replies.arm(tx);
        let pending = PendingDialog {
            manager: self,
            active: true,
        };

        let asked = self.master.send_message(
            Role::AccessDialog,
            SlaveCommand::Ask {
                user: user.to_string(),
                host: host.to_string(),
                choice_flags: choice_flags.bits(),
            },
        );
        if !asked {
            pending.finish();
            self.replies.disarm();
            self.master.stop_slave(Role::AccessDialog).await;
            return ChoiceFlags::DEFAULT_DENY;
        }

        let answer = tokio::time::timeout(self.access_dialog_timeout, rx).await;
        pending.finish();
        match answer {
            Ok(Ok(choice)) => {
                tracing::info!(user, host, ?choice, "Access dialog answered");
                choice
            }
            Ok(Err(_)) => {
                tracing::warn!(user, host, "Access dialog reply slot dropped");
                ChoiceFlags::DEFAULT_DENY
            }
            Err(_) => {
                tracing::warn!(
                    user,
                    host,
                    timeout_secs = self.access_dialog_timeout.as_secs_f64(),
                    "Access dialog timed out, denying"
                );
                self.replies.disarm();
                self.master.stop_slave(Role::AccessDialog).await;
                ChoiceFlags::DEFAULT_DENY
            }
        }
    }

    /// Bitmask of the reported roles whose slave is running right now.
    pub fn slave_state_flags(&self) -> SlaveStates {
        SlaveStates::REPORTED
            .into_iter()
            .filter(|role| self.master.is_slave_running(*role))
            .collect()
    }

    /// Stop every slave. Used when the master itself shuts down.
    pub async fn shutdown(&self) {
        tracing::info!("Stopping all slaves");
        self.master.stop_all().await;
    }
}
