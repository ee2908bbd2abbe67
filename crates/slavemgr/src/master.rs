//! Master - slave lifecycle façade and inbound message dispatch.
//!
//! Flow:
//! 1. `create_slave` checks the interactive session, picks a launcher and
//!    registers the new instance with its channel
//! 2. Channel reader tasks post inbound messages and disconnects to one
//!    event loop
//! 3. The event loop hands each message to the single [`MessageHandler`]
//!    in receipt order and reaps instances whose channel ended

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::channel::SlaveEvent;
use crate::bridge::protocol::{Msg, Role};
use crate::config::MasterConfig;
use crate::launcher::{
    DefaultLauncher, DesktopSwitchingLauncher, LauncherKind, SlaveLauncher, SpawnError,
};
use crate::registry::{CreateOutcome, SlaveRegistry};
use crate::session::InteractiveSession;

/// Receives every message sent by any slave.
pub trait MessageHandler: Send + Sync {
    /// Returns true if the message was consumed.
    fn handle_message(&self, role: Role, msg: &Msg) -> bool;
}

/// The launcher variants available to the master.
#[derive(Clone)]
pub struct Launchers {
    pub default: Arc<dyn SlaveLauncher>,
    pub desktop_switching: Arc<dyn SlaveLauncher>,
}

impl Default for Launchers {
    fn default() -> Self {
        Self {
            default: Arc::new(DefaultLauncher),
            desktop_switching: Arc::new(DesktopSwitchingLauncher::default()),
        }
    }
}

impl Launchers {
    fn get(&self, kind: LauncherKind) -> &Arc<dyn SlaveLauncher> {
        match kind {
            LauncherKind::Default => &self.default,
            LauncherKind::DesktopSwitching => &self.desktop_switching,
        }
    }
}

pub struct Master {
    registry: Arc<SlaveRegistry>,
    session: Arc<dyn InteractiveSession>,
    launchers: Launchers,
    event_loop: JoinHandle<()>,
}

impl Master {
    /// Create the master and start its event loop. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: MasterConfig,
        session: Arc<dyn InteractiveSession>,
        launchers: Launchers,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SlaveRegistry::new(&config, events_tx));
        let event_loop = tokio::spawn(run_event_loop(events_rx, Arc::clone(&registry), handler));
        Self {
            registry,
            session,
            launchers,
            event_loop,
        }
    }

    /// Start the slave for `role` with the given launcher variant.
    ///
    /// Interactive slaves are only started while a user is logged on, so
    /// nothing ever pops up on a login screen.
    pub async fn create_slave(
        &self,
        role: Role,
        launcher: LauncherKind,
    ) -> Result<CreateOutcome, SpawnError> {
        let user = if role.is_interactive() {
            match self.session.logged_on_user() {
                Some(user) => Some(user),
                None => {
                    tracing::info!(%role, "Not creating slave as no user is logged on");
                    return Ok(CreateOutcome::NoInteractiveUser);
                }
            }
        } else {
            None
        };
        self.registry
            .create(role, self.launchers.get(launcher).as_ref(), user)
            .await
    }

    pub async fn stop_slave(&self, role: Role) {
        self.registry.stop(role).await;
    }

    /// Stop `role` on a detached task. For callers that cannot await, such
    /// as drop guards.
    pub fn stop_slave_in_background(&self, role: Role) {
        let registry = Arc::clone(&self.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { registry.stop(role).await });
            }
            Err(_) => {
                tracing::warn!(%role, "No runtime to stop slave on, leaving it to kill_on_drop");
            }
        }
    }

    pub async fn stop_all(&self) {
        self.registry.stop_all().await;
    }

    /// Queue a message for `role`. Returns false (and logs) if it is not running.
    pub fn send_message(&self, role: Role, msg: impl Into<Msg>) -> bool {
        self.registry.send(role, msg.into())
    }

    pub fn is_slave_running(&self, role: Role) -> bool {
        self.registry.is_running(role)
    }

    pub fn running_slaves(&self) -> BTreeSet<Role> {
        self.registry.running_roles()
    }

    /// Name of the launcher that started the live instance of `role`.
    pub fn launcher_of(&self, role: Role) -> Option<&'static str> {
        self.registry.launcher_of(role)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<SlaveEvent>,
    registry: Arc<SlaveRegistry>,
    handler: Arc<dyn MessageHandler>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SlaveEvent::Message { role, instance, msg } => {
                if !registry.is_latest(role, instance) {
                    tracing::debug!(%role, %instance, cmd = msg.cmd(), "Dropping message from replaced slave instance");
                    continue;
                }
                tracing::trace!(%role, %instance, cmd = msg.cmd(), "Dispatching slave message");
                if !handler.handle_message(role, &msg) {
                    tracing::warn!(%role, cmd = msg.cmd(), "Unhandled message from slave, dropping");
                }
            }
            SlaveEvent::Disconnected { role, instance } => {
                if registry.reap(role, instance) {
                    tracing::info!(%role, %instance, "Slave exited");
                }
            }
        }
    }
    tracing::debug!("Master event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::session::StaticSession;
    use crate::test_support::FakeLauncher;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(Role, String)>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(&self, role: Role, msg: &Msg) -> bool {
            self.seen.lock().unwrap().push((role, msg.cmd().to_string()));
            msg.cmd() != "Ignored"
        }
    }

    struct Fixture {
        master: Master,
        default: Arc<FakeLauncher>,
        switching: Arc<FakeLauncher>,
        recorder: Arc<Recorder>,
    }

    fn fixture(session: StaticSession) -> Fixture {
        let default = Arc::new(FakeLauncher::new("fake-default"));
        let switching = Arc::new(FakeLauncher::new("fake-switching"));
        let recorder = Arc::new(Recorder::default());
        let master = Master::new(
            MasterConfig::new("/usr/bin/slavemgr").with_shutdown_timeout(Duration::from_millis(200)),
            Arc::new(session),
            Launchers {
                default: default.clone(),
                desktop_switching: switching.clone(),
            },
            recorder.clone(),
        );
        Fixture {
            master,
            default,
            switching,
            recorder,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn no_logged_on_user_means_no_slave() {
        let f = fixture(StaticSession::nobody());
        assert_eq!(
            f.master
                .create_slave(Role::ScreenLock, LauncherKind::Default)
                .await
                .unwrap(),
            CreateOutcome::NoInteractiveUser
        );
        assert_eq!(f.default.spawn_count(), 0);
        assert!(!f.master.is_slave_running(Role::ScreenLock));
    }

    #[tokio::test]
    async fn core_server_ignores_session_state() {
        let f = fixture(StaticSession::nobody());
        assert_eq!(
            f.master
                .create_slave(Role::CoreServer, LauncherKind::Default)
                .await
                .unwrap(),
            CreateOutcome::Spawned
        );
    }

    #[tokio::test]
    async fn launcher_variant_is_recorded() {
        let f = fixture(StaticSession::logged_on("alice"));
        f.master
            .create_slave(Role::ScreenLock, LauncherKind::DesktopSwitching)
            .await
            .unwrap();
        f.master
            .create_slave(Role::InputLock, LauncherKind::Default)
            .await
            .unwrap();

        assert_eq!(f.master.launcher_of(Role::ScreenLock), Some("fake-switching"));
        assert_eq!(f.master.launcher_of(Role::InputLock), Some("fake-default"));
        assert_eq!(f.switching.spawn_count(), 1);
        assert_eq!(f.default.spawn_count(), 1);
    }

    #[tokio::test]
    async fn messages_are_delivered_in_send_order() {
        let f = fixture(StaticSession::logged_on("alice"));
        f.master
            .create_slave(Role::DemoServer, LauncherKind::Default)
            .await
            .unwrap();
        for i in 0..5i64 {
            assert!(f.master.send_message(Role::DemoServer, Msg::new("Step").with_arg("N", i)));
        }

        let slave = f.default.slave(Role::DemoServer).unwrap();
        let received = slave.wait_for_messages(5).await;
        let order: Vec<i64> = received
            .iter()
            .filter_map(|m| m.arg("N").and_then(|v| v.as_i64()))
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn send_to_missing_role_does_not_spawn() {
        let f = fixture(StaticSession::logged_on("alice"));
        assert!(!f.master.send_message(Role::DemoClient, Msg::new("StartDemo")));
        assert_eq!(f.default.spawn_count(), 0);
        assert!(f.master.running_slaves().is_empty());
    }

    #[tokio::test]
    async fn inbound_messages_reach_the_handler() {
        let f = fixture(StaticSession::logged_on("alice"));
        f.master
            .create_slave(Role::AccessDialog, LauncherKind::Default)
            .await
            .unwrap();
        let slave = f.default.slave(Role::AccessDialog).unwrap();
        slave.reply(Msg::new("First"));
        slave.reply(Msg::new("Ignored"));

        let recorder = f.recorder.clone();
        assert!(eventually(|| recorder.seen.lock().unwrap().len() == 2).await);
        assert_eq!(
            *f.recorder.seen.lock().unwrap(),
            vec![
                (Role::AccessDialog, "First".to_string()),
                (Role::AccessDialog, "Ignored".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn crashed_slave_is_reaped_by_the_event_loop() {
        let f = fixture(StaticSession::logged_on("alice"));
        f.master
            .create_slave(Role::InputLock, LauncherKind::Default)
            .await
            .unwrap();
        f.default.slave(Role::InputLock).unwrap().crash();

        let master = &f.master;
        assert!(eventually(|| master.launcher_of(Role::InputLock).is_none()).await);
        assert!(!f.master.is_slave_running(Role::InputLock));
    }

    #[tokio::test]
    async fn messages_from_replaced_instances_are_dropped() {
        let (registry_tx, _registry_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SlaveRegistry::new(
            &MasterConfig::new("/usr/bin/slavemgr").with_shutdown_timeout(Duration::from_millis(200)),
            registry_tx,
        ));
        let launcher = FakeLauncher::new("fake");
        registry.create(Role::AccessDialog, &launcher, None).await.unwrap();
        let old = registry.instance_of(Role::AccessDialog).unwrap();
        registry.stop(Role::AccessDialog).await;
        registry.create(Role::AccessDialog, &launcher, None).await.unwrap();
        let current = registry.instance_of(Role::AccessDialog).unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        for (instance, cmd) in [(old, "Late"), (current, "Fresh")] {
            events_tx
                .send(SlaveEvent::Message {
                    role: Role::AccessDialog,
                    instance,
                    msg: Msg::new(cmd),
                })
                .unwrap();
        }
        drop(events_tx);

        let recorder = Arc::new(Recorder::default());
        run_event_loop(events_rx, Arc::clone(&registry), recorder.clone()).await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![(Role::AccessDialog, "Fresh".to_string())]
        );
    }

    #[tokio::test]
    async fn background_stop_unregisters_slave() {
        let f = fixture(StaticSession::logged_on("alice"));
        f.master
            .create_slave(Role::AccessDialog, LauncherKind::Default)
            .await
            .unwrap();
        f.master.stop_slave_in_background(Role::AccessDialog);

        let master = &f.master;
        assert!(eventually(|| !master.is_slave_running(Role::AccessDialog)).await);
        let slave = f.default.slave(Role::AccessDialog).unwrap();
        assert!(eventually(|| !slave.is_alive()).await);
        assert!(slave.saw_shutdown());
    }

    #[tokio::test]
    async fn stop_then_running_is_false() {
        let f = fixture(StaticSession::logged_on("alice"));
        f.master
            .create_slave(Role::DemoClient, LauncherKind::Default)
            .await
            .unwrap();
        assert!(f.master.is_slave_running(Role::DemoClient));

        f.master.stop_slave(Role::DemoClient).await;
        assert!(!f.master.is_slave_running(Role::DemoClient));
        assert!(f.default.slave(Role::DemoClient).unwrap().saw_shutdown());
    }
}
