//! Registry of live slave instances, one per role.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};

use crate::bridge::channel::{SlaveChannel, SlaveEvent};
use crate::bridge::protocol::{InstanceId, Msg, Role};
use crate::config::MasterConfig;
use crate::launcher::{LaunchRequest, SlaveLauncher, SlaveProcess, SpawnError};

/// Result of a create request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Spawned,
    /// A live instance already existed; nothing was started.
    AlreadyRunning,
    /// Nobody is logged on; interactive slaves are not started.
    NoInteractiveUser,
}

struct SlaveInstance {
    id: InstanceId,
    launcher: &'static str,
    process: Box<dyn SlaveProcess>,
    channel: SlaveChannel,
}

impl SlaveInstance {
    fn release(self) {
        self.channel.close();
    }
}

pub struct SlaveRegistry {
    instances: StdMutex<HashMap<Role, SlaveInstance>>,
    /// Most recently started instance per role, kept after it stops.
    latest: StdMutex<HashMap<Role, InstanceId>>,
    /// Held by `create` and `stop` for one role, so a new process never
    /// starts while the previous one is still exiting.
    lifecycle: HashMap<Role, AsyncMutex<()>>,
    events: mpsc::UnboundedSender<SlaveEvent>,
    executable: PathBuf,
    shutdown_timeout: Duration,
}

impl SlaveRegistry {
    pub fn new(config: &MasterConfig, events: mpsc::UnboundedSender<SlaveEvent>) -> Self {
        Self {
            instances: StdMutex::new(HashMap::new()),
            latest: StdMutex::new(HashMap::new()),
            lifecycle: Role::ALL
                .into_iter()
                .map(|role| (role, AsyncMutex::new(())))
                .collect(),
            events,
            executable: config.executable.clone(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// The lock is never held across an await, so poisoning can only come
    /// from a panicking launcher; the map itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<Role, SlaveInstance>> {
        self.instances.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Slave registry mutex poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    async fn lifecycle(&self, role: Role) -> Option<AsyncMutexGuard<'_, ()>> {
        match self.lifecycle.get(&role) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Start a slave for `role` unless a live one exists.
    ///
    /// Waits for a pending `stop` of the same role to finish first. Launch
    /// happens under the registry lock, so two creates for the same role can
    /// never both spawn. Must be called inside a tokio runtime.
    pub async fn create(
        &self,
        role: Role,
        launcher: &dyn SlaveLauncher,
        user: Option<String>,
    ) -> Result<CreateOutcome, SpawnError> {
        let _lifecycle = self.lifecycle(role).await;
        let mut instances = self.lock();

        if let Some(existing) = instances.get_mut(&role) {
            if !existing.process.has_exited() {
                tracing::debug!(%role, "Slave already running");
                return Ok(CreateOutcome::AlreadyRunning);
            }
            if let Some(stale) = instances.remove(&role) {
                tracing::debug!(%role, instance = %stale.id, "Reaping exited slave before restart");
                stale.release();
            }
        }

        let request = LaunchRequest {
            role,
            executable: self.executable.clone(),
            user,
        };
        let launched = launcher.launch(&request)?;

        let id = InstanceId::new();
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role, id);
        let channel = SlaveChannel::open(
            role,
            id,
            launched.reader,
            launched.writer,
            self.events.clone(),
        );
        tracing::info!(
            %role,
            instance = %id,
            pid = ?launched.process.id(),
            launcher = launcher.name(),
            "Slave started"
        );
        instances.insert(
            role,
            SlaveInstance {
                id,
                launcher: launcher.name(),
                process: launched.process,
                channel,
            },
        );
        Ok(CreateOutcome::Spawned)
    }

    /// Ask the slave to exit, then force it after the shutdown timeout.
    ///
    /// The instance is unregistered before this waits, so `is_running` is
    /// false from here on. A `create` for the same role waits until the old
    /// process is gone.
    pub async fn stop(&self, role: Role) {
        let _lifecycle = self.lifecycle(role).await;
        let Some(instance) = self.lock().remove(&role) else {
            tracing::trace!(%role, "Stop requested for slave that is not running");
            return;
        };
        self.shutdown_instance(role, instance).await;
    }

    pub async fn stop_all(&self) {
        for role in Role::ALL {
            self.stop(role).await;
        }
    }

    async fn shutdown_instance(&self, role: Role, mut instance: SlaveInstance) {
        tracing::debug!(%role, instance = %instance.id, "Stopping slave");
        instance.channel.request_shutdown();
        instance.process.terminate(self.shutdown_timeout).await;
        instance.release();
        tracing::info!(%role, "Slave stopped");
    }

    /// Live check, reconciled with the process state: an exited slave is
    /// unregistered here even if its exit event has not been processed yet.
    pub fn is_running(&self, role: Role) -> bool {
        let mut instances = self.lock();
        Self::reconcile(&mut instances, role)
    }

    pub fn running_roles(&self) -> BTreeSet<Role> {
        let mut instances = self.lock();
        let roles: Vec<Role> = instances.keys().copied().collect();
        roles
            .into_iter()
            .filter(|role| Self::reconcile(&mut instances, *role))
            .collect()
    }

    fn reconcile(instances: &mut HashMap<Role, SlaveInstance>, role: Role) -> bool {
        let Some(instance) = instances.get_mut(&role) else {
            return false;
        };
        if !instance.process.has_exited() {
            return true;
        }
        if let Some(exited) = instances.remove(&role) {
            tracing::info!(%role, instance = %exited.id, "Slave process has exited");
            exited.release();
        }
        false
    }

    /// Queue `msg` for the slave. Logged no-op if the role is not running.
    pub fn send(&self, role: Role, msg: Msg) -> bool {
        let mut instances = self.lock();
        if !Self::reconcile(&mut instances, role) {
            tracing::warn!(%role, cmd = msg.cmd(), "Not sending message to slave that is not running");
            return false;
        }
        let Some(instance) = instances.get(&role) else {
            return false;
        };
        let sent = instance.channel.send(msg);
        if !sent {
            tracing::warn!(%role, "Slave channel closed, message dropped");
        }
        sent
    }

    /// Unregister `instance` after its channel ended. A newer instance of the
    /// same role is left alone. Returns true if something was removed.
    pub fn reap(&self, role: Role, instance: InstanceId) -> bool {
        let mut instances = self.lock();
        if instances.get(&role).map(|i| i.id) != Some(instance) {
            return false;
        }
        match instances.remove(&role) {
            Some(exited) => {
                exited.release();
                true
            }
            None => false,
        }
    }

    /// Name of the launcher that started the current instance of `role`.
    pub fn launcher_of(&self, role: Role) -> Option<&'static str> {
        self.lock().get(&role).map(|i| i.launcher)
    }

    pub fn instance_of(&self, role: Role) -> Option<InstanceId> {
        self.lock().get(&role).map(|i| i.id)
    }

    /// True unless a newer instance of `role` has been started since
    /// `instance`. An instance that exited but was not replaced still counts.
    pub fn is_latest(&self, role: Role, instance: InstanceId) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            == Some(&instance)
    }
}
