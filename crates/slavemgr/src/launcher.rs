//! Slave launch strategies.
//!
//! A launcher starts the process for a role and hands back its process
//! handle plus the two ends of its channel. Which launcher is used is a pure
//! function of the role and configuration (see [`select_launcher`]).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::bridge::channel::{BoxedReader, BoxedWriter};
use crate::bridge::protocol::Role;

/// Command-line flag selecting slave mode in the slave executable.
pub const SLAVE_FLAG: &str = "--slave";
/// Extra flag passed by the desktop-switching launcher.
pub const DESKTOP_SWITCH_FLAG: &str = "--desktop-switch";
/// Environment variable naming the role of a slave process.
pub const ROLE_ENV: &str = "SLAVEMGR_SLAVE_ROLE";
/// Environment variable naming the desktop a switched slave renders on.
pub const DESKTOP_ENV: &str = "SLAVEMGR_DESKTOP";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    NotCaptured(&'static str),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// What a launcher needs to start one slave.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub role: Role,
    pub executable: PathBuf,
    /// Interactive user the slave should run as, if known.
    pub user: Option<String>,
}

/// Handle to a running slave process.
#[async_trait]
pub trait SlaveProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking liveness check. Reaps the process if it has exited.
    fn has_exited(&mut self) -> bool;

    /// Wait up to `grace` for the process to exit on its own, then force it.
    async fn terminate(&mut self, grace: Duration);
}

/// A started slave: process handle plus the master's ends of its channel.
pub struct LaunchedSlave {
    pub process: Box<dyn SlaveProcess>,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// Strategy for starting slave processes.
pub trait SlaveLauncher: Send + Sync {
    /// Short name, recorded on every instance it starts.
    fn name(&self) -> &'static str;

    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedSlave, SpawnError>;
}

/// Which launcher variant to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    Default,
    DesktopSwitching,
}

/// Pick the launcher variant for `role`.
///
/// Desktop switching only applies to full-screen slaves (screen lock, and a
/// demo client in full-screen mode) and only when configured.
pub fn select_launcher(role: Role, fullscreen: bool, lock_with_desktop_switching: bool) -> LauncherKind {
    let wants_switch = match role {
        Role::ScreenLock => true,
        Role::DemoClient => fullscreen,
        _ => false,
    };
    if wants_switch && lock_with_desktop_switching {
        LauncherKind::DesktopSwitching
    } else {
        LauncherKind::Default
    }
}

/// Starts `<executable> --slave <Role>` as the interactive user with the
/// channel on the child's stdin/stdout.
#[derive(Debug, Default, Clone)]
pub struct DefaultLauncher;

impl DefaultLauncher {
    fn command(&self, request: &LaunchRequest) -> Result<Command, SpawnError> {
        let mut cmd = Command::new(&request.executable);
        cmd.arg(SLAVE_FLAG)
            .arg(request.role.as_str())
            .env(ROLE_ENV, request.role.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            if let Some(user) = &request.user {
                run_as_user(&mut cmd, user)?;
            }
        }

        Ok(cmd)
    }

    fn spawn(&self, mut cmd: Command) -> Result<LaunchedSlave, SpawnError> {
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::NotCaptured("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::NotCaptured("stdout"))?;
        Ok(LaunchedSlave {
            process: Box::new(ChildProcess::new(child)),
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }
}

impl SlaveLauncher for DefaultLauncher {
    fn name(&self) -> &'static str {
        "default"
    }

    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedSlave, SpawnError> {
        let cmd = self.command(request)?;
        tracing::debug!(role = %request.role, executable = %request.executable.display(), "Launching slave");
        self.spawn(cmd)
    }
}

/// Drop privileges to `user` when running privileged. No-op otherwise.
#[cfg(unix)]
fn run_as_user(cmd: &mut Command, user: &str) -> Result<(), SpawnError> {
    use nix::unistd::{User, geteuid};

    if !geteuid().is_root() {
        return Ok(());
    }
    let entry = User::from_name(user)
        .map_err(|e| SpawnError::Other(format!("user lookup for {user}: {e}")))?
        .ok_or_else(|| SpawnError::UnknownUser(user.to_string()))?;
    if entry.uid.is_root() {
        return Ok(());
    }
    cmd.uid(entry.uid.as_raw())
        .gid(entry.gid.as_raw())
        .env("HOME", &entry.dir)
        .env("USER", &entry.name)
        .env("LOGNAME", &entry.name);
    Ok(())
}

/// Starts the slave on a dedicated desktop so it cannot be bypassed by
/// switching away from it. The slave switches back when it exits.
#[derive(Debug, Clone)]
pub struct DesktopSwitchingLauncher {
    inner: DefaultLauncher,
    desktop: String,
}

impl DesktopSwitchingLauncher {
    pub fn new(desktop: impl Into<String>) -> Self {
        Self {
            inner: DefaultLauncher,
            desktop: desktop.into(),
        }
    }

    pub fn desktop(&self) -> &str {
        &self.desktop
    }

    fn command(&self, request: &LaunchRequest) -> Result<Command, SpawnError> {
        let mut cmd = self.inner.command(request)?;
        cmd.arg(DESKTOP_SWITCH_FLAG).env(DESKTOP_ENV, self.desktop());
        Ok(cmd)
    }
}

impl Default for DesktopSwitchingLauncher {
    fn default() -> Self {
        Self::new("slavemgr-secure")
    }
}

impl SlaveLauncher for DesktopSwitchingLauncher {
    fn name(&self) -> &'static str {
        "desktop-switching"
    }

    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedSlave, SpawnError> {
        let cmd = self.command(request)?;
        tracing::debug!(role = %request.role, desktop = %self.desktop, "Launching slave on separate desktop");
        let mut launched = self.inner.spawn(cmd)?;
        launched.process = Box::new(SwitchedProcess {
            inner: launched.process,
            role: request.role,
            desktop: self.desktop.clone(),
        });
        Ok(launched)
    }
}

/// Child process started by tokio.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl SlaveProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "Slave process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll slave process");
                true
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                tracing::debug!(pid, "Slave ignored shutdown, sending SIGTERM");
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(grace, self.child.wait()).await.is_ok()
                {
                    return;
                }
            }
        }

        tracing::warn!(pid = ?self.child.id(), "Killing slave process");
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill slave process");
        }
    }
}

/// Process started on a separate desktop; logs the switch back.
struct SwitchedProcess {
    inner: Box<dyn SlaveProcess>,
    role: Role,
    desktop: String,
}

#[async_trait]
impl SlaveProcess for SwitchedProcess {
    fn id(&self) -> Option<u32> {
        self.inner.id()
    }

    fn has_exited(&mut self) -> bool {
        let exited = self.inner.has_exited();
        if exited {
            tracing::debug!(role = %self.role, desktop = %self.desktop, "Slave left its desktop");
        }
        exited
    }

    async fn terminate(&mut self, grace: Duration) {
        self.inner.terminate(grace).await;
        tracing::debug!(role = %self.role, desktop = %self.desktop, "Switched back to default desktop");
    }
}

/// Path of the running executable, used as the slave executable by default.
pub fn current_executable() -> std::io::Result<PathBuf> {
    std::env::current_exe()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_lock_switches_only_when_configured() {
        assert_eq!(
            select_launcher(Role::ScreenLock, false, true),
            LauncherKind::DesktopSwitching
        );
        assert_eq!(
            select_launcher(Role::ScreenLock, false, false),
            LauncherKind::Default
        );
    }

    #[test]
    fn demo_client_switches_only_in_fullscreen() {
        assert_eq!(
            select_launcher(Role::DemoClient, true, true),
            LauncherKind::DesktopSwitching
        );
        assert_eq!(
            select_launcher(Role::DemoClient, false, true),
            LauncherKind::Default
        );
        assert_eq!(
            select_launcher(Role::DemoClient, true, false),
            LauncherKind::Default
        );
    }

    #[test]
    fn other_roles_never_switch() {
        for role in [Role::AccessDialog, Role::InputLock, Role::DemoServer] {
            assert_eq!(select_launcher(role, true, true), LauncherKind::Default);
        }
    }

    fn request(role: Role) -> LaunchRequest {
        LaunchRequest {
            role,
            executable: PathBuf::from("/usr/bin/slavemgr"),
            user: None,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn env_of(cmd: &Command, key: &str) -> Option<String> {
        cmd.as_std()
            .get_envs()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v)
            .map(|v| v.to_string_lossy().into_owned())
    }

    #[test]
    fn default_command_selects_role() {
        let cmd = DefaultLauncher.command(&request(Role::InputLock)).unwrap();
        assert_eq!(cmd.as_std().get_program(), "/usr/bin/slavemgr");
        assert_eq!(args_of(&cmd), vec!["--slave", "InputLock"]);
        assert_eq!(env_of(&cmd, ROLE_ENV).as_deref(), Some("InputLock"));
        assert_eq!(env_of(&cmd, DESKTOP_ENV), None);
    }

    #[test]
    fn switching_command_names_desktop() {
        let launcher = DesktopSwitchingLauncher::new("lock-desk");
        assert_eq!(launcher.desktop(), "lock-desk");

        let cmd = launcher.command(&request(Role::ScreenLock)).unwrap();
        assert_eq!(
            args_of(&cmd),
            vec!["--slave", "ScreenLock", "--desktop-switch"]
        );
        assert_eq!(env_of(&cmd, ROLE_ENV).as_deref(), Some("ScreenLock"));
        assert_eq!(env_of(&cmd, DESKTOP_ENV).as_deref(), Some("lock-desk"));
        assert_eq!(
            DesktopSwitchingLauncher::default().desktop(),
            "slavemgr-secure"
        );
    }

    #[test]
    fn current_executable_exists() {
        assert!(current_executable().unwrap().exists());
    }

    #[test]
    fn launching_missing_executable_fails() {
        let request = LaunchRequest {
            role: Role::InputLock,
            executable: PathBuf::from("/nonexistent/slavemgr-12345"),
            user: None,
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        assert!(matches!(
            DefaultLauncher.launch(&request),
            Err(SpawnError::Spawn(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_process_terminates_stubborn_child() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut process = ChildProcess::new(child);
        assert!(process.id().is_some());
        assert!(!process.has_exited());

        process.terminate(Duration::from_millis(50)).await;
        assert!(process.has_exited());
    }
}
