//! Runtime configuration.
//!
//! Defaults suit a service deployment; each field can be overridden from the
//! environment with `from_env()` or set through the `with_*` builders.

use std::path::PathBuf;
use std::time::Duration;

use crate::launcher::current_executable;

pub const LOCK_WITH_DESKTOP_SWITCHING_ENV: &str = "SLAVEMGR_LOCK_WITH_DESKTOP_SWITCHING";
pub const ACCESS_DIALOG_TIMEOUT_ENV: &str = "SLAVEMGR_ACCESS_DIALOG_TIMEOUT_SECS";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "SLAVEMGR_SHUTDOWN_TIMEOUT_SECS";
pub const SLAVE_EXECUTABLE_ENV: &str = "SLAVEMGR_SLAVE_EXECUTABLE";

/// Master process configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Executable started for every slave (with `--slave <Role>`).
    pub executable: PathBuf,
    /// How long a stopping slave may take to exit before it is killed.
    pub shutdown_timeout: Duration,
}

impl MasterConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            shutdown_timeout: Duration::from_secs(3),
        }
    }

    /// Defaults with the running executable, then environment overrides.
    pub fn from_env() -> std::io::Result<Self> {
        let executable = match std::env::var_os(SLAVE_EXECUTABLE_ENV) {
            Some(path) => PathBuf::from(path),
            None => current_executable()?,
        };
        let mut config = Self::new(executable);
        if let Some(timeout) = secs_from_env(SHUTDOWN_TIMEOUT_ENV) {
            config.shutdown_timeout = timeout;
        }
        Ok(config)
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Policy-layer configuration.
#[derive(Debug, Clone)]
pub struct SlaveManagerConfig {
    /// Run screen lock and full-screen demo on a separate desktop.
    pub lock_with_desktop_switching: bool,
    /// How long `exec_access_dialog` waits for the user's answer.
    pub access_dialog_timeout: Duration,
}

impl Default for SlaveManagerConfig {
    fn default() -> Self {
        Self {
            lock_with_desktop_switching: false,
            access_dialog_timeout: Duration::from_secs(30),
        }
    }
}

impl SlaveManagerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(flag) = flag_from_env(LOCK_WITH_DESKTOP_SWITCHING_ENV) {
            config.lock_with_desktop_switching = flag;
        }
        if let Some(timeout) = secs_from_env(ACCESS_DIALOG_TIMEOUT_ENV) {
            config.access_dialog_timeout = timeout;
        }
        config
    }

    pub fn with_desktop_switching(mut self, enabled: bool) -> Self {
        self.lock_with_desktop_switching = enabled;
        self
    }

    pub fn with_access_dialog_timeout(mut self, timeout: Duration) -> Self {
        self.access_dialog_timeout = timeout;
        self
    }
}

fn flag_from_env(key: &str) -> Option<bool> {
    parse_flag(&std::env::var(key).ok()?)
}

fn secs_from_env(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring non-numeric timeout");
            None
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
