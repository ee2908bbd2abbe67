//! slavemgr: supervisor for short-lived interactive helper processes.
//!
//! A privileged master starts one helper ("slave") per role in the
//! interactive user's session and exchanges typed messages with it.

pub mod bridge;
pub mod config;
pub mod launcher;
mod logging;
pub mod manager;
pub mod master;
pub mod registry;
pub mod session;
pub mod slave;
mod state;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{Msg, Role, Scalar, SlaveCommand};
pub use config::{MasterConfig, SlaveManagerConfig};
pub use launcher::{
    DefaultLauncher, DesktopSwitchingLauncher, LauncherKind, SlaveLauncher, SpawnError,
};
pub use logging::init_tracing;
pub use manager::SlaveManager;
pub use master::{Launchers, Master, MessageHandler};
pub use registry::CreateOutcome;
pub use session::{InteractiveSession, StaticSession, SystemSession};
pub use slave::{HeadlessSlave, SlaveContext, SlaveHandler, run_slave};
pub use state::{ChoiceFlags, SlaveStates};
