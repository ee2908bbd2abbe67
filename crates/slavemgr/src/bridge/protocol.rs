//! Wire protocol types for master-slave communication.
//!
//! Every frame on a slave channel carries either a [`Msg`] (a command plus
//! ordered, named scalar arguments) or a lifecycle signal. The command and
//! argument names are fixed constants and form the wire contract; the typed
//! [`SlaveCommand`] enum is the view the policy layer dispatches on.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Kind of slave process. At most one live process exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Reserved identifier, not driven by the slave manager.
    CoreServer,
    AccessDialog,
    DemoClient,
    DemoServer,
    ScreenLock,
    InputLock,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::CoreServer,
        Role::AccessDialog,
        Role::DemoClient,
        Role::DemoServer,
        Role::ScreenLock,
        Role::InputLock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CoreServer => "CoreServer",
            Role::AccessDialog => "AccessDialog",
            Role::DemoClient => "DemoClient",
            Role::DemoServer => "DemoServer",
            Role::ScreenLock => "ScreenLock",
            Role::InputLock => "InputLock",
        }
    }

    /// Interactive slaves render on or intercept the user's desktop and must
    /// only be started while somebody is logged on.
    pub fn is_interactive(&self) -> bool {
        !matches!(self, Role::CoreServer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownRole(s.to_string()))
    }
}

/// Unique identifier of one spawned slave instance.
///
/// A role can be stopped and started again; the id lets late events from a
/// previous process be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command names.
pub mod cmd {
    pub const ASK: &str = "Ask";
    pub const REPORT_CHOICE: &str = "ReportChoice";
    pub const START_DEMO: &str = "StartDemo";
    pub const START_DEMO_SERVER: &str = "StartDemoServer";
    pub const UPDATE_ALLOWED_HOSTS: &str = "UpdateAllowedHosts";
}

/// Argument names.
pub mod arg {
    pub const USER: &str = "User";
    pub const HOST: &str = "Host";
    pub const CHOICE_FLAGS: &str = "ChoiceFlags";
    pub const MASTER_HOST: &str = "MasterHost";
    pub const FULL_SCREEN: &str = "FullScreen";
    pub const SOURCE_PORT: &str = "SourcePort";
    pub const DESTINATION_PORT: &str = "DestinationPort";
    pub const COMMON_SECRET: &str = "CommonSecret";
    pub const ALLOWED_HOSTS: &str = "AllowedHosts";
}

/// Scalar argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Scalar {
    /// Integer view. Numeric strings and booleans convert.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Bool(b) => Some(i64::from(*b)),
            Scalar::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            Scalar::Int(i) => Some(*i != 0),
            Scalar::Str(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<u16> for Scalar {
    fn from(v: u16) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

/// A command with ordered, named scalar arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    cmd: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    args: IndexMap<String, Scalar>,
}

impl Msg {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: IndexMap::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn arg(&self, name: &str) -> Option<&Scalar> {
        self.args.get(name)
    }

    pub fn args(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn required(&self, name: &'static str) -> Result<&Scalar, ProtocolError> {
        self.arg(name).ok_or(ProtocolError::MissingArgument {
            cmd: self.cmd.clone(),
            arg: name,
        })
    }

    fn required_i64(&self, name: &'static str) -> Result<i64, ProtocolError> {
        self.required(name)?
            .as_i64()
            .ok_or_else(|| self.invalid(name))
    }

    fn required_bool(&self, name: &'static str) -> Result<bool, ProtocolError> {
        self.required(name)?
            .as_bool()
            .ok_or_else(|| self.invalid(name))
    }

    fn required_str(&self, name: &'static str) -> Result<String, ProtocolError> {
        self.required(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(name))
    }

    fn required_port(&self, name: &'static str) -> Result<u16, ProtocolError> {
        u16::try_from(self.required_i64(name)?).map_err(|_| self.invalid(name))
    }

    fn invalid(&self, name: &'static str) -> ProtocolError {
        ProtocolError::InvalidArgument {
            cmd: self.cmd.clone(),
            arg: name,
        }
    }
}

/// Frames from master to slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterFrame {
    Message(Msg),
    /// Ask the slave to exit. The master kills it if it does not comply.
    Shutdown,
}

/// Frames from slave to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveFrame {
    Message(Msg),
    ShuttingDown,
}

/// Typed view of the protocol vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveCommand {
    /// Master → AccessDialog.
    Ask {
        user: String,
        host: String,
        choice_flags: i64,
    },
    /// AccessDialog → master.
    ReportChoice { choice_flags: i64 },
    /// Master → DemoClient.
    StartDemo { master_host: String, full_screen: bool },
    /// Master → DemoServer.
    StartDemoServer {
        source_port: u16,
        destination_port: u16,
        common_secret: String,
    },
    /// Master → DemoServer. Hosts are sent comma-separated.
    UpdateAllowedHosts { allowed_hosts: Vec<String> },
}

impl SlaveCommand {
    pub fn into_msg(self) -> Msg {
        match self {
            SlaveCommand::Ask {
                user,
                host,
                choice_flags,
            } => Msg::new(cmd::ASK)
                .with_arg(arg::USER, user)
                .with_arg(arg::HOST, host)
                .with_arg(arg::CHOICE_FLAGS, choice_flags),
            SlaveCommand::ReportChoice { choice_flags } => {
                Msg::new(cmd::REPORT_CHOICE).with_arg(arg::CHOICE_FLAGS, choice_flags)
            }
            SlaveCommand::StartDemo {
                master_host,
                full_screen,
            } => Msg::new(cmd::START_DEMO)
                .with_arg(arg::MASTER_HOST, master_host)
                .with_arg(arg::FULL_SCREEN, full_screen),
            SlaveCommand::StartDemoServer {
                source_port,
                destination_port,
                common_secret,
            } => Msg::new(cmd::START_DEMO_SERVER)
                .with_arg(arg::SOURCE_PORT, source_port)
                .with_arg(arg::DESTINATION_PORT, destination_port)
                .with_arg(arg::COMMON_SECRET, common_secret),
            SlaveCommand::UpdateAllowedHosts { allowed_hosts } => Msg::new(
                cmd::UPDATE_ALLOWED_HOSTS,
            )
            .with_arg(arg::ALLOWED_HOSTS, allowed_hosts.join(",")),
        }
    }
}

impl TryFrom<&Msg> for SlaveCommand {
    type Error = ProtocolError;

    fn try_from(msg: &Msg) -> Result<Self, Self::Error> {
        match msg.cmd() {
            cmd::ASK => Ok(SlaveCommand::Ask {
                user: msg.required_str(arg::USER)?,
                host: msg.required_str(arg::HOST)?,
                choice_flags: msg.required_i64(arg::CHOICE_FLAGS)?,
            }),
            cmd::REPORT_CHOICE => Ok(SlaveCommand::ReportChoice {
                choice_flags: msg.required_i64(arg::CHOICE_FLAGS)?,
            }),
            cmd::START_DEMO => Ok(SlaveCommand::StartDemo {
                master_host: msg.required_str(arg::MASTER_HOST)?,
                full_screen: msg.required_bool(arg::FULL_SCREEN)?,
            }),
            cmd::START_DEMO_SERVER => Ok(SlaveCommand::StartDemoServer {
                source_port: msg.required_port(arg::SOURCE_PORT)?,
                destination_port: msg.required_port(arg::DESTINATION_PORT)?,
                common_secret: msg.required_str(arg::COMMON_SECRET)?,
            }),
            cmd::UPDATE_ALLOWED_HOSTS => {
                let joined = msg.required_str(arg::ALLOWED_HOSTS)?;
                let allowed_hosts = joined
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(SlaveCommand::UpdateAllowedHosts { allowed_hosts })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl From<SlaveCommand> for Msg {
    fn from(command: SlaveCommand) -> Self {
        command.into_msg()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{cmd}: missing argument {arg}")]
    MissingArgument { cmd: String, arg: &'static str },
    #[error("{cmd}: invalid value for argument {arg}")]
    InvalidArgument { cmd: String, arg: &'static str },
}
