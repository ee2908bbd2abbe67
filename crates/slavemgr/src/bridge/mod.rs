//! IPC bridge for master-slave communication.
//!
//! - **protocol**: Roles, messages, frames and the typed command vocabulary
//! - **codec**: Length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **channel**: Master-side reader/writer tasks for one slave

pub mod channel;
pub mod codec;
pub mod protocol;
