//! Slave process side - runs inside the helper process.
//!
//! The parent side (spawning, routing) lives in master.rs and registry.rs.
//! Channel: frames from the master on stdin, frames to the master on stdout.
//! Anything the slave wants to log must go to stderr.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{MasterFrame, Msg, ProtocolError, Role, SlaveCommand, SlaveFrame};
use crate::launcher::{DESKTOP_SWITCH_FLAG, SLAVE_FLAG};

/// Handle for sending messages back to the master.
#[derive(Clone)]
pub struct SlaveContext {
    role: Role,
    tx: mpsc::UnboundedSender<SlaveFrame>,
}

impl SlaveContext {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn send(&self, msg: impl Into<Msg>) -> io::Result<()> {
        self.tx
            .send(SlaveFrame::Message(msg.into()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "master channel closed"))
    }
}

/// What a slave does with the master's commands.
#[async_trait::async_trait]
pub trait SlaveHandler: Send + Sync + 'static {
    async fn handle_message(&self, ctx: &SlaveContext, msg: Msg);

    /// Called once before the slave exits on the master's request.
    async fn shutdown(&self, _ctx: &SlaveContext) {}
}

/// How the slave was invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveInvocation {
    pub role: Role,
    pub desktop_switch: bool,
}

/// Parse `--slave <Role> [--desktop-switch]`. Returns None when not invoked
/// as a slave.
pub fn parse_slave_args(args: &[String]) -> Option<Result<SlaveInvocation, ProtocolError>> {
    let pos = args.iter().position(|a| a == SLAVE_FLAG)?;
    let role = match args.get(pos + 1) {
        Some(name) => name.parse::<Role>(),
        None => Err(ProtocolError::UnknownRole(String::new())),
    };
    let desktop_switch = args.iter().any(|a| a == DESKTOP_SWITCH_FLAG);
    Some(role.map(|role| SlaveInvocation {
        role,
        desktop_switch,
    }))
}

/// Run the slave loop on stdin/stdout until the master says shutdown or
/// goes away.
pub async fn run_slave<H: SlaveHandler>(role: Role, handler: Arc<H>) -> io::Result<()> {
    run_slave_on(role, handler, stdin(), stdout()).await
}

/// Run the slave loop over arbitrary streams.
pub async fn run_slave_on<H, R, W>(
    role: Role,
    handler: Arc<H>,
    reader: R,
    writer: W,
) -> io::Result<()>
where
    H: SlaveHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut frames = FramedRead::new(reader, JsonCodec::<MasterFrame>::new());
    let mut out = FramedWrite::new(writer, JsonCodec::<SlaveFrame>::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<SlaveFrame>();
    let forwarder = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            out.send(frame).await?;
        }
        Ok::<(), io::Error>(())
    });

    let ctx = SlaveContext { role, tx };
    tracing::info!(%role, "Slave started");

    loop {
        match frames.next().await {
            Some(Ok(MasterFrame::Message(msg))) => {
                tracing::debug!(%role, cmd = msg.cmd(), "Command from master");
                handler.handle_message(&ctx, msg).await;
            }
            Some(Ok(MasterFrame::Shutdown)) => {
                tracing::info!(%role, "Shutdown requested");
                handler.shutdown(&ctx).await;
                let _ = ctx.tx.send(SlaveFrame::ShuttingDown);
                break;
            }
            Some(Err(e)) => {
                tracing::error!(%role, error = %e, "Master channel error");
                break;
            }
            None => {
                tracing::warn!(%role, "Master channel closed (master died?), exiting");
                break;
            }
        }
    }

    drop(ctx);
    match forwarder.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Handler for slaves whose user interface is provided elsewhere. Logs every
/// command; lifecycle-only slaves simply live until stopped.
#[derive(Debug, Default)]
pub struct HeadlessSlave;

#[async_trait::async_trait]
impl SlaveHandler for HeadlessSlave {
    async fn handle_message(&self, ctx: &SlaveContext, msg: Msg) {
        match SlaveCommand::try_from(&msg) {
            Ok(SlaveCommand::Ask { user, host, .. }) => {
                tracing::info!(role = %ctx.role(), %user, %host, "Access request received, no dialog available");
            }
            Ok(SlaveCommand::StartDemo {
                master_host,
                full_screen,
            }) => {
                tracing::info!(role = %ctx.role(), %master_host, full_screen, "Demo requested");
            }
            Ok(SlaveCommand::StartDemoServer {
                source_port,
                destination_port,
                ..
            }) => {
                tracing::info!(role = %ctx.role(), source_port, destination_port, "Demo server requested");
            }
            Ok(SlaveCommand::UpdateAllowedHosts { allowed_hosts }) => {
                tracing::info!(role = %ctx.role(), hosts = allowed_hosts.len(), "Allowed hosts updated");
            }
            Ok(SlaveCommand::ReportChoice { .. }) => {
                tracing::warn!(role = %ctx.role(), "Unexpected ReportChoice from master");
            }
            Err(e) => {
                tracing::warn!(role = %ctx.role(), error = %e, "Unrecognized command");
            }
        }
    }
}
