//! Master side of a slave channel.
//!
//! Each channel owns two tasks:
//! - a writer draining an unbounded queue into the slave's input, so sends
//!   never block and stay in send order
//! - a reader forwarding every inbound message to the master's event loop,
//!   followed by exactly one `Disconnected` when the stream ends

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{InstanceId, MasterFrame, Msg, Role, SlaveFrame};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Event posted by channel reader tasks to the master's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEvent {
    Message {
        role: Role,
        instance: InstanceId,
        msg: Msg,
    },
    /// The slave's output stream ended (process exited or crashed).
    Disconnected { role: Role, instance: InstanceId },
}

pub struct SlaveChannel {
    role: Role,
    tx: Option<mpsc::UnboundedSender<MasterFrame>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SlaveChannel {
    /// Start the reader and writer tasks. Must be called inside a tokio runtime.
    pub fn open(
        role: Role,
        instance: InstanceId,
        reader: BoxedReader,
        writer: BoxedWriter,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(role, rx, writer));
        let reader = tokio::spawn(reader_task(role, instance, reader, events));
        Self {
            role,
            tx: Some(tx),
            writer,
            reader,
        }
    }

    /// Queue a message for delivery. Returns false if the writer has gone away.
    pub fn send(&self, msg: Msg) -> bool {
        match &self.tx {
            Some(tx) => tx.send(MasterFrame::Message(msg)).is_ok(),
            None => false,
        }
    }

    /// Queue the shutdown request and close the queue; the writer exits once
    /// everything queued before it has been written.
    pub fn request_shutdown(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if tx.send(MasterFrame::Shutdown).is_err() {
            tracing::debug!(role = %self.role, "Writer already gone, shutdown frame not queued");
        }
    }

    pub fn close(mut self) {
        self.request_shutdown();
        self.reader.abort();
        self.writer.abort();
    }
}

async fn writer_task(
    role: Role,
    mut rx: mpsc::UnboundedReceiver<MasterFrame>,
    writer: BoxedWriter,
) {
    let mut framed = FramedWrite::new(writer, JsonCodec::<MasterFrame>::new());
    while let Some(frame) = rx.recv().await {
        if let Err(e) = framed.send(frame).await {
            tracing::warn!(%role, error = %e, "Failed to write to slave");
            break;
        }
    }
    tracing::trace!(%role, "Slave writer task exiting");
}

async fn reader_task(
    role: Role,
    instance: InstanceId,
    reader: BoxedReader,
    events: mpsc::UnboundedSender<SlaveEvent>,
) {
    let mut framed = FramedRead::new(reader, JsonCodec::<SlaveFrame>::new());
    loop {
        match framed.next().await {
            Some(Ok(SlaveFrame::Message(msg))) => {
                tracing::trace!(%role, cmd = msg.cmd(), "Message from slave");
                if events
                    .send(SlaveEvent::Message {
                        role,
                        instance,
                        msg,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(SlaveFrame::ShuttingDown)) => {
                tracing::debug!(%role, "Slave acknowledged shutdown");
            }
            Some(Err(e)) => {
                tracing::warn!(%role, error = %e, "Slave channel error");
                break;
            }
            None => {
                tracing::debug!(%role, "Slave channel closed");
                break;
            }
        }
    }
    let _ = events.send(SlaveEvent::Disconnected { role, instance });
}
