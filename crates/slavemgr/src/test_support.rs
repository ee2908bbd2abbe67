//! In-memory slaves for lifecycle tests.
//!
//! `FakeLauncher` "spawns" a task speaking the real frame protocol over a
//! duplex pipe, so everything above the launcher runs unmodified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{MasterFrame, Msg, Role, SlaveCommand, SlaveFrame};
use crate::launcher::{LaunchRequest, LaunchedSlave, SlaveLauncher, SlaveProcess, SpawnError};

enum Control {
    Send(SlaveFrame),
    Crash,
}

struct FakeSlaveState {
    exited: watch::Sender<bool>,
    received: StdMutex<Vec<Msg>>,
    received_notify: Notify,
    saw_shutdown: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
}

/// Test-side handle to one fake slave process.
#[derive(Clone)]
pub(crate) struct FakeSlave {
    state: Arc<FakeSlaveState>,
}

impl FakeSlave {
    pub(crate) fn received(&self) -> Vec<Msg> {
        self.state.received.lock().unwrap().clone()
    }

    /// Wait until at least `n` messages arrived (1s cap).
    pub(crate) async fn wait_for_messages(&self, n: usize) -> Vec<Msg> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let notified = self.state.received_notify.notified();
            let received = self.received();
            if received.len() >= n {
                return received;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.received();
            }
        }
    }

    pub(crate) fn saw_shutdown(&self) -> bool {
        self.state.saw_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn is_alive(&self) -> bool {
        !*self.state.exited.borrow()
    }

    /// Send a message to the master.
    pub(crate) fn reply(&self, msg: Msg) {
        let _ = self.state.control.send(Control::Send(SlaveFrame::Message(msg)));
    }

    /// Die without saying goodbye.
    pub(crate) fn crash(&self) {
        self.state.exited.send_replace(true);
        let _ = self.state.control.send(Control::Crash);
    }
}

/// Launcher producing in-memory slaves.
pub(crate) struct FakeLauncher {
    name: &'static str,
    fail: bool,
    spawned: AtomicUsize,
    slaves: StdMutex<HashMap<Role, FakeSlave>>,
    /// Choice an AccessDialog answers `Ask` with, if any.
    answer: StdMutex<Option<i64>>,
}

impl FakeLauncher {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            fail: false,
            spawned: AtomicUsize::new(0),
            slaves: StdMutex::new(HashMap::new()),
            answer: StdMutex::new(None),
        }
    }

    pub(crate) fn failing(name: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub(crate) fn answering(name: &'static str, choice: i64) -> Self {
        let launcher = Self::new(name);
        *launcher.answer.lock().unwrap() = Some(choice);
        launcher
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Most recently started slave for `role`.
    pub(crate) fn slave(&self, role: Role) -> Option<FakeSlave> {
        self.slaves.lock().unwrap().get(&role).cloned()
    }
}

impl SlaveLauncher for FakeLauncher {
    fn name(&self) -> &'static str {
        self.name
    }

    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedSlave, SpawnError> {
        if self.fail {
            return Err(SpawnError::Other("launcher configured to fail".to_string()));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let (master_end, slave_end) = tokio::io::duplex(16 * 1024);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exited, _) = watch::channel(false);
        let state = Arc::new(FakeSlaveState {
            exited,
            received: StdMutex::new(Vec::new()),
            received_notify: Notify::new(),
            saw_shutdown: AtomicBool::new(false),
            control: control_tx,
        });

        let answer = *self.answer.lock().unwrap();
        tokio::spawn(fake_slave(
            Arc::clone(&state),
            slave_end,
            control_rx,
            answer,
        ));

        self.slaves.lock().unwrap().insert(
            request.role,
            FakeSlave {
                state: Arc::clone(&state),
            },
        );

        let (reader, writer) = tokio::io::split(master_end);
        Ok(LaunchedSlave {
            process: Box::new(FakeProcess { state }),
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

async fn fake_slave(
    state: Arc<FakeSlaveState>,
    stream: tokio::io::DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
    answer: Option<i64>,
) {
    let (r, w) = tokio::io::split(stream);
    let mut frames = FramedRead::new(r, JsonCodec::<MasterFrame>::new());
    let mut out = FramedWrite::new(w, JsonCodec::<SlaveFrame>::new());

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(MasterFrame::Message(msg))) => {
                    let reply = match (answer, SlaveCommand::try_from(&msg)) {
                        (Some(choice_flags), Ok(SlaveCommand::Ask { .. })) => {
                            Some(SlaveCommand::ReportChoice { choice_flags }.into_msg())
                        }
                        _ => None,
                    };
                    state.received.lock().unwrap().push(msg);
                    state.received_notify.notify_waiters();
                    if let Some(reply) = reply {
                        let _ = out.send(SlaveFrame::Message(reply)).await;
                    }
                }
                Some(Ok(MasterFrame::Shutdown)) => {
                    state.saw_shutdown.store(true, Ordering::SeqCst);
                    let _ = out.send(SlaveFrame::ShuttingDown).await;
                    break;
                }
                Some(Err(_)) | None => break,
            },
            Some(ctl) = control.recv() => match ctl {
                Control::Send(frame) => {
                    let _ = out.send(frame).await;
                }
                Control::Crash => break,
            },
        }
    }
    state.exited.send_replace(true);
}

struct FakeProcess {
    state: Arc<FakeSlaveState>,
}

#[async_trait]
impl SlaveProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        *self.state.exited.borrow()
    }

    async fn terminate(&mut self, grace: Duration) {
        let mut exited = self.state.exited.subscribe();
        let timed_out = tokio::time::timeout(grace, exited.wait_for(|e| *e))
            .await
            .is_err();
        if timed_out {
            self.state.exited.send_replace(true);
            let _ = self.state.control.send(Control::Crash);
        }
    }
}
