//! Worker process supervision.
//!
//! A [`WorkerProcess`] is one spawned generation of the worker:
//! - a writer task owns the child's stdin; requests are written one at a time
//!   in the order they were handed over
//! - a watcher task owns the child and its stdout; it forwards decoded lines
//!   until EOF, then reports the exit status
//!
//! Everything the tasks observe goes to the dispatcher as a [`WorkerEvent`]
//! tagged with the generation, so events from a dead worker can be told apart
//! from events of its replacement.

use std::process::Stdio;

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{CorrelationId, Request, WorkerMessage};
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, SpawnError};

/// Extension point for different ways of launching the worker.
///
/// The child must have stdin and stdout piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &DispatcherConfig) -> Result<Child, SpawnError>;
}

/// Runs `<interpreter> <script_path> [args...]`.
pub struct InterpreterSpawner;

impl WorkerSpawner for InterpreterSpawner {
    fn spawn(&self, config: &DispatcherConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&config.interpreter)
            .arg(&config.script_path)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message {
        generation: u64,
        message: WorkerMessage,
    },
    /// Writing this request to stdin failed.
    WriteFailed {
        generation: u64,
        id: CorrelationId,
        error: String,
    },
    /// stdout became unreadable. The worker has been killed and its exit is
    /// reported as a crash.
    ReadFailed { generation: u64, error: String },
    Exited {
        generation: u64,
        code: Option<i32>,
        /// The dispatcher asked for the kill.
        killed: bool,
    },
    /// Scheduled by the dispatcher when restarts are delayed.
    RestartDue { generation: u64 },
}

impl WorkerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Message { generation, .. }
            | Self::WriteFailed { generation, .. }
            | Self::ReadFailed { generation, .. }
            | Self::Exited { generation, .. }
            | Self::RestartDue { generation } => *generation,
        }
    }
}

/// Handle to one running worker generation.
///
/// Dropping the handle kills the process.
pub(crate) struct WorkerProcess {
    generation: u64,
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<Request>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerProcess {
    pub fn spawn(
        config: &DispatcherConfig,
        generation: u64,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, SpawnError> {
        let mut child = config.spawner.spawn(config)?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let pid = child.id();

        tracing::info!(
            generation,
            pid,
            script = %config.script_path.display(),
            "Spawned worker subprocess"
        );

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(
            generation,
            stdin,
            requests_rx,
            events.clone(),
        ));

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_process(generation, child, stdout, kill_rx, events));

        Ok(Self {
            generation,
            pid,
            requests: requests_tx,
            kill: Some(kill_tx),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a request for the writer. Fails only if the writer is gone.
    pub fn send(&self, request: Request) -> Result<(), DispatchError> {
        self.requests
            .send(request)
            .map_err(|_| DispatchError::WriteFailure("worker stdin closed".to_string()))
    }

    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            tracing::debug!(generation = self.generation, pid = self.pid, "Killing worker");
            let _ = kill.send(());
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn write_requests(
    generation: u64,
    stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut writer = FramedWrite::new(stdin, LineCodec::new());
    while let Some(request) = requests.recv().await {
        let id = request.id;
        if let Err(e) = writer.send(request).await {
            tracing::warn!(generation, %id, error = %e, "Failed to write request to worker");
            let error = e.to_string();
            let _ = events.send(WorkerEvent::WriteFailed {
                generation,
                id,
                error: error.clone(),
            });

            // stdin is unusable from here on. Fail what is already queued;
            // later sends are refused by `WorkerProcess::send`.
            requests.close();
            while let Some(request) = requests.recv().await {
                let _ = events.send(WorkerEvent::WriteFailed {
                    generation,
                    id: request.id,
                    error: error.clone(),
                });
            }
            break;
        }
    }
    tracing::debug!(generation, "Worker writer task exiting");
}

async fn watch_process(
    generation: u64,
    mut child: Child,
    stdout: ChildStdout,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut reader = FramedRead::new(stdout, LineCodec::new());
    let mut killed = false;

    loop {
        tokio::select! {
            message = reader.next() => match message {
                Some(Ok(message)) => {
                    if events.send(WorkerEvent::Message { generation, message }).is_err() {
                        // Dispatcher is gone, nobody will read the output.
                        killed = true;
                        let _ = child.start_kill();
                        break;
                    }
                }
                Some(Err(e)) => {
                    // Nothing the worker says can be seen any more. Kill it so
                    // the exit is handled as a crash and pending work recovered.
                    tracing::warn!(generation, error = %e, "Failed to read from worker stdout");
                    let _ = events.send(WorkerEvent::ReadFailed {
                        generation,
                        error: e.to_string(),
                    });
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(generation, error = %e, "Worker already gone");
                    }
                    break;
                }
                None => break,
            },
            // A dropped sender counts as a kill request too.
            _ = &mut kill_rx, if !killed => {
                killed = true;
                if let Err(e) = child.start_kill() {
                    tracing::debug!(generation, error = %e, "Worker already gone");
                }
            }
        }
    }

    let status = if killed {
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                killed = true;
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(generation, error = %e, "Failed to wait for worker");
            None
        }
    };
    tracing::debug!(generation, ?code, killed, "Worker process exited");
    let _ = events.send(WorkerEvent::Exited {
        generation,
        code,
        killed,
    });
}
