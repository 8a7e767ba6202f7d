//! Dispatcher - owns the worker, the gate and the correlation registry.
//!
//! Flow:
//! 1. Spawn worker subprocess (state STARTING)
//! 2. Queue submissions until the worker prints READY
//! 3. Dispatch up to `max_concurrency` requests, route RESULT lines back by id
//! 4. On every completion promote the next queued task
//! 5. On worker crash: reconcile in-flight requests, respawn
//! 6. On sentinel exit or shutdown: fail everything, retire
//!
//! All of this state lives in one event-loop task. [`Dispatcher`] handles talk
//! to it over a channel, so no lock is ever held across an await.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};

use crate::bridge::protocol::{CorrelationId, Request, WorkerMessage, validate_payload};
use crate::config::DispatcherConfig;
use crate::correlation::Responder;
use crate::error::DispatchError;
use crate::gate::Gate;
use crate::health::{DispatcherStatus, WorkerState};
use crate::supervisor::{WorkerEvent, WorkerProcess};

const COMMAND_BUFFER: usize = 256;

enum Command {
    Submit {
        payload: String,
        responder: Responder,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a supervised worker. Cheap to clone; every clone talks to the
/// same worker and queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    script_path: PathBuf,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<DispatcherStatus>,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("script_path", &self.inner.script_path)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the worker and start the event loop.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// process is spawned; tasks submitted before the worker is ready wait in
    /// the queue.
    pub fn start(config: DispatcherConfig) -> Result<Self, DispatchError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = WorkerProcess::spawn(&config, 1, events_tx.clone())?;

        let mut initial = DispatcherStatus::starting(config.max_concurrency);
        initial.generation = worker.generation();
        let (status_tx, status_rx) = watch::channel(initial);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        let inner = Arc::new(Inner {
            script_path: config.script_path.clone(),
            commands: commands_tx,
            status: status_rx,
            request_timeout: config.request_timeout,
        });

        let event_loop = EventLoop {
            gate: Gate::new(config.max_concurrency),
            generation: worker.generation(),
            worker: Some(worker),
            state: WorkerState::Starting,
            restarts: 0,
            ready_at: None,
            events_tx,
            status_tx,
            config,
        };
        tokio::spawn(event_loop.run(commands_rx, events_rx));

        Ok(Self { inner })
    }

    /// Submit a task and wait for its result.
    ///
    /// The task is serialized with serde_json, the result deserialized from
    /// the worker's RESULT payload.
    pub async fn submit<T, R>(&self, task: &T) -> Result<R, DispatchError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload =
            serde_json::to_string(task).map_err(|e| DispatchError::Encode(e.to_string()))?;
        let raw = self.submit_raw(payload).await?;
        serde_json::from_str(&raw).map_err(|e| {
            tracing::warn!(
                script = %self.inner.script_path.display(),
                error = %e,
                "Protocol anomaly: result payload does not decode"
            );
            DispatchError::MalformedResult(e.to_string())
        })
    }

    /// Submit a pre-serialized payload and wait for the raw result payload.
    pub async fn submit_raw(&self, payload: impl Into<String>) -> Result<String, DispatchError> {
        let payload = payload.into();
        validate_payload(&payload).map_err(DispatchError::Encode)?;

        let (responder, response) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Submit { payload, responder })
            .await
            .map_err(|_| DispatchError::Terminated)?;

        let result = match self.inner.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, response)
                .await
                .map_err(|_| DispatchError::Timeout)?,
            None => response.await,
        };
        result.map_err(|_| DispatchError::Abandoned)?
    }

    /// Wait until the worker has completed its handshake.
    pub async fn wait_ready(&self) -> Result<(), DispatchError> {
        let mut status = self.subscribe();
        let state = status
            .wait_for(|s| s.state.is_ready() || s.state.is_terminated())
            .await
            .map_err(|_| DispatchError::Terminated)?
            .state;
        if state.is_terminated() {
            return Err(DispatchError::Terminated);
        }
        Ok(())
    }

    /// Kill the worker and retire this dispatcher. Pending and queued tasks
    /// fail with [`DispatchError::Terminated`].
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = finished.await;
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        self.inner.status.borrow().clone()
    }

    /// Status updates, one per processed event.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherStatus> {
        self.inner.status.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.status.borrow().state.is_terminated()
    }

    pub fn script_path(&self) -> &Path {
        &self.inner.script_path
    }
}

struct EventLoop {
    config: DispatcherConfig,
    gate: Gate,
    worker: Option<WorkerProcess>,
    state: WorkerState,
    generation: u64,
    restarts: u32,
    ready_at: Option<String>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    status_tx: watch::Sender<DispatcherStatus>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.handle_event(event),

                command = commands.recv() => match command {
                    Some(Command::Submit { payload, responder }) => {
                        self.handle_submit(payload, responder);
                    }
                    Some(Command::Shutdown { done }) => {
                        tracing::info!(script = %self.script(), "Shutting down dispatcher");
                        self.terminate(DispatchError::Terminated);
                        self.publish_status();
                        let _ = done.send(());
                    }
                    None => {
                        let abandoned = self.gate.abandon_in_flight();
                        tracing::debug!(abandoned, "All dispatcher handles dropped");
                        self.terminate(DispatchError::Terminated);
                    }
                },
            }

            self.publish_status();
            if self.state.is_terminated() {
                break;
            }
        }

        // Anything that raced with termination gets a definite answer.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Submit { responder, .. } => {
                    let _ = responder.send(Err(DispatchError::Terminated));
                }
                Command::Shutdown { done } => {
                    let _ = done.send(());
                }
            }
        }

        tracing::info!(script = %self.script(), "Dispatcher event loop exiting");
    }

    fn handle_submit(&mut self, payload: String, responder: Responder) {
        if self.state.is_terminated() {
            let _ = responder.send(Err(DispatchError::Terminated));
            return;
        }
        if let Some(request) = self.gate.submit(payload, responder) {
            self.send_all(vec![request]);
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        if event.generation() != self.generation {
            tracing::debug!(
                event_generation = event.generation(),
                generation = self.generation,
                "Ignoring event from previous worker"
            );
            return;
        }

        match event {
            WorkerEvent::Message { message, .. } => self.handle_message(message),
            WorkerEvent::WriteFailed { id, error, .. } => {
                tracing::warn!(%id, %error, "Task failed: request could not be written");
                if let Some((_, promoted)) =
                    self.gate.fail(&id, DispatchError::WriteFailure(error))
                {
                    self.send_all(promoted);
                }
            }
            WorkerEvent::ReadFailed { error, .. } => {
                tracing::warn!(
                    script = %self.script(),
                    %error,
                    "Worker output unreadable, restarting worker"
                );
            }
            WorkerEvent::Exited { code, killed, .. } => self.handle_exit(code, killed),
            WorkerEvent::RestartDue { .. } => self.respawn(),
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready => {
                if self.state.is_ready() {
                    tracing::warn!(generation = self.generation, "Duplicate READY from worker");
                    return;
                }
                self.state = WorkerState::Ready;
                self.ready_at = Some(chrono::Utc::now().to_rfc3339());
                tracing::info!(
                    script = %self.script(),
                    generation = self.generation,
                    queued = self.gate.queued(),
                    "Worker ready"
                );
                let dispatched = self.gate.set_ready();
                self.send_all(dispatched);
            }
            WorkerMessage::Result { id, payload } => {
                let Some(correlation_id) = CorrelationId::parse(&id) else {
                    tracing::warn!(%id, "Protocol anomaly: RESULT with unrecognized id");
                    return;
                };
                let preview = self.config.log_tasks.then(|| payload.clone());
                match self.gate.complete(&correlation_id, payload) {
                    Some((completion, promoted)) => {
                        if let Some(result) = preview {
                            tracing::info!(
                                target: "taskbridge::task",
                                id = %correlation_id,
                                script = %self.script(),
                                elapsed_ms = completion.elapsed.as_millis() as u64,
                                %result,
                                "Task finished"
                            );
                        }
                        if !completion.delivered {
                            tracing::debug!(id = %correlation_id, "Caller stopped waiting before result");
                        }
                        self.send_all(promoted);
                    }
                    None => {
                        tracing::warn!(%id, "Protocol anomaly: RESULT for unknown correlation id");
                    }
                }
            }
            WorkerMessage::Diagnostic(line) => {
                tracing::info!(target: "taskbridge::worker", script = %self.script(), "{}", line);
            }
            WorkerMessage::Oversized => {
                tracing::warn!(
                    script = %self.script(),
                    "Protocol anomaly: over-long line from worker discarded"
                );
            }
        }
    }

    fn handle_exit(&mut self, code: Option<i32>, killed: bool) {
        self.worker = None;
        self.ready_at = None;

        if killed || code == Some(self.config.shutdown_exit_code) {
            tracing::info!(
                script = %self.script(),
                ?code,
                "Worker exited deliberately, not restarting"
            );
            self.terminate(DispatchError::Terminated);
            return;
        }

        self.state = WorkerState::Crashed;
        let affected = self.gate.worker_lost(self.config.crash_policy);
        tracing::warn!(
            script = %self.script(),
            generation = self.generation,
            ?code,
            affected,
            policy = ?self.config.crash_policy,
            "Worker crashed"
        );

        if let Some(max) = self.config.max_restarts
            && self.restarts >= max
        {
            tracing::error!(restarts = self.restarts, "Worker restart limit reached");
            self.terminate(DispatchError::WorkerCrashed);
            return;
        }

        if self.config.restart_delay.is_zero() {
            self.respawn();
        } else {
            let events = self.events_tx.clone();
            let generation = self.generation;
            let delay = self.config.restart_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(WorkerEvent::RestartDue { generation });
            });
        }
    }

    fn respawn(&mut self) {
        if self.state != WorkerState::Crashed {
            return;
        }
        self.generation += 1;
        self.restarts += 1;
        match WorkerProcess::spawn(&self.config, self.generation, self.events_tx.clone()) {
            Ok(worker) => {
                tracing::info!(
                    script = %self.script(),
                    generation = self.generation,
                    pid = worker.pid(),
                    "Worker restarted"
                );
                self.worker = Some(worker);
                self.state = WorkerState::Starting;
            }
            Err(e) => {
                tracing::error!(script = %self.script(), error = %e, "Failed to respawn worker");
                self.terminate(DispatchError::Spawn(e.to_string()));
            }
        }
    }

    /// Hand requests to the worker. A request that cannot be handed over
    /// fails on its own and frees its slot for the next one.
    fn send_all(&mut self, requests: Vec<Request>) {
        let mut outgoing: VecDeque<Request> = requests.into();
        while let Some(request) = outgoing.pop_front() {
            let id = request.id;
            if self.config.log_tasks {
                tracing::info!(
                    target: "taskbridge::task",
                    %id,
                    script = %self.script(),
                    payload = %request.payload,
                    "Started task"
                );
            }
            let sent = match &self.worker {
                Some(worker) => worker.send(request),
                None => Err(DispatchError::WriteFailure("worker not running".to_string())),
            };
            if let Err(error) = sent {
                tracing::warn!(%id, %error, "Failed to hand request to worker");
                if let Some((_, promoted)) = self.gate.fail(&id, error) {
                    outgoing.extend(promoted);
                }
            }
        }
    }

    fn terminate(&mut self, error: DispatchError) {
        self.state = WorkerState::Terminated;
        self.ready_at = None;
        let failed = self.gate.terminate(error);
        if failed > 0 {
            tracing::warn!(failed, "Failed outstanding tasks on termination");
        }
        if let Some(mut worker) = self.worker.take() {
            worker.kill();
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(DispatcherStatus {
            state: self.state,
            in_flight: self.gate.in_flight(),
            queued: self.gate.queued(),
            max_concurrency: self.gate.max_concurrency(),
            generation: self.generation,
            restarts: self.restarts,
            ready_at: self.ready_at.clone(),
        });
    }

    fn script(&self) -> std::path::Display<'_> {
        self.config.script_path.display()
    }
}
