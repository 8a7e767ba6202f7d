//! Concurrency gate and FIFO wait queue.
//!
//! Decides, for every submitted task, whether it goes to the worker now or
//! waits. Owned by the dispatcher event loop, so every method runs to
//! completion before the next event is looked at.
//!
//! The in-flight count is the size of the correlation registry: a task holds a
//! slot exactly as long as it has a pending entry.

use std::collections::VecDeque;

use crate::bridge::protocol::{CorrelationId, Request};
use crate::config::CrashPolicy;
use crate::correlation::{Completion, CorrelationRegistry, Responder};
use crate::error::DispatchError;

/// A task waiting for a slot.
pub(crate) struct QueuedTask {
    pub payload: String,
    pub responder: Responder,
}

pub(crate) struct Gate {
    max_concurrency: usize,
    ready: bool,
    queue: VecDeque<QueuedTask>,
    registry: CorrelationRegistry,
}

impl Gate {
    pub fn new(max_concurrency: usize) -> Self {
        debug_assert!(max_concurrency >= 1);
        Self {
            max_concurrency,
            ready: false,
            queue: VecDeque::new(),
            registry: CorrelationRegistry::new(),
        }
    }

    /// Admit a task. Returns the request to send if it was dispatched right
    /// away, `None` if it was queued.
    pub fn submit(&mut self, payload: String, responder: Responder) -> Option<Request> {
        let task = QueuedTask { payload, responder };
        if self.has_capacity() {
            Some(self.dispatch(task))
        } else {
            self.queue.push_back(task);
            tracing::debug!(queued = self.queue.len(), "Task queued");
            None
        }
    }

    /// The worker finished its handshake.
    pub fn set_ready(&mut self) -> Vec<Request> {
        self.ready = true;
        self.promote()
    }

    /// A response arrived. `None` if `id` is not pending (nothing changes).
    pub fn complete(
        &mut self,
        id: &CorrelationId,
        value: String,
    ) -> Option<(Completion, Vec<Request>)> {
        let completion = self.registry.resolve(id, value)?;
        Some((completion, self.promote()))
    }

    /// A request failed before it could be answered (e.g. write failure).
    pub fn fail(
        &mut self,
        id: &CorrelationId,
        error: DispatchError,
    ) -> Option<(Completion, Vec<Request>)> {
        let completion = self.registry.fail(id, error)?;
        Some((completion, self.promote()))
    }

    /// The worker process is gone. Stops dispatch and reconciles in-flight
    /// requests according to `policy`. Returns how many were affected.
    pub fn worker_lost(&mut self, policy: CrashPolicy) -> usize {
        self.ready = false;
        let pending = self.registry.drain();
        let count = pending.len();
        match policy {
            CrashPolicy::FailPending => {
                for (_, request) in pending {
                    let _ = request.responder.send(Err(DispatchError::WorkerCrashed));
                }
            }
            CrashPolicy::Redeliver => {
                // Oldest dispatch ends up at the very front.
                for (_, request) in pending.into_iter().rev() {
                    self.queue.push_front(QueuedTask {
                        payload: request.payload,
                        responder: request.responder,
                    });
                }
            }
        }
        count
    }

    /// Fail everything, pending and queued, with `error`. Returns the count.
    pub fn terminate(&mut self, error: DispatchError) -> usize {
        self.ready = false;
        let mut count = 0;
        for (_, request) in self.registry.drain() {
            let _ = request.responder.send(Err(error.clone()));
            count += 1;
        }
        for task in self.queue.drain(..) {
            let _ = task.responder.send(Err(error.clone()));
            count += 1;
        }
        count
    }

    /// Forget in-flight requests without answering them.
    pub fn abandon_in_flight(&mut self) -> usize {
        self.registry.drop_all()
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.registry.contains(id)
    }

    fn has_capacity(&self) -> bool {
        self.ready && self.in_flight() < self.max_concurrency
    }

    fn dispatch(&mut self, task: QueuedTask) -> Request {
        let id = self.registry.new_id();
        let request = Request::new(id, task.payload.clone());
        self.registry.register(id, task.responder, task.payload);
        debug_assert!(self.in_flight() <= self.max_concurrency);
        request
    }

    fn promote(&mut self) -> Vec<Request> {
        let mut dispatched = Vec::new();
        while self.has_capacity() {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if task.responder.is_closed() {
                tracing::debug!("Skipping queued task, caller stopped waiting");
                continue;
            }
            dispatched.push(self.dispatch(task));
        }
        dispatched
    }
}
