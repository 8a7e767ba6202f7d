//! Correlation registry: in-flight request id → waiting caller.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationId;
use crate::error::DispatchError;

/// Resolving side of a caller's pending result.
pub(crate) type Responder = oneshot::Sender<Result<String, DispatchError>>;

/// A request that has been sent to the worker and not answered yet.
pub(crate) struct PendingRequest {
    pub responder: Responder,
    /// Kept so the request can be redelivered after a crash.
    pub payload: String,
    pub dispatched_at: Instant,
    seq: u64,
}

/// Outcome of resolving a pending request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub elapsed: Duration,
    /// False when the caller stopped waiting (timed out or dropped the future).
    pub delivered: bool,
}

#[derive(Default)]
pub(crate) struct CorrelationRegistry {
    pending: HashMap<CorrelationId, PendingRequest>,
    next_seq: u64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh id, never equal to a still-pending one.
    pub fn new_id(&self) -> CorrelationId {
        loop {
            let id = CorrelationId::new();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&mut self, id: CorrelationId, responder: Responder, payload: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let previous = self.pending.insert(
            id,
            PendingRequest {
                responder,
                payload,
                dispatched_at: Instant::now(),
                seq,
            },
        );
        debug_assert!(previous.is_none(), "correlation id registered twice");
    }

    /// Remove the entry and deliver `value` to its caller.
    ///
    /// Returns `None` for an unknown id; nothing is touched in that case.
    pub fn resolve(&mut self, id: &CorrelationId, value: String) -> Option<Completion> {
        self.complete(id, Ok(value))
    }

    /// Remove the entry and deliver `error` to its caller.
    pub fn fail(&mut self, id: &CorrelationId, error: DispatchError) -> Option<Completion> {
        self.complete(id, Err(error))
    }

    fn complete(
        &mut self,
        id: &CorrelationId,
        result: Result<String, DispatchError>,
    ) -> Option<Completion> {
        let pending = self.pending.remove(id)?;
        let elapsed = pending.dispatched_at.elapsed();
        let delivered = pending.responder.send(result).is_ok();
        Some(Completion { elapsed, delivered })
    }

    /// Forget every entry without answering. Waiting callers see
    /// [`DispatchError::Abandoned`].
    pub fn drop_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Remove every entry, oldest dispatch first.
    pub fn drain(&mut self) -> Vec<(CorrelationId, PendingRequest)> {
        let mut entries: Vec<_> = self.pending.drain().collect();
        entries.sort_by_key(|(_, p)| p.seq);
        entries
    }

    #[cfg(test)]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
