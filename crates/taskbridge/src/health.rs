//! Worker state and dispatcher status snapshots.

use serde::{Deserialize, Serialize};

/// Lifecycle of the supervised worker.
///
/// `Starting -> Ready -> (Crashed -> Starting) | Terminated`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Spawned, waiting for the readiness handshake
    #[default]
    Starting,
    /// Handshake received, tasks are dispatched
    Ready,
    /// Exited abnormally, restart pending
    Crashed,
    /// Shut down for good; submissions are rejected
    Terminated,
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Crashed => "crashed",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a dispatcher, published after every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    pub state: WorkerState,
    pub in_flight: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    /// Number of the current worker process, starting at 1.
    pub generation: u64,
    pub restarts: u32,
    /// When the current worker became ready (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
}

impl DispatcherStatus {
    pub fn starting(max_concurrency: usize) -> Self {
        Self {
            state: WorkerState::Starting,
            in_flight: 0,
            queued: 0,
            max_concurrency,
            generation: 0,
            restarts: 0,
            ready_at: None,
        }
    }

    /// Ready but every slot is taken.
    pub fn is_busy(&self) -> bool {
        self.state.is_ready() && self.in_flight >= self.max_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_default_is_starting() {
        assert_eq!(WorkerState::default(), WorkerState::Starting);
    }

    #[test]
    fn worker_state_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            "worker_state_all_variants",
            [
                WorkerState::Starting,
                WorkerState::Ready,
                WorkerState::Crashed,
                WorkerState::Terminated,
            ]
        );
    }

    #[test]
    fn worker_state_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<WorkerState>("\"TERMINATED\"").unwrap(),
            WorkerState::Terminated
        );
    }

    #[test]
    fn status_serializes_without_ready_at() {
        let status = DispatcherStatus {
            state: WorkerState::Ready,
            in_flight: 2,
            queued: 1,
            max_concurrency: 2,
            generation: 1,
            restarts: 0,
            ready_at: None,
        };
        insta::assert_json_snapshot!("status_busy", status);
    }

    #[test]
    fn busy_only_when_ready_and_full() {
        let mut status = DispatcherStatus::starting(2);
        status.in_flight = 2;
        assert!(!status.is_busy());

        status.state = WorkerState::Ready;
        assert!(status.is_busy());

        status.in_flight = 1;
        assert!(!status.is_busy());
    }
}
