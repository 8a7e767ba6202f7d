//! taskbridge: supervised worker subprocess with a bounded-concurrency task queue.

mod correlation;
mod gate;

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod instances;
pub mod supervisor;

pub use bridge::protocol::{CorrelationId, WorkerMessage};
pub use config::{CrashPolicy, DispatcherConfig};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, SpawnError};
pub use health::{DispatcherStatus, WorkerState};
pub use instances::DispatcherRegistry;
pub use supervisor::{InterpreterSpawner, WorkerSpawner};
