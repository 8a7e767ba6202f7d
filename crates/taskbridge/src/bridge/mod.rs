//! IPC bridge for dispatcher-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the dispatcher (parent) and the worker subprocess over its stdin/stdout.
//!
//! # Architecture
//!
//! - **protocol**: Record types (Request, WorkerMessage, CorrelationId)
//! - **codec**: Newline framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
