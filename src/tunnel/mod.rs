//! Tunnel layer - outbound stream multiplexing
//!
//! Provides:
//! - Outbound TCP streams with buffered writes
//! - The engine loop that applies client messages to streams
//! - Socket readiness multiplexing with a bounded wait

mod engine;
mod stream;

pub use engine::{EngineConfig, TunnelEngine};
pub use stream::{ReadOutcome, StreamState, TunnelStream};

use crate::protocol::StreamId;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Stream not connected: {0}")]
    NotConnected(StreamId),

    #[error("Stream closed: {0}")]
    StreamClosed(StreamId),

    #[error("Write to stream {0} timed out")]
    WriteTimeout(StreamId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
