//! Protocol definitions and constants

mod message;

pub use message::{decode_request, encode_reply, Message, Reply, Request, StreamId};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Stale sequence number: got {got}, expected at least {expected}")]
    StaleSequence { got: u64, expected: u64 },

    #[error("Sequence number {got} too far ahead, accepting below {limit}")]
    TooFarAhead { got: u64, limit: u64 },
}

/// Status value reported for every failure that carries no OS error code
/// (resolution failure, read/write failure, peer close). Matches `EIO`.
pub const FAILURE_CODE: i32 = 5;

/// Status value reported when an outbound connect completes
pub const CONNECTED: i32 = 0;

/// Maximum number of outbound messages returned by one sync response
pub const PAGE_SIZE: usize = 64;

/// Maximum number of bytes taken from a socket per read
pub const READ_CHUNK_SIZE: usize = 8192;

/// Number of inbound sequence numbers, starting at the next expected one,
/// that a session accepts. Batches further ahead are rejected.
pub const REORDER_WINDOW: u64 = 1024;
