//! Session layer - reliable exchange over disjoint HTTP requests
//!
//! Provides:
//! - Inbound batch sequencing with out-of-order reassembly
//! - Outbound pagination
//! - The engine's per-iteration queue exchange
//! - A lockable session store shared by the engine and request handlers

mod queue;
mod store;

pub use queue::{Exchange, SessionSnapshot, SessionState};
pub use store::{Generation, MemoryStore, SessionId, SessionLock, SessionStore, SessionTxn};

use thiserror::Error;

/// Session layer errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session id: {0:?}")]
    InvalidId(String),
}

/// Longest accepted session id
pub const MAX_SESSION_ID_LEN: usize = 128;
