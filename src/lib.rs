//! # HTTP Tunnel
//!
//! A TCP-over-HTTP tunnel endpoint. Clients drive arbitrary outbound TCP
//! connections through a series of independent HTTP requests; the server
//! keeps a long-running socket multiplexer per session and trades control
//! and data messages with the client through a sequence-numbered queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Transport Boundary                   │
//! │      (axum router: start / sync / stop / teardown)   │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                      │
//! │   (sequence numbers, reassembly, outbound paging)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Engine                      │
//! │    (stream table, multiplex wait, message apply)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Outbound Streams                    │
//! │                (one TCP socket each)                 │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
