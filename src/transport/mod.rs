//! Transport layer
//!
//! Provides:
//! - The HTTP boundary clients talk to (start / sync / stop / teardown)
//! - Host name resolution for outbound connects

mod http;
mod resolver;

pub use http::TunnelRouter;
pub use resolver::{Resolver, StaticResolver, SystemResolver};

use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Resolution failed: {0}")]
    Resolve(String),

    #[error("Timeout")]
    Timeout,
}
