//! Shared pieces of the Cirrus signaling relay: wire protocol, logging, error types.

#![forbid(unsafe_code)]

pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{decode, encode, DecodeError, Envelope, PeerKind, PlayerId};

/// Initialize tracing with a specific default level.
///
/// Log level is controlled by the `RUST_LOG` environment variable when set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
