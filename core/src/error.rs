//! Error types for the wire contract

use thiserror::Error;

/// Error type for wire-level operations
#[derive(Error, Debug)]
pub enum WireError {
    /// A connection spec did not match the endpoint grammar.
    ///
    /// Endpoint specs look like `tcp://host:9604`, `host:9604`, `host` or
    /// `inproc://name`. Anything else is rejected.
    #[error("invalid endpoint spec: {0}")]
    Endpoint(String),

    /// Payload compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] snap::Error),
}
