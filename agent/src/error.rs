//! Error types for the agent

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for the agent
///
/// Only configuration problems are ever returned to the caller; everything
/// that happens after startup (socket trouble, serialization failures) is
/// logged locally and swallowed, because telemetry must never fail the
/// request it describes.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration error, fatal at agent construction
    #[error("configuration error: {0}")]
    Config(String),

    /// A connection spec could not be parsed
    #[error(transparent)]
    Endpoint(#[from] logjam_core::WireError),

    /// ZeroMQ socket operation failed
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),

    /// Broker host name did not resolve to an IPv4 address
    #[error("could not resolve an IPv4 address for {0}")]
    Resolve(String),

    /// Payload serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
