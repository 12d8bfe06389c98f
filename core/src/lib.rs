//! logjam-core - wire contract for the logjam telemetry system
//!
//! This crate provides the types that are shared between the agent embedded
//! in an application and collector-side tooling (receivers, importers, test
//! harnesses):
//!
//! - [`Severity`] - the numeric log level scale carried in payloads
//! - [`meta`] - the 24-byte binary meta-header framing every message, plus
//!   payload compression
//! - [`endpoint`] - broker connection spec parsing and normalization
//!
//! # Why this crate exists
//!
//! A receiver that consumes agent traffic needs to unpack the meta-header and
//! decompress payloads without pulling in HTTP middleware, sockets, or any of
//! the agent's runtime. By keeping the wire contract here, both sides of the
//! broker depend on the same byte-level definitions:
//!
//! ```text
//! logjam-core ◄── logjam-agent (publisher)
//!     ▲
//!     └────────── receiver / test tooling (subscriber)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Broker connection spec parsing and normalization
pub mod endpoint;
mod error;
/// The binary meta-header and payload compression
pub mod meta;
mod severity;

pub use endpoint::Endpoint;
pub use error::WireError;
pub use meta::{Compression, MetaInfo};
pub use severity::Severity;
