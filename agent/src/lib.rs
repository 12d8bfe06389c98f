//! logjam-agent - per-process telemetry for web applications
//!
//! For each HTTP request this agent accumulates structured log lines, timing
//! measurements, counters and request metadata, then serializes the result
//! into one JSON document that is compressed and shipped over a message
//! broker to the logjam collector. It also propagates the `X-Logjam-*`
//! tracing headers between cooperating services.
//!
//! ```text
//! Middleware ──► Request (per-transaction aggregator)
//!     │               ▲
//!     │               │ log / count / add_duration, via extensions
//!     ├──► handler ───┘
//!     │
//!     └──► finish ──► JSON ──► Snappy ──► ZeroMQ ──► collector
//! ```
//!
//! # Usage
//!
//! Build one [`Agent`] at startup, wrap your router in a [`LogjamLayer`],
//! and call [`Agent::shutdown`] at teardown:
//!
//! ```ignore
//! let agent = Agent::new(AgentConfig {
//!     app_name: "shop".into(),
//!     env_name: "production".into(),
//!     ..AgentConfig::default()
//! })?;
//!
//! let app = Router::new()
//!     .route("/users/{id}", get(show_user))
//!     .layer(LogjamLayer::new(agent.clone()));
//! ```
//!
//! Handlers reach their telemetry record through the request extensions:
//!
//! ```ignore
//! async fn show_user(req: axum::extract::Request) -> impl IntoResponse {
//!     if let Some(r) = logjam_agent::request_from(req.extensions()) {
//!         r.count("db_calls");
//!         r.log(Severity::Info, "loading user");
//!     }
//!     // ...
//! }
//! ```
//!
//! Telemetry is fire-and-forget by design: nothing in this crate ever fails
//! the request being served. Transport trouble is logged through `tracing`
//! and the affected record is dropped.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod actions;
pub mod agent;
pub mod capture;
mod context;
mod error;
pub mod info;
pub mod middleware;
pub mod request;
pub mod transport;

pub use actions::{default_action_name, legacy_action_name, ActionNameExtractor};
pub use agent::{Agent, AgentConfig};
pub use capture::ResponseCapture;
pub use context::{add_count, add_duration, count, log, request_from, set_call_headers};
pub use error::{AgentError, Result};
pub use info::obfuscate_ip;
pub use middleware::{LogjamLayer, LogjamService};
pub use request::Request;
pub use transport::{DiscardTransport, Transport, ZmqTransport};

// The numeric severity scale is part of the wire contract and lives in
// logjam-core; re-exported here so applications need only one import.
pub use logjam_core::Severity;
