//! Agent construction and process-wide state
//!
//! One [`Agent`] exists per application process. It is built once during
//! startup, cloned freely (clones share the same transport and sequence
//! numbers), handed to the middleware, and shut down once at teardown.
//!
//! Configuration values resolve in three steps: programmer-set values win,
//! then the `LOGJAM_*` environment, then built-in defaults.

use crate::actions::ActionNameExtractor;
use crate::error::{AgentError, Result};
use crate::request::Request;
use crate::transport::{SocketOptions, Transport, ZmqTransport};
use logjam_core::endpoint::{self, Endpoint};
use logjam_core::Severity;
use std::sync::Arc;

/// Long line truncation threshold, in bytes.
pub const MAX_LINE_LENGTH_DEFAULT: usize = 2048;
/// Cap on the total bytes of all log lines of one request.
pub const MAX_BYTES_ALL_LINES_DEFAULT: usize = 1024 * 1024;

/// Options for building an [`Agent`].
///
/// `app_name` and `env_name` are required; they name the stream the
/// collector files messages under. Everything else has a default, most of
/// them overridable through the environment (see the field docs).
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Name of your application. Required.
    pub app_name: String,
    /// The environment you are running in (production, preview, ...). Required.
    pub env_name: String,
    /// Comma separated list of broker connection specs. Falls back to
    /// `LOGJAM_AGENT_ZMQ_ENDPOINTS`, then `LOGJAM_BROKER`, then `localhost`.
    pub endpoints: Option<String>,
    /// Default port for connection specs without one. Falls back to
    /// `LOGJAM_AGENT_ZMQ_PORT`, then 9604.
    pub port: Option<u16>,
    /// Socket linger on close, milliseconds. `LOGJAM_AGENT_ZMQ_LINGER`, 1000.
    pub linger_ms: Option<i32>,
    /// Send high-water mark. `LOGJAM_AGENT_ZMQ_SND_HWM`, 1000.
    pub snd_hwm: Option<i32>,
    /// Receive high-water mark. `LOGJAM_AGENT_ZMQ_RCV_HWM`, 1000.
    pub rcv_hwm: Option<i32>,
    /// Send timeout, milliseconds. `LOGJAM_AGENT_ZMQ_SND_TIMEO`, 5000.
    pub snd_timeout_ms: Option<i32>,
    /// Receive timeout, milliseconds. `LOGJAM_AGENT_ZMQ_RCV_TIMEO`, 5000.
    pub rcv_timeout_ms: Option<i32>,
    /// Only lines at this severity or above are forwarded to the collector.
    /// Lower lines still advance the request's severity watermark.
    pub log_level: Severity,
    /// How action names are derived from requests.
    pub action_name_extractor: ActionNameExtractor,
    /// Whether client IPs are masked before they enter the payload.
    pub obfuscate_ips: bool,
    /// Truncation threshold for a single log line, in bytes.
    pub max_line_length: usize,
    /// Cap on the total log bytes of one request.
    pub max_bytes_all_lines: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            app_name: String::new(),
            env_name: String::new(),
            endpoints: None,
            port: None,
            linger_ms: None,
            snd_hwm: None,
            rcv_hwm: None,
            snd_timeout_ms: None,
            rcv_timeout_ms: None,
            log_level: Severity::Debug,
            action_name_extractor: ActionNameExtractor::Default,
            obfuscate_ips: false,
            max_line_length: MAX_LINE_LENGTH_DEFAULT,
            max_bytes_all_lines: MAX_BYTES_ALL_LINES_DEFAULT,
        }
    }
}

fn env_or(programmed: Option<i32>, name: &str, default: i32) -> i32 {
    programmed
        .or_else(|| std::env::var(name).ok().and_then(|value| value.parse().ok()))
        .unwrap_or(default)
}

/// Host identity tags, read from the environment once at agent construction.
#[derive(Clone, Debug, Default)]
pub(crate) struct HostTags {
    pub host: String,
    pub cluster: String,
    pub datacenter: String,
    pub namespace: String,
}

impl HostTags {
    fn from_env() -> Self {
        HostTags {
            host: std::env::var("HOSTNAME").unwrap_or_default(),
            cluster: std::env::var("CLUSTER").unwrap_or_default(),
            datacenter: std::env::var("DATACENTER").unwrap_or_default(),
            namespace: std::env::var("NAMESPACE").unwrap_or_default(),
        }
    }
}

pub(crate) struct AgentInner {
    pub(crate) app_name: String,
    pub(crate) env_name: String,
    pub(crate) log_level: Severity,
    pub(crate) extractor: ActionNameExtractor,
    pub(crate) obfuscate_ips: bool,
    pub(crate) max_line_length: usize,
    pub(crate) max_bytes_all_lines: usize,
    pub(crate) tags: HostTags,
    transport: Box<dyn Transport>,
}

/// Handle to the process-wide telemetry agent. Cheap to clone.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Builds an agent that publishes over ZeroMQ.
    ///
    /// Endpoint discovery and validation happen here; a spec that does not
    /// parse is a fatal configuration error. The socket itself is created
    /// lazily on the first send.
    pub fn new(config: AgentConfig) -> Result<Agent> {
        let port = config
            .port
            .or_else(|| {
                std::env::var("LOGJAM_AGENT_ZMQ_PORT")
                    .ok()
                    .and_then(|value| value.parse().ok())
            })
            .unwrap_or(endpoint::DEFAULT_PORT);

        let endpoints = endpoint::discover(config.endpoints.as_deref(), port);
        if endpoints.is_empty() {
            return Err(AgentError::Config("no broker endpoints".to_string()));
        }
        for spec in &endpoints {
            Endpoint::parse(spec, port)?;
        }

        let options = SocketOptions {
            linger_ms: env_or(config.linger_ms, "LOGJAM_AGENT_ZMQ_LINGER", 1000),
            snd_hwm: env_or(config.snd_hwm, "LOGJAM_AGENT_ZMQ_SND_HWM", 1000),
            rcv_hwm: env_or(config.rcv_hwm, "LOGJAM_AGENT_ZMQ_RCV_HWM", 1000),
            snd_timeout_ms: env_or(config.snd_timeout_ms, "LOGJAM_AGENT_ZMQ_SND_TIMEO", 5000),
            rcv_timeout_ms: env_or(config.rcv_timeout_ms, "LOGJAM_AGENT_ZMQ_RCV_TIMEO", 5000),
        };

        let stream = format!("{}-{}", config.app_name, config.env_name);
        let topic = format!("logs.{}.{}", config.app_name, config.env_name);
        let transport = ZmqTransport::new(stream, topic, endpoints, options);
        Agent::with_transport(config, Box::new(transport))
    }

    /// Builds an agent on a caller-supplied [`Transport`]. This is how tests
    /// capture payloads and how exotic deployments swap the wire out.
    pub fn with_transport(config: AgentConfig, transport: Box<dyn Transport>) -> Result<Agent> {
        if config.app_name.is_empty() {
            return Err(AgentError::Config("app_name is required".to_string()));
        }
        if config.env_name.is_empty() {
            return Err(AgentError::Config("env_name is required".to_string()));
        }

        Ok(Agent {
            inner: Arc::new(AgentInner {
                app_name: config.app_name,
                env_name: config.env_name,
                log_level: config.log_level,
                extractor: config.action_name_extractor,
                obfuscate_ips: config.obfuscate_ips,
                max_line_length: config.max_line_length,
                max_bytes_all_lines: config.max_bytes_all_lines,
                tags: HostTags::from_env(),
                transport,
            }),
        })
    }

    /// Starts a request record with the given action name. Prefer the
    /// middleware for HTTP traffic; this entry point exists for background
    /// jobs that want records of their own.
    pub fn begin_request(&self, action: impl Into<String>) -> Request {
        Request::new(self, action)
    }

    /// Says goodbye to the broker and releases the socket. Call once at
    /// process teardown; what happens to sends after shutdown is undefined.
    pub fn shutdown(&self) {
        self.inner.transport.shutdown();
    }

    pub(crate) fn send(&self, payload: Vec<u8>) {
        self.inner.transport.send(payload);
    }

    pub(crate) fn inner(&self) -> &AgentInner {
        &self.inner
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("app_name", &self.inner.app_name)
            .field("env_name", &self.inner.env_name)
            .field("log_level", &self.inner.log_level)
            .finish_non_exhaustive()
    }
}
