//! Broker connection spec parsing and normalization
//!
//! Agents accept connection specs in several shorthand forms and expand them
//! to a full `protocol://host:port` before connecting:
//!
//! ```text
//! logjam              -> tcp://logjam:9604
//! logjam:9605         -> tcp://logjam:9605
//! udp://logjam        -> udp://logjam:9604
//! tcp://logjam:9604   -> tcp://logjam:9604
//! inproc://test       -> inproc://test        (never rewritten)
//! ```
//!
//! A spec that does not match the grammar is passed through untouched so the
//! failure surfaces as a connection error at the socket, not as a silent
//! rewrite.

use crate::error::WireError;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Default broker port when a spec does not name one.
pub const DEFAULT_PORT: u16 = 9604;

#[allow(clippy::expect_used)]
fn spec_matcher() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| {
        Regex::new(r"^(?:([^:]+)://)?([^:]+)(?::(\d+))?$").expect("endpoint grammar is valid")
    })
}

/// A parsed broker endpoint.
///
/// The host is never empty. The port is `None` only for the in-process
/// transport, where ZeroMQ addresses are names rather than host/port pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Transport protocol, `tcp` unless the spec says otherwise.
    pub protocol: String,
    /// Host name, IP address, or inproc channel name.
    pub host: String,
    /// Port, defaulted for network transports, absent for inproc.
    pub port: Option<u16>,
}

impl Endpoint {
    /// Parses a connection spec, applying the protocol and port defaults.
    pub fn parse(spec: &str, default_port: u16) -> Result<Endpoint, WireError> {
        let captures = spec_matcher()
            .captures(spec)
            .ok_or_else(|| WireError::Endpoint(spec.to_string()))?;

        let protocol = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let host = captures.get(2).map(|m| m.as_str()).unwrap_or("");
        if host.is_empty() {
            return Err(WireError::Endpoint(spec.to_string()));
        }

        if protocol == "inproc" {
            return Ok(Endpoint {
                protocol: protocol.to_string(),
                host: host.to_string(),
                port: None,
            });
        }

        let port = match captures.get(3) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| WireError::Endpoint(spec.to_string()))?,
            None => default_port,
        };

        Ok(Endpoint {
            protocol: if protocol.is_empty() { "tcp" } else { protocol }.to_string(),
            host: host.to_string(),
            port: Some(port),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.protocol, self.host, port),
            None => write!(f, "{}://{}", self.protocol, self.host),
        }
    }
}

/// Expands a connection spec to its full `protocol://host:port` form.
///
/// `inproc` specs and specs that do not match the grammar are returned
/// unchanged. Normalization is idempotent.
pub fn normalize(spec: &str, default_port: u16) -> String {
    match Endpoint::parse(spec, default_port) {
        Ok(endpoint) if endpoint.protocol == "inproc" => spec.to_string(),
        Ok(endpoint) => endpoint.to_string(),
        Err(_) => spec.to_string(),
    }
}

/// Resolves the endpoint list an agent should connect to.
///
/// Precedence: the programmer-supplied spec string, then
/// `LOGJAM_AGENT_ZMQ_ENDPOINTS`, then `LOGJAM_BROKER`, then `localhost`.
/// The chosen string is split on commas and each entry normalized.
pub fn discover(configured: Option<&str>, default_port: u16) -> Vec<String> {
    let specs = configured
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("LOGJAM_AGENT_ZMQ_ENDPOINTS").ok().filter(|s| !s.is_empty()))
        .or_else(|| std::env::var("LOGJAM_BROKER").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string());

    specs
        .split(',')
        .filter(|spec| !spec.is_empty())
        .map(|spec| normalize(spec, default_port))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fills_in_protocol_and_port() {
        assert_eq!(normalize("logjam", DEFAULT_PORT), "tcp://logjam:9604");
        assert_eq!(normalize("logjam:9605", DEFAULT_PORT), "tcp://logjam:9605");
        assert_eq!(normalize("udp://logjam", DEFAULT_PORT), "udp://logjam:9604");
        assert_eq!(normalize("tcp://logjam:9604", DEFAULT_PORT), "tcp://logjam:9604");
        assert_eq!(normalize("logjam", 3000), "tcp://logjam:3000");
    }

    #[test]
    fn leaves_inproc_specs_alone() {
        assert_eq!(normalize("inproc://test", DEFAULT_PORT), "inproc://test");
    }

    #[test]
    fn leaves_non_matching_specs_alone() {
        assert_eq!(normalize("tcp://a:b:c", DEFAULT_PORT), "tcp://a:b:c");
        assert_eq!(normalize("", DEFAULT_PORT), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for spec in ["logjam", "logjam:9605", "udp://logjam", "inproc://x", "a:b:c"] {
            let once = normalize(spec, DEFAULT_PORT);
            assert_eq!(normalize(&once, DEFAULT_PORT), once);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Endpoint::parse("tcp://a:b:c", DEFAULT_PORT).is_err());
        assert!(Endpoint::parse("", DEFAULT_PORT).is_err());
    }

    #[test]
    fn parse_extracts_the_tuple() {
        let endpoint = Endpoint::parse("broker.example.com:9605", DEFAULT_PORT).unwrap();
        assert_eq!(endpoint.protocol, "tcp");
        assert_eq!(endpoint.host, "broker.example.com");
        assert_eq!(endpoint.port, Some(9605));

        let inproc = Endpoint::parse("inproc://test", DEFAULT_PORT).unwrap();
        assert_eq!(inproc.port, None);
    }

    // Env-based discovery lives in one test because the variables are process
    // globals.
    #[test]
    fn discovery_precedence() {
        std::env::remove_var("LOGJAM_AGENT_ZMQ_ENDPOINTS");
        std::env::remove_var("LOGJAM_BROKER");
        assert_eq!(discover(None, DEFAULT_PORT), vec!["tcp://localhost:9604"]);

        std::env::set_var("LOGJAM_BROKER", "host1");
        assert_eq!(discover(None, DEFAULT_PORT), vec!["tcp://host1:9604"]);

        std::env::set_var("LOGJAM_AGENT_ZMQ_ENDPOINTS", "host1,host2");
        assert_eq!(
            discover(None, DEFAULT_PORT),
            vec!["tcp://host1:9604", "tcp://host2:9604"]
        );

        // programmer values win over the environment
        assert_eq!(discover(Some("foobar"), 3000), vec!["tcp://foobar:3000"]);

        std::env::remove_var("LOGJAM_AGENT_ZMQ_ENDPOINTS");
        std::env::remove_var("LOGJAM_BROKER");
    }

    #[test]
    fn discovery_skips_empty_entries() {
        assert_eq!(
            discover(Some("host1,,host2"), DEFAULT_PORT),
            vec!["tcp://host1:9604", "tcp://host2:9604"]
        );
    }
}
