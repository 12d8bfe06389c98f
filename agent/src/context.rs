//! Reaching the current request from handler code
//!
//! The middleware stores an `Arc<Request>` in the request extensions under a
//! crate-private wrapper, so only this module can put one there. Handlers
//! pull it back out with [`request_from`], or use the free functions below
//! when they only want to record something and do not care whether telemetry
//! is wired up at all — every one of them is a no-op without a request in
//! the extensions.

use crate::request::Request;
use http::header::{HeaderName, HeaderValue};
use http::Extensions;
use logjam_core::Severity;
use std::sync::Arc;
use std::time::Duration;

/// Private extensions key. The type is the key: nothing outside this crate
/// can insert or replace it.
#[derive(Clone)]
pub(crate) struct CurrentRequest(pub(crate) Arc<Request>);

/// Returns the telemetry record of the current request, if the middleware
/// put one in these extensions.
pub fn request_from(extensions: &Extensions) -> Option<Arc<Request>> {
    extensions
        .get::<CurrentRequest>()
        .map(|current| current.0.clone())
}

/// Marks an outgoing request with the current request's identity, so the
/// downstream service reports us as its caller: `X-Logjam-Caller-Id` becomes
/// our id, `X-Logjam-Action` our action.
pub fn set_call_headers<B>(request: &Request, outgoing: &mut http::Request<B>) {
    let headers = outgoing.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request.id()) {
        headers.insert(HeaderName::from_static("x-logjam-caller-id"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&request.action()) {
        headers.insert(HeaderName::from_static("x-logjam-action"), value);
    }
}

/// Records a log line on the current request, if any.
pub fn log(extensions: &Extensions, severity: Severity, message: impl Into<String>) {
    if let Some(request) = request_from(extensions) {
        request.log(severity, message);
    }
}

/// Increments a counter on the current request, if any.
pub fn count(extensions: &Extensions, key: &str) {
    add_count(extensions, key, 1);
}

/// Adds to a counter on the current request, if any.
pub fn add_count(extensions: &Extensions, key: &str, value: i64) {
    if let Some(request) = request_from(extensions) {
        request.add_count(key, value);
    }
}

/// Adds to a timer on the current request, if any.
pub fn add_duration(extensions: &Extensions, key: &str, value: Duration) {
    if let Some(request) = request_from(extensions) {
        request.add_duration(key, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig};
    use crate::transport::DiscardTransport;

    fn test_agent() -> Agent {
        Agent::with_transport(
            AgentConfig {
                app_name: "app".to_string(),
                env_name: "test".to_string(),
                ..AgentConfig::default()
            },
            Box::new(DiscardTransport),
        )
        .unwrap()
    }

    #[test]
    fn set_call_headers_stamps_identity_onto_the_outgoing_request() {
        let agent = test_agent();
        let request = agent.begin_request("Some#action");

        let mut outgoing = http::Request::builder()
            .uri("http://downstream/api")
            .body(())
            .unwrap();
        set_call_headers(&request, &mut outgoing);

        assert_eq!(
            outgoing.headers().get("X-Logjam-Caller-Id").unwrap(),
            request.id()
        );
        assert_eq!(
            outgoing.headers().get("X-Logjam-Action").unwrap(),
            "Some#action"
        );
    }

    #[test]
    fn helpers_reach_the_request_through_extensions() {
        let agent = test_agent();
        let request = Arc::new(agent.begin_request("a#b"));
        let mut extensions = Extensions::new();
        extensions.insert(CurrentRequest(request.clone()));

        let found = request_from(&extensions).unwrap();
        assert_eq!(found.id(), request.id());

        count(&extensions, "lookups");
        add_count(&extensions, "lookups", 2);
        add_duration(&extensions, "db_time", Duration::from_millis(5));
        log(&extensions, Severity::Error, "boom");
        assert_eq!(request.severity(), Severity::Error);
    }

    #[test]
    fn helpers_without_a_request_are_no_ops() {
        let extensions = Extensions::new();
        assert!(request_from(&extensions).is_none());
        count(&extensions, "lookups");
        log(&extensions, Severity::Fatal, "nobody listening");
    }
}
