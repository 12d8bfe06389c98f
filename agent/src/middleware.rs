//! Tower middleware binding a [`Request`] to each HTTP transaction
//!
//! Wrap your router once:
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
//! For every request the middleware derives the action name, creates a
//! [`Request`](crate::Request), makes it reachable for handlers through the
//! request extensions, runs the inner service with panic capture, stamps the
//! `X-Logjam-*` response headers, and finalizes the record when the response
//! body has left the process.
//!
//! A panicking handler still produces a complete record: one FATAL line with
//! the panic payload and a backtrace, a 500 code, and a finalized message on
//! the wire before the panic is either re-raised (`bubble_panics`) or turned
//! into a plain 500 response.

use crate::agent::Agent;
use crate::capture::{CapturedBody, ResponseCapture};
use crate::context::CurrentRequest;
use crate::info::{self, obfuscate_ip};
use crate::request::Request as LogjamRequest;
use axum::body::Body;
use axum::extract::ConnectInfo;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use logjam_core::Severity;
use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::error;

const CALLER_ID_HEADER: &str = "x-logjam-caller-id";
const ACTION_HEADER: &str = "x-logjam-action";
const TRACE_ID_HEADER: &str = "x-logjam-trace-id";
const REQUEST_ID_HEADER: &str = "x-logjam-request-id";

/// Layer that instruments a service with logjam telemetry.
#[derive(Clone, Debug)]
pub struct LogjamLayer {
    agent: Agent,
    bubble_panics: bool,
}

impl LogjamLayer {
    /// Creates the layer for an agent. Panics are answered with a plain 500
    /// by default; see [`bubble_panics`](LogjamLayer::bubble_panics).
    pub fn new(agent: Agent) -> Self {
        LogjamLayer {
            agent,
            bubble_panics: false,
        }
    }

    /// Chooses what happens to a handler panic after the telemetry record is
    /// finalized: re-raise it (`true`, the connection dies the way the host
    /// framework decides) or swallow it and answer a 500 (`false`).
    pub fn bubble_panics(mut self, bubble: bool) -> Self {
        self.bubble_panics = bubble;
        self
    }
}

impl<S> Layer<S> for LogjamLayer {
    type Service = LogjamService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LogjamService {
            inner,
            agent: self.agent.clone(),
            bubble_panics: self.bubble_panics,
        }
    }
}

/// The middleware service produced by [`LogjamLayer`].
#[derive(Clone, Debug)]
pub struct LogjamService<S> {
    inner: S,
    agent: Agent,
    bubble_panics: bool,
}

impl<S> Service<Request<Body>> for LogjamService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response<Body>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness, leave the clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let agent = self.agent.clone();
        let bubble_panics = self.bubble_panics;

        let action = agent.inner().extractor.extract(&req);
        let request = Arc::new(LogjamRequest::new(&agent, action));

        request.set_caller(
            header_str(req.headers(), CALLER_ID_HEADER).as_deref(),
            header_str(req.headers(), ACTION_HEADER).as_deref(),
        );
        if let Some(trace_id) = header_str(req.headers(), TRACE_ID_HEADER) {
            request.set_trace_id(&trace_id);
        }

        let ip = client_ip(&req);
        request.set_ip(if agent.inner().obfuscate_ips {
            obfuscate_ip(&ip)
        } else {
            ip
        });

        // Snapshot before the inner service consumes the request.
        request.set_info(info::request_info(
            req.method().as_str(),
            req.uri(),
            req.headers(),
        ));

        req.extensions_mut().insert(CurrentRequest(request.clone()));

        let capture = ResponseCapture::new();

        Box::pin(async move {
            let outcome = AssertUnwindSafe(async { inner.call(req).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(mut response)) => {
                    capture.write_header(response.status().as_u16());
                    stamp_response_headers(response.headers_mut(), &request);

                    // The record closes when the body has fully streamed (or
                    // the client went away), so total_time covers the last
                    // byte, not just the handler return.
                    let finish_capture = capture.clone();
                    let finish_request = request.clone();
                    Ok(response.map(|body| {
                        Body::new(CapturedBody::new(body, capture, move || {
                            finish_request.finish(finish_capture.code());
                        }))
                    }))
                }
                Ok(Err(inner_error)) => {
                    request.finish(500);
                    Err(inner_error)
                }
                Err(panic) => {
                    let description = panic_description(panic.as_ref());
                    request.log(
                        Severity::Fatal,
                        format!(
                            "handler panicked: {description}\n{}",
                            Backtrace::force_capture()
                        ),
                    );
                    if !capture.header_written() {
                        capture.write_header(500);
                    }
                    request.finish(capture.code());

                    if bubble_panics {
                        std::panic::resume_unwind(panic);
                    }
                    error!(action = %request.action(), "handler panicked: {description}");
                    let mut response = Response::new(Body::from("Internal Server Error"));
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    stamp_response_headers(response.headers_mut(), &request);
                    Ok(response)
                }
            }
        })
    }
}

fn header_str(headers: &HeaderMap, name: &'static str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn client_ip<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(address)| address.ip().to_string())
        .unwrap_or_default()
}

fn stamp_response_headers(headers: &mut HeaderMap, request: &LogjamRequest) {
    set_header(headers, REQUEST_ID_HEADER, request.id());
    set_header(headers, ACTION_HEADER, &request.action());
    set_header(headers, CALLER_ID_HEADER, &request.caller_id());
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn panic_description(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
