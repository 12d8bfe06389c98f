//! Shipping finished requests to the broker
//!
//! The agent talks to the broker over a single long-lived ZeroMQ DEALER
//! socket. The socket is created lazily on the first send: one of the
//! configured endpoints is picked uniformly at random (so a fleet of
//! processes spreads across brokers without coordination), its host is
//! resolved to an IPv4 address, and the socket connects once and is reused.
//!
//! ZeroMQ sockets are not thread safe, so every socket operation happens
//! under one mutex. The monotonic sequence number stamped into each
//! meta-header advances under that same lock.
//!
//! Delivery is fire-and-forget: a failed or timed-out send is logged through
//! `tracing` and dropped. Nothing here ever surfaces an error to the request
//! being served.

use crate::error::{AgentError, Result};
use logjam_core::endpoint::Endpoint;
use logjam_core::meta::{self, Compression};
use parking_lot::Mutex;
use rand::Rng;
use std::net::ToSocketAddrs;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Seam between the request aggregator and the wire.
///
/// The default implementation is [`ZmqTransport`]. Tests and dry runs can
/// substitute their own, e.g. to capture payloads in memory; see
/// [`DiscardTransport`].
pub trait Transport: Send + Sync {
    /// Ships one serialized payload. Must not fail the caller.
    fn send(&self, payload: Vec<u8>);

    /// Releases the connection, telling the broker goodbye if the protocol
    /// has a way to. Called exactly once, at process teardown.
    fn shutdown(&self);
}

/// Socket tunables, resolved from the configuration and environment once at
/// agent construction.
#[derive(Clone, Copy, Debug)]
pub struct SocketOptions {
    /// Linger on close, in milliseconds.
    pub linger_ms: i32,
    /// Send high-water mark, in messages.
    pub snd_hwm: i32,
    /// Receive high-water mark, in messages.
    pub rcv_hwm: i32,
    /// Send timeout, in milliseconds.
    pub snd_timeout_ms: i32,
    /// Receive timeout, in milliseconds.
    pub rcv_timeout_ms: i32,
}

struct SocketState {
    socket: Option<zmq::Socket>,
    sequence: u64,
}

/// The production transport: one DEALER socket, serialized sends, Snappy
/// payload compression, and the 24-byte meta-header on every message.
pub struct ZmqTransport {
    context: zmq::Context,
    stream: String,
    topic: String,
    endpoints: Vec<String>,
    options: SocketOptions,
    state: Mutex<SocketState>,
}

impl ZmqTransport {
    /// Creates a transport for the given stream. The socket itself is not
    /// created until the first send.
    pub fn new(stream: String, topic: String, endpoints: Vec<String>, options: SocketOptions) -> Self {
        ZmqTransport {
            context: zmq::Context::new(),
            stream,
            topic,
            endpoints,
            options,
            state: Mutex::new(SocketState {
                socket: None,
                sequence: 0,
            }),
        }
    }

    fn connect(&self) -> Result<zmq::Socket> {
        if self.endpoints.is_empty() {
            return Err(AgentError::Config("no broker endpoints".to_string()));
        }
        let mut rng = rand::thread_rng();
        let spec = &self.endpoints[rng.gen_range(0..self.endpoints.len())];
        let resolved = resolve_endpoint(spec)?;

        let socket = self.context.socket(zmq::DEALER)?;
        socket.set_linger(self.options.linger_ms)?;
        socket.set_sndhwm(self.options.snd_hwm)?;
        socket.set_rcvhwm(self.options.rcv_hwm)?;
        socket.set_sndtimeo(self.options.snd_timeout_ms)?;
        socket.set_rcvtimeo(self.options.rcv_timeout_ms)?;
        socket.connect(&resolved)?;
        debug!(endpoint = %resolved, "connected to broker");
        Ok(socket)
    }
}

impl Transport for ZmqTransport {
    fn send(&self, payload: Vec<u8>) {
        let compressed = match meta::compress(&payload) {
            Ok(compressed) => compressed,
            Err(error) => {
                warn!(%error, "dropping request record, compression failed");
                return;
            }
        };

        let mut state = self.state.lock();
        if state.socket.is_none() {
            match self.connect() {
                Ok(socket) => state.socket = Some(socket),
                Err(error) => {
                    warn!(%error, "dropping request record, broker connection failed");
                    return;
                }
            }
        }
        state.sequence += 1;
        let header = meta::pack(SystemTime::now(), state.sequence, Compression::Snappy);

        if let Some(socket) = state.socket.as_ref() {
            let frames = [
                self.stream.as_bytes(),
                self.topic.as_bytes(),
                compressed.as_slice(),
                header.as_slice(),
            ];
            if let Err(error) = socket.send_multipart(frames, 0) {
                warn!(%error, "dropping request record, send failed");
            }
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        let Some(socket) = state.socket.take() else {
            return;
        };

        // Best-effort goodbye so the broker can log a clean disconnect.
        // Failures here are uninteresting; the socket closes either way.
        state.sequence += 1;
        let header = meta::pack(SystemTime::now(), state.sequence, Compression::None);
        let frames = [
            b"".as_slice(),
            b"ping".as_slice(),
            self.stream.as_bytes(),
            b"{}".as_slice(),
            header.as_slice(),
        ];
        if let Err(error) = socket.send_multipart(frames, 0) {
            warn!(%error, "could not send shutdown ping");
            return;
        }
        match socket.recv_multipart(0) {
            Ok(answer) => {
                if answer.get(1).map(Vec::as_slice) != Some(b"200 OK".as_slice()) {
                    warn!("unexpected answer to shutdown ping");
                }
            }
            Err(error) => warn!(%error, "no answer to shutdown ping"),
        }
    }
}

/// Transport that drops everything. The default when you want the middleware
/// wired up without a broker, e.g. in tests or local development.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardTransport;

impl Transport for DiscardTransport {
    fn send(&self, _payload: Vec<u8>) {}

    fn shutdown(&self) {}
}

/// Resolves a normalized endpoint's host to an IPv4 address. Only `tcp`
/// endpoints are resolved; other transports are passed to ZeroMQ as-is.
fn resolve_endpoint(spec: &str) -> Result<String> {
    let endpoint = Endpoint::parse(spec, logjam_core::endpoint::DEFAULT_PORT)?;
    if endpoint.protocol != "tcp" {
        return Ok(spec.to_string());
    }
    let port = endpoint.port.unwrap_or(logjam_core::endpoint::DEFAULT_PORT);
    let addresses = (endpoint.host.as_str(), port)
        .to_socket_addrs()
        .map_err(|_| AgentError::Resolve(endpoint.host.clone()))?;
    let ipv4 = addresses
        .filter(|address| address.is_ipv4())
        .map(|address| address.ip())
        .next()
        .ok_or_else(|| AgentError::Resolve(endpoint.host.clone()))?;
    Ok(format!("tcp://{ipv4}:{port}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tcp_hosts_to_ipv4() {
        assert_eq!(
            resolve_endpoint("tcp://127.0.0.1:9604").unwrap(),
            "tcp://127.0.0.1:9604"
        );
        assert_eq!(
            resolve_endpoint("tcp://localhost:9604").unwrap(),
            "tcp://127.0.0.1:9604"
        );
    }

    #[test]
    fn leaves_other_protocols_alone() {
        assert_eq!(resolve_endpoint("inproc://test").unwrap(), "inproc://test");
    }

    #[test]
    fn unresolvable_hosts_error() {
        assert!(resolve_endpoint("tcp://host.invalid:9604").is_err());
    }
}
