//! Per-request telemetry aggregation
//!
//! A [`Request`] collects everything one HTTP transaction wants to tell the
//! collector: log lines, counters, timers, free-form fields, exception tags,
//! caller identity. The middleware creates it, handlers mutate it through
//! the request extensions (possibly from several tasks at once), and
//! [`finish`](Request::finish) freezes it into a single JSON document and
//! hands that to the transport.
//!
//! # Memory bounds
//!
//! The log buffer is bounded twice over. A single line longer than
//! `max_line_length` bytes is truncated with a ` ... [LINE TRUNCATED]`
//! suffix. Once the running total of raw line bytes crosses
//! `max_bytes_all_lines`, exactly one `... [LINES DROPPED]` sentinel is
//! recorded and everything after it is ignored.
//!
//! # Concurrency
//!
//! A single mutex guards all mutable state. No user code ever runs under it:
//! [`measure_duration`](Request::measure_duration) times its thunk outside
//! the lock and only locks for the bookkeeping.

use crate::agent::Agent;
use chrono::{DateTime, Local};
use logjam_core::Severity;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::error;

const LINE_TRUNCATED: &str = " ... [LINE TRUNCATED]";
const LINES_DROPPED: &str = "... [LINES DROPPED]";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One recorded log line: severity, timestamp, message. Serializes as the
/// three-element array the collector expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LogLine {
    severity: Severity,
    time: String,
    message: String,
}

impl LogLine {
    fn new(severity: Severity, time: DateTime<Local>, message: String, max_length: usize) -> Self {
        LogLine {
            severity,
            time: time.format(TIME_FORMAT).to_string(),
            message: truncate_line(message, max_length),
        }
    }

    #[cfg(test)]
    fn message(&self) -> &str {
        &self.message
    }
}

impl Serialize for LogLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.severity)?;
        seq.serialize_element(&self.time)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

/// Truncates a message to at most `max_length` bytes, replacing the tail
/// with ` ... [LINE TRUNCATED]`. Cuts on a char boundary, so multi-byte
/// input may come out slightly shorter than the limit.
fn truncate_line(message: String, max_length: usize) -> String {
    if message.len() <= max_length {
        return message;
    }
    let mut cut = max_length.saturating_sub(LINE_TRUNCATED.len());
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &message[..cut], LINE_TRUNCATED)
}

struct RequestState {
    action: String,
    trace_id: String,
    caller_id: String,
    caller_action: String,
    ip: String,
    severity: Severity,
    lines: Vec<LogLine>,
    lines_bytes: usize,
    lines_dropped: bool,
    counts: BTreeMap<String, i64>,
    durations: BTreeMap<String, Duration>,
    fields: Map<String, Value>,
    exceptions: BTreeSet<String>,
    info: Option<Map<String, Value>>,
    finished: bool,
}

/// Telemetry record of one HTTP transaction.
pub struct Request {
    agent: Agent,
    uuid: String,
    id: String,
    start_wall: DateTime<Local>,
    start: Instant,
    state: Mutex<RequestState>,
}

impl Request {
    /// Starts a new record. The timestamp is taken here, so create the
    /// request immediately before running the work it describes.
    pub fn new(agent: &Agent, action: impl Into<String>) -> Request {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}-{}-{}",
            agent.inner().app_name,
            agent.inner().env_name,
            uuid
        );
        Request {
            agent: agent.clone(),
            uuid,
            id,
            start_wall: Local::now(),
            start: Instant::now(),
            state: Mutex::new(RequestState {
                action: action.into(),
                trace_id: String::new(),
                caller_id: String::new(),
                caller_action: String::new(),
                ip: String::new(),
                severity: Severity::Info,
                lines: Vec::new(),
                lines_bytes: 0,
                lines_dropped: false,
                counts: BTreeMap::new(),
                durations: BTreeMap::new(),
                fields: Map::new(),
                exceptions: BTreeSet::new(),
                info: None,
                finished: false,
            }),
        }
    }

    /// The request UUID: 32 lowercase hex characters, a v4 UUID with the
    /// dashes stripped, as the collector expects.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The full request id, `<app>-<env>-<uuid>`. This is what gets passed
    /// to downstream services as their caller id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current action name.
    pub fn action(&self) -> String {
        self.state.lock().action.clone()
    }

    /// Reassigns the action name. Allowed until the record is finished;
    /// routers use this when the real action is only known after matching.
    pub fn change_action(&self, action: impl Into<String>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.action = action.into();
    }

    /// The distributed trace id. Defaults to [`uuid`](Request::uuid) unless
    /// the caller propagated one.
    pub fn trace_id(&self) -> String {
        let state = self.state.lock();
        if state.trace_id.is_empty() {
            self.uuid.clone()
        } else {
            state.trace_id.clone()
        }
    }

    /// The caller's request id, from `X-Logjam-Caller-Id`.
    pub fn caller_id(&self) -> String {
        self.state.lock().caller_id.clone()
    }

    /// The caller's action name, from `X-Logjam-Action`.
    pub fn caller_action(&self) -> String {
        self.state.lock().caller_action.clone()
    }

    pub(crate) fn set_caller(&self, caller_id: Option<&str>, caller_action: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(caller_id) = caller_id {
            state.caller_id = caller_id.to_string();
        }
        if let Some(caller_action) = caller_action {
            state.caller_action = caller_action.to_string();
        }
    }

    pub(crate) fn set_trace_id(&self, trace_id: &str) {
        self.state.lock().trace_id = trace_id.to_string();
    }

    pub(crate) fn set_ip(&self, ip: String) {
        self.state.lock().ip = ip;
    }

    pub(crate) fn set_info(&self, info: Map<String, Value>) {
        self.state.lock().info = Some(info);
    }

    /// Records a log line.
    ///
    /// Every call advances the severity watermark, even when the line itself
    /// is dropped by the forwarding threshold or the byte budget.
    pub fn log(&self, severity: Severity, line: impl Into<String>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        if state.severity < severity {
            state.severity = severity;
        }
        if severity < self.agent.inner().log_level {
            return;
        }
        if state.lines_dropped {
            return;
        }

        let message: String = line.into();
        state.lines_bytes += message.len();
        let max_length = self.agent.inner().max_line_length;
        if state.lines_bytes > self.agent.inner().max_bytes_all_lines {
            state.lines_dropped = true;
            state
                .lines
                .push(LogLine::new(severity, Local::now(), LINES_DROPPED.to_string(), max_length));
        } else {
            state
                .lines
                .push(LogLine::new(severity, Local::now(), message, max_length));
        }
    }

    /// Adds `value` to the counter `key`.
    pub fn add_count(&self, key: &str, value: i64) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        *state.counts.entry(key.to_string()).or_insert(0) += value;
    }

    /// Increments the counter `key` by one.
    pub fn count(&self, key: &str) {
        self.add_count(key, 1);
    }

    /// Adds elapsed time to the timer `key`.
    pub fn add_duration(&self, key: &str, value: Duration) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        *state.durations.entry(key.to_string()).or_insert(Duration::ZERO) += value;
    }

    /// Runs `work` and adds its wall-clock time to the timer `key`. The
    /// closure runs outside the request lock.
    pub fn measure_duration<T>(&self, key: &str, work: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let result = work();
        self.add_duration(key, started.elapsed());
        result
    }

    /// Attaches a free-form field to the payload. Fields are merged into the
    /// document last and may overwrite any other key; that escape hatch is
    /// intentional.
    pub fn set_field(&self, key: &str, value: impl Into<Value>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.fields.insert(key.to_string(), value.into());
    }

    /// Looks up a previously set field.
    pub fn get_field(&self, key: &str) -> Option<Value> {
        self.state.lock().fields.get(key).cloned()
    }

    /// Tags the request with an exception name. Tags form a set; adding one
    /// twice records it once.
    pub fn add_exception(&self, tag: impl Into<String>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.exceptions.insert(tag.into());
    }

    /// The severity watermark so far.
    pub fn severity(&self) -> Severity {
        self.state.lock().severity
    }

    /// Freezes the record with the response code, serializes it, and hands
    /// it to the transport. Runs at most once; later calls and any mutation
    /// after the first call are silently ignored.
    pub fn finish(&self, code: u16) {
        let payload = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            self.build_payload(&state, code)
        };

        match serde_json::to_vec(&payload) {
            Ok(bytes) => self.agent.send(bytes),
            Err(err) => error!(error = %err, "could not serialize request record"),
        }
    }

    fn build_payload(&self, state: &RequestState, code: u16) -> Value {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let tags = &self.agent.inner().tags;

        let mut payload = Map::new();
        payload.insert("action".to_string(), Value::String(state.action.clone()));
        payload.insert("code".to_string(), Value::from(code));
        payload.insert("process_id".to_string(), Value::from(std::process::id()));
        payload.insert("request_id".to_string(), Value::String(self.uuid.clone()));
        let trace_id = if state.trace_id.is_empty() {
            self.uuid.clone()
        } else {
            state.trace_id.clone()
        };
        payload.insert("trace_id".to_string(), Value::String(trace_id));
        payload.insert("severity".to_string(), Value::from(state.severity.as_i64()));
        payload.insert(
            "started_at".to_string(),
            Value::String(self.start_wall.format(TIME_FORMAT).to_string()),
        );
        payload.insert(
            "started_ms".to_string(),
            Value::from(self.start_wall.timestamp_millis()),
        );
        payload.insert("total_time".to_string(), Value::from(total_time_ms));

        if !state.lines.is_empty() {
            if let Ok(lines) = serde_json::to_value(&state.lines) {
                payload.insert("lines".to_string(), lines);
            }
        }
        if let Some(info) = &state.info {
            payload.insert("request_info".to_string(), Value::Object(info.clone()));
        }
        if !state.ip.is_empty() {
            payload.insert("ip".to_string(), Value::String(state.ip.clone()));
        }
        if !state.caller_id.is_empty() {
            payload.insert("caller_id".to_string(), Value::String(state.caller_id.clone()));
        }
        if !state.caller_action.is_empty() {
            payload.insert(
                "caller_action".to_string(),
                Value::String(state.caller_action.clone()),
            );
        }
        if !state.exceptions.is_empty() {
            payload.insert(
                "exceptions".to_string(),
                Value::Array(state.exceptions.iter().cloned().map(Value::String).collect()),
            );
        }
        if !tags.host.is_empty() {
            payload.insert("host".to_string(), Value::String(tags.host.clone()));
        }
        if !tags.cluster.is_empty() {
            payload.insert("cluster".to_string(), Value::String(tags.cluster.clone()));
        }
        if !tags.datacenter.is_empty() {
            payload.insert("datacenter".to_string(), Value::String(tags.datacenter.clone()));
        }
        if !tags.namespace.is_empty() {
            payload.insert("namespace".to_string(), Value::String(tags.namespace.clone()));
        }

        // Individual timers can overlap under concurrency and add up to more
        // than wall time, but the collector assumes their sum stays below
        // total_time. Scale them down when they do not.
        let durations_ms: Vec<(String, f64)> = state
            .durations
            .iter()
            .map(|(key, duration)| (key.clone(), duration.as_secs_f64() * 1000.0))
            .collect();
        let durations_sum: f64 = durations_ms.iter().map(|(_, millis)| millis).sum();
        let correction = if durations_sum > total_time_ms {
            (total_time_ms - 0.1) / durations_sum
        } else {
            1.0
        };
        for (key, millis) in durations_ms {
            payload.insert(key, Value::from(millis * correction));
        }

        for (key, value) in &state.counts {
            payload.insert(key.clone(), Value::from(*value));
        }

        // fields win over everything, by contract
        for (key, value) in &state.fields {
            payload.insert(key.clone(), value.clone());
        }

        Value::Object(payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::transport::Transport;
    use std::sync::Arc;

    /// Transport that keeps every payload for inspection.
    #[derive(Default)]
    struct CaptureTransport {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl CaptureTransport {
        fn documents(&self) -> Vec<Value> {
            self.payloads
                .lock()
                .iter()
                .map(|bytes| serde_json::from_slice(bytes).unwrap())
                .collect()
        }
    }

    impl Transport for Arc<CaptureTransport> {
        fn send(&self, payload: Vec<u8>) {
            self.payloads.lock().push(payload);
        }

        fn shutdown(&self) {}
    }

    fn capturing_agent(config: AgentConfig) -> (Agent, Arc<CaptureTransport>) {
        let transport = Arc::new(CaptureTransport::default());
        let agent = Agent::with_transport(config, Box::new(transport.clone())).unwrap();
        (agent, transport)
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            app_name: "app".to_string(),
            env_name: "test".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn identity_is_derived_from_app_env_and_uuid() {
        let (agent, _) = capturing_agent(test_config());
        let request = agent.begin_request("Home#index");

        assert_eq!(request.uuid().len(), 32);
        assert!(request.uuid().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(request.id(), format!("app-test-{}", request.uuid()));
        assert_eq!(request.trace_id(), request.uuid());
    }

    #[test]
    fn long_lines_are_truncated_in_place() {
        let (agent, _) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        request.log(Severity::Debug, "x".repeat(2050));
        let state = request.state.lock();
        let message = state.lines[0].message();
        assert_eq!(message.len(), 2048);
        assert_eq!(message, &format!("{}{}", "x".repeat(2027), LINE_TRUNCATED));
    }

    #[test]
    fn short_lines_are_kept_verbatim() {
        let (agent, _) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        request.log(Severity::Debug, "x".repeat(2048));
        let state = request.state.lock();
        assert_eq!(state.lines[0].message(), &"x".repeat(2048));
    }

    #[test]
    fn line_budget_emits_exactly_one_sentinel() {
        let (agent, _) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        let overflow = MAX_BYTES_ALL_LINES_TEST / MAX_LINE_LENGTH_TEST;
        for _ in 0..overflow * 2 {
            request.log(Severity::Debug, "x".repeat(MAX_LINE_LENGTH_TEST));
        }

        let state = request.state.lock();
        assert_eq!(state.lines.len(), overflow + 1);
        assert_eq!(state.lines[overflow].message(), LINES_DROPPED);
        assert_eq!(
            state
                .lines
                .iter()
                .filter(|line| line.message() == LINES_DROPPED)
                .count(),
            1
        );
    }

    const MAX_LINE_LENGTH_TEST: usize = crate::agent::MAX_LINE_LENGTH_DEFAULT;
    const MAX_BYTES_ALL_LINES_TEST: usize = crate::agent::MAX_BYTES_ALL_LINES_DEFAULT;

    #[test]
    fn watermark_rises_even_below_the_forwarding_threshold() {
        let (agent, _) = capturing_agent(AgentConfig {
            log_level: Severity::Error,
            ..test_config()
        });
        let request = agent.begin_request("a#b");

        request.log(Severity::Warn, "not forwarded");
        assert_eq!(request.severity(), Severity::Warn);
        assert!(request.state.lock().lines.is_empty());

        request.log(Severity::Fatal, "forwarded");
        assert_eq!(request.severity(), Severity::Fatal);
        assert_eq!(request.state.lock().lines.len(), 1);
    }

    #[test]
    fn initial_severity_is_info() {
        let (agent, _) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");
        assert_eq!(request.severity(), Severity::Info);

        // DEBUG lines never lower the watermark
        request.log(Severity::Debug, "quiet");
        assert_eq!(request.severity(), Severity::Info);
    }

    #[test]
    fn counters_and_timers_accumulate() {
        let (agent, transport) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        request.count("rest_calls");
        request.add_count("rest_calls", 2);
        request.add_duration("rest_time", Duration::from_millis(30));
        request.add_duration("rest_time", Duration::from_millis(20));
        let answer = request.measure_duration("view_time", || 42);
        assert_eq!(answer, 42);

        request.finish(200);
        let payload = &transport.documents()[0];
        assert_eq!(payload["rest_calls"], 3);
        assert!((payload["rest_time"].as_f64().unwrap() - 50.0).abs() < 1.0);
        assert!(payload["view_time"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn durations_are_scaled_down_to_fit_total_time() {
        let (agent, transport) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        // Far more timer time than this request can have spent
        request.add_duration("db_time", Duration::from_secs(30));
        request.add_duration("view_time", Duration::from_secs(10));
        request.finish(200);

        let payload = &transport.documents()[0];
        let total = payload["total_time"].as_f64().unwrap();
        let sum = payload["db_time"].as_f64().unwrap() + payload["view_time"].as_f64().unwrap();
        assert!(sum <= total, "sum of timers {sum} must not exceed total {total}");
        // relative proportions survive the correction
        let ratio = payload["db_time"].as_f64().unwrap() / payload["view_time"].as_f64().unwrap();
        assert!((ratio - 3.0).abs() < 0.01);
    }

    #[test]
    fn fields_overwrite_payload_keys() {
        let (agent, transport) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        request.set_field("user_id", 1234);
        request.set_field("severity", 99);
        assert_eq!(request.get_field("user_id"), Some(Value::from(1234)));

        request.finish(200);
        let payload = &transport.documents()[0];
        assert_eq!(payload["user_id"], 1234);
        assert_eq!(payload["severity"], 99);
    }

    #[test]
    fn exceptions_form_a_sorted_set() {
        let (agent, transport) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        request.add_exception("TimeoutError");
        request.add_exception("ArgumentError");
        request.add_exception("TimeoutError");
        request.finish(500);

        let payload = &transport.documents()[0];
        assert_eq!(
            payload["exceptions"],
            Value::Array(vec!["ArgumentError".into(), "TimeoutError".into()])
        );
    }

    #[test]
    fn payload_carries_the_required_keys() {
        let (agent, transport) = capturing_agent(test_config());
        let request = agent.begin_request("Some#action");
        request.log(Severity::Info, "a line");
        request.finish(200);

        let payload = &transport.documents()[0];
        assert_eq!(payload["action"], "Some#action");
        assert_eq!(payload["code"], 200);
        assert_eq!(payload["request_id"].as_str().unwrap(), request.uuid());
        assert_eq!(payload["trace_id"].as_str().unwrap(), request.uuid());
        assert_eq!(payload["severity"], 1);
        assert!(payload["process_id"].as_u64().unwrap() > 0);
        assert!(payload["total_time"].as_f64().unwrap() >= 0.0);

        // started_at formats with 6 fractional digits; started_ms is its
        // millisecond floor
        let started_at = payload["started_at"].as_str().unwrap();
        assert_eq!(started_at.len(), "2006-01-02T15:04:05.000000".len());
        let parsed =
            chrono::NaiveDateTime::parse_from_str(started_at, "%Y-%m-%dT%H:%M:%S%.6f").unwrap();
        let started_ms = payload["started_ms"].as_i64().unwrap();
        assert_eq!(
            parsed.and_local_timezone(Local).single().unwrap().timestamp_millis(),
            started_ms
        );

        let lines = payload["lines"].as_array().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0][0], 1);
        assert_eq!(lines[0][2], "a line");

        // nothing optional sneaks in
        assert!(payload.get("caller_id").is_none());
        assert!(payload.get("exceptions").is_none());
        assert!(payload.get("request_info").is_none());
    }

    #[test]
    fn finish_runs_once_and_freezes_the_record() {
        let (agent, transport) = capturing_agent(test_config());
        let request = agent.begin_request("a#b");

        request.finish(200);
        request.finish(500);
        assert_eq!(transport.documents().len(), 1);

        // post-finish mutations are silently dropped
        request.log(Severity::Fatal, "too late");
        request.add_count("late", 1);
        request.change_action("Too#late");
        assert_eq!(request.action(), "a#b");
        assert_eq!(request.severity(), Severity::Info);
    }

    #[test]
    fn mutators_are_safe_across_threads() {
        let (agent, transport) = capturing_agent(test_config());
        let request = Arc::new(agent.begin_request("a#b"));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let request = request.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        request.add_count("iterations", 1);
                        request.add_duration("work_time", Duration::from_micros(10));
                        request.log(Severity::Debug, format!("worker {worker} line {i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        request.finish(200);
        let payload = &transport.documents()[0];
        assert_eq!(payload["iterations"], 800);
        assert_eq!(payload["lines"].as_array().unwrap().len(), 800);
    }
}
