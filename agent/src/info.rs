//! What the payload reveals about the HTTP request
//!
//! Builds the `request_info` object (method, url, headers, query parameters)
//! and applies the two privacy rules that come with it: infrastructure and
//! credential headers are filtered out before serialization, and client IPs
//! can be obfuscated by masking their host bits.

use http::header::{HeaderMap, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::Uri;
use regex::Regex;
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

/// Headers that never make it into `request_info.headers`: server internals,
/// routing artifacts, and anything carrying credentials.
#[allow(clippy::expect_used)]
fn dropped_headers() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| {
        Regex::new(
            r"^(Server|Path|Gateway|Request|Script|Remote|Query|Passenger|Document|Scgi|Union[_-]Station|Original[_-]|Routes[_-]|Raw[_-]Post[_-]Data|(Http[_-])?Authorization)",
        )
        .expect("header filter pattern is valid")
    })
}

#[allow(clippy::expect_used)]
fn trailing_zeros() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| Regex::new(r"0+$").expect("trailing zero pattern is valid"))
}

/// Canonicalizes a header name to the `Word-Word` form the collector
/// displays, e.g. `x-logjam-caller-id` → `X-Logjam-Caller-Id`.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Whether the request declares a body. Decides if `Content-Length` is worth
/// reporting.
pub(crate) fn declares_body(headers: &HeaderMap) -> bool {
    let declared_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    declared_length > 0 || headers.contains_key(TRANSFER_ENCODING)
}

/// Filters and canonicalizes request headers. Multi-valued headers keep only
/// their first value.
pub(crate) fn filtered_headers(headers: &HeaderMap, has_body: bool) -> Map<String, Value> {
    let mut filtered = Map::new();
    for name in headers.keys() {
        let canonical = canonical_header_name(name.as_str());
        if dropped_headers().is_match(&canonical) {
            continue;
        }
        if canonical == "Content-Length" && !has_body {
            continue;
        }
        let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) else {
            continue;
        };
        filtered.insert(canonical, Value::String(value.to_string()));
    }
    filtered
}

/// Decodes the query string into a map of name to value, or to a list of
/// values when a name repeats.
pub(crate) fn query_parameters(uri: &Uri) -> Option<Map<String, Value>> {
    let query = uri.query()?;
    let mut parameters = Map::new();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match parameters.get_mut(name.as_ref()) {
            None => {
                parameters.insert(name.into_owned(), Value::String(value.into_owned()));
            }
            Some(existing @ Value::String(_)) => {
                let first = std::mem::replace(existing, Value::Null);
                *existing = Value::Array(vec![first, Value::String(value.into_owned())]);
            }
            Some(Value::Array(values)) => {
                values.push(Value::String(value.into_owned()));
            }
            Some(_) => {}
        }
    }
    if parameters.is_empty() {
        None
    } else {
        Some(parameters)
    }
}

/// Builds the `request_info` object for the payload.
pub(crate) fn request_info(method: &str, uri: &Uri, headers: &HeaderMap) -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("method".to_string(), Value::String(method.to_string()));
    info.insert("url".to_string(), Value::String(uri.to_string()));

    let headers = filtered_headers(headers, declares_body(headers));
    if !headers.is_empty() {
        info.insert("headers".to_string(), Value::Object(headers));
    }
    if let Some(parameters) = query_parameters(uri) {
        info.insert("query_parameters".to_string(), Value::Object(parameters));
    }
    info
}

fn mask_v4(address: Ipv4Addr) -> String {
    // /24 mask, then blank the trailing zero run of the dotted form
    let octets = address.octets();
    let masked = format!("{}.{}.{}.0", octets[0], octets[1], octets[2]);
    trailing_zeros().replace(&masked, "XXX").into_owned()
}

fn mask_v6(address: Ipv6Addr) -> String {
    // /112 mask, then blank the trailing zero run of the last group
    let mut segments = address.segments();
    segments[7] = 0;
    let masked = Ipv6Addr::from(segments).to_string();
    trailing_zeros().replace(&masked, "XXXX").into_owned()
}

/// Obfuscates a client IP by masking its host bits: IPv4 addresses to /24
/// with the last octet shown as `XXX`, IPv6 addresses to /112 with the last
/// group shown as `XXXX`. Anything that does not parse as an IP is returned
/// unchanged.
pub fn obfuscate_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => mask_v4(v4),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => mask_v4(v4),
            None => mask_v6(v6),
        },
        Err(_) => ip.to_string(),
    }
}
