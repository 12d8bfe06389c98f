//! Action name derivation
//!
//! The collector groups requests by an action name of the form
//! `Class(::Class)*#method_or_verb`, derived from the HTTP method and the
//! escaped URL path. Two conventions are in circulation:
//!
//! - [`default_action_name`]: path segments become camel-cased classes,
//!   numeric ids become `Id`, and the lower-cased HTTP method is the suffix.
//!   `GET /rest/app/v1/users/123` → `Rest::App::V1::Users::Id#get`.
//! - [`legacy_action_name`]: the historical scheme, kept so established
//!   dashboards keep their names. Numeric ids become `by_id`, a `v1` segment
//!   additionally emits the upper-cased method, and the last segment is the
//!   suffix. `GET /rest/app/v1/users/123` → `Rest::App::V1::GET::Users#by_id`.
//!
//! Both functions are pure; pick one per agent, or plug in your own.

use axum::body::Body;
use std::fmt;
use std::sync::Arc;

/// Strategy for deriving action names from incoming requests.
#[derive(Clone, Default)]
pub enum ActionNameExtractor {
    /// Camel-cased segments, `Id` placeholders, method as suffix.
    #[default]
    Default,
    /// The historical naming scheme, for installations that predate it.
    Legacy,
    /// A user-supplied derivation.
    Custom(Arc<dyn Fn(&http::Request<Body>) -> String + Send + Sync>),
}

impl ActionNameExtractor {
    /// Derives the action name for an incoming request.
    pub fn extract(&self, request: &http::Request<Body>) -> String {
        match self {
            ActionNameExtractor::Default => {
                default_action_name(request.method().as_str(), request.uri().path())
            }
            ActionNameExtractor::Legacy => {
                legacy_action_name(request.method().as_str(), request.uri().path())
            }
            ActionNameExtractor::Custom(extract) => extract(request),
        }
    }
}

impl fmt::Debug for ActionNameExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionNameExtractor::Default => f.write_str("Default"),
            ActionNameExtractor::Legacy => f.write_str("Legacy"),
            ActionNameExtractor::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A segment is an id when it starts with a decimal digit.
fn is_numeric_id(segment: &str) -> bool {
    segment.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Title-cases every word of `s`, where words are delimited by anything that
/// is not a letter, digit or underscore. `employment-statuses` stays two
/// words, `index.html` becomes `Index.Html`, and `_system` keeps its
/// underscore prefix lower-cased.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = !(c.is_alphanumeric() || c == '_');
    }
    out
}

/// Camel-cases one path segment: underscores count as dashes, dash-separated
/// words are title-cased and joined without a separator.
fn format_segment(segment: &str) -> String {
    segment
        .replace('_', "-")
        .split('-')
        .map(title_case)
        .collect()
}

/// Derives an action name in the default convention.
pub fn default_action_name(method: &str, path: &str) -> String {
    let parts: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if is_numeric_id(segment) {
                "Id".to_string()
            } else {
                format_segment(segment)
            }
        })
        .collect();

    let class = if parts.is_empty() {
        "Unknown".to_string()
    } else {
        parts.join("::")
    };
    format!("{}#{}", class, method.to_lowercase())
}

/// Derives an action name in the legacy convention.
pub fn legacy_action_name(method: &str, path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if is_numeric_id(segment) {
            parts.push("by_id".to_string());
        } else {
            parts.push(title_case(segment));
            if segment == "v1" {
                parts.push(method.to_uppercase());
            }
        }
    }

    let suffix = match parts.pop() {
        Some(last) => last.to_lowercase().replace('-', "_"),
        None => "unknown".to_string(),
    };
    let class = parts.join("::").replace('-', "");
    let class = if class.is_empty() {
        "Unknown".to_string()
    } else {
        class
    };
    format!("{class}#{suffix}")
}
