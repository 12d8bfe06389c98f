//! Log severity scale
//!
//! The collector identifies severities by number, both in the per-request
//! `severity` field and in the first element of every log line triple. The
//! numeric values are therefore part of the wire contract and must not change.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a log line, ordered from [`Severity::Debug`] to
/// [`Severity::Fatal`].
///
/// Serializes as its numeric value. Values outside the scale are clamped on
/// the way in, never rejected: telemetry must not fail a request over a bad
/// log level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Diagnostic chatter, usually only forwarded in development.
    Debug = 0,
    /// Normal operation.
    Info = 1,
    /// Something looks off but the request succeeded.
    Warn = 2,
    /// The request failed.
    Error = 3,
    /// The handler panicked or the process is in trouble.
    Fatal = 4,
}

impl Severity {
    /// Converts a raw numeric level, clamping out-of-range input to the scale.
    pub fn from_i64(value: i64) -> Severity {
        match value {
            i64::MIN..=0 => Severity::Debug,
            1 => Severity::Info,
            2 => Severity::Warn,
            3 => Severity::Error,
            _ => Severity::Fatal,
        }
    }

    /// The numeric wire value.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Upper-case label, matching what log facades print.
    pub fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Debug
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Ok(Severity::from_i64(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(Severity::Debug.as_i64(), 0);
        assert_eq!(Severity::Info.as_i64(), 1);
        assert_eq!(Severity::Warn.as_i64(), 2);
        assert_eq!(Severity::Error.as_i64(), 3);
        assert_eq!(Severity::Fatal.as_i64(), 4);
    }

    #[test]
    fn clamps_out_of_range_input() {
        assert_eq!(Severity::from_i64(-3), Severity::Debug);
        assert_eq!(Severity::from_i64(5), Severity::Fatal);
        assert_eq!(Severity::from_i64(100), Severity::Fatal);
        assert_eq!(Severity::from_i64(2), Severity::Warn);
    }

    #[test]
    fn ordering_follows_the_scale() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Error < Severity::Fatal);
        assert_eq!(Severity::Warn.max(Severity::Error), Severity::Error);
    }
}
