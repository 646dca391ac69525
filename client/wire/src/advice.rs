//! Server advice steering client retry behavior.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The reconnect action requested by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Retry the `/meta/connect` exchange.
    Retry,
    /// Start over with a new `/meta/handshake`.
    Handshake,
    /// Stop contacting the server.
    None,
}

/// Guidance attached by the server to a reply, steering client retries.
///
/// All durations are milliseconds. Fields the client does not recognize are
/// preserved in `rest`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    /// Requested reconnect action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// How long the server will hold a connect before replying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// How long the client should wait before the next connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Upper bound on inactivity before the client must re-handshake.
    #[serde(rename = "maxInterval", skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<u64>,
    /// Unrecognized advice fields, preserved verbatim.
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

impl Advice {
    /// Advice asking the server to reply to a connect immediately.
    pub fn immediate() -> Self {
        Self {
            timeout: Some(0),
            ..Self::default()
        }
    }

    /// The reconnect action, or `default` when absent.
    pub fn reconnect_or(&self, default: Reconnect) -> Reconnect {
        self.reconnect.unwrap_or(default)
    }

    /// `timeout` in milliseconds, defaulting to 0.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.unwrap_or(0)
    }

    /// `interval` in milliseconds, defaulting to 0.
    pub fn interval_ms(&self) -> u64 {
        self.interval.unwrap_or(0)
    }

    /// `maxInterval` in milliseconds, defaulting to 0.
    pub fn max_interval_ms(&self) -> u64 {
        self.max_interval.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_wire_names() {
        assert_eq!(serde_json::to_string(&Reconnect::Retry).unwrap(), "\"retry\"");
        assert_eq!(
            serde_json::to_string(&Reconnect::Handshake).unwrap(),
            "\"handshake\""
        );
        assert_eq!(serde_json::to_string(&Reconnect::None).unwrap(), "\"none\"");
    }

    #[test]
    fn test_parse_with_unknown_fields() {
        let advice: Advice = serde_json::from_str(
            r#"{"reconnect":"retry","interval":250,"maxInterval":10000,"multiple-clients":true}"#,
        )
        .unwrap();
        assert_eq!(advice.reconnect, Some(Reconnect::Retry));
        assert_eq!(advice.interval_ms(), 250);
        assert_eq!(advice.max_interval_ms(), 10_000);
        assert_eq!(advice.timeout_ms(), 0);
        assert_eq!(advice.rest.get("multiple-clients"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_immediate_advice() {
        let advice = Advice::immediate();
        assert_eq!(
            serde_json::to_string(&advice).unwrap(),
            r#"{"timeout":0}"#
        );
    }
}
