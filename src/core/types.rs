use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of the realtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Live,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Live => "live",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One decoded realtime message, tagged with its routing fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Subject code, e.g. `0B` for executed trades
    pub subject: String,
    /// Subscription group the server tagged the message with, if any
    pub group: Option<String>,
    /// Instrument code
    pub item: String,
    /// Human readable subject name sent alongside the code
    pub name: Option<String>,
    /// Field code to value
    pub values: HashMap<String, Value>,
}

impl Envelope {
    pub fn new(subject: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            group: None,
            item: item.into(),
            name: None,
            values: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, code: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(code.into(), value.into());
        self
    }

    /// String value of a field; numbers are not coerced
    pub fn value(&self, code: &str) -> Option<&str> {
        self.values.get(code).and_then(Value::as_str)
    }
}

/// Which control request a server acknowledgement answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// A decoded realtime frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Login { return_code: i64, return_msg: String },
    Ping,
    Ack {
        kind: AckKind,
        return_code: i64,
        return_msg: String,
    },
    Data(Vec<Envelope>),
    /// Recognised as a frame but not routed anywhere
    Other(String),
}

/// Subscribe/unsubscribe request for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub group: String,
    pub items: Vec<String>,
    pub subjects: Vec<String>,
}

impl Subscription {
    pub fn new(group: impl Into<String>, items: Vec<String>, subjects: Vec<String>) -> Self {
        Self {
            group: group.into(),
            items,
            subjects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_builder() {
        let envelope = Envelope::new("0B", "005930")
            .with_group("1")
            .with_value("10", "+60700")
            .with_value("9001", 3);

        assert_eq!(envelope.group.as_deref(), Some("1"));
        assert_eq!(envelope.value("10"), Some("+60700"));
        assert_eq!(envelope.value("9001"), None);
        assert_eq!(envelope.value("missing"), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Live.to_string(), "live");
        assert_eq!(ConnectionState::Authenticating.to_string(), "authenticating");
    }
}
