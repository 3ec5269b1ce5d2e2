//! Transport-level message envelope and settlement types.
//!
//! A [`ReceivedMessage`] is what a transport hands to a channel receiver: the
//! raw body plus the metadata the host needs to drive the pipeline (delivery
//! count, lock token, property bag). Payload decoding happens in the host.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LockToken
// ---------------------------------------------------------------------------

/// Opaque token identifying one delivery of a message while it is locked
/// (invisible) on the transport.
///
/// Settlement operations (`complete`, `abandon`, `dead_letter`) are addressed
/// by lock token, not by message id, because the same logical message gets a
/// new token on every redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    /// Wraps a transport-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageProperties
// ---------------------------------------------------------------------------

/// Mutable string-keyed property bag carried with a message.
///
/// Used for cross-cutting metadata such as correlation and trace
/// propagation. Properties are never part of the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties(HashMap<String, String>);

impl MessageProperties {
    /// Well-known property carrying the correlation id used for tracing.
    pub const CORRELATION_ID: &'static str = "correlation-id";

    /// Creates an empty property bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Inserts or replaces a property, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the bag holds no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MessageProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// ReceivedMessage
// ---------------------------------------------------------------------------

/// One delivery of a message as yielded by a transport's receive loop.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Transport-assigned identifier, stable across redeliveries.
    pub message_id: String,
    /// Serialized payload.
    pub body: Bytes,
    /// Content type label of `body`, if the transport carries one.
    pub content_type: Option<String>,
    /// Number of times this message has been delivered, starting at 1.
    /// Monotonically non-decreasing across redeliveries.
    pub delivery_count: u32,
    /// Token addressing this particular delivery for settlement.
    pub lock_token: LockToken,
    /// Application properties.
    pub properties: MessageProperties,
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// Final fate of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    /// Acknowledged; the transport removes the message.
    Completed,
    /// Returned to the source for redelivery.
    Abandoned,
    /// Moved to quarantine.
    DeadLettered,
}

impl Disposition {
    /// Stable lowercase label used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_insert_replaces_and_returns_previous() {
        let mut props = MessageProperties::new();
        assert!(props.insert("k", "v1").is_none());
        assert_eq!(props.insert("k", "v2").as_deref(), Some("v1"));
        assert_eq!(props.get("k"), Some("v2"));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn properties_collect_from_pairs() {
        let props: MessageProperties = [("a", "1"), ("b", "2")].into_iter().collect();
        assert!(props.contains_key("a"));
        assert_eq!(props.get("b"), Some("2"));
        assert!(props.get("c").is_none());
    }

    #[test]
    fn disposition_labels_are_stable() {
        assert_eq!(Disposition::Completed.to_string(), "completed");
        assert_eq!(Disposition::Abandoned.to_string(), "abandoned");
        assert_eq!(Disposition::DeadLettered.to_string(), "dead_lettered");
    }
}
