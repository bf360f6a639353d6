use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Attributes
// ============================================================================

/// Normalized message attributes: string keys to string values.
///
/// Insertion order is kept so that backends with order-sensitive header
/// formats write headers back in the order they were supplied. Equality
/// ignores order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(IndexMap<String, String>);

impl AttributeSet {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(IndexMap::with_capacity(capacity))
    }

    /// Insert or overwrite a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert only when the key is not present yet (first occurrence wins).
    ///
    /// Returns `true` when the value was stored.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        match self.0.entry(key.into()) {
            indexmap::map::Entry::Occupied(_) => false,
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Remove a key, keeping the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = AttributeSet::new();
        set.extend(iter);
        set
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for AttributeSet {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl IntoIterator for AttributeSet {
    type Item = (String, String);
    type IntoIter = indexmap::map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = (&'a String, &'a String);
    type IntoIter = indexmap::map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// Core Message Types
// ============================================================================

/// A message pulled from a backend and handed to a handler.
///
/// `raw` is the backend-native handle (a STOMP frame, a Kafka record, an SQS
/// message, ...). A message is owned by exactly one handler invocation and is
/// dropped when the handler returns.
#[derive(Debug, Clone)]
pub struct Message<R> {
    pub id: Option<String>,
    pub payload: Bytes,
    pub attributes: AttributeSet,
    pub raw: R,
}

impl<R> Message<R> {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Who is responsible for acknowledging a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// The broker acknowledges on delivery.
    #[default]
    Auto,
    /// The consumer acknowledges each message on its own.
    ClientIndividual,
    /// The consumer acknowledges a message and everything delivered before it.
    ClientCumulative,
    /// Nobody acknowledges.
    None,
}

impl AckMode {
    /// Whether the consumer has to send an explicit ack/delete/commit.
    pub fn requires_explicit_ack(&self) -> bool {
        matches!(self, AckMode::ClientIndividual | AckMode::ClientCumulative)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::ClientIndividual => "client-individual",
            AckMode::ClientCumulative => "client-cumulative",
            AckMode::None => "none",
        }
    }
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "client-individual" | "client_individual" => Ok(AckMode::ClientIndividual),
            "client-cumulative" | "client_cumulative" | "client" => Ok(AckMode::ClientCumulative),
            "none" => Ok(AckMode::None),
            other => Err(format!("unknown ack mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_wins() {
        let mut attrs = AttributeSet::new();
        assert!(attrs.insert_if_absent("a", "1"));
        assert!(!attrs.insert_if_absent("a", "2"));
        assert_eq!(attrs.get("a"), Some("1"));
    }

    #[test]
    fn test_equality_ignores_order() {
        let a: AttributeSet = [("x", "1"), ("y", "2")].into_iter().collect();
        let b: AttributeSet = [("y", "2"), ("x", "1")].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut attrs: AttributeSet = [("a", "1"), ("b", "2"), ("c", "3")].into_iter().collect();
        attrs.remove("b");
        assert_eq!(attrs.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_ack_mode_serde() {
        let mode: AckMode = serde_json::from_str("\"client-individual\"").unwrap();
        assert_eq!(mode, AckMode::ClientIndividual);
        assert_eq!(serde_json::to_string(&AckMode::None).unwrap(), "\"none\"");
    }

    #[test]
    fn test_ack_mode_explicit() {
        assert!(!AckMode::Auto.requires_explicit_ack());
        assert!(!AckMode::None.requires_explicit_ack());
        assert!(AckMode::ClientIndividual.requires_explicit_ack());
        assert!(AckMode::ClientCumulative.requires_explicit_ack());
        assert_eq!("client".parse::<AckMode>().unwrap(), AckMode::ClientCumulative);
    }
}
