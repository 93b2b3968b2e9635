//! Namespaced event identifiers.
//!
//! The source design carries event-ids as Clojure keywords (`:chsk/ws-ping`).
//! Rust has no first-class keyword type, so `EventId` interns the `ns/name`
//! form explicitly and keeps the namespace/name split available for callers
//! that want to match on it.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A validated `namespace/name` identifier, e.g. `chsk/handshake`.
///
/// Equality and hashing compare the interned `ns/name` string, matching the
/// source's keyword-identity semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    interned: String,
    ns_len: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidEventId {
    #[error("event-id must be namespaced as 'ns/name', got {0:?}")]
    NotNamespaced(String),
    #[error("event-id namespace and name must be non-empty, got {0:?}")]
    EmptyComponent(String),
}

impl EventId {
    /// Build an `EventId` from explicit namespace and name parts.
    pub fn new(namespace: &str, name: &str) -> Result<Self, InvalidEventId> {
        if namespace.is_empty() || name.is_empty() {
            return Err(InvalidEventId::EmptyComponent(format!(
                "{namespace}/{name}"
            )));
        }
        Ok(Self {
            ns_len: namespace.len(),
            interned: format!("{namespace}/{name}"),
        })
    }

    /// Parse the `ns/name` wire form, failing if the identifier is
    /// unqualified (no `/`) or either half is empty.
    pub fn parse(s: &str) -> Result<Self, InvalidEventId> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self {
                ns_len: ns.len(),
                interned: s.to_owned(),
            }),
            Some(_) => Err(InvalidEventId::EmptyComponent(s.to_owned())),
            None => Err(InvalidEventId::NotNamespaced(s.to_owned())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.interned[..self.ns_len]
    }

    pub fn name(&self) -> &str {
        &self.interned[self.ns_len + 1..]
    }

    /// The interned `ns/name` wire form.
    pub fn as_str(&self) -> &str {
        &self.interned
    }

    pub fn is_namespace(&self, ns: &str) -> bool {
        self.namespace() == ns
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.interned)
    }
}

impl TryFrom<&str> for EventId {
    type Error = InvalidEventId;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for EventId {
    type Error = InvalidEventId;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.interned)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EventId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Macro for declaring well-known event-ids as associated constants without
/// repeating the `EventId::parse(...).unwrap()` boilerplate at every call
/// site. Namespace and name are both compile-time string literals, so the
/// `unwrap` can never fail.
#[macro_export]
macro_rules! event_id {
    ($ns:literal, $name:literal) => {{
        // SAFETY net: both halves are non-empty literals, parse cannot fail.
        $crate::EventId::new($ns, $name).expect("literal event-id is always valid")
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_identifiers() {
        let id = EventId::parse("chsk/ws-ping").unwrap();
        assert_eq!(id.namespace(), "chsk");
        assert_eq!(id.name(), "ws-ping");
        assert_eq!(id.as_str(), "chsk/ws-ping");
    }

    #[test]
    fn rejects_unqualified_identifiers() {
        assert_eq!(
            EventId::parse("ping"),
            Err(InvalidEventId::NotNamespaced("ping".to_owned()))
        );
    }

    #[test]
    fn rejects_empty_components() {
        assert!(EventId::parse("/ping").is_err());
        assert!(EventId::parse("chsk/").is_err());
        assert!(EventId::new("", "ping").is_err());
    }

    #[test]
    fn equality_compares_interned_form() {
        let a = EventId::parse("app/foo").unwrap();
        let b = EventId::new("app", "foo").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn json_round_trip_uses_ns_name_string() {
        let id = EventId::parse("app/foo").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"app/foo\"");
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn json_deserialize_rejects_unqualified_string() {
        let err = serde_json::from_str::<EventId>("\"ping\"");
        assert!(err.is_err());
    }
}
