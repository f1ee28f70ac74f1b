//! Store key generation for distributed limiters.

use std::fmt;

/// A key that identifies one event budget in the shared store.
///
/// The key is composed of the limiter prefix and the event ID. The store
/// appends the window epoch, so the stored counter lives under
/// `{prefix}:{event_id}:{epoch}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Namespace of the limiter, e.g. `deviceauth:rate:g:devices`
    pub prefix: String,
    /// The event ID within the limiter, empty for an unkeyed limiter
    pub event_id: String,
}

impl EventKey {
    /// Create a new event key.
    pub fn new(prefix: &str, event_id: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            event_id: event_id.to_string(),
        }
    }

    /// Convert the key to the string used in the store.
    pub fn to_string_key(&self) -> String {
        if self.event_id.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}:{}", self.prefix, self.event_id)
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Prefix of the default group's limiter.
pub fn default_group_prefix(service_prefix: &str) -> String {
    format!("{}:rate:default", service_prefix)
}

/// Prefix of a named group's limiter.
pub fn group_prefix(service_prefix: &str, group: &str) -> String {
    format!("{}:rate:g:{}", service_prefix, group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_to_string() {
        let key = EventKey::new("svc:rate:default", "user-1");
        assert_eq!(key.to_string_key(), "svc:rate:default:user-1");
        assert_eq!(key.to_string(), "svc:rate:default:user-1");
    }

    #[test]
    fn test_unkeyed_event_key() {
        let key = EventKey::new("svc:rate:default", "");
        assert_eq!(key.to_string_key(), "svc:rate:default");
    }

    #[test]
    fn test_event_key_equality() {
        assert_eq!(EventKey::new("p", "a"), EventKey::new("p", "a"));
        assert_ne!(EventKey::new("p", "a"), EventKey::new("p", "b"));
    }

    #[test]
    fn test_group_prefixes() {
        assert_eq!(default_group_prefix("deviceauth"), "deviceauth:rate:default");
        assert_eq!(group_prefix("deviceauth", "devices"), "deviceauth:rate:g:devices");
    }
}
