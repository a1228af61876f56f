//! Core event types
//!
//! An [`Event`] is a structural record: a `type`, a per-queue `id` assigned at
//! push time, and arbitrary type-specific fields. [`CollapseClass`] is the
//! closed table of event kinds that a queue folds together while they wait
//! for delivery.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Identifier of a user account
pub type UserId = u64;

/// Identifier of a realm (organization)
pub type RealmId = u64;

/// Identifier of an event queue, `"<generation>:<counter>"`
pub type QueueId = String;

/// Key under which per-recipient notification hints travel with an event.
/// Never delivered to clients.
pub const INTERNAL_DATA: &str = "internal_data";

/// A single event destined for a client queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type (`message`, `pointer`, `update_message_flags`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Queue-local id; overwritten when the event is pushed
    #[serde(default)]
    pub id: u64,
    /// Type-specific payload
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// Create an event with no payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: 0,
            fields: Map::new(),
        }
    }

    /// Builder method: set a payload field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Synthetic keepalive event injected by the heartbeat timer
    pub fn heartbeat() -> Self {
        Self::new("heartbeat")
    }

    /// Event telling clients the server restarted under a new generation
    pub fn restart(server_generation: i64) -> Self {
        Self::new("restart").with("server_generation", server_generation)
    }

    /// Get a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a payload field as a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Notification hints attached for the recipient, if any
    pub fn internal_data(&self) -> Option<&Map<String, Value>> {
        self.fields.get(INTERNAL_DATA).and_then(Value::as_object)
    }

    /// Copy of this event safe to hand to a client
    pub fn for_client(&self) -> Event {
        let mut event = self.clone();
        event.fields.remove(INTERNAL_DATA);
        event
    }

    /// Fold a newer occurrence of the same collapse class into this one.
    ///
    /// The merged event takes the newer id so it sorts where the most recent
    /// occurrence would have.
    pub(crate) fn absorb(&mut self, class: &CollapseClass, newer: &Event) {
        self.id = newer.id;
        if let Some(timestamp) = newer.fields.get("timestamp") {
            self.fields.insert("timestamp".to_string(), timestamp.clone());
        }

        match class {
            CollapseClass::Pointer => self.copy_field(newer, "pointer"),
            CollapseClass::Restart => {
                self.copy_field(newer, "server_generation");
                self.copy_field(newer, "immediate");
            }
            CollapseClass::Flags { .. } => {
                let incoming = newer
                    .fields
                    .get("messages")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let messages = self
                    .fields
                    .entry("messages")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !messages.is_array() {
                    *messages = Value::Array(Vec::new());
                }
                if let Value::Array(existing) = messages {
                    for id in incoming {
                        if !existing.contains(&id) {
                            existing.push(id);
                        }
                    }
                }
            }
        }
    }

    fn copy_field(&mut self, from: &Event, key: &str) {
        if let Some(value) = from.fields.get(key) {
            self.fields.insert(key.to_string(), value.clone());
        }
    }
}

/// Event classes that are collapsed while pending.
///
/// Kept as an explicit table: each class has its own merge rule in
/// [`Event::absorb`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CollapseClass {
    /// Pointer moves: only the latest position matters
    Pointer,
    /// Server restarts: only the latest generation matters
    Restart,
    /// Per-message flag batches for one (operation, flag) pair
    Flags { operation: String, flag: String },
}

impl CollapseClass {
    /// Compute the collapse class of an event, or `None` if it must be
    /// delivered as-is.
    pub fn of(event: &Event) -> Option<Self> {
        match event.kind.as_str() {
            "pointer" => Some(CollapseClass::Pointer),
            "restart" => Some(CollapseClass::Restart),
            "update_message_flags" => {
                // "all" updates get their own class and are never merged
                let all = event.get("all").and_then(Value::as_bool).unwrap_or(false);
                if all {
                    return None;
                }
                let operation = event.get_str("op").or_else(|| event.get_str("operation"))?;
                let flag = event.get_str("flag")?;
                Some(CollapseClass::Flags {
                    operation: operation.to_string(),
                    flag: flag.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for CollapseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollapseClass::Pointer => write!(f, "pointer"),
            CollapseClass::Restart => write!(f, "restart"),
            CollapseClass::Flags { operation, flag } => write!(f, "flags/{}/{}", operation, flag),
        }
    }
}

impl FromStr for CollapseClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pointer" => Ok(CollapseClass::Pointer),
            "restart" => Ok(CollapseClass::Restart),
            other => {
                let mut parts = other.splitn(3, '/');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("flags"), Some(operation), Some(flag)) => Ok(CollapseClass::Flags {
                        operation: operation.to_string(),
                        flag: flag.to_string(),
                    }),
                    _ => Err(format!("unknown collapse class: {}", other)),
                }
            }
        }
    }
}

impl From<CollapseClass> for String {
    fn from(class: CollapseClass) -> Self {
        class.to_string()
    }
}

impl TryFrom<String> for CollapseClass {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flags(op: &str, flag: &str, messages: Value) -> Event {
        Event::new("update_message_flags")
            .with("op", op)
            .with("flag", flag)
            .with("all", false)
            .with("messages", messages)
    }

    #[test]
    fn test_collapse_class_table() {
        assert_eq!(
            CollapseClass::of(&Event::new("pointer").with("pointer", 5)),
            Some(CollapseClass::Pointer)
        );
        assert_eq!(
            CollapseClass::of(&Event::restart(17)),
            Some(CollapseClass::Restart)
        );
        assert_eq!(
            CollapseClass::of(&flags("add", "read", json!([1]))),
            Some(CollapseClass::Flags {
                operation: "add".to_string(),
                flag: "read".to_string()
            })
        );
        assert_eq!(CollapseClass::of(&Event::new("message")), None);
        assert_eq!(CollapseClass::of(&Event::heartbeat()), None);
    }

    #[test]
    fn test_all_flag_updates_never_collapse() {
        let event = Event::new("update_message_flags")
            .with("op", "add")
            .with("flag", "read")
            .with("all", true)
            .with("messages", json!([]));
        assert_eq!(CollapseClass::of(&event), None);
    }

    #[test]
    fn test_legacy_operation_key() {
        let event = Event::new("update_message_flags")
            .with("operation", "remove")
            .with("flag", "starred")
            .with("messages", json!([3]));
        assert_eq!(
            CollapseClass::of(&event).map(|c| c.to_string()),
            Some("flags/remove/starred".to_string())
        );
    }

    #[test]
    fn test_collapse_class_string_form() {
        for class in [
            CollapseClass::Pointer,
            CollapseClass::Restart,
            CollapseClass::Flags {
                operation: "add".to_string(),
                flag: "has/slash".to_string(),
            },
        ] {
            let parsed: CollapseClass = class.to_string().parse().unwrap();
            assert_eq!(parsed, class);
        }
        assert!("typing".parse::<CollapseClass>().is_err());
    }

    #[test]
    fn test_absorb_unions_messages() {
        let class = CollapseClass::Flags {
            operation: "add".to_string(),
            flag: "read".to_string(),
        };
        let mut pending = flags("add", "read", json!([1, 2, 3]));
        pending.id = 4;
        let mut newer = flags("add", "read", json!([3, 4, 5]));
        newer.id = 9;

        pending.absorb(&class, &newer);

        assert_eq!(pending.id, 9);
        assert_eq!(pending.get("messages"), Some(&json!([1, 2, 3, 4, 5])));
    }

    #[test]
    fn test_absorb_replaces_pointer_and_timestamp() {
        let mut pending = Event::new("pointer").with("pointer", 1).with("timestamp", 100);
        let mut newer = Event::new("pointer").with("pointer", 2).with("timestamp", 200);
        newer.id = 3;

        pending.absorb(&CollapseClass::Pointer, &newer);

        assert_eq!(pending.id, 3);
        assert_eq!(pending.get("pointer"), Some(&json!(2)));
        assert_eq!(pending.get("timestamp"), Some(&json!(200)));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new("pointer").with("pointer", 12);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "pointer", "id": 0, "pointer": 12}));

        let parsed: Event =
            serde_json::from_value(json!({"type": "typing", "op": "start"})).unwrap();
        assert_eq!(parsed.kind, "typing");
        assert_eq!(parsed.id, 0);
        assert_eq!(parsed.get_str("op"), Some("start"));
    }

    #[test]
    fn test_for_client_strips_internal_data() {
        let event = Event::new("message")
            .with("message", json!({"id": 1}))
            .with(INTERNAL_DATA, json!({"mentioned": true}));
        assert!(event.internal_data().is_some());

        let public = event.for_client();
        assert!(public.get(INTERNAL_DATA).is_none());
        assert!(public.get("message").is_some());
    }
}
