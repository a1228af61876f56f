//! Fan-out of producer notices to client queues
//!
//! Producers describe an event and its audience; the dispatcher resolves the
//! audience to descriptors through the registry indices and pushes a copy to
//! every descriptor that accepts it. Three notice shapes are understood:
//!
//! - **simple**: one event for every queue of a list of users
//! - **message**: a new message with rendering variants and per-recipient
//!   flags, also delivered to firehose queues for public streams
//! - **overlay**: one event template shallow-merged with a per-user record

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::error::{EngineError, EngineResult};
use super::event::{Event, QueueId, RealmId, UserId, INTERNAL_DATA};
use super::registry::Registry;

/// Notice as posted by a producer: `{"event": {...}, "users": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireNotice {
    pub event: Value,
    pub users: Audience,
}

/// The `users` half of a notice: plain ids or per-user records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Ids(Vec<UserId>),
    Records(Vec<Map<String, Value>>),
}

/// One recipient of a new message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub id: UserId,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Notification hints, attached to the recipient's copy as internal data
    #[serde(flatten)]
    pub hints: Map<String, Value>,
}

impl MessageRecipient {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            flags: Vec::new(),
            hints: Map::new(),
        }
    }
}

/// A new message about to be fanned out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageNotice {
    /// Message payload with rendered content
    pub message_markdown: Value,
    /// Message payload with source content
    pub message_plain: Value,
    pub realm_id: RealmId,
    /// Stream name, absent for direct messages
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub invite_only: bool,
    /// Client class that sent the message
    #[serde(default)]
    pub sending_client: String,
    /// Queue that sent the message, tagged with `local_message_id`
    #[serde(default)]
    pub sender_queue_id: Option<QueueId>,
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(skip)]
    pub recipients: Vec<MessageRecipient>,
}

/// A decoded producer notice
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Simple { event: Event, users: Vec<UserId> },
    Message(MessageNotice),
    Overlay {
        event: Event,
        users: Vec<Map<String, Value>>,
    },
}

impl TryFrom<WireNotice> for Notice {
    type Error = EngineError;

    fn try_from(wire: WireNotice) -> EngineResult<Self> {
        let kind = wire
            .event
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidNotice("event has no type".to_string()))?
            .to_string();

        if kind == "message" {
            let mut notice: MessageNotice = serde_json::from_value(wire.event)
                .map_err(|e| EngineError::InvalidNotice(e.to_string()))?;
            notice.recipients = match wire.users {
                Audience::Ids(ids) => ids.into_iter().map(MessageRecipient::new).collect(),
                Audience::Records(records) => records
                    .into_iter()
                    .map(|record| serde_json::from_value(Value::Object(record)))
                    .collect::<Result<_, _>>()
                    .map_err(|e| EngineError::InvalidNotice(e.to_string()))?,
            };
            return Ok(Notice::Message(notice));
        }

        let event: Event = serde_json::from_value(wire.event)
            .map_err(|e| EngineError::InvalidNotice(e.to_string()))?;
        Ok(match wire.users {
            Audience::Ids(users) => Notice::Simple { event, users },
            Audience::Records(users) => Notice::Overlay { event, users },
        })
    }
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Descriptors in the resolved audience
    pub matched: usize,
    /// Descriptors that received the event
    pub delivered: usize,
    /// Descriptors whose filters rejected the event
    pub filtered: usize,
    /// Deliveries skipped to avoid mirror loops
    pub suppressed: usize,
}

impl Registry {
    /// Push a notice to every matching descriptor
    pub fn dispatch(&mut self, notice: Notice) -> DispatchStats {
        let stats = match notice {
            Notice::Simple { event, users } => self.dispatch_simple(event, &users),
            Notice::Message(message) => self.dispatch_message(message),
            Notice::Overlay { event, users } => self.dispatch_overlay(event, users),
        };
        debug!(
            matched = stats.matched,
            delivered = stats.delivered,
            filtered = stats.filtered,
            "Dispatched notice"
        );
        stats
    }

    fn dispatch_simple(&mut self, event: Event, users: &[UserId]) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for &user_id in users {
            let queue_ids = self.queues_for_user(user_id).to_vec();
            for queue_id in queue_ids {
                stats.matched += 1;
                self.offer(&queue_id, event.clone(), &mut stats);
            }
        }
        stats
    }

    fn dispatch_overlay(
        &mut self,
        template: Event,
        users: Vec<Map<String, Value>>,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        for record in users {
            let Some(user_id) = record.get("id").and_then(Value::as_u64) else {
                warn!(kind = %template.kind, "Dropping per-user record without an id");
                continue;
            };

            let mut event = template.clone();
            for (key, value) in record {
                if key != "id" && key != "type" {
                    event.fields.insert(key, value);
                }
            }

            let queue_ids = self.queues_for_user(user_id).to_vec();
            for queue_id in queue_ids {
                stats.matched += 1;
                self.offer(&queue_id, event.clone(), &mut stats);
            }
        }
        stats
    }

    fn dispatch_message(&mut self, notice: MessageNotice) -> DispatchStats {
        let mut stats = DispatchStats::default();

        // queue id -> flags; recipients override the firehose default
        let mut targets: HashMap<QueueId, Vec<String>> = HashMap::new();
        if notice.stream_name.is_some() && !notice.invite_only {
            for queue_id in self.firehose_queues(notice.realm_id) {
                targets.insert(queue_id.clone(), Vec::new());
            }
        }

        let mut hints: HashMap<UserId, Map<String, Value>> = HashMap::new();
        for recipient in &notice.recipients {
            for queue_id in self.queues_for_user(recipient.id) {
                targets.insert(queue_id.clone(), recipient.flags.clone());
            }
            hints.insert(recipient.id, recipient.hints.clone());
        }

        let sending_client = notice.sending_client.to_lowercase();
        let from_mirror = sending_client.contains("mirror");

        for (queue_id, flags) in targets {
            let Some(client) = self.get(&queue_id) else {
                continue;
            };
            stats.matched += 1;

            if !client.accepts_messages() {
                stats.filtered += 1;
                continue;
            }

            let mut message = if client.options.apply_markdown {
                notice.message_markdown.clone()
            } else {
                notice.message_plain.clone()
            };
            if client.is_mirror() && notice.invite_only {
                if let Some(fields) = message.as_object_mut() {
                    fields.insert("invite_only_stream".to_string(), Value::Bool(true));
                }
            }

            let mut event = Event::new("message")
                .with("message", message)
                .with("flags", flags);
            if let Some(user_hints) = hints.get(&client.user_id) {
                if !user_hints.is_empty() {
                    event = event.with(INTERNAL_DATA, Value::Object(user_hints.clone()));
                }
            }
            if notice.sender_queue_id.as_deref() == Some(queue_id.as_str()) {
                if let Some(local_id) = &notice.local_id {
                    event = event.with("local_message_id", local_id.clone());
                }
            }

            if !client.accepts_event(&event) {
                stats.filtered += 1;
                continue;
            }

            // Mirrors already have the message they relayed
            if from_mirror && client.options.client_name.to_lowercase() == sending_client {
                stats.suppressed += 1;
                continue;
            }

            self.offer(&queue_id, event, &mut stats);
        }

        stats
    }

    fn offer(&mut self, queue_id: &str, event: Event, stats: &mut DispatchStats) {
        let Some(client) = self.get_mut(queue_id) else {
            return;
        };
        if client.accepts_event(&event) {
            client.add_event(event);
            stats.delivered += 1;
        } else {
            stats.filtered += 1;
        }
    }
}
