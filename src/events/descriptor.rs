//! Client descriptors
//!
//! A [`ClientDescriptor`] is one subscriber: who owns it, which events it
//! wants, its [`EventQueue`], and at most one parked long-poll
//! ([`Transport`]) plus the heartbeat timer that keeps that poll alive.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::event::{Event, RealmId, UserId};
use super::narrow::{narrow_matches, NarrowTerm};
use super::queue::EventQueue;

/// Default idle timeout for a queue with no lifespan of its own (10 minutes)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Hard cap on any queue's lifespan (one week)
pub const MAX_QUEUE_LIFESPAN_SECS: u64 = 7 * 24 * 60 * 60;

/// What a client asked for when it registered its queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Event-type allowlist; `None` accepts every type
    pub event_types: Option<BTreeSet<String>>,
    /// Narrow applied to message events
    pub narrow: Vec<NarrowTerm>,
    /// Deliver the rendered variant of messages
    pub apply_markdown: bool,
    /// Receive every public stream message in the realm
    #[serde(alias = "all_public_streams")]
    pub firehose: bool,
    /// Requested idle timeout in seconds (0 = server default)
    pub lifespan_secs: u64,
    /// Declared transport class (`website`, `mobile`, `irc_mirror`, ...)
    pub client_name: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            event_types: None,
            narrow: Vec::new(),
            apply_markdown: false,
            firehose: false,
            lifespan_secs: 0,
            client_name: "unknown".to_string(),
        }
    }
}

/// Bounds applied to every queue's timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub idle_timeout_secs: u64,
    pub max_lifespan_secs: u64,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifespan_secs: MAX_QUEUE_LIFESPAN_SECS,
        }
    }
}

impl QueueLimits {
    /// Timeout for a queue registered with `lifespan_secs`
    pub fn timeout_for(&self, lifespan_secs: u64) -> u64 {
        let requested = if lifespan_secs > 0 {
            lifespan_secs
        } else {
            self.idle_timeout_secs
        };
        requested.min(self.max_lifespan_secs)
    }
}

/// Events handed to a parked long-poll
pub type Delivery = Vec<Event>;

/// A parked long-poll waiting for its first batch of events
#[derive(Debug)]
pub struct Transport {
    client_name: String,
    reply: oneshot::Sender<Delivery>,
}

impl Transport {
    pub fn new(client_name: impl Into<String>, reply: oneshot::Sender<Delivery>) -> Self {
        Self {
            client_name: client_name.into(),
            reply,
        }
    }

    /// Create a transport and the receiver the waiting request awaits
    pub fn channel(client_name: impl Into<String>) -> (Self, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(client_name, tx), rx)
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    fn deliver(self, events: Delivery) -> Result<(), Delivery> {
        self.reply.send(events)
    }
}

/// Arms heartbeat timers for parked queues
pub trait HeartbeatScheduler {
    /// Arm a timer that reports back for `queue_id` after the heartbeat delay
    fn schedule(&self, queue_id: &str) -> HeartbeatTimer;
}

/// An armed heartbeat. Dropping it cancels the timer.
#[derive(Debug)]
pub struct HeartbeatTimer {
    token: u64,
    abort: Option<AbortHandle>,
}

impl HeartbeatTimer {
    pub fn new(token: u64, abort: Option<AbortHandle>) -> Self {
        Self { token, abort }
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

/// Randomized heartbeat delay: `min_secs` plus up to `jitter_secs`
pub fn heartbeat_delay(min_secs: u64, jitter_secs: u64) -> Duration {
    let jitter = if jitter_secs == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_secs)
    };
    Duration::from_secs(min_secs + jitter)
}

/// One subscriber's state
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientDescriptor {
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub realm_id: RealmId,
    #[serde(flatten)]
    pub options: QueueOptions,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub event_queue: EventQueue,
    #[serde(skip)]
    transport: Option<Transport>,
    #[serde(skip)]
    heartbeat: Option<HeartbeatTimer>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

impl ClientDescriptor {
    pub fn new(
        user_id: UserId,
        realm_id: RealmId,
        event_queue: EventQueue,
        options: QueueOptions,
        limits: &QueueLimits,
        now: DateTime<Utc>,
    ) -> Self {
        let timeout_secs = limits.timeout_for(options.lifespan_secs);
        Self {
            user_id,
            realm_id,
            options,
            timeout_secs,
            last_activity: now,
            event_queue,
            transport: None,
            heartbeat: None,
        }
    }

    /// The descriptor's id is its queue's id
    pub fn id(&self) -> &str {
        self.event_queue.id()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Firehose descriptors receive public stream messages of their realm
    /// without being listed as recipients.
    pub fn is_firehose(&self) -> bool {
        self.options.firehose || !self.options.narrow.is_empty()
    }

    /// Mirror clients relay messages between chat systems
    pub fn is_mirror(&self) -> bool {
        self.options.client_name.to_lowercase().contains("mirror")
    }

    pub fn accepts_messages(&self) -> bool {
        self.options
            .event_types
            .as_ref()
            .map_or(true, |types| types.contains("message"))
    }

    pub fn accepts_event(&self, event: &Event) -> bool {
        if let Some(types) = &self.options.event_types {
            if !types.contains(&event.kind) {
                return false;
            }
        }

        if event.kind == "message" {
            let message = event.get("message").cloned().unwrap_or_default();
            let flags: Vec<String> = event
                .get("flags")
                .and_then(|f| f.as_array())
                .map(|f| {
                    f.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            return narrow_matches(&self.options.narrow, &message, &flags);
        }

        true
    }

    /// Push an event. A parked long-poll, if any, is answered immediately.
    /// Returns the assigned event id.
    pub fn add_event(&mut self, event: Event) -> u64 {
        let id = self.event_queue.push(event);
        self.finish_current_transport();
        id
    }

    /// Answer the parked long-poll with the current contents and detach it.
    /// Returns whether a transport was attached.
    pub fn finish_current_transport(&mut self) -> bool {
        let Some(transport) = self.transport.take() else {
            return false;
        };
        self.heartbeat = None;

        let events = self.event_queue.contents();
        let count = events.len();
        match transport.deliver(events) {
            Ok(()) => debug!(queue_id = %self.id(), count, "Delivered events"),
            Err(_) => warn!(
                queue_id = %self.id(),
                client = %self.options.client_name,
                "Long-poll went away before delivery"
            ),
        }
        true
    }

    /// Park a long-poll on this descriptor. Returns the heartbeat token,
    /// which identifies this connection until it is answered or dropped.
    pub fn connect(
        &mut self,
        transport: Transport,
        heartbeats: &dyn HeartbeatScheduler,
        now: DateTime<Utc>,
    ) -> u64 {
        self.last_activity = now;
        self.transport = Some(transport);
        self.heartbeat = None;
        let timer = heartbeats.schedule(self.id());
        let token = timer.token();
        self.heartbeat = Some(timer);
        token
    }

    /// Drop the parked long-poll without answering it
    pub fn disconnect(&mut self) {
        self.transport = None;
        self.heartbeat = None;
    }

    /// Record client activity that did not park a long-poll
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Token of the armed heartbeat timer, if any
    pub fn heartbeat_token(&self) -> Option<u64> {
        self.heartbeat.as_ref().map(HeartbeatTimer::token)
    }

    /// Handle a fired heartbeat timer. Stale tokens are ignored.
    pub fn on_heartbeat(&mut self, token: u64) -> bool {
        if self.heartbeat_token() != Some(token) {
            return false;
        }
        self.heartbeat = None;
        self.add_event(Event::heartbeat());
        true
    }

    /// No transport attached and no activity for the timeout
    pub fn idle(&self, now: DateTime<Utc>) -> bool {
        if self.transport.is_some() {
            return false;
        }
        let timeout_ms = i64::try_from(self.timeout_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let elapsed = now.signed_duration_since(self.last_activity);
        elapsed.num_milliseconds() >= timeout_ms
    }
}
