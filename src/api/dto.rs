//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use serde::{Deserialize, Serialize};

use crate::events::{DispatchStats, Event, QueueId, RegistryStats};

// ============================================
// QUEUE DTOs
// ============================================

/// Queue registration response
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Id of the freshly allocated queue
    pub queue_id: QueueId,
    /// Always -1: nothing has been delivered yet
    pub last_event_id: i64,
}

/// Long-poll query parameters
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Queue to read; absent together with `dont_block` allocates a queue
    #[serde(default)]
    pub queue_id: Option<QueueId>,
    /// Highest event id already processed
    #[serde(default = "no_event")]
    pub last_event_id: i64,
    /// Answer immediately even when there is nothing to deliver
    #[serde(default)]
    pub dont_block: bool,
    /// Name of the polling client
    #[serde(default)]
    pub client_name: Option<String>,
}

fn no_event() -> i64 {
    -1
}

/// Long-poll response
#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<Event>,
    /// Present only when the poll allocated a new queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<QueueId>,
}

/// Queue deletion parameters
#[derive(Debug, Deserialize)]
pub struct DeleteQueueQuery {
    pub queue_id: QueueId,
}

/// Generic success response
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    /// Status: "ok"
    pub status: String,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

// ============================================
// NOTIFY DTOs
// ============================================

/// Notice dispatch response
#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    /// Status: "ok"
    pub status: String,
    #[serde(flatten)]
    pub stats: DispatchStats,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: healthy, unhealthy
    pub status: String,
    /// Engine status
    pub engine: String,
    /// Queue counters, absent when the engine is not answering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queues: Option<RegistryStats>,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
