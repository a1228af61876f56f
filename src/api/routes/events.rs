//! Event Queue Routes
//!
//! Long-poll consumer endpoints.
//!
//! - POST /api/v1/register - Allocate a queue
//! - GET /api/v1/events - Fetch events, parking until one arrives
//! - DELETE /api/v1/events - Delete a queue

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use super::Caller;
use crate::api::dto::{
    DeleteQueueQuery, EventsQuery, EventsResponse, RegisterResponse, SuccessResponse,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::events::{EngineHandle, FetchOutcome, FetchRequest, QueueId, QueueOptions};

/// POST /api/v1/register
///
/// Allocate a queue with the options in the body.
pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    options: Result<Json<QueueOptions>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let caller = Caller::from_headers(&headers)?;
    let Json(options) = options?;
    let queue_id = state
        .engine
        .register(caller.user_id, caller.realm_id, options)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            queue_id,
            last_event_id: -1,
        }),
    ))
}

/// GET /api/v1/events
///
/// Acknowledge `last_event_id` and return what is left in the queue. With
/// nothing to deliver and `dont_block` unset, the request waits until the
/// next event or heartbeat.
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> ApiResult<Json<EventsResponse>> {
    let caller = Caller::from_headers(&headers)?;
    let Query(query) = query?;
    let client_name = query.client_name.unwrap_or_else(|| "unknown".to_string());

    let request = FetchRequest {
        user_id: caller.user_id,
        realm_id: caller.realm_id,
        queue_id: query.queue_id,
        last_event_id: query.last_event_id,
        dont_block: query.dont_block,
        new_queue_options: QueueOptions {
            client_name: client_name.clone(),
            ..Default::default()
        },
        client_name,
    };

    match state.engine.fetch(request).await? {
        FetchOutcome::Immediate {
            queue_id,
            events,
            allocated,
        } => Ok(Json(EventsResponse {
            events,
            queue_id: allocated.then_some(queue_id),
        })),
        FetchOutcome::Parked {
            queue_id,
            token,
            receiver,
        } => {
            tracing::debug!(queue_id = %queue_id, "Parked long-poll request");
            let mut parked = ParkedPoll {
                engine: state.engine.clone(),
                queue_id,
                token,
                answered: false,
            };
            let delivery = receiver.await;
            parked.answered = true;
            let events = delivery.map_err(|_| {
                ApiError::ServiceUnavailable(format!(
                    "queue {} closed while polling",
                    parked.queue_id
                ))
            })?;
            Ok(Json(EventsResponse {
                events,
                queue_id: None,
            }))
        }
    }
}

/// Detaches the parked poll from its queue if the request is dropped
/// (client gone) before an answer arrives
struct ParkedPoll {
    engine: EngineHandle,
    queue_id: QueueId,
    token: u64,
    answered: bool,
}

impl Drop for ParkedPoll {
    fn drop(&mut self) {
        if !self.answered {
            self.engine.disconnect(self.queue_id.clone(), self.token);
        }
    }
}

/// DELETE /api/v1/events
///
/// Delete one of the caller's queues.
pub async fn delete_queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<DeleteQueueQuery>, QueryRejection>,
) -> ApiResult<Json<SuccessResponse>> {
    let caller = Caller::from_headers(&headers)?;
    let Query(query) = query?;
    state.engine.cleanup(caller.user_id, query.queue_id).await?;
    Ok(Json(SuccessResponse::ok()))
}
