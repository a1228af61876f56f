//! Notify Route
//!
//! - POST /api/v1/notify - Dispatch a producer notice `{event, users}`

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::NotifyResponse;
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::events::{Notice, WireNotice};

/// POST /api/v1/notify
///
/// Fan an event out to the listed users (and, for public stream messages,
/// to the realm's firehose queues).
pub async fn notify(
    State(state): State<Arc<AppState>>,
    wire: Result<Json<WireNotice>, JsonRejection>,
) -> ApiResult<Json<NotifyResponse>> {
    let Json(wire) = wire?;
    let notice = Notice::try_from(wire)?;
    let stats = state.engine.notify(notice).await?;

    tracing::debug!(
        matched = stats.matched,
        delivered = stats.delivered,
        "Dispatched notice"
    );

    Ok(Json(NotifyResponse {
        status: "ok".to_string(),
        stats,
    }))
}
