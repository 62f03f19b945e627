use axum::extract::State;
use axum::Json;

use super::{error::ApiError, ApiState};
use crate::scheduler::QueueStatus;

/// GET /api/status
pub async fn system_status(
    State(state): State<ApiState>,
) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.scheduler.queue_status().await?))
}
