use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{error::ApiError, ApiState};
use crate::scheduler::JobInfo;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub conversation_id: String,
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub request_id: String,
    pub estimated_completion: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
}

/// POST /api/prompts
pub async fn submit(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let (request_id, estimated_completion) = state
        .scheduler
        .enqueue_prompt(&request.conversation_id, &request.prompt)
        .await?;

    let queue_position = state
        .scheduler
        .job_info(&request_id)
        .await
        .ok()
        .and_then(|info| info.queue_position);

    Ok(Json(SubmitResponse {
        request_id,
        estimated_completion,
        queue_position,
    }))
}

/// GET /api/requests/:id
pub async fn request_info(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    Ok(Json(state.scheduler.job_info(&id).await?))
}
