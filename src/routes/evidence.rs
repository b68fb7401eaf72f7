//! Evidence ingestion routes

use crate::error::AppError;
use crate::models::SuccessResponse;
use crate::pipeline::service::SubmitOutcome;
use crate::pipeline::types::EvidenceContext;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEvidenceRequest {
    /// Wire-format evidence type, validated against the enumeration.
    pub evidence_type: String,
    pub user_id: String,
    pub context: EvidenceContext,
}

/// Submit one evidence event. Synchronous: returns the pattern id, the
/// updated cumulative score, and the recomputed threshold flags.
pub async fn submit_evidence(
    State(state): State<SharedState>,
    Path(tenant): Path<String>,
    Json(request): Json<SubmitEvidenceRequest>,
) -> Result<Json<SuccessResponse<SubmitOutcome>>, AppError> {
    if request.user_id.trim().is_empty() {
        return Err(AppError::Validation("userId must not be empty".to_string()));
    }
    if request.context.original_request.trim().is_empty() {
        return Err(AppError::Validation(
            "context.originalRequest must not be empty".to_string(),
        ));
    }

    let outcome = state
        .pipeline
        .submit_evidence(&tenant, &request.evidence_type, &request.user_id, request.context)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        "Evidence recorded",
        outcome,
    )))
}
