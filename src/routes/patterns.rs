//! Need-pattern routes

use crate::error::AppError;
use crate::models::{PaginationQuery, SuccessResponse};
use crate::pipeline::store::PatternFilter;
use crate::pipeline::types::{Evidence, NeedPattern, PatternStatus};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternListQuery {
    pub status: Option<PatternStatus>,
    pub min_score: Option<f64>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternListResponse {
    pub patterns: Vec<NeedPattern>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDetailResponse {
    pub pattern: NeedPattern,
    pub evidence: Vec<Evidence>,
}

/// List patterns for a tenant, score descending.
pub async fn list_patterns(
    State(state): State<SharedState>,
    Path(tenant): Path<String>,
    Query(query): Query<PatternListQuery>,
) -> Result<Json<SuccessResponse<PatternListResponse>>, AppError> {
    let filter = PatternFilter {
        status: query.status,
        min_score: query.min_score,
    };
    let page = PaginationQuery {
        page: query.page,
        per_page: query.per_page,
    }
    .to_page();

    let patterns = state.pipeline.list_patterns(&tenant, &filter, page).await;
    Ok(Json(SuccessResponse::with_data(
        "Patterns listed",
        PatternListResponse { patterns },
    )))
}

/// One pattern with its attributed evidence.
pub async fn get_pattern(
    State(state): State<SharedState>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> Result<Json<SuccessResponse<PatternDetailResponse>>, AppError> {
    let pattern = state.pipeline.store().pattern(&tenant, id).await?;
    let evidence = state.pipeline.store().pattern_evidence(&tenant, id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Pattern found",
        PatternDetailResponse { pattern, evidence },
    )))
}
