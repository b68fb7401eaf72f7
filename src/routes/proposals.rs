//! Proposal review, testing, and publishing routes

use crate::error::AppError;
use crate::models::{PaginationQuery, SuccessResponse};
use crate::pipeline::queue::DeadLetter;
use crate::pipeline::service::{AdminAction, ProposalDetail, TestMode};
use crate::pipeline::store::ProposalFilter;
use crate::pipeline::types::{ProposalStatus, ReviewEvent, TestSummary, WorkflowProposal};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalListQuery {
    pub status: Option<ProposalStatus>,
    pub min_confidence: Option<f64>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub action: AdminAction,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub modifications: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    #[serde(default)]
    pub test_mode: TestMode,
    pub cases: Vec<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalListResponse {
    pub proposals: Vec<WorkflowProposal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub proposal: WorkflowProposal,
    pub event: ReviewEvent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResponse {
    pub proposal: WorkflowProposal,
    pub summary: TestSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    pub dead_letters: Vec<DeadLetter>,
}

/// List proposals for a tenant, newest first.
pub async fn list_proposals(
    State(state): State<SharedState>,
    Path(tenant): Path<String>,
    Query(query): Query<ProposalListQuery>,
) -> Result<Json<SuccessResponse<ProposalListResponse>>, AppError> {
    let filter = ProposalFilter {
        status: query.status,
        min_confidence: query.min_confidence,
    };
    let page = PaginationQuery {
        page: query.page,
        per_page: query.per_page,
    }
    .to_page();

    let proposals = state.pipeline.list_proposals(&tenant, &filter, page).await;
    Ok(Json(SuccessResponse::with_data(
        "Proposals listed",
        ProposalListResponse { proposals },
    )))
}

/// Full proposal detail: proposal + pattern + evidence + review history.
pub async fn get_proposal(
    State(state): State<SharedState>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> Result<Json<SuccessResponse<ProposalDetail>>, AppError> {
    let detail = state.pipeline.proposal_detail(&tenant, id).await?;
    Ok(Json(SuccessResponse::with_data("Proposal found", detail)))
}

/// Human review of a pending proposal.
pub async fn review_proposal(
    State(state): State<SharedState>,
    Path((tenant, id)): Path<(String, Uuid)>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<SuccessResponse<ReviewResponse>>, AppError> {
    let (proposal, event) = state
        .pipeline
        .review(&tenant, id, request.action, request.notes, request.modifications)
        .await?;
    Ok(Json(SuccessResponse::with_data(
        "Review recorded",
        ReviewResponse { proposal, event },
    )))
}

/// Run a proposal in `testing` against the sandbox.
pub async fn test_proposal(
    State(state): State<SharedState>,
    Path((tenant, id)): Path<(String, Uuid)>,
    Json(request): Json<TestRequest>,
) -> Result<Json<SuccessResponse<TestResponse>>, AppError> {
    let (proposal, summary) = state
        .pipeline
        .run_test(
            &tenant,
            id,
            request.test_mode,
            request.cases,
            request.iterations.unwrap_or(1),
        )
        .await?;
    Ok(Json(SuccessResponse::with_data(
        "Test run complete",
        TestResponse { proposal, summary },
    )))
}

/// Promote an approved proposal into the production catalog.
pub async fn publish_proposal(
    State(state): State<SharedState>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> Result<Json<SuccessResponse<WorkflowProposal>>, AppError> {
    let proposal = state.pipeline.publish(&tenant, id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Proposal published",
        proposal,
    )))
}

/// Dead-lettered pipeline tasks for this tenant.
pub async fn list_dead_letters(
    State(state): State<SharedState>,
    Path(tenant): Path<String>,
) -> Result<Json<SuccessResponse<DeadLetterResponse>>, AppError> {
    let dead_letters = state
        .pipeline
        .queue()
        .dead_letters()
        .await
        .into_iter()
        .filter(|d| d.task.tenant_id() == &tenant)
        .collect();
    Ok(Json(SuccessResponse::with_data(
        "Dead letters listed",
        DeadLetterResponse { dead_letters },
    )))
}
