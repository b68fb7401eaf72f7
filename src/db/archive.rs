//! Write-through archival
//!
//! Mirrors pipeline rows into Postgres for durability and audit
//! reconstruction. Writes are fire-and-forget from the service's
//! perspective; failures are logged, never surfaced to the ingestion
//! path.

use crate::error::AppError;
use crate::pipeline::queue::DeadLetter;
use crate::pipeline::thresholds::TenantConfig;
use crate::pipeline::types::{Evidence, NeedPattern, ReviewEvent, TenantId, WorkflowProposal};
use chrono::Utc;
use deadpool_postgres::Pool;

/// Postgres-backed archive of the pipeline's durable rows.
#[derive(Clone)]
pub struct PipelineArchive {
    pool: Pool,
}

impl PipelineArchive {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Evidence rows are immutable: plain insert.
    pub async fn record_evidence(&self, evidence: &Evidence) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO evidence (id, tenant_id, pattern_id, evidence_type, weight,
                    user_id, session_id, execution_id, original_request, failure_reason, captured_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &evidence.id,
                    &evidence.tenant_id,
                    &evidence.pattern_id,
                    &evidence.evidence_type.as_str(),
                    &evidence.weight,
                    &evidence.user_id,
                    &evidence.session_id,
                    &evidence.execution_id,
                    &evidence.original_request,
                    &evidence.failure_reason,
                    &evidence.captured_at,
                ],
            )
            .await?;
        Ok(())
    }

    /// Patterns are mutable aggregates: upsert the latest snapshot.
    pub async fn upsert_pattern(&self, pattern: &NeedPattern) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let signature = serde_json::to_value(&pattern.signature)
            .map_err(|e| AppError::Internal(format!("signature serialization: {}", e)))?;
        let embedding = serde_json::to_value(&pattern.embedding)
            .map_err(|e| AppError::Internal(format!("embedding serialization: {}", e)))?;
        let status = serde_json::to_value(pattern.status)
            .map_err(|e| AppError::Internal(format!("status serialization: {}", e)))?;
        let status = status.as_str().unwrap_or("accumulating").to_string();

        client
            .execute(
                "INSERT INTO need_patterns (id, tenant_id, content_hash, signature, embedding,
                    evidence_count, distinct_users, cumulative_score, first_occurrence,
                    last_occurrence, occurrence_met, impact_met, confidence_met, status,
                    active_proposal_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                 ON CONFLICT (id) DO UPDATE SET
                    evidence_count = EXCLUDED.evidence_count,
                    distinct_users = EXCLUDED.distinct_users,
                    cumulative_score = EXCLUDED.cumulative_score,
                    last_occurrence = EXCLUDED.last_occurrence,
                    occurrence_met = EXCLUDED.occurrence_met,
                    impact_met = EXCLUDED.impact_met,
                    confidence_met = EXCLUDED.confidence_met,
                    status = EXCLUDED.status,
                    active_proposal_id = EXCLUDED.active_proposal_id",
                &[
                    &pattern.id,
                    &pattern.tenant_id,
                    &pattern.content_hash,
                    &signature,
                    &embedding,
                    &(pattern.evidence_count as i32),
                    &(pattern.distinct_users as i32),
                    &pattern.cumulative_score,
                    &pattern.first_occurrence,
                    &pattern.last_occurrence,
                    &pattern.occurrence_met,
                    &pattern.impact_met,
                    &pattern.confidence_met,
                    &status,
                    &pattern.active_proposal_id,
                ],
            )
            .await?;
        Ok(())
    }

    /// Proposal snapshots carry the full document as JSONB.
    pub async fn upsert_proposal(&self, proposal: &WorkflowProposal) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let payload = serde_json::to_value(proposal)
            .map_err(|e| AppError::Internal(format!("proposal serialization: {}", e)))?;
        let status = serde_json::to_value(proposal.status)
            .map_err(|e| AppError::Internal(format!("status serialization: {}", e)))?;
        let status = status.as_str().unwrap_or("pending_brain").to_string();

        client
            .execute(
                "INSERT INTO workflow_proposals (id, tenant_id, pattern_id, name, status,
                    payload, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    payload = EXCLUDED.payload,
                    updated_at = EXCLUDED.updated_at",
                &[
                    &proposal.id,
                    &proposal.tenant_id,
                    &proposal.pattern_id,
                    &proposal.name,
                    &status,
                    &payload,
                    &proposal.created_at,
                    &proposal.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    /// Review events are append-only: plain insert.
    pub async fn record_review_event(&self, event: &ReviewEvent) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let actor = serde_json::to_value(event.actor)
            .map_err(|e| AppError::Internal(format!("actor serialization: {}", e)))?;
        let action = serde_json::to_value(event.action)
            .map_err(|e| AppError::Internal(format!("action serialization: {}", e)))?;
        let previous = serde_json::to_value(event.previous_status)
            .map_err(|e| AppError::Internal(format!("status serialization: {}", e)))?;
        let new = serde_json::to_value(event.new_status)
            .map_err(|e| AppError::Internal(format!("status serialization: {}", e)))?;
        let modifications = serde_json::to_value(&event.modifications)
            .map_err(|e| AppError::Internal(format!("modifications serialization: {}", e)))?;

        client
            .execute(
                "INSERT INTO review_events (id, tenant_id, proposal_id, pattern_id, actor,
                    action, previous_status, new_status, rationale, modifications, reviewed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &event.id,
                    &event.tenant_id,
                    &event.proposal_id,
                    &event.pattern_id,
                    &actor.as_str().unwrap_or("governor"),
                    &action.as_str().unwrap_or("decline"),
                    &previous.as_str().unwrap_or("pending_brain"),
                    &new.as_str().unwrap_or("pending_brain"),
                    &event.rationale,
                    &modifications,
                    &event.reviewed_at,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn upsert_config(
        &self,
        tenant: &TenantId,
        config: &TenantConfig,
    ) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let payload = serde_json::to_value(config)
            .map_err(|e| AppError::Internal(format!("config serialization: {}", e)))?;
        let updated_at = config.updated_at.unwrap_or_else(Utc::now);

        client
            .execute(
                "INSERT INTO tenant_configs (tenant_id, payload, updated_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (tenant_id) DO UPDATE SET
                    payload = EXCLUDED.payload,
                    updated_at = EXCLUDED.updated_at",
                &[&tenant, &payload, &updated_at],
            )
            .await?;
        Ok(())
    }

    /// Dead-lettered tasks are persisted for manual inspection.
    pub async fn record_dead_letter(&self, dead_letter: &DeadLetter) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        let task = serde_json::to_value(&dead_letter.task)
            .map_err(|e| AppError::Internal(format!("task serialization: {}", e)))?;
        let tenant = dead_letter.task.tenant_id().clone();

        client
            .execute(
                "INSERT INTO pipeline_dead_letters (tenant_id, task, attempts, last_error,
                    dead_lettered_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &tenant,
                    &task,
                    &(dead_letter.attempts as i32),
                    &dead_letter.last_error,
                    &dead_letter.dead_lettered_at,
                ],
            )
            .await?;
        Ok(())
    }
}
