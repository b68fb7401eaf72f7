//! Pipeline metadata store
//!
//! In-process store for patterns, evidence, proposals, review events, and
//! tenant configuration. All pipeline coordination goes through this
//! store: the tenant+hash uniqueness index makes evidence attribution
//! linearizable per pattern, and every status change is a guarded
//! transition that validates its precondition and appends exactly one
//! audit row inside the same critical section. Durable copies are written
//! through to Postgres by the archive service.

use crate::error::AppError;
use crate::external::cosine_similarity;
use crate::pipeline::thresholds::{self, PatternAggregates, TenantConfig, ThresholdFlags};
use crate::pipeline::types::{
    Evidence, EvidenceContext, EvidenceType, NeedPattern, PatternSignature, PatternStatus,
    ProposalStatus, ReviewAction, ReviewActor, ReviewEvent, TenantId, WorkflowProposal,
};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Embedding similarity above which two signatures collapse into one
/// pattern.
pub const SIMILARITY_THRESHOLD: f32 = 0.85;

/// Pagination window for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// 1-based page number.
    pub page: usize,
    pub per_page: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, per_page: 50 }
    }
}

impl Page {
    fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.per_page
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    pub status: Option<PatternStatus>,
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub status: Option<ProposalStatus>,
    pub min_confidence: Option<f64>,
}

/// Result of attributing one evidence record.
#[derive(Debug, Clone)]
pub struct EvidenceAttachment {
    pub pattern: NeedPattern,
    pub evidence: Evidence,
    pub flags: ThresholdFlags,
    /// True when this attachment flipped the pattern to `threshold_met`.
    pub newly_threshold_met: bool,
}

/// Outcome of a scheduler dispatch pass for one tenant.
#[derive(Debug, Clone)]
pub enum DispatchDecision {
    /// A daily or weekly cap is already exhausted; nothing was processed.
    RateLimited { today: u32, this_week: u32 },
    /// Patterns transitioned to `proposal_generating`, ready to enqueue.
    Dispatched(Vec<Uuid>),
}

#[derive(Default)]
struct StoreInner {
    patterns: HashMap<Uuid, NeedPattern>,
    /// Tenant+hash uniqueness constraint backing the find-or-create race.
    pattern_by_hash: HashMap<(TenantId, String), Uuid>,
    patterns_by_tenant: HashMap<TenantId, Vec<Uuid>>,
    evidence_by_pattern: HashMap<Uuid, Vec<Evidence>>,
    proposals: HashMap<Uuid, WorkflowProposal>,
    proposals_by_tenant: HashMap<TenantId, Vec<Uuid>>,
    proposals_by_pattern: HashMap<Uuid, Vec<Uuid>>,
    review_events: HashMap<Uuid, Vec<ReviewEvent>>,
    configs: HashMap<TenantId, TenantConfig>,
}

/// Thread-safe pipeline store.
pub struct PipelineStore {
    inner: RwLock<StoreInner>,
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    // =========================================================================
    // TENANT CONFIG
    // =========================================================================

    pub async fn config(&self, tenant: &TenantId) -> TenantConfig {
        let inner = self.inner.read().await;
        inner.configs.get(tenant).cloned().unwrap_or_default()
    }

    pub async fn update_config(&self, tenant: &TenantId, mut config: TenantConfig) -> TenantConfig {
        config.updated_at = Some(Utc::now());
        let mut inner = self.inner.write().await;
        inner.configs.insert(tenant.clone(), config.clone());
        config
    }

    // =========================================================================
    // EVIDENCE ATTRIBUTION (find-or-create + aggregate update)
    // =========================================================================

    /// Attribute one evidence record to its pattern, creating the pattern
    /// when no exact-hash or similarity match exists.
    ///
    /// The whole find-or-create + insert + aggregate update runs inside a
    /// single write section, so two concurrent submissions with the same
    /// signature cannot fragment into two patterns: the loser of the
    /// insert race re-reads the uniqueness index and attaches to the
    /// winner's row.
    #[allow(clippy::too_many_arguments)]
    pub async fn attach_evidence(
        &self,
        tenant: &TenantId,
        signature: PatternSignature,
        content_hash: String,
        embedding: Vec<f32>,
        evidence_type: EvidenceType,
        weight: f64,
        user_id: &str,
        context: &EvidenceContext,
        now: DateTime<Utc>,
    ) -> Result<EvidenceAttachment, AppError> {
        let mut inner = self.inner.write().await;
        let config = inner.configs.get(tenant).cloned().unwrap_or_default();

        let pattern_id = match Self::find_pattern(&inner, tenant, &content_hash, &embedding) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                let pattern = NeedPattern {
                    id,
                    tenant_id: tenant.clone(),
                    signature: signature.clone(),
                    content_hash: content_hash.clone(),
                    embedding,
                    evidence_count: 0,
                    distinct_users: 0,
                    cumulative_score: 0.0,
                    first_occurrence: now,
                    last_occurrence: now,
                    occurrence_met: false,
                    impact_met: false,
                    confidence_met: false,
                    status: PatternStatus::Accumulating,
                    active_proposal_id: None,
                };
                inner.patterns.insert(id, pattern);
                inner
                    .pattern_by_hash
                    .insert((tenant.clone(), content_hash), id);
                inner
                    .patterns_by_tenant
                    .entry(tenant.clone())
                    .or_default()
                    .push(id);
                id
            }
        };

        let evidence = Evidence {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            pattern_id,
            evidence_type,
            weight,
            user_id: user_id.to_string(),
            session_id: context.session_id.clone(),
            execution_id: context.execution_id.clone(),
            original_request: context.original_request.clone(),
            failure_reason: context.failure_reason.clone(),
            captured_at: now,
        };
        inner
            .evidence_by_pattern
            .entry(pattern_id)
            .or_default()
            .push(evidence.clone());

        // Flags may only regress after a decline-cooldown has expired and
        // accumulation restarted; otherwise they are monotone.
        let allow_reset = Self::flag_reset_allowed(&inner, pattern_id, &config, now);

        let rows = inner.evidence_by_pattern.get(&pattern_id).cloned().unwrap_or_default();
        let pattern = inner
            .patterns
            .get_mut(&pattern_id)
            .ok_or_else(|| AppError::Internal("pattern vanished during attach".to_string()))?;

        pattern.evidence_count += 1;
        pattern.cumulative_score += weight;
        pattern.last_occurrence = now;
        // Distinct-user count via re-count over the evidence rows.
        let users: HashSet<&str> = rows.iter().map(|e| e.user_id.as_str()).collect();
        pattern.distinct_users = users.len() as u32;

        let aggregates = PatternAggregates {
            evidence_count: pattern.evidence_count,
            distinct_users: pattern.distinct_users,
            cumulative_score: pattern.cumulative_score,
            first_occurrence: pattern.first_occurrence,
            last_occurrence: pattern.last_occurrence,
        };
        // Confidence is never evaluated at ingestion time.
        let fresh = thresholds::evaluate(&aggregates, None, &config.thresholds);
        if allow_reset {
            pattern.occurrence_met = fresh.occurrence;
            pattern.impact_met = fresh.impact;
        } else {
            pattern.occurrence_met |= fresh.occurrence;
            pattern.impact_met |= fresh.impact;
        }

        let mut newly_threshold_met = false;
        if pattern.status == PatternStatus::Accumulating
            && pattern.occurrence_met
            && pattern.impact_met
        {
            pattern.status = PatternStatus::ThresholdMet;
            newly_threshold_met = true;
        }

        let flags = ThresholdFlags {
            occurrence: pattern.occurrence_met,
            impact: pattern.impact_met,
            confidence: pattern.confidence_met,
            all_met: pattern.occurrence_met && pattern.impact_met && pattern.confidence_met,
        };

        Ok(EvidenceAttachment {
            pattern: pattern.clone(),
            evidence,
            flags,
            newly_threshold_met,
        })
    }

    /// Two-tier lookup: exact hash within the tenant, then best
    /// embedding-similarity match above the threshold.
    fn find_pattern(
        inner: &StoreInner,
        tenant: &TenantId,
        content_hash: &str,
        embedding: &[f32],
    ) -> Option<Uuid> {
        if let Some(id) = inner
            .pattern_by_hash
            .get(&(tenant.clone(), content_hash.to_string()))
        {
            return Some(*id);
        }

        inner
            .patterns_by_tenant
            .get(tenant)?
            .iter()
            .filter_map(|id| inner.patterns.get(id))
            .map(|p| (p.id, cosine_similarity(&p.embedding, embedding)))
            .filter(|(_, sim)| *sim >= SIMILARITY_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// A pattern may have its flags recomputed from scratch only once a
    /// decline-cooldown has fully elapsed and it fell back to
    /// accumulation.
    fn flag_reset_allowed(
        inner: &StoreInner,
        pattern_id: Uuid,
        config: &TenantConfig,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(pattern) = inner.patterns.get(&pattern_id) else {
            return false;
        };
        if pattern.status != PatternStatus::Accumulating || pattern.active_proposal_id.is_some() {
            return false;
        }
        match Self::last_decline(inner, pattern_id) {
            Some(declined_at) => now - declined_at >= config.thresholds.decline_cooldown(),
            None => false,
        }
    }

    fn last_decline(inner: &StoreInner, pattern_id: Uuid) -> Option<DateTime<Utc>> {
        let proposal_ids = inner.proposals_by_pattern.get(&pattern_id)?;
        proposal_ids
            .iter()
            .filter_map(|pid| inner.review_events.get(pid))
            .flatten()
            .filter(|e| e.action == ReviewAction::Decline)
            .map(|e| e.reviewed_at)
            .max()
    }

    // =========================================================================
    // SCHEDULER DISPATCH
    // =========================================================================

    /// One scheduler pass for a tenant: rate-limit check, qualifying
    /// pattern selection ordered by score, per-pattern cooldown check,
    /// and the guarded `threshold_met -> proposal_generating` transition,
    /// all within a single critical section so overlapping runs cannot
    /// overshoot the caps or double-dispatch a pattern.
    pub async fn select_for_dispatch(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
    ) -> DispatchDecision {
        let mut inner = self.inner.write().await;
        let config = inner.configs.get(tenant).cloned().unwrap_or_default();

        let (today, this_week) = Self::proposal_counts(&inner, tenant, now, None);
        if today >= config.thresholds.max_daily_proposals
            || this_week >= config.thresholds.max_weekly_proposals
        {
            return DispatchDecision::RateLimited { today, this_week };
        }
        let remaining = (config.thresholds.max_daily_proposals - today)
            .min(config.thresholds.max_weekly_proposals - this_week) as usize;

        let mut candidates: Vec<(Uuid, f64)> = inner
            .patterns_by_tenant
            .get(tenant)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.patterns.get(id))
                    .filter(|p| {
                        p.status == PatternStatus::ThresholdMet && p.active_proposal_id.is_none()
                    })
                    .map(|p| (p.id, p.cumulative_score))
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        let cooldown = config.thresholds.decline_cooldown();
        let mut dispatched = Vec::new();
        for (id, _) in candidates {
            if dispatched.len() >= remaining {
                break;
            }
            // Cooldown enforcement is per-pattern: a recent decline skips
            // this pattern and leaves its status unchanged.
            if let Some(declined_at) = Self::last_decline(&inner, id) {
                if now - declined_at < cooldown {
                    continue;
                }
            }
            let Some(pattern) = inner.patterns.get_mut(&id) else {
                continue;
            };
            // Idempotent guard: only flips if still threshold_met.
            if pattern.status != PatternStatus::ThresholdMet {
                continue;
            }
            pattern.status = PatternStatus::ProposalGenerating;
            dispatched.push(id);
        }

        DispatchDecision::Dispatched(dispatched)
    }

    /// Today = since UTC midnight; week = rolling seven days.
    fn proposal_counts(
        inner: &StoreInner,
        tenant: &TenantId,
        now: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> (u32, u32) {
        let day_start = now
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let week_start = now - Duration::days(7);

        let mut today = 0u32;
        let mut this_week = 0u32;
        if let Some(ids) = inner.proposals_by_tenant.get(tenant) {
            for proposal in ids.iter().filter_map(|id| inner.proposals.get(id)) {
                if Some(proposal.id) == exclude {
                    continue;
                }
                if proposal.created_at >= week_start {
                    this_week += 1;
                    if proposal.created_at >= day_start {
                        today += 1;
                    }
                }
            }
        }
        (today, this_week)
    }

    /// Rate-limit counts visible to the governor backstop check,
    /// excluding the proposal under assessment.
    pub async fn proposal_counts_excluding(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
        exclude: Uuid,
    ) -> (u32, u32) {
        let inner = self.inner.read().await;
        Self::proposal_counts(&inner, tenant, now, Some(exclude))
    }

    // =========================================================================
    // PATTERN TRANSITIONS
    // =========================================================================

    /// Revert a `proposal_generating` pattern to a prior stable state
    /// after a synthesis failure, leaving the gate flags intact.
    pub async fn revert_generation(
        &self,
        pattern_id: Uuid,
        to: PatternStatus,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        let pattern = inner
            .patterns
            .get_mut(&pattern_id)
            .ok_or_else(|| AppError::NotFound(format!("Pattern {} not found", pattern_id)))?;
        if pattern.status != PatternStatus::ProposalGenerating {
            return Err(AppError::StaleTransition(format!(
                "Pattern {} is {:?}, expected proposal_generating",
                pattern_id, pattern.status
            )));
        }
        pattern.status = to;
        Ok(())
    }

    /// Record a successful synthesis: the pattern advances to
    /// `proposal_generated` with its confidence flag set, and the new
    /// proposal becomes the pattern's single active proposal.
    pub async fn complete_generation(
        &self,
        proposal: WorkflowProposal,
    ) -> Result<WorkflowProposal, AppError> {
        let mut inner = self.inner.write().await;

        let pattern = inner
            .patterns
            .get_mut(&proposal.pattern_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Pattern {} not found", proposal.pattern_id))
            })?;
        if pattern.status != PatternStatus::ProposalGenerating {
            return Err(AppError::StaleTransition(format!(
                "Pattern {} is {:?}, expected proposal_generating",
                pattern.id, pattern.status
            )));
        }
        // At most one active proposal per pattern.
        if pattern.active_proposal_id.is_some() {
            return Err(AppError::Conflict(format!(
                "Pattern {} already has an active proposal",
                pattern.id
            )));
        }
        pattern.status = PatternStatus::ProposalGenerated;
        pattern.confidence_met = true;
        pattern.active_proposal_id = Some(proposal.id);
        let tenant = pattern.tenant_id.clone();
        let pattern_id = pattern.id;

        inner.proposals.insert(proposal.id, proposal.clone());
        inner
            .proposals_by_tenant
            .entry(tenant)
            .or_default()
            .push(proposal.id);
        inner
            .proposals_by_pattern
            .entry(pattern_id)
            .or_default()
            .push(proposal.id);
        Ok(proposal)
    }

    // =========================================================================
    // PROPOSAL TRANSITIONS
    // =========================================================================

    /// Guarded proposal transition: validates the status precondition,
    /// applies `mutate`, writes the new status, and appends exactly one
    /// review event, atomically. Declines release the pattern's active
    /// slot; publishes resolve the pattern.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition_proposal(
        &self,
        tenant: &TenantId,
        proposal_id: Uuid,
        expected: ProposalStatus,
        new_status: ProposalStatus,
        actor: ReviewActor,
        action: ReviewAction,
        rationale: Option<String>,
        modifications: Vec<String>,
        mutate: impl FnOnce(&mut WorkflowProposal),
    ) -> Result<(WorkflowProposal, ReviewEvent), AppError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let proposal = inner
            .proposals
            .get_mut(&proposal_id)
            .filter(|p| &p.tenant_id == tenant)
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", proposal_id)))?;
        if proposal.status != expected {
            return Err(AppError::StaleTransition(format!(
                "Proposal {} is {:?}, expected {:?}",
                proposal_id, proposal.status, expected
            )));
        }

        let previous_status = proposal.status;
        mutate(proposal);
        proposal.status = new_status;
        proposal.updated_at = now;
        let pattern_id = proposal.pattern_id;
        let snapshot = proposal.clone();

        if let Some(pattern) = inner.patterns.get_mut(&pattern_id) {
            match new_status {
                ProposalStatus::Declined => {
                    pattern.active_proposal_id = None;
                    if pattern.status != PatternStatus::Resolved {
                        // Occurrence/impact flags stay intact so the
                        // pattern can re-qualify after cooldown.
                        pattern.status = PatternStatus::ThresholdMet;
                    }
                }
                ProposalStatus::Published => {
                    pattern.status = PatternStatus::Resolved;
                }
                _ => {}
            }
        }

        let event = ReviewEvent {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            proposal_id,
            pattern_id,
            actor,
            action,
            previous_status,
            new_status,
            rationale,
            modifications,
            reviewed_at: now,
        };
        inner
            .review_events
            .entry(proposal_id)
            .or_default()
            .push(event.clone());

        Ok((snapshot, event))
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub async fn pattern(&self, tenant: &TenantId, id: Uuid) -> Result<NeedPattern, AppError> {
        let inner = self.inner.read().await;
        inner
            .patterns
            .get(&id)
            .filter(|p| &p.tenant_id == tenant)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Pattern {} not found", id)))
    }

    pub async fn pattern_evidence(
        &self,
        tenant: &TenantId,
        pattern_id: Uuid,
    ) -> Result<Vec<Evidence>, AppError> {
        let inner = self.inner.read().await;
        inner
            .patterns
            .get(&pattern_id)
            .filter(|p| &p.tenant_id == tenant)
            .ok_or_else(|| AppError::NotFound(format!("Pattern {} not found", pattern_id)))?;
        Ok(inner
            .evidence_by_pattern
            .get(&pattern_id)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn proposal(
        &self,
        tenant: &TenantId,
        id: Uuid,
    ) -> Result<WorkflowProposal, AppError> {
        let inner = self.inner.read().await;
        inner
            .proposals
            .get(&id)
            .filter(|p| &p.tenant_id == tenant)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", id)))
    }

    pub async fn review_history(
        &self,
        tenant: &TenantId,
        proposal_id: Uuid,
    ) -> Result<Vec<ReviewEvent>, AppError> {
        let inner = self.inner.read().await;
        inner
            .proposals
            .get(&proposal_id)
            .filter(|p| &p.tenant_id == tenant)
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", proposal_id)))?;
        Ok(inner
            .review_events
            .get(&proposal_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Tenant-scoped pattern listing, score descending.
    pub async fn list_patterns(
        &self,
        tenant: &TenantId,
        filter: &PatternFilter,
        page: Page,
    ) -> Vec<NeedPattern> {
        let inner = self.inner.read().await;
        let mut patterns: Vec<NeedPattern> = inner
            .patterns_by_tenant
            .get(tenant)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.patterns.get(id))
                    .filter(|p| filter.status.map_or(true, |s| p.status == s))
                    .filter(|p| filter.min_score.map_or(true, |s| p.cumulative_score >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        patterns.sort_by(|a, b| b.cumulative_score.total_cmp(&a.cumulative_score));
        patterns
            .into_iter()
            .skip(page.offset())
            .take(page.per_page)
            .collect()
    }

    /// Tenant-scoped proposal listing, newest first.
    pub async fn list_proposals(
        &self,
        tenant: &TenantId,
        filter: &ProposalFilter,
        page: Page,
    ) -> Vec<WorkflowProposal> {
        let inner = self.inner.read().await;
        let mut proposals: Vec<WorkflowProposal> = inner
            .proposals_by_tenant
            .get(tenant)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.proposals.get(id))
                    .filter(|p| filter.status.map_or(true, |s| p.status == s))
                    .filter(|p| {
                        filter.min_confidence.map_or(true, |c| p.confidence >= c)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        proposals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        proposals
            .into_iter()
            .skip(page.offset())
            .take(page.per_page)
            .collect()
    }

    /// All tenants that currently have any pipeline state. The scheduler
    /// iterates this set each tick.
    pub async fn known_tenants(&self) -> Vec<TenantId> {
        let inner = self.inner.read().await;
        let mut tenants: HashSet<TenantId> = inner.patterns_by_tenant.keys().cloned().collect();
        tenants.extend(inner.configs.keys().cloned());
        let mut tenants: Vec<TenantId> = tenants.into_iter().collect();
        tenants.sort();
        tenants
    }
}
