//! Pipeline service
//!
//! Orchestrates the full evidence -> pattern -> synthesis -> governance ->
//! review -> publish flow over the store, the dispatch queue, and the
//! external collaborators. Route handlers and background workers both go
//! through this service; it owns no HTTP or scheduling concerns itself.

use crate::db::archive::PipelineArchive;
use crate::error::AppError;
use crate::external::{
    EmbeddingService, HashEmbedder, InMemoryCatalog, LogNotifier, NotificationChannel,
    NotifyEvent, SandboxExecutor, SimulatedSandbox, WorkflowCatalog,
};
use crate::pipeline::governor::{GovernorContext, GovernorDecision, RiskGovernor};
use crate::pipeline::queue::{FailureOutcome, PipelineTask, QueuedTask, TaskQueue};
use crate::pipeline::signature;
use crate::pipeline::store::{
    DispatchDecision, EvidenceAttachment, Page, PatternFilter, PipelineStore, ProposalFilter,
};
use crate::pipeline::synthesizer::{SynthesisTuning, Synthesizer};
use crate::pipeline::thresholds::{TenantConfig, ThresholdFlags};
use crate::pipeline::types::{
    Evidence, EvidenceContext, EvidenceType, NeedPattern, PatternStatus, ProposalStatus,
    ReviewAction, ReviewActor, ReviewEvent, TenantId, TestStatus, TestSummary, WorkflowProposal,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Synchronous result of an evidence submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub pattern_id: Uuid,
    pub evidence_id: Uuid,
    pub cumulative_score: f64,
    pub pattern_status: PatternStatus,
    pub thresholds: ThresholdFlags,
}

/// Admin review actions exposed at the API boundary.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Approve,
    Decline,
    RequestTest,
    Modify,
}

/// How a proposal test run exercises the candidate graph. Shadow mode
/// replays recorded production traffic; sandbox mode runs synthetic
/// cases. Both go through the sandbox execution service.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    #[default]
    Sandbox,
    Shadow,
}

impl TestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Sandbox => "sandbox",
            TestMode::Shadow => "shadow",
        }
    }
}

/// Full proposal detail: proposal + pattern + evidence + review history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalDetail {
    pub proposal: WorkflowProposal,
    pub pattern: NeedPattern,
    pub evidence: Vec<Evidence>,
    pub history: Vec<ReviewEvent>,
}

pub struct PipelineService {
    store: PipelineStore,
    queue: TaskQueue,
    synthesizer: Synthesizer,
    embedder: Arc<dyn EmbeddingService>,
    catalog: Arc<dyn WorkflowCatalog>,
    sandbox: Arc<dyn SandboxExecutor>,
    notifier: Arc<dyn NotificationChannel>,
    archive: Option<PipelineArchive>,
}

impl PipelineService {
    pub fn new(
        tuning: SynthesisTuning,
        embedder: Arc<dyn EmbeddingService>,
        catalog: Arc<dyn WorkflowCatalog>,
        sandbox: Arc<dyn SandboxExecutor>,
        notifier: Arc<dyn NotificationChannel>,
        archive: Option<PipelineArchive>,
    ) -> Self {
        Self {
            store: PipelineStore::new(),
            queue: TaskQueue::new(),
            synthesizer: Synthesizer::new(tuning),
            embedder,
            catalog,
            sandbox,
            notifier,
            archive,
        }
    }

    /// Fully in-process service: deterministic embedder, in-memory
    /// catalog, simulated sandbox, log notifications, no archive.
    pub fn in_process(tuning: SynthesisTuning) -> Self {
        Self::new(
            tuning,
            Arc::new(HashEmbedder),
            Arc::new(InMemoryCatalog::new()),
            Arc::new(SimulatedSandbox),
            Arc::new(LogNotifier),
            None,
        )
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    // =========================================================================
    // EVIDENCE INGESTION
    // =========================================================================

    /// Validate, weigh, normalize, and attribute one evidence event.
    /// Synchronous to the caller; synthesis never runs on this path.
    pub async fn submit_evidence(
        &self,
        tenant: &TenantId,
        evidence_type: &str,
        user_id: &str,
        context: EvidenceContext,
    ) -> Result<SubmitOutcome, AppError> {
        let evidence_type = EvidenceType::parse(evidence_type)?;
        let config = self.store.config(tenant).await;
        let weight = config.weights.weight_for(evidence_type);

        let sig = signature::derive_signature(&context);
        let content_hash = signature::content_hash(&sig);
        let embedding = self.embedder.embed(&signature::signature_text(&sig)).await;

        let attachment = self
            .store
            .attach_evidence(
                tenant,
                sig,
                content_hash,
                embedding,
                evidence_type,
                weight,
                user_id,
                &context,
                Utc::now(),
            )
            .await?;

        self.archive_attachment(&attachment);
        if attachment.newly_threshold_met {
            info!(
                "📈 Pattern {} for tenant {} crossed occurrence+impact thresholds (score {:.2})",
                attachment.pattern.id, tenant, attachment.pattern.cumulative_score
            );
            self.notify(NotifyEvent::PatternThresholdMet {
                tenant_id: tenant.clone(),
                pattern_id: attachment.pattern.id,
                cumulative_score: attachment.pattern.cumulative_score,
            });
        }

        Ok(SubmitOutcome {
            pattern_id: attachment.pattern.id,
            evidence_id: attachment.evidence.id,
            cumulative_score: attachment.pattern.cumulative_score,
            pattern_status: attachment.pattern.status,
            thresholds: attachment.flags,
        })
    }

    // =========================================================================
    // SCHEDULING & TASK HANDLING
    // =========================================================================

    /// One scheduler pass for a tenant: rate limits, qualifying-pattern
    /// selection, and synthesis dispatch.
    pub async fn run_scheduler_pass(&self, tenant: &TenantId) -> Result<usize, AppError> {
        match self.store.select_for_dispatch(tenant, Utc::now()).await {
            DispatchDecision::RateLimited { today, this_week } => {
                Err(AppError::RateLimitExceeded {
                    tenant: tenant.clone(),
                    detail: format!("{} proposals today, {} this week", today, this_week),
                })
            }
            DispatchDecision::Dispatched(pattern_ids) => {
                let count = pattern_ids.len();
                for pattern_id in pattern_ids {
                    self.queue
                        .enqueue(PipelineTask::Synthesize {
                            tenant_id: tenant.clone(),
                            pattern_id,
                        })
                        .await;
                }
                Ok(count)
            }
        }
    }

    /// Scheduler pass over every known tenant; rate-limited tenants are
    /// logged and skipped, never partially processed.
    pub async fn run_scheduler_tick(&self) -> usize {
        let mut dispatched = 0;
        for tenant in self.store.known_tenants().await {
            match self.run_scheduler_pass(&tenant).await {
                Ok(count) => dispatched += count,
                Err(AppError::RateLimitExceeded { detail, .. }) => {
                    info!("⏳ Tenant {} rate-limited this pass: {}", tenant, detail);
                }
                Err(e) => error!("Scheduler pass failed for tenant {}: {}", tenant, e),
            }
        }
        dispatched
    }

    /// Process one queued delivery, including retry/dead-letter and
    /// state-reversion bookkeeping.
    pub async fn run_delivery(&self, delivery: QueuedTask) {
        let task = delivery.task.clone();
        match self.handle_task(&task).await {
            Ok(()) => {}
            Err(e) => {
                warn!("Task delivery failed (attempt {}): {}", delivery.attempts + 1, e);
                let outcome = self.queue.record_failure(delivery, &e.to_string()).await;
                if outcome == FailureOutcome::DeadLettered {
                    self.dead_letter_revert(&task, &e).await;
                }
            }
        }
    }

    /// Drain the queue inline. Used by tests and by deployments without
    /// dedicated worker tasks.
    pub async fn drain_queue(&self) {
        while let Some(delivery) = self.queue.try_pop().await {
            self.run_delivery(delivery).await;
        }
    }

    async fn handle_task(&self, task: &PipelineTask) -> Result<(), AppError> {
        match task {
            PipelineTask::Synthesize {
                tenant_id,
                pattern_id,
            } => self.synthesize_pattern(tenant_id, *pattern_id).await,
            PipelineTask::Govern {
                tenant_id,
                pattern_id,
                proposal_id,
            } => self.govern_proposal(tenant_id, *pattern_id, *proposal_id).await,
        }
    }

    async fn synthesize_pattern(
        &self,
        tenant: &TenantId,
        pattern_id: Uuid,
    ) -> Result<(), AppError> {
        let pattern = self.store.pattern(tenant, pattern_id).await?;
        if pattern.status != PatternStatus::ProposalGenerating {
            // Stale redelivery after the pattern moved on.
            return Ok(());
        }
        let evidence = self.store.pattern_evidence(tenant, pattern_id).await?;
        let config = self.store.config(tenant).await;

        let draft = match self
            .synthesizer
            .synthesize(&pattern, &evidence, &config.thresholds)
        {
            Ok(draft) => draft,
            Err(e @ AppError::InsufficientSignal(_)) | Err(e @ AppError::LowCoverage(_)) => {
                // Recoverable: keep the occurrence/impact flags and fall
                // back to accumulation so new evidence can re-qualify the
                // pattern without starting from zero.
                info!("Synthesis for pattern {} deferred: {}", pattern_id, e);
                self.store
                    .revert_generation(pattern_id, PatternStatus::Accumulating)
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.store
                    .revert_generation(pattern_id, PatternStatus::ThresholdMet)
                    .await
                    .ok();
                return Err(e);
            }
        };

        let now = Utc::now();
        let proposal = WorkflowProposal {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            pattern_id,
            name: draft.name,
            description: draft.description,
            graph: draft.graph,
            complexity: draft.complexity,
            confidence: draft.confidence,
            coverage: draft.coverage,
            reasoning: draft.reasoning,
            alternatives: draft.alternatives,
            risk: None,
            priority: None,
            suggested_modifications: Vec::new(),
            status: ProposalStatus::PendingBrain,
            test_status: None,
            test_summary: None,
            external_workflow_id: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        };
        let proposal = self.store.complete_generation(proposal).await?;
        info!(
            "🧪 Synthesized proposal {} ('{}') for pattern {}",
            proposal.id, proposal.name, pattern_id
        );
        self.archive_proposal(&proposal);

        self.queue
            .enqueue(PipelineTask::Govern {
                tenant_id: tenant.clone(),
                pattern_id,
                proposal_id: proposal.id,
            })
            .await;
        Ok(())
    }

    async fn govern_proposal(
        &self,
        tenant: &TenantId,
        pattern_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<(), AppError> {
        let proposal = self.store.proposal(tenant, proposal_id).await?;
        if proposal.status != ProposalStatus::PendingBrain {
            return Ok(());
        }
        let pattern = self.store.pattern(tenant, pattern_id).await?;
        let config = self.store.config(tenant).await;

        let (today, this_week) = self
            .store
            .proposal_counts_excluding(tenant, Utc::now(), proposal_id)
            .await;
        let nearest_workflow = self
            .catalog
            .most_similar(tenant, &pattern.embedding)
            .await
            .map(|(entry, similarity)| (entry.name, similarity));
        let context = GovernorContext {
            nearest_workflow,
            proposals_today: today,
            proposals_this_week: this_week,
        };

        match RiskGovernor::decide(&proposal, &pattern, &config.thresholds, &context) {
            GovernorDecision::Veto { reason, assessment } => {
                info!("🧠 Governor vetoed proposal {}: {}", proposal_id, reason);
                let (proposal, event) = self
                    .store
                    .transition_proposal(
                        tenant,
                        proposal_id,
                        ProposalStatus::PendingBrain,
                        ProposalStatus::Declined,
                        ReviewActor::Governor,
                        ReviewAction::Decline,
                        Some(reason.clone()),
                        Vec::new(),
                        |p| p.risk = Some(assessment),
                    )
                    .await?;
                self.archive_transition(&proposal, &event);
                self.notify(NotifyEvent::ProposalVetoed {
                    tenant_id: tenant.clone(),
                    proposal_id,
                    reason,
                });
            }
            GovernorDecision::Forward {
                priority,
                suggestions,
                assessment,
            } => {
                info!(
                    "🧠 Governor forwarded proposal {} to human review (priority {:?})",
                    proposal_id, priority
                );
                let (proposal, event) = self
                    .store
                    .transition_proposal(
                        tenant,
                        proposal_id,
                        ProposalStatus::PendingBrain,
                        ProposalStatus::PendingAdmin,
                        ReviewActor::Governor,
                        ReviewAction::Forward,
                        Some("risk assessment within tenant ceilings".to_string()),
                        suggestions.clone(),
                        |p| {
                            p.risk = Some(assessment);
                            p.priority = Some(priority);
                            p.suggested_modifications = suggestions;
                        },
                    )
                    .await?;
                self.archive_transition(&proposal, &event);
                self.notify(NotifyEvent::ProposalAwaitingReview {
                    tenant_id: tenant.clone(),
                    proposal_id,
                    priority: format!("{:?}", priority).to_lowercase(),
                });
            }
        }
        Ok(())
    }

    /// Dead-lettered synthesis reverts the pattern to `threshold_met`
    /// for manual inspection; dead-lettered governance leaves the
    /// proposal parked in `pending_brain` for the same reason.
    async fn dead_letter_revert(&self, task: &PipelineTask, cause: &AppError) {
        error!(
            "💀 Task dead-lettered after {} attempts: {:?} ({})",
            crate::pipeline::queue::MAX_DELIVERY_ATTEMPTS,
            task,
            cause
        );
        if let PipelineTask::Synthesize { pattern_id, .. } = task {
            if let Err(e) = self
                .store
                .revert_generation(*pattern_id, PatternStatus::ThresholdMet)
                .await
            {
                warn!("Failed to revert pattern {} after dead-letter: {}", pattern_id, e);
            }
        }
        if let Some(archive) = &self.archive {
            let archive = archive.clone();
            let dead_letter = crate::pipeline::queue::DeadLetter {
                task: task.clone(),
                attempts: crate::pipeline::queue::MAX_DELIVERY_ATTEMPTS,
                last_error: cause.to_string(),
                dead_lettered_at: Utc::now(),
            };
            tokio::spawn(async move {
                if let Err(e) = archive.record_dead_letter(&dead_letter).await {
                    warn!("Dead-letter archive write failed: {}", e);
                }
            });
        }
        self.notify(NotifyEvent::TaskDeadLettered {
            tenant_id: task.tenant_id().clone(),
            pattern_id: task.pattern_id(),
            detail: cause.to_string(),
        });
    }

    // =========================================================================
    // ADMIN REVIEW, TEST, PUBLISH
    // =========================================================================

    /// Human review of a `pending_admin` proposal.
    pub async fn review(
        &self,
        tenant: &TenantId,
        proposal_id: Uuid,
        action: AdminAction,
        notes: Option<String>,
        modifications: Vec<String>,
    ) -> Result<(WorkflowProposal, ReviewEvent), AppError> {
        let (new_status, review_action) = match action {
            AdminAction::Approve => (ProposalStatus::Approved, ReviewAction::Approve),
            AdminAction::Decline => (ProposalStatus::Declined, ReviewAction::Decline),
            AdminAction::RequestTest => (ProposalStatus::Testing, ReviewAction::RequestTest),
            AdminAction::Modify => (ProposalStatus::PendingAdmin, ReviewAction::Modify),
        };

        let mods = modifications.clone();
        let (proposal, event) = self
            .store
            .transition_proposal(
                tenant,
                proposal_id,
                ProposalStatus::PendingAdmin,
                new_status,
                ReviewActor::Admin,
                review_action,
                notes,
                modifications,
                move |p| {
                    if action == AdminAction::Modify {
                        p.suggested_modifications.extend(mods);
                    }
                },
            )
            .await?;
        self.archive_transition(&proposal, &event);
        Ok((proposal, event))
    }

    /// Run a `testing` proposal against the sandbox and return it to the
    /// human queue with aggregated results. Sandbox failures count as
    /// failed runs; the proposal is never left in `testing`.
    pub async fn run_test(
        &self,
        tenant: &TenantId,
        proposal_id: Uuid,
        test_mode: TestMode,
        cases: Vec<String>,
        iterations: u32,
    ) -> Result<(WorkflowProposal, TestSummary), AppError> {
        if cases.is_empty() {
            return Err(AppError::Validation(
                "at least one test case is required".to_string(),
            ));
        }
        let iterations = iterations.max(1);

        let proposal = self.store.proposal(tenant, proposal_id).await?;
        if proposal.status != ProposalStatus::Testing {
            return Err(AppError::StaleTransition(format!(
                "Proposal {} is {:?}, expected testing",
                proposal_id, proposal.status
            )));
        }

        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut latency_total = 0u64;
        let mut quality_total = 0.0f64;
        for case in &cases {
            for _ in 0..iterations {
                match self.sandbox.run(&proposal.graph, case).await {
                    Ok(run) => {
                        if run.passed {
                            passed += 1;
                        } else {
                            failed += 1;
                        }
                        latency_total += run.latency_ms;
                        quality_total += run.quality_score;
                    }
                    Err(e) => {
                        warn!("Sandbox run failed for proposal {}: {}", proposal_id, e);
                        failed += 1;
                    }
                }
            }
        }

        let total = passed + failed;
        let pass_rate = passed as f64 / total as f64;
        let summary = TestSummary {
            total_runs: total,
            passed_runs: passed,
            failed_runs: failed,
            pass_rate,
            avg_latency_ms: latency_total as f64 / total as f64,
            avg_quality: quality_total / total as f64,
            completed_at: Utc::now(),
        };
        let test_status = if pass_rate >= 0.8 {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };

        let summary_clone = summary.clone();
        let (proposal, event) = self
            .store
            .transition_proposal(
                tenant,
                proposal_id,
                ProposalStatus::Testing,
                ProposalStatus::PendingAdmin,
                ReviewActor::Admin,
                ReviewAction::TestCompleted,
                Some(format!(
                    "{}/{} {} runs passed ({:.0}%)",
                    passed,
                    total,
                    test_mode.as_str(),
                    pass_rate * 100.0
                )),
                Vec::new(),
                move |p| {
                    p.test_status = Some(test_status);
                    p.test_summary = Some(summary_clone);
                },
            )
            .await?;
        self.archive_transition(&proposal, &event);
        Ok((proposal, summary))
    }

    /// Promote an approved proposal into the production catalog and
    /// resolve its source pattern.
    pub async fn publish(
        &self,
        tenant: &TenantId,
        proposal_id: Uuid,
    ) -> Result<WorkflowProposal, AppError> {
        let proposal = self.store.proposal(tenant, proposal_id).await?;
        if proposal.status != ProposalStatus::Approved {
            return Err(AppError::NotApproved(format!(
                "Proposal {} is {:?}; only approved proposals can be published",
                proposal_id, proposal.status
            )));
        }
        let pattern = self.store.pattern(tenant, proposal.pattern_id).await?;

        let external_id = self
            .catalog
            .publish(tenant, &proposal.name, &proposal.graph, pattern.embedding.clone())
            .await?;
        let now = Utc::now();
        let external = external_id.clone();
        let (proposal, event) = self
            .store
            .transition_proposal(
                tenant,
                proposal_id,
                ProposalStatus::Approved,
                ProposalStatus::Published,
                ReviewActor::Admin,
                ReviewAction::Publish,
                Some(format!("published as {}", external_id)),
                Vec::new(),
                move |p| {
                    p.external_workflow_id = Some(external);
                    p.published_at = Some(now);
                },
            )
            .await?;
        info!(
            "🚢 Published proposal {} as {} and resolved pattern {}",
            proposal_id, external_id, proposal.pattern_id
        );
        self.archive_transition(&proposal, &event);
        self.notify(NotifyEvent::ProposalPublished {
            tenant_id: tenant.clone(),
            proposal_id,
            external_workflow_id: external_id,
        });
        Ok(proposal)
    }

    // =========================================================================
    // READS & CONFIG
    // =========================================================================

    pub async fn list_patterns(
        &self,
        tenant: &TenantId,
        filter: &PatternFilter,
        page: Page,
    ) -> Vec<NeedPattern> {
        self.store.list_patterns(tenant, filter, page).await
    }

    pub async fn list_proposals(
        &self,
        tenant: &TenantId,
        filter: &ProposalFilter,
        page: Page,
    ) -> Vec<WorkflowProposal> {
        self.store.list_proposals(tenant, filter, page).await
    }

    pub async fn proposal_detail(
        &self,
        tenant: &TenantId,
        proposal_id: Uuid,
    ) -> Result<ProposalDetail, AppError> {
        let proposal = self.store.proposal(tenant, proposal_id).await?;
        let pattern = self.store.pattern(tenant, proposal.pattern_id).await?;
        let evidence = self.store.pattern_evidence(tenant, proposal.pattern_id).await?;
        let history = self.store.review_history(tenant, proposal_id).await?;
        Ok(ProposalDetail {
            proposal,
            pattern,
            evidence,
            history,
        })
    }

    pub async fn tenant_config(&self, tenant: &TenantId) -> TenantConfig {
        self.store.config(tenant).await
    }

    pub async fn update_tenant_config(
        &self,
        tenant: &TenantId,
        config: TenantConfig,
    ) -> TenantConfig {
        let config = self.store.update_config(tenant, config).await;
        if let Some(archive) = &self.archive {
            let archive = archive.clone();
            let tenant = tenant.clone();
            let snapshot = config.clone();
            tokio::spawn(async move {
                if let Err(e) = archive.upsert_config(&tenant, &snapshot).await {
                    warn!("Config archive write failed for tenant {}: {}", tenant, e);
                }
            });
        }
        config
    }

    // =========================================================================
    // WRITE-THROUGH ARCHIVAL & NOTIFICATIONS
    // =========================================================================

    fn archive_attachment(&self, attachment: &EvidenceAttachment) {
        if let Some(archive) = &self.archive {
            let archive = archive.clone();
            let evidence = attachment.evidence.clone();
            let pattern = attachment.pattern.clone();
            tokio::spawn(async move {
                // Pattern first: the evidence row references it.
                if let Err(e) = archive.upsert_pattern(&pattern).await {
                    warn!("Pattern archive write failed: {}", e);
                }
                if let Err(e) = archive.record_evidence(&evidence).await {
                    warn!("Evidence archive write failed: {}", e);
                }
            });
        }
    }

    fn archive_proposal(&self, proposal: &WorkflowProposal) {
        if let Some(archive) = &self.archive {
            let archive = archive.clone();
            let proposal = proposal.clone();
            tokio::spawn(async move {
                if let Err(e) = archive.upsert_proposal(&proposal).await {
                    warn!("Proposal archive write failed: {}", e);
                }
            });
        }
    }

    /// Proposal snapshot and its review event in one ordered write; the
    /// event row references the proposal row.
    fn archive_transition(&self, proposal: &WorkflowProposal, event: &ReviewEvent) {
        if let Some(archive) = &self.archive {
            let archive = archive.clone();
            let proposal = proposal.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = archive.upsert_proposal(&proposal).await {
                    warn!("Proposal archive write failed: {}", e);
                }
                if let Err(e) = archive.record_review_event(&event).await {
                    warn!("Review-event archive write failed: {}", e);
                }
            });
        }
    }

    fn notify(&self, event: NotifyEvent) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            notifier.notify(event).await;
        });
    }
}
