//! End-to-end pipeline scenarios: evidence accumulation, threshold
//! crossing, scheduling, synthesis, governance, review, and publishing,
//! all against the in-process collaborator defaults.

use chrono::{Duration, Utc};
use flowforge_api::error::AppError;
use flowforge_api::external::{
    CatalogEntry, EmbeddingService, HashEmbedder, InMemoryCatalog, LogNotifier, SimulatedSandbox,
    WorkflowCatalog,
};
use flowforge_api::pipeline::service::{AdminAction, PipelineService, TestMode};
use flowforge_api::pipeline::signature::{content_hash, derive_signature, signature_text};
use flowforge_api::pipeline::store::{DispatchDecision, EvidenceAttachment, PatternFilter, Page};
use flowforge_api::pipeline::synthesizer::SynthesisTuning;
use flowforge_api::pipeline::thresholds::TenantConfig;
use flowforge_api::pipeline::types::{
    EvidenceContext, EvidenceType, PatternStatus, ProposalStatus, ReviewAction, ReviewActor,
    TestStatus,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn service() -> PipelineService {
    PipelineService::in_process(SynthesisTuning::default())
}

fn context(request: &str, reason: Option<&str>) -> EvidenceContext {
    EvidenceContext {
        original_request: request.to_string(),
        failure_reason: reason.map(String::from),
        ..Default::default()
    }
}

/// Attach evidence through the store with a controlled timestamp.
async fn attach_at(
    service: &PipelineService,
    tenant: &str,
    request: &str,
    reason: Option<&str>,
    user: &str,
    evidence_type: EvidenceType,
    weight: f64,
    at: chrono::DateTime<Utc>,
) -> EvidenceAttachment {
    let ctx = context(request, reason);
    let sig = derive_signature(&ctx);
    let hash = content_hash(&sig);
    let embedding = HashEmbedder.embed(&signature_text(&sig)).await;
    service
        .store()
        .attach_evidence(
            &tenant.to_string(),
            sig,
            hash,
            embedding,
            evidence_type,
            weight,
            user,
            &ctx,
            at,
        )
        .await
        .expect("attach evidence")
}

/// Seed the canonical qualifying pattern: five negative-feedback events
/// (weight 0.35-equivalent) from three users spread over 30 hours.
async fn seed_qualifying_pattern(
    service: &PipelineService,
    tenant: &str,
    request: &str,
    reason: &str,
    weight: f64,
) -> EvidenceAttachment {
    let start = Utc::now() - Duration::hours(30);
    let mut last = None;
    for i in 0..5 {
        let user = format!("user-{}", i % 3);
        let at = start + Duration::hours((i as i64) * 7); // 0..28h, plus final send below
        let at = if i == 4 { start + Duration::hours(30) } else { at };
        last = Some(
            attach_at(
                service,
                tenant,
                request,
                Some(reason),
                &user,
                EvidenceType::NegativeFeedback,
                weight,
                at,
            )
            .await,
        );
    }
    last.unwrap()
}

// =============================================================================
// EVIDENCE & THRESHOLDS
// =============================================================================

#[tokio::test]
async fn default_thresholds_flip_pattern_to_threshold_met() {
    let service = service();
    let last = seed_qualifying_pattern(
        &service,
        "acme",
        "summarize weekly sales numbers",
        "missed the regional breakdown",
        0.35,
    )
    .await;

    assert!((last.pattern.cumulative_score - 1.75).abs() < 1e-9);
    assert_eq!(last.pattern.evidence_count, 5);
    assert_eq!(last.pattern.distinct_users, 3);
    assert!(last.flags.occurrence);
    assert!(last.flags.impact);
    assert!(!last.flags.confidence);
    assert_eq!(last.pattern.status, PatternStatus::ThresholdMet);
    assert!(last.newly_threshold_met);
}

#[tokio::test]
async fn concurrent_submissions_converge_to_one_pattern() {
    let service = Arc::new(service());
    let mut handles = Vec::new();
    for i in 0..12 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service
                .submit_evidence(
                    &"acme".to_string(),
                    "negative_feedback",
                    &format!("user-{}", i),
                    context(
                        "translate product descriptions to spanish",
                        Some("tone came out robotic"),
                    ),
                )
                .await
                .expect("submit")
        }));
    }

    let mut pattern_ids = Vec::new();
    for handle in handles {
        pattern_ids.push(handle.await.unwrap().pattern_id);
    }
    pattern_ids.dedup();
    assert_eq!(pattern_ids.len(), 1, "signature fragmented across patterns");

    let pattern = service
        .store()
        .pattern(&"acme".to_string(), pattern_ids[0])
        .await
        .unwrap();
    assert_eq!(pattern.evidence_count, 12);
    assert_eq!(pattern.distinct_users, 12);
}

#[tokio::test]
async fn pattern_score_is_exact_sum_of_evidence_weights() {
    let service = service();
    let tenant = "acme".to_string();
    let types = [
        EvidenceType::WorkflowFailure,
        EvidenceType::NegativeFeedback,
        EvidenceType::ManualOverride,
        EvidenceType::RegenerationRequest,
        EvidenceType::SessionAbandonment,
        EvidenceType::LowConfidenceCompletion,
        EvidenceType::ExplicitRequest,
        EvidenceType::NegativeFeedback,
        EvidenceType::WorkflowFailure,
    ];
    let now = Utc::now();
    let mut pattern_id = None;
    for (i, et) in types.iter().enumerate() {
        let attachment = attach_at(
            &service,
            "acme",
            "draft a quarterly investor update",
            Some("structure was disorganized"),
            &format!("user-{}", i % 4),
            *et,
            0.1 + (i as f64) * 0.05,
            now + Duration::minutes(i as i64),
        )
        .await;
        pattern_id = Some(attachment.pattern.id);
    }

    let pattern = service.store().pattern(&tenant, pattern_id.unwrap()).await.unwrap();
    let evidence = service
        .store()
        .pattern_evidence(&tenant, pattern.id)
        .await
        .unwrap();
    let expected: f64 = evidence.iter().map(|e| e.weight).sum();
    assert_eq!(evidence.len(), types.len());
    assert!((pattern.cumulative_score - expected).abs() < 1e-9);
}

#[tokio::test]
async fn threshold_flags_never_regress_under_config_tightening() {
    let service = service();
    let tenant = "acme".to_string();

    let mut config = TenantConfig::default();
    config.thresholds.min_evidence_count = 2;
    config.thresholds.min_unique_users = 1;
    config.thresholds.min_time_span_hours = 0;
    config.thresholds.min_total_evidence_score = 0.5;
    service.store().update_config(&tenant, config).await;

    let now = Utc::now();
    attach_at(
        &service, "acme", "classify support tickets", Some("labels were wrong"),
        "user-1", EvidenceType::ManualOverride, 0.4, now - Duration::hours(1),
    )
    .await;
    let attachment = attach_at(
        &service, "acme", "classify support tickets", Some("labels were wrong"),
        "user-1", EvidenceType::ManualOverride, 0.4, now,
    )
    .await;
    assert!(attachment.flags.occurrence);
    assert!(attachment.flags.impact);

    // Tighten the config far beyond what the pattern satisfies; the
    // already-set flags must hold.
    let mut strict = TenantConfig::default();
    strict.thresholds.min_evidence_count = 100;
    strict.thresholds.min_total_evidence_score = 50.0;
    service.store().update_config(&tenant, strict).await;

    let attachment = attach_at(
        &service, "acme", "classify support tickets", Some("labels were wrong"),
        "user-2", EvidenceType::ManualOverride, 0.4, now + Duration::minutes(5),
    )
    .await;
    assert!(attachment.flags.occurrence, "occurrence flag regressed");
    assert!(attachment.flags.impact, "impact flag regressed");
}

#[tokio::test]
async fn invalid_evidence_type_is_rejected() {
    let service = service();
    let err = service
        .submit_evidence(
            &"acme".to_string(),
            "vibes",
            "user-1",
            context("do a thing", None),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidEvidenceType(_)));
}

// =============================================================================
// SCHEDULER
// =============================================================================

#[tokio::test]
async fn concurrent_scheduler_passes_dispatch_a_pattern_once() {
    let service = Arc::new(service());
    seed_qualifying_pattern(
        &service,
        "acme",
        "research competitor pricing across multiple sources",
        "missed key sources",
        0.5,
    )
    .await;

    let a = Arc::clone(&service);
    let b = Arc::clone(&service);
    let tenant = "acme".to_string();
    let tenant_b = tenant.clone();
    let (first, second) = tokio::join!(
        async move { a.run_scheduler_pass(&tenant).await },
        async move { b.run_scheduler_pass(&tenant_b).await },
    );

    let dispatched = first.unwrap_or(0) + second.unwrap_or(0);
    assert_eq!(dispatched, 1, "pattern double-dispatched");
    assert_eq!(service.queue().len().await, 1);
}

#[tokio::test]
async fn scheduler_aborts_tenant_pass_when_caps_exhausted() {
    let service = service();
    let tenant = "acme".to_string();

    let mut config = TenantConfig::default();
    config.thresholds.max_daily_proposals = 0;
    service.store().update_config(&tenant, config).await;

    seed_qualifying_pattern(
        &service,
        "acme",
        "summarize long contracts",
        "missed key clauses",
        0.5,
    )
    .await;

    let err = service.run_scheduler_pass(&tenant).await.unwrap_err();
    assert!(matches!(err, AppError::RateLimitExceeded { .. }));
    assert!(service.queue().is_empty().await);

    // No partial processing: the pattern is still waiting, untouched.
    let decision = service
        .store()
        .select_for_dispatch(&tenant, Utc::now())
        .await;
    assert!(matches!(decision, DispatchDecision::RateLimited { .. }));
}

// =============================================================================
// SYNTHESIS OUTCOMES
// =============================================================================

#[tokio::test]
async fn insufficient_signal_reverts_pattern_with_flags_intact() {
    let service = service();
    let tenant = "acme".to_string();

    // Low weights and scattered reasons: evidence confidence lands at
    // 0.3 + 0.3*0.2 + 0.4*0.2 = 0.44, under the 0.5 floor.
    let start = Utc::now() - Duration::hours(30);
    let mut last = None;
    for i in 0..5 {
        last = Some(
            attach_at(
                &service,
                "acme",
                "handle the odd requests from the ops team",
                Some(&format!("failed in a new way #{}", i)),
                &format!("user-{}", i % 3),
                EvidenceType::LowConfidenceCompletion,
                0.2,
                start + Duration::hours(i as i64 * 7 + 2),
            )
            .await,
        );
    }
    let pattern_id = last.unwrap().pattern.id;
    assert_eq!(
        service.store().pattern(&tenant, pattern_id).await.unwrap().status,
        PatternStatus::ThresholdMet
    );

    let dispatched = service.run_scheduler_pass(&tenant).await.unwrap();
    assert_eq!(dispatched, 1);
    service.drain_queue().await;

    let pattern = service.store().pattern(&tenant, pattern_id).await.unwrap();
    assert_eq!(pattern.status, PatternStatus::Accumulating);
    assert!(pattern.occurrence_met, "occurrence flag lost on revert");
    assert!(pattern.impact_met, "impact flag lost on revert");
    assert!(!pattern.confidence_met);
    assert!(pattern.active_proposal_id.is_none());
}

// =============================================================================
// GOVERNOR & COOLDOWN
// =============================================================================

#[tokio::test]
async fn governor_veto_declines_and_cooldown_blocks_resynthesis() {
    let service = service();
    let tenant = "acme".to_string();

    // A cost ceiling low enough that any synthesized graph trips it.
    let mut config = TenantConfig::default();
    config.thresholds.max_cost_risk = 0.05;
    service.store().update_config(&tenant, config).await;

    let last = seed_qualifying_pattern(
        &service,
        "acme",
        "research competitor pricing across multiple sources",
        "missed key sources",
        0.5,
    )
    .await;
    let pattern_id = last.pattern.id;

    assert_eq!(service.run_scheduler_pass(&tenant).await.unwrap(), 1);
    service.drain_queue().await;

    // The proposal was vetoed by the governor, citing cost first.
    let proposals = service
        .store()
        .list_proposals(&tenant, &Default::default(), Page::default())
        .await;
    assert_eq!(proposals.len(), 1);
    let proposal = &proposals[0];
    assert_eq!(proposal.status, ProposalStatus::Declined);

    let history = service
        .store()
        .review_history(&tenant, proposal.id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].actor, ReviewActor::Governor);
    assert_eq!(history[0].action, ReviewAction::Decline);
    assert!(history[0].rationale.as_deref().unwrap().contains("cost risk"));

    // Pattern is eligible again in principle, but the decline-cooldown
    // keeps the scheduler away from it.
    let pattern = service.store().pattern(&tenant, pattern_id).await.unwrap();
    assert_eq!(pattern.status, PatternStatus::ThresholdMet);
    assert!(pattern.active_proposal_id.is_none());
    assert_eq!(service.run_scheduler_pass(&tenant).await.unwrap(), 0);

    // Once the cooldown window is lifted, re-synthesis dispatches again.
    let mut relaxed = TenantConfig::default();
    relaxed.thresholds.max_cost_risk = 0.05;
    relaxed.thresholds.decline_cooldown_hours = 0;
    service.store().update_config(&tenant, relaxed).await;
    assert_eq!(service.run_scheduler_pass(&tenant).await.unwrap(), 1);
}

#[tokio::test]
async fn near_duplicate_catalog_workflow_is_vetoed() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let service = PipelineService::new(
        SynthesisTuning::default(),
        Arc::new(HashEmbedder),
        Arc::clone(&catalog) as Arc<dyn WorkflowCatalog>,
        Arc::new(SimulatedSandbox),
        Arc::new(LogNotifier),
        None,
    );
    let tenant = "acme".to_string();

    let last = seed_qualifying_pattern(
        &service,
        "acme",
        "research competitor pricing across multiple sources",
        "missed key sources",
        0.5,
    )
    .await;
    catalog
        .seed(
            &tenant,
            CatalogEntry {
                external_id: "wf-existing".to_string(),
                name: "Competitor pricing research".to_string(),
                embedding: last.pattern.embedding.clone(),
            },
        )
        .await;

    service.run_scheduler_pass(&tenant).await.unwrap();
    service.drain_queue().await;

    let proposals = service
        .store()
        .list_proposals(&tenant, &Default::default(), Page::default())
        .await;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].status, ProposalStatus::Declined);
    let history = service
        .store()
        .review_history(&tenant, proposals[0].id)
        .await
        .unwrap();
    assert!(history[0]
        .rationale
        .as_deref()
        .unwrap()
        .contains("near-duplicate"));
}

// =============================================================================
// REVIEW, TEST, PUBLISH
// =============================================================================

#[tokio::test]
async fn full_pipeline_review_test_publish_resolves_pattern() {
    let service = service();
    let tenant = "acme".to_string();

    let last = seed_qualifying_pattern(
        &service,
        "acme",
        "research competitor pricing across multiple sources",
        "missed key sources",
        0.5,
    )
    .await;
    let pattern_id = last.pattern.id;

    assert_eq!(service.run_scheduler_pass(&tenant).await.unwrap(), 1);
    service.drain_queue().await;

    // Governor forwarded to the human queue with a computed priority.
    let proposals = service
        .store()
        .list_proposals(&tenant, &Default::default(), Page::default())
        .await;
    assert_eq!(proposals.len(), 1);
    let proposal = proposals[0].clone();
    assert_eq!(proposal.status, ProposalStatus::PendingAdmin);
    assert!(proposal.priority.is_some());
    assert!(proposal.risk.is_some());
    assert!(!proposal.alternatives.is_empty());

    // The pattern now carries its active proposal and the confidence flag.
    let pattern = service.store().pattern(&tenant, pattern_id).await.unwrap();
    assert_eq!(pattern.status, PatternStatus::ProposalGenerated);
    assert!(pattern.confidence_met);
    assert_eq!(pattern.active_proposal_id, Some(proposal.id));

    // Request a sandbox test; the run returns the proposal to the queue.
    let (proposal, _) = service
        .review(&tenant, proposal.id, AdminAction::RequestTest, None, vec![])
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Testing);
    let (proposal, summary) = service
        .run_test(
            &tenant,
            proposal.id,
            TestMode::Sandbox,
            vec!["case-a".to_string(), "case-b".to_string()],
            3,
        )
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::PendingAdmin);
    assert_eq!(summary.total_runs, 6);
    assert_eq!(proposal.test_status, Some(TestStatus::Passed));

    // Approve and publish.
    let (proposal, _) = service
        .review(
            &tenant,
            proposal.id,
            AdminAction::Approve,
            Some("looks solid".to_string()),
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Approved);

    let published = service.publish(&tenant, proposal.id).await.unwrap();
    assert_eq!(published.status, ProposalStatus::Published);
    assert!(published.external_workflow_id.is_some());
    assert!(published.published_at.is_some());

    // Source pattern is resolved, terminally.
    let pattern = service.store().pattern(&tenant, pattern_id).await.unwrap();
    assert_eq!(pattern.status, PatternStatus::Resolved);

    // Publish is idempotent-safe: the second call fails with NotApproved
    // and changes nothing.
    let err = service.publish(&tenant, proposal.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotApproved(_)));

    // Every transition left exactly one audit row:
    // forward, request_test, test_completed, approve, publish.
    let history = service
        .store()
        .review_history(&tenant, proposal.id)
        .await
        .unwrap();
    let actions: Vec<ReviewAction> = history.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            ReviewAction::Forward,
            ReviewAction::RequestTest,
            ReviewAction::TestCompleted,
            ReviewAction::Approve,
            ReviewAction::Publish,
        ]
    );
}

#[tokio::test]
async fn review_of_non_pending_proposal_is_stale() {
    let service = service();
    let tenant = "acme".to_string();

    seed_qualifying_pattern(
        &service,
        "acme",
        "research competitor pricing across multiple sources",
        "missed key sources",
        0.5,
    )
    .await;
    service.run_scheduler_pass(&tenant).await.unwrap();
    service.drain_queue().await;

    let proposals = service
        .store()
        .list_proposals(&tenant, &Default::default(), Page::default())
        .await;
    let proposal_id = proposals[0].id;

    service
        .review(&tenant, proposal_id, AdminAction::Approve, None, vec![])
        .await
        .unwrap();

    // A second approve sees the status has moved on.
    let err = service
        .review(&tenant, proposal_id, AdminAction::Approve, None, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StaleTransition(_)));

    // Publishing without approval is rejected with no state change.
    let other_tenant_err = service
        .publish(&"globex".to_string(), proposal_id)
        .await
        .unwrap_err();
    assert!(matches!(other_tenant_err, AppError::NotFound(_)));
}

#[tokio::test]
async fn admin_decline_releases_pattern_for_future_resynthesis() {
    let service = service();
    let tenant = "acme".to_string();

    let last = seed_qualifying_pattern(
        &service,
        "acme",
        "research competitor pricing across multiple sources",
        "missed key sources",
        0.5,
    )
    .await;
    let pattern_id = last.pattern.id;

    service.run_scheduler_pass(&tenant).await.unwrap();
    service.drain_queue().await;
    let proposals = service
        .store()
        .list_proposals(&tenant, &Default::default(), Page::default())
        .await;
    let proposal_id = proposals[0].id;

    let (proposal, event) = service
        .review(
            &tenant,
            proposal_id,
            AdminAction::Decline,
            Some("not worth automating".to_string()),
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Declined);
    assert_eq!(event.actor, ReviewActor::Admin);

    let pattern = service.store().pattern(&tenant, pattern_id).await.unwrap();
    assert_eq!(pattern.status, PatternStatus::ThresholdMet);
    assert!(pattern.occurrence_met);
    assert!(pattern.impact_met);
    assert!(pattern.active_proposal_id.is_none());

    // Cooldown applies to admin declines exactly as to governor vetoes.
    assert_eq!(service.run_scheduler_pass(&tenant).await.unwrap(), 0);
}

// =============================================================================
// TENANT ISOLATION
// =============================================================================

#[tokio::test]
async fn patterns_and_proposals_are_tenant_scoped() {
    let service = service();

    seed_qualifying_pattern(&service, "acme", "summarize sales", "too shallow", 0.5).await;
    seed_qualifying_pattern(&service, "globex", "summarize sales", "too shallow", 0.5).await;

    let acme = service
        .store()
        .list_patterns(&"acme".to_string(), &PatternFilter::default(), Page::default())
        .await;
    let globex = service
        .store()
        .list_patterns(&"globex".to_string(), &PatternFilter::default(), Page::default())
        .await;
    assert_eq!(acme.len(), 1);
    assert_eq!(globex.len(), 1);
    assert_ne!(acme[0].id, globex[0].id);

    // Cross-tenant reads are NotFound, never another tenant's row.
    let err = service
        .store()
        .pattern(&"globex".to_string(), acme[0].id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
