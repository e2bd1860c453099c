//! # researchflow-store
//!
//! The in-memory reference implementation of ResearchFlow's persistence
//! contracts: versioned workflow documents with conditional writes,
//! atomically appended hash-chained audit events, approval records, and
//! per-request leases with TTL expiry.
//!
//! Documents are stored as raw JSON and validated against the state schema
//! on load (schema-on-read), so schema drift is detected before the engine
//! ever interprets a document. Terminal documents accept no further writes
//! beyond idempotent re-assertions during crash recovery.

pub mod memory;
pub mod schema;

pub use memory::InMemoryStore;
pub use schema::validate_document;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use researchflow_contracts::approval::{
        Approval, ApprovalDecision, ApprovalStatus, ApprovalType, PendingFilter,
    };
    use researchflow_contracts::audit::{AuditKind, AuditRecord};
    use researchflow_contracts::error::FlowError;
    use researchflow_contracts::state::{
        FlowState, RequestId, Researcher, Version, WorkflowState,
    };
    use researchflow_core::traits::{ApprovalStore, LeaseKeeper, StateStore};

    use super::InMemoryStore;

    fn state() -> WorkflowState {
        WorkflowState::new(
            Researcher {
                name: "Dr. Adeyemi".to_string(),
                email: "adeyemi@hospital.example".to_string(),
                department: "Endocrinology".to_string(),
                irb_number: "IRB-2026-0320".to_string(),
            },
            "adults with T2DM on GLP-1 agonists, 2021-2025",
        )
    }

    fn created_event(state: &WorkflowState) -> AuditRecord {
        AuditRecord::new(state.request_id, AuditKind::Created)
    }

    // ── Create / load / save ──────────────────────────────────────────────────

    #[tokio::test]
    async fn create_then_load_round_trips_field_by_field() {
        let store = InMemoryStore::new();
        let state = state();
        let version = store.create(&state, vec![created_event(&state)]).await.unwrap();
        assert_eq!(version, Version::INITIAL);

        let (loaded, loaded_version) = store.load(state.request_id).await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded_version, version);
    }

    #[tokio::test]
    async fn duplicate_create_fails_already_exists() {
        let store = InMemoryStore::new();
        let state = state();
        store.create(&state, vec![]).await.unwrap();
        let err = store.create(&state, vec![]).await.unwrap_err();
        assert!(matches!(err, FlowError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn load_unknown_request_fails_not_found() {
        let store = InMemoryStore::new();
        let err = store.load(RequestId::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::RequestNotFound { .. }));
    }

    #[tokio::test]
    async fn save_bumps_version_and_persists_changes() {
        let store = InMemoryStore::new();
        let mut state = state();
        let v1 = store.create(&state, vec![]).await.unwrap();

        state.current_state = FlowState::RequirementsGathering;
        state.iteration_counters.requirements = 1;
        let v2 = store.save(&state, v1, vec![]).await.unwrap();
        assert_eq!(v2, v1.next());

        let (loaded, version) = store.load(state.request_id).await.unwrap();
        assert_eq!(loaded.current_state, FlowState::RequirementsGathering);
        assert_eq!(version, v2);
    }

    #[tokio::test]
    async fn stale_save_fails_conflict_and_never_replaces_state() {
        let store = InMemoryStore::new();
        let mut state = state();
        let v1 = store.create(&state, vec![]).await.unwrap();

        state.current_state = FlowState::RequirementsGathering;
        let _v2 = store.save(&state, v1, vec![]).await.unwrap();

        // A writer holding the stale v1 must be refused.
        let mut stale = state.clone();
        stale.current_state = FlowState::DataDelivery;
        let err = store.save(&stale, v1, vec![]).await.unwrap_err();
        assert!(matches!(err, FlowError::ConcurrencyConflict { .. }));

        let (loaded, _) = store.load(state.request_id).await.unwrap();
        assert_eq!(loaded.current_state, FlowState::RequirementsGathering);
    }

    // ── Terminal write protection ─────────────────────────────────────────────

    #[tokio::test]
    async fn terminal_documents_refuse_new_writes() {
        let store = InMemoryStore::new();
        let mut state = state();
        let v1 = store.create(&state, vec![]).await.unwrap();

        state.current_state = FlowState::Complete;
        let v2 = store.save(&state, v1, vec![]).await.unwrap();

        let mut mutated = state.clone();
        mutated.escalation_reason = Some("should not land".to_string());
        let err = store.save(&mutated, v2, vec![]).await.unwrap_err();
        assert!(matches!(err, FlowError::TerminalStateImmutable { .. }));
    }

    #[tokio::test]
    async fn terminal_documents_accept_idempotent_re_assertion() {
        let store = InMemoryStore::new();
        let mut state = state();
        let v1 = store.create(&state, vec![]).await.unwrap();

        state.current_state = FlowState::Complete;
        let v2 = store.save(&state, v1, vec![]).await.unwrap();

        // Crash recovery may re-assert the identical document.
        let v3 = store.save(&state, v2, vec![]).await.unwrap();
        assert_eq!(v3, v2);
    }

    // ── Audit atomicity ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn saves_append_events_and_keep_the_chain_valid() {
        let store = InMemoryStore::new();
        let mut state = state();
        let v1 = store.create(&state, vec![created_event(&state)]).await.unwrap();

        state.current_state = FlowState::RequirementsGathering;
        let events = vec![AuditRecord::new(state.request_id, AuditKind::NodeEntered)
            .node(FlowState::RequirementsGathering)];
        store.save(&state, v1, events).await.unwrap();

        let stream = store.audit_stream(state.request_id).await.unwrap();
        let kinds: Vec<AuditKind> = stream.iter().map(|e| e.record.kind).collect();
        // created + state_persisted(create) + node_entered + state_persisted(save)
        assert_eq!(
            kinds,
            vec![
                AuditKind::Created,
                AuditKind::StatePersisted,
                AuditKind::NodeEntered,
                AuditKind::StatePersisted,
            ]
        );
        assert!(store.verify_audit_chain(state.request_id));
    }

    // ── Schema drift ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn drifted_document_fails_schema_drift_on_load() {
        let store = InMemoryStore::new();
        let state = state();
        store.create(&state, vec![]).await.unwrap();

        let mut raw = serde_json::to_value(&state).unwrap();
        raw["current_state"] = json!("a_state_from_the_future");
        store.put_raw_document(state.request_id, raw, Version(7));

        let err = store.load(state.request_id).await.unwrap_err();
        assert!(matches!(err, FlowError::SchemaDrift { .. }));
    }

    #[tokio::test]
    async fn quarantine_forces_human_review_on_the_raw_document() {
        let store = InMemoryStore::new();
        let state = state();
        store.create(&state, vec![]).await.unwrap();

        let mut raw = serde_json::to_value(&state).unwrap();
        raw["current_state"] = json!("a_state_from_the_future");
        store.put_raw_document(state.request_id, raw, Version(7));

        store
            .quarantine(state.request_id, "current_state is not a known value")
            .await
            .unwrap();

        // The quarantined document rests at human_review with the reason.
        let (loaded, version) = store.load(state.request_id).await.unwrap();
        assert_eq!(loaded.current_state, FlowState::HumanReview);
        assert_eq!(
            loaded.escalation_reason.as_deref(),
            Some("current_state is not a known value")
        );
        assert_eq!(version, Version(8));
    }

    // ── list_pending_resumable ────────────────────────────────────────────────

    #[tokio::test]
    async fn resumable_listing_excludes_terminal_and_leased_requests() {
        let store = InMemoryStore::new();

        let open = state();
        store.create(&open, vec![]).await.unwrap();

        let mut done = state();
        let v1 = store.create(&done, vec![]).await.unwrap();
        done.current_state = FlowState::Complete;
        store.save(&done, v1, vec![]).await.unwrap();

        let leased = state();
        store.create(&leased, vec![]).await.unwrap();
        let token = store
            .try_acquire(leased.request_id, "worker-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let resumable = store.list_pending_resumable().await.unwrap();
        assert!(resumable.contains(&open.request_id));
        assert!(!resumable.contains(&done.request_id));
        assert!(!resumable.contains(&leased.request_id));

        // Releasing the lease makes the request resumable again.
        store.release(token).await.unwrap();
        let resumable = store.list_pending_resumable().await.unwrap();
        assert!(resumable.contains(&leased.request_id));
    }

    // ── Leases ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_acquire_fails_while_lease_is_live() {
        let store = InMemoryStore::new();
        let request_id = RequestId::new();
        let ttl = Duration::from_secs(30);

        let token = store.try_acquire(request_id, "worker-a", ttl).await.unwrap();
        assert!(token.is_some());
        let second = store.try_acquire(request_id, "worker-b", ttl).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_by_another_worker() {
        let store = InMemoryStore::new();
        let request_id = RequestId::new();

        let stale = store
            .try_acquire(request_id, "worker-a", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        let reclaimed = store
            .try_acquire(request_id, "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(reclaimed.is_some(), "expired lease must be reclaimable");

        // The original holder can no longer renew its lost lease.
        assert!(store.renew(&stale, Duration::from_secs(30)).await.is_err());
        // Releasing a lost lease is a harmless no-op.
        store.release(stale).await.unwrap();
        let second = store
            .try_acquire(request_id, "worker-c", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none(), "release of a lost lease must not free the live one");
    }

    #[tokio::test]
    async fn renew_extends_the_held_lease() {
        let store = InMemoryStore::new();
        let request_id = RequestId::new();
        let token = store
            .try_acquire(request_id, "worker-a", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let renewed = store.renew(&token, Duration::from_secs(60)).await.unwrap();
        assert!(renewed.expires_at > token.expires_at);
    }

    // ── Approvals ─────────────────────────────────────────────────────────────

    fn pending_approval(request_id: RequestId, approval_type: ApprovalType) -> Approval {
        let now = Utc::now();
        Approval::pending(
            request_id,
            approval_type,
            json!({ "snapshot": true }),
            now,
            now + chrono::Duration::hours(72),
        )
    }

    #[tokio::test]
    async fn decide_transitions_exactly_once() {
        let store = InMemoryStore::new();
        let approval = pending_approval(RequestId::new(), ApprovalType::Requirements);
        let approval_id = approval.approval_id;
        store.create_pending(approval).await.unwrap();

        let decided = store
            .decide(approval_id, &ApprovalDecision::approve("dr-okafor"), Utc::now())
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.reviewer.as_deref(), Some("dr-okafor"));
        assert!(decided.decided_at.is_some());

        let err = store
            .decide(approval_id, &ApprovalDecision::reject("dr-okafor", "no"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::AlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn list_pending_honors_every_filter_axis() {
        let store = InMemoryStore::new();
        let r1 = RequestId::new();
        let r2 = RequestId::new();
        store.create_pending(pending_approval(r1, ApprovalType::Requirements)).await.unwrap();
        store.create_pending(pending_approval(r1, ApprovalType::Qa)).await.unwrap();
        store.create_pending(pending_approval(r2, ApprovalType::Qa)).await.unwrap();

        let all = store.list_pending(&PendingFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let by_type = store
            .list_pending(&PendingFilter {
                approval_type: Some(ApprovalType::Qa),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_type.len(), 2);

        let by_request = store
            .list_pending(&PendingFilter { request_id: Some(r1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_request.len(), 2);

        let due_now = store
            .list_pending(&PendingFilter {
                due_before: Some(Utc::now()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(due_now.is_empty(), "nothing is due within the 72h SLA yet");
    }

    #[tokio::test]
    async fn latest_for_returns_the_most_recent_record() {
        let store = InMemoryStore::new();
        let request_id = RequestId::new();
        let first = pending_approval(request_id, ApprovalType::Requirements);
        let first_id = first.approval_id;
        store.create_pending(first).await.unwrap();
        store
            .decide(first_id, &ApprovalDecision::reject("r", "incomplete"), Utc::now())
            .await
            .unwrap();

        let second = pending_approval(request_id, ApprovalType::Requirements);
        let second_id = second.approval_id;
        store.create_pending(second).await.unwrap();

        let latest = store
            .latest_for(request_id, ApprovalType::Requirements)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.approval_id, second_id);
        assert_eq!(latest.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn sweep_times_out_exactly_the_overdue_pending_approvals() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut overdue = pending_approval(RequestId::new(), ApprovalType::PhenotypeSql);
        overdue.sla_deadline = now - chrono::Duration::minutes(1);
        let overdue_id = overdue.approval_id;
        store.create_pending(overdue).await.unwrap();

        let fresh = pending_approval(RequestId::new(), ApprovalType::PhenotypeSql);
        let fresh_id = fresh.approval_id;
        store.create_pending(fresh).await.unwrap();

        let swept = store.sweep_timeouts(now).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].approval_id, overdue_id);
        assert_eq!(swept[0].status, ApprovalStatus::TimedOut);

        // Idempotent: a second sweep finds nothing new.
        assert!(store.sweep_timeouts(now).await.unwrap().is_empty());
        let fresh = store.get(fresh_id).await.unwrap();
        assert_eq!(fresh.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn timeout_exactly_at_the_sla_deadline_times_out() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut approval = pending_approval(RequestId::new(), ApprovalType::Qa);
        approval.sla_deadline = now;
        store.create_pending(approval).await.unwrap();

        let swept = store.sweep_timeouts(now).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, ApprovalStatus::TimedOut);
    }
}
