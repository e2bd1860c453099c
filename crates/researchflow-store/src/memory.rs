//! In-memory reference implementation of the persistence contracts.
//!
//! `InMemoryStore` implements `StateStore`, `ApprovalStore`, and
//! `LeaseKeeper` in one process-local store. Workflow documents are kept as
//! raw JSON and validated on load (schema-on-read); a state write and the
//! audit events produced with it are appended under one lock so readers
//! never observe a document without its events.
//!
//! This is the reference implementation the scenarios and tests run
//! against; a relational implementation satisfies the same contracts with
//! `workflow_state`, `approvals`, and `audit` tables.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use researchflow_audit::{AuditEnvelope, InMemoryAuditChains};
use researchflow_contracts::approval::{
    Approval, ApprovalDecision, ApprovalId, ApprovalStatus, ApprovalType, Decision,
    PendingFilter,
};
use researchflow_contracts::audit::{AuditKind, AuditRecord, Severity};
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::{RequestId, Version, WorkflowState};
use researchflow_core::traits::{ApprovalStore, LeaseKeeper, LeaseToken, StateStore};

use crate::schema::validate_document;

/// One stored workflow document: raw JSON plus its version.
struct StoredDocument {
    value: Value,
    version: Version,
}

/// One stored approval with its insertion order for `latest_for`.
struct StoredApproval {
    approval: Approval,
    seq: u64,
}

struct LeaseRecord {
    owner: String,
    token: uuid::Uuid,
    expires_at: DateTime<Utc>,
}

/// Process-local store backing the engine's persistence traits.
#[derive(Default)]
pub struct InMemoryStore {
    documents: Mutex<HashMap<RequestId, StoredDocument>>,
    approvals: Mutex<HashMap<ApprovalId, StoredApproval>>,
    approval_seq: Mutex<u64>,
    leases: Mutex<HashMap<RequestId, LeaseRecord>>,
    audit: InMemoryAuditChains,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify the audit hash chain for one request.
    pub fn verify_audit_chain(&self, request_id: RequestId) -> bool {
        self.audit.verify(request_id)
    }

    /// Replace a stored document with arbitrary raw JSON, bypassing
    /// validation. Exists so drift tests can simulate an older or corrupted
    /// writer; not part of the persistence contract.
    #[doc(hidden)]
    pub fn put_raw_document(&self, request_id: RequestId, value: Value, version: Version) {
        let mut documents = self.documents.lock().expect("document lock poisoned");
        documents.insert(request_id, StoredDocument { value, version });
    }

    fn terminal_in(value: &Value) -> bool {
        value
            .get("current_state")
            .and_then(Value::as_str)
            .map(|s| {
                matches!(s, "complete" | "not_feasible" | "qa_failed" | "human_review")
            })
            .unwrap_or(false)
    }

    fn serialize(state: &WorkflowState) -> FlowResult<Value> {
        serde_json::to_value(state).map_err(|e| FlowError::Internal {
            reason: format!("workflow state failed to serialize: {e}"),
        })
    }

    fn persisted_event(state_value: &Value, request_id: RequestId, version: Version) -> AuditRecord {
        AuditRecord::new(request_id, AuditKind::StatePersisted).payload(json!({
            "version": version.0,
            "current_state": state_value.get("current_state"),
        }))
    }
}

// ── StateStore ────────────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for InMemoryStore {
    async fn create(
        &self,
        state: &WorkflowState,
        events: Vec<AuditRecord>,
    ) -> FlowResult<Version> {
        let value = Self::serialize(state)?;
        let mut documents = self.documents.lock().expect("document lock poisoned");
        if documents.contains_key(&state.request_id) {
            return Err(FlowError::AlreadyExists { request_id: state.request_id });
        }
        let version = Version::INITIAL;
        self.audit.append_all(events);
        self.audit.append(Self::persisted_event(&value, state.request_id, version));
        documents.insert(state.request_id, StoredDocument { value, version });
        debug!(request_id = %state.request_id, "workflow document created");
        Ok(version)
    }

    async fn load(&self, request_id: RequestId) -> FlowResult<(WorkflowState, Version)> {
        let documents = self.documents.lock().expect("document lock poisoned");
        let stored = documents
            .get(&request_id)
            .ok_or(FlowError::RequestNotFound { request_id })?;

        validate_document(&stored.value)
            .map_err(|reason| FlowError::SchemaDrift { request_id, reason })?;
        let state: WorkflowState =
            serde_json::from_value(stored.value.clone()).map_err(|e| FlowError::SchemaDrift {
                request_id,
                reason: format!("document no longer deserializes: {e}"),
            })?;
        Ok((state, stored.version))
    }

    async fn save(
        &self,
        state: &WorkflowState,
        expected: Version,
        events: Vec<AuditRecord>,
    ) -> FlowResult<Version> {
        let value = Self::serialize(state)?;
        let mut documents = self.documents.lock().expect("document lock poisoned");
        let stored = documents
            .get_mut(&state.request_id)
            .ok_or(FlowError::RequestNotFound { request_id: state.request_id })?;

        if stored.version != expected {
            return Err(FlowError::ConcurrencyConflict {
                request_id: state.request_id,
                expected,
                found: stored.version,
            });
        }

        if Self::terminal_in(&stored.value) {
            // Idempotent re-assertion of the identical terminal document is
            // permitted for crash recovery; anything else is refused.
            if stored.value == value {
                return Ok(stored.version);
            }
            return Err(FlowError::TerminalStateImmutable { request_id: state.request_id });
        }

        let version = stored.version.next();
        self.audit.append_all(events);
        self.audit.append(Self::persisted_event(&value, state.request_id, version));
        stored.value = value;
        stored.version = version;
        Ok(version)
    }

    async fn list_pending_resumable(&self) -> FlowResult<Vec<RequestId>> {
        let now = Utc::now();
        let leases = self.leases.lock().expect("lease lock poisoned");
        let documents = self.documents.lock().expect("document lock poisoned");
        let mut resumable: Vec<RequestId> = documents
            .iter()
            .filter(|(request_id, stored)| {
                let leased = leases
                    .get(request_id)
                    .is_some_and(|lease| lease.expires_at > now);
                !leased && !Self::terminal_in(&stored.value)
            })
            .map(|(request_id, _)| *request_id)
            .collect();
        resumable.sort_by_key(|id| id.0);
        Ok(resumable)
    }

    async fn audit_stream(&self, request_id: RequestId) -> FlowResult<Vec<AuditEnvelope>> {
        Ok(self.audit.stream(request_id))
    }

    async fn quarantine(&self, request_id: RequestId, reason: &str) -> FlowResult<()> {
        let mut documents = self.documents.lock().expect("document lock poisoned");
        let stored = documents
            .get_mut(&request_id)
            .ok_or(FlowError::RequestNotFound { request_id })?;

        warn!(request_id = %request_id, reason = %reason, "quarantining drifted document");
        stored.value["current_state"] = json!("human_review");
        stored.value["escalation_reason"] = json!(reason);
        stored.version = stored.version.next();
        self.audit.append(
            AuditRecord::new(request_id, AuditKind::Escalated)
                .severity(Severity::Error)
                .payload(json!({ "reason": reason, "quarantined": true })),
        );
        self.audit
            .append(Self::persisted_event(&stored.value, request_id, stored.version));
        Ok(())
    }
}

// ── ApprovalStore ─────────────────────────────────────────────────────────────

#[async_trait]
impl ApprovalStore for InMemoryStore {
    async fn create_pending(&self, approval: Approval) -> FlowResult<()> {
        let mut approvals = self.approvals.lock().expect("approval lock poisoned");
        let mut seq = self.approval_seq.lock().expect("approval seq lock poisoned");
        *seq += 1;
        debug!(
            approval_id = %approval.approval_id,
            request_id = %approval.request_id,
            approval_type = %approval.approval_type,
            "approval opened"
        );
        approvals.insert(approval.approval_id, StoredApproval { approval, seq: *seq });
        Ok(())
    }

    async fn get(&self, approval_id: ApprovalId) -> FlowResult<Approval> {
        let approvals = self.approvals.lock().expect("approval lock poisoned");
        approvals
            .get(&approval_id)
            .map(|s| s.approval.clone())
            .ok_or(FlowError::ApprovalNotFound { approval_id })
    }

    async fn decide(
        &self,
        approval_id: ApprovalId,
        decision: &ApprovalDecision,
        now: DateTime<Utc>,
    ) -> FlowResult<Approval> {
        let mut approvals = self.approvals.lock().expect("approval lock poisoned");
        let stored = approvals
            .get_mut(&approval_id)
            .ok_or(FlowError::ApprovalNotFound { approval_id })?;

        if stored.approval.status.is_terminal() {
            return Err(FlowError::AlreadyDecided { approval_id });
        }

        stored.approval.status = match decision.decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
            Decision::Modify => ApprovalStatus::Modified,
        };
        stored.approval.decided_at = Some(now);
        stored.approval.reviewer = Some(decision.reviewer.clone());
        stored.approval.notes = decision.notes.clone();
        if decision.decision == Decision::Modify {
            stored.approval.modified_payload = decision.modified_payload.clone();
        }
        Ok(stored.approval.clone())
    }

    async fn list_pending(&self, filter: &PendingFilter) -> FlowResult<Vec<Approval>> {
        let approvals = self.approvals.lock().expect("approval lock poisoned");
        let mut pending: Vec<&StoredApproval> = approvals
            .values()
            .filter(|s| s.approval.status == ApprovalStatus::Pending)
            .filter(|s| {
                filter
                    .approval_type
                    .map(|t| s.approval.approval_type == t)
                    .unwrap_or(true)
            })
            .filter(|s| {
                filter.request_id.map(|r| s.approval.request_id == r).unwrap_or(true)
            })
            .filter(|s| {
                filter
                    .due_before
                    .map(|due| s.approval.sla_deadline <= due)
                    .unwrap_or(true)
            })
            .collect();
        pending.sort_by_key(|s| s.seq);
        Ok(pending.into_iter().map(|s| s.approval.clone()).collect())
    }

    async fn latest_for(
        &self,
        request_id: RequestId,
        approval_type: ApprovalType,
    ) -> FlowResult<Option<Approval>> {
        let approvals = self.approvals.lock().expect("approval lock poisoned");
        Ok(approvals
            .values()
            .filter(|s| {
                s.approval.request_id == request_id
                    && s.approval.approval_type == approval_type
            })
            .max_by_key(|s| s.seq)
            .map(|s| s.approval.clone()))
    }

    async fn sweep_timeouts(&self, now: DateTime<Utc>) -> FlowResult<Vec<Approval>> {
        let mut approvals = self.approvals.lock().expect("approval lock poisoned");
        let mut timed_out = Vec::new();
        for stored in approvals.values_mut() {
            if stored.approval.status == ApprovalStatus::Pending
                && stored.approval.sla_deadline <= now
            {
                stored.approval.status = ApprovalStatus::TimedOut;
                stored.approval.decided_at = Some(now);
                timed_out.push(stored.approval.clone());
            }
        }
        timed_out.sort_by_key(|a| a.submitted_at);
        Ok(timed_out)
    }
}

// ── LeaseKeeper ───────────────────────────────────────────────────────────────

#[async_trait]
impl LeaseKeeper for InMemoryStore {
    async fn try_acquire(
        &self,
        request_id: RequestId,
        owner: &str,
        ttl: Duration,
    ) -> FlowResult<Option<LeaseToken>> {
        let now = Utc::now();
        let mut leases = self.leases.lock().expect("lease lock poisoned");
        if let Some(existing) = leases.get(&request_id) {
            if existing.expires_at > now {
                return Ok(None);
            }
            // Expired: the previous holder crashed or stalled; reclaim.
            warn!(
                request_id = %request_id,
                previous_owner = %existing.owner,
                "reclaiming expired lease"
            );
        }
        let token = uuid::Uuid::new_v4();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        leases.insert(
            request_id,
            LeaseRecord { owner: owner.to_string(), token, expires_at },
        );
        Ok(Some(LeaseToken { request_id, owner: owner.to_string(), token, expires_at }))
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> FlowResult<LeaseToken> {
        let now = Utc::now();
        let mut leases = self.leases.lock().expect("lease lock poisoned");
        let record = leases.get_mut(&token.request_id).ok_or_else(|| FlowError::Internal {
            reason: format!("lease for '{}' was lost", token.request_id),
        })?;
        if record.token != token.token {
            return Err(FlowError::Internal {
                reason: format!(
                    "lease for '{}' was re-acquired by '{}'",
                    token.request_id, record.owner
                ),
            });
        }
        record.expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Ok(LeaseToken { expires_at: record.expires_at, ..token.clone() })
    }

    async fn release(&self, token: LeaseToken) -> FlowResult<()> {
        let mut leases = self.leases.lock().expect("lease lock poisoned");
        if leases.get(&token.request_id).is_some_and(|r| r.token == token.token) {
            leases.remove(&token.request_id);
        }
        Ok(())
    }
}
