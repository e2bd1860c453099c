//! Core trait definitions for the ResearchFlow engine.
//!
//! These four traits define the complete seam between the engine and the
//! outside world:
//!
//! - `Agent`         — external domain logic (may be backed by an LLM)
//! - `StateStore`    — durable workflow documents + audit streams
//! - `ApprovalStore` — durable approval records
//! - `LeaseKeeper`   — per-request exclusive claims with TTL expiry
//!
//! The engine wires them together. Agents are stateless with respect to
//! workflow state: they receive explicit input slices and return explicit
//! output records, and they never touch workflow storage directly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use researchflow_audit::AuditEnvelope;
use researchflow_contracts::agent::{AgentInput, AgentOutcome, InvocationKey};
use researchflow_contracts::approval::{
    Approval, ApprovalDecision, ApprovalId, ApprovalType, PendingFilter,
};
use researchflow_contracts::audit::AuditRecord;
use researchflow_contracts::error::FlowResult;
use researchflow_contracts::state::{RequestId, Version, WorkflowState};

/// Call context handed to every agent invocation attempt.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub request_id: RequestId,
    /// Deterministic key `(request_id, node, attempt_no)`; agents may use
    /// it to deduplicate side effects across crash re-invocations.
    pub invocation_key: InvocationKey,
    /// Absolute deadline for this attempt.
    pub deadline: DateTime<Utc>,
    /// Cooperative cancellation; the agent must return promptly with a
    /// `Cancelled` failure when this fires.
    pub cancel: CancellationToken,
}

/// An external agent performing one unit of domain work.
///
/// Implementations are untrusted by the engine: every result is classified
/// through `AgentOutcome` and an output whose shape does not match the
/// requested task is treated as a `Malformed` terminal failure by the
/// adapter.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Execute one task attempt.
    ///
    /// Must be pure with respect to workflow state: reads the input slice,
    /// produces an output record, and does nothing else observable to the
    /// engine. Honors `ctx.cancel` and `ctx.deadline` cooperatively.
    async fn execute(&self, input: AgentInput, ctx: AgentContext) -> AgentOutcome;
}

/// Durable storage for workflow documents and their audit streams.
///
/// A state write and the audit events produced since the last write are
/// persisted together or not at all; readers never observe partial updates.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Initial insert. Fails `AlreadyExists` on a duplicate request ID.
    async fn create(&self, state: &WorkflowState, events: Vec<AuditRecord>)
        -> FlowResult<Version>;

    /// Load the canonical latest state, or fail `NotFound`.
    ///
    /// The stored document is validated before deserialization; a document
    /// that no longer matches the state schema fails `SchemaDrift`.
    async fn load(&self, request_id: RequestId) -> FlowResult<(WorkflowState, Version)>;

    /// Conditional write. Fails `ConcurrencyConflict` when `expected` does
    /// not match the stored version, and `TerminalStateImmutable` when the
    /// stored state is terminal and the write is not an idempotent
    /// re-assertion of the same document.
    async fn save(
        &self,
        state: &WorkflowState,
        expected: Version,
        events: Vec<AuditRecord>,
    ) -> FlowResult<Version>;

    /// Requests whose state is non-terminal and whose lease is not
    /// currently held. Used by crash-recovery scans.
    async fn list_pending_resumable(&self) -> FlowResult<Vec<RequestId>>;

    /// The ordered, hash-chained audit stream for one request.
    async fn audit_stream(&self, request_id: RequestId) -> FlowResult<Vec<AuditEnvelope>>;

    /// Force a drifted document into `human_review` without interpreting
    /// it. Operates on the raw stored payload so a document the engine can
    /// no longer deserialize can still be escalated.
    async fn quarantine(&self, request_id: RequestId, reason: &str) -> FlowResult<()>;
}

/// Durable storage for approval records.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create_pending(&self, approval: Approval) -> FlowResult<()>;

    async fn get(&self, approval_id: ApprovalId) -> FlowResult<Approval>;

    /// Atomic `pending` → terminal transition. Fails `AlreadyDecided` when
    /// the approval has already left `pending`, `NotFound` when unknown.
    async fn decide(
        &self,
        approval_id: ApprovalId,
        decision: &ApprovalDecision,
        now: DateTime<Utc>,
    ) -> FlowResult<Approval>;

    async fn list_pending(&self, filter: &PendingFilter) -> FlowResult<Vec<Approval>>;

    /// The most recently submitted approval of one type for one request,
    /// regardless of status.
    async fn latest_for(
        &self,
        request_id: RequestId,
        approval_type: ApprovalType,
    ) -> FlowResult<Option<Approval>>;

    /// Transition every pending approval whose SLA deadline is at or before
    /// `now` to `timed_out`, returning the approvals that changed.
    /// Idempotent; safe to run from any sweeper process.
    async fn sweep_timeouts(&self, now: DateTime<Utc>) -> FlowResult<Vec<Approval>>;
}

/// A time-bounded exclusive claim on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub request_id: RequestId,
    pub owner: String,
    pub token: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Per-request lease keeping. At most one live lease exists per request;
/// expired leases are reclaimable by any worker.
#[async_trait]
pub trait LeaseKeeper: Send + Sync {
    /// Claim the request for `owner`, or return `None` when a live lease is
    /// already held by someone else. Expired leases are replaced.
    async fn try_acquire(
        &self,
        request_id: RequestId,
        owner: &str,
        ttl: Duration,
    ) -> FlowResult<Option<LeaseToken>>;

    /// Extend a held lease. Fails when the lease was lost (expired and
    /// re-acquired by another worker).
    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> FlowResult<LeaseToken>;

    /// Release a held lease. Releasing a lost lease is a no-op.
    async fn release(&self, token: LeaseToken) -> FlowResult<()>;
}
