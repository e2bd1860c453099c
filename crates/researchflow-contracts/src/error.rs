//! The unified error type for the ResearchFlow core.
//!
//! Every failure the core surfaces carries a structured kind and the
//! identifier it concerns — no opaque strings. Agent-side failures use the
//! separate `AgentFailure` taxonomy; the engine converts those into state
//! routing, never into unwinding, so `FlowError` is reserved for the
//! persistence, approval, configuration, and contract surfaces.

use thiserror::Error;

use crate::approval::ApprovalId;
use crate::state::{LoopSite, RequestId, Version};

/// The unified error type for the ResearchFlow core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// No workflow exists with the given request ID.
    #[error("workflow '{request_id}' not found")]
    RequestNotFound { request_id: RequestId },

    /// No approval exists with the given approval ID.
    #[error("approval '{approval_id}' not found")]
    ApprovalNotFound { approval_id: ApprovalId },

    /// A workflow with this request ID already exists.
    #[error("workflow '{request_id}' already exists")]
    AlreadyExists { request_id: RequestId },

    /// The approval has already left `pending`; decisions apply exactly once.
    #[error("approval '{approval_id}' is no longer pending")]
    AlreadyDecided { approval_id: ApprovalId },

    /// A conditional write observed a stale version.
    ///
    /// Always handled internally by re-reading and re-computing; never
    /// surfaced to users.
    #[error(
        "stale write for workflow '{request_id}': expected version {expected}, found {found}"
    )]
    ConcurrencyConflict { request_id: RequestId, expected: Version, found: Version },

    /// A loop counter reached its configured cap; the workflow is escalated.
    #[error("iteration cap {cap} exceeded at loop site '{site}' for workflow '{request_id}'")]
    IterationCapExceeded { request_id: RequestId, site: LoopSite, cap: u32 },

    /// A write was attempted against a terminal workflow state.
    #[error("workflow '{request_id}' is terminal; no further writes are permitted")]
    TerminalStateImmutable { request_id: RequestId },

    /// A reviewer's `modify` decision touched fields the gate does not
    /// declare modifiable, or carried no payload at all.
    #[error("invalid modification on approval '{approval_id}': {reason}")]
    InvalidModification { approval_id: ApprovalId, reason: String },

    /// The persisted document does not match the state schema; the engine
    /// refuses to run it and escalates instead.
    #[error("schema drift in persisted state for workflow '{request_id}': {reason}")]
    SchemaDrift { request_id: RequestId, reason: String },

    /// The workflow was cancelled administratively.
    #[error("workflow '{request_id}' was cancelled")]
    Cancelled { request_id: RequestId },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// The persistence layer is unreachable or failing; the engine retries
    /// with backoff and then abandons, leaving the workflow claimable.
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// Unclassified internal error; logged at high severity.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

/// Convenience alias used throughout the ResearchFlow crates.
pub type FlowResult<T> = Result<T, FlowError>;
