//! Approval records and the decision contract consumed by review UIs.
//!
//! An approval is created by a gate node in `pending` status with a snapshot
//! of the material under review, and transitions exactly once to a terminal
//! status. Loop iterations create a new approval rather than reopening the
//! prior record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::RequestId;

/// Unique identifier of one approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub uuid::Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of material the reviewer is deciding on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Requirements,
    PhenotypeSql,
    Extraction,
    Qa,
    ScopeChange,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalType::Requirements => "requirements",
            ApprovalType::PhenotypeSql => "phenotype_sql",
            ApprovalType::Extraction => "extraction",
            ApprovalType::Qa => "qa",
            ApprovalType::ScopeChange => "scope_change",
        }
    }
}

impl fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an approval record.
///
/// `Pending` is the only non-terminal status. The transition out of
/// `Pending` happens exactly once; there is no reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    TimedOut,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// One human-approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: ApprovalId,
    pub request_id: RequestId,
    pub approval_type: ApprovalType,
    pub submitted_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decided_at: Option<DateTime<Utc>>,
    pub reviewer: Option<String>,
    pub notes: Option<String>,
    /// Snapshot of the material under review at gate entry.
    pub payload: serde_json::Value,
    /// Reviewer-edited payload, present only when `status = modified`.
    pub modified_payload: Option<serde_json::Value>,
    pub sla_deadline: DateTime<Utc>,
}

impl Approval {
    /// Create a fresh pending approval with a payload snapshot.
    pub fn pending(
        request_id: RequestId,
        approval_type: ApprovalType,
        payload: serde_json::Value,
        submitted_at: DateTime<Utc>,
        sla_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            approval_id: ApprovalId::new(),
            request_id,
            approval_type,
            submitted_at,
            status: ApprovalStatus::Pending,
            decided_at: None,
            reviewer: None,
            notes: None,
            payload,
            modified_payload: None,
            sla_deadline,
        }
    }
}

/// The decision kind a reviewer submits against a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Modify,
}

/// A reviewer's full decision submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub reviewer: String,
    pub notes: Option<String>,
    /// Required when `decision = Modify`; must touch only the fields the
    /// gate declares modifiable.
    pub modified_payload: Option<serde_json::Value>,
}

impl ApprovalDecision {
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            decision: Decision::Approve,
            reviewer: reviewer.into(),
            notes: None,
            modified_payload: None,
        }
    }

    pub fn reject(reviewer: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            decision: Decision::Reject,
            reviewer: reviewer.into(),
            notes: Some(notes.into()),
            modified_payload: None,
        }
    }

    pub fn modify(reviewer: impl Into<String>, modified_payload: serde_json::Value) -> Self {
        Self {
            decision: Decision::Modify,
            reviewer: reviewer.into(),
            notes: None,
            modified_payload: Some(modified_payload),
        }
    }
}

/// Filter for listing pending approvals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingFilter {
    pub approval_type: Option<ApprovalType>,
    pub request_id: Option<RequestId>,
    /// Only approvals whose SLA deadline falls at or before this instant.
    pub due_before: Option<DateTime<Utc>>,
}
