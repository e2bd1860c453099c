//! The approval gate service: the decision surface consumed by review UIs
//! and the timeout sweeper.
//!
//! Gate *nodes* (in `handlers`) create pending approvals and apply decided
//! ones; this service owns the other half of the contract — validating and
//! recording reviewer decisions, listing pending approvals, and timing out
//! approvals past their SLA deadline. Decisions transition an approval
//! exactly once; a `modify` decision is accepted only when its payload
//! stays within the fields the gate declares modifiable.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use researchflow_contracts::approval::{
    Approval, ApprovalDecision, ApprovalId, ApprovalType, Decision, PendingFilter,
};
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::Requirements;

use crate::traits::ApprovalStore;

/// The fields a reviewer may touch when modifying a requirements payload.
const REQUIREMENTS_FIELDS: [&str; 6] = [
    "study_title",
    "inclusion_criteria",
    "exclusion_criteria",
    "time_window",
    "data_elements",
    "phi_level",
];

/// Decision surface over pending approvals.
pub struct ApprovalGateService {
    approvals: Arc<dyn ApprovalStore>,
}

impl ApprovalGateService {
    pub fn new(approvals: Arc<dyn ApprovalStore>) -> Self {
        Self { approvals }
    }

    /// Pending approvals matching `filter`, read-only.
    pub async fn list_pending(&self, filter: &PendingFilter) -> FlowResult<Vec<Approval>> {
        self.approvals.list_pending(filter).await
    }

    /// Record a reviewer decision against a pending approval.
    ///
    /// Fails `ApprovalNotFound` for unknown IDs, `AlreadyDecided` when the
    /// approval has left `pending`, and `InvalidModification` when a
    /// `modify` decision's payload strays outside the gate's modifiable
    /// fields. The transition itself is atomic in the approval store.
    pub async fn decide(
        &self,
        approval_id: ApprovalId,
        decision: ApprovalDecision,
    ) -> FlowResult<Approval> {
        let approval = self.approvals.get(approval_id).await?;
        if approval.status.is_terminal() {
            return Err(FlowError::AlreadyDecided { approval_id });
        }
        validate_modification(&approval, &decision)?;

        let decided = self.approvals.decide(approval_id, &decision, Utc::now()).await?;
        info!(
            approval_id = %approval_id,
            request_id = %decided.request_id,
            approval_type = %decided.approval_type,
            status = ?decided.status,
            reviewer = %decision.reviewer,
            "approval decided"
        );
        Ok(decided)
    }

    /// Transition pending approvals past their SLA deadline to `timed_out`.
    ///
    /// Idempotent; may be run by any sweeper process. Returns the approvals
    /// that changed so the caller can resume their workflows.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> FlowResult<Vec<Approval>> {
        let timed_out = self.approvals.sweep_timeouts(now).await?;
        for approval in &timed_out {
            warn!(
                approval_id = %approval.approval_id,
                request_id = %approval.request_id,
                approval_type = %approval.approval_type,
                sla_deadline = %approval.sla_deadline,
                "pending approval timed out past SLA deadline"
            );
        }
        Ok(timed_out)
    }
}

/// Check a `modify` decision against the gate's modifiable fields.
fn validate_modification(approval: &Approval, decision: &ApprovalDecision) -> FlowResult<()> {
    if decision.decision != Decision::Modify {
        return Ok(());
    }
    let approval_id = approval.approval_id;
    let payload = decision.modified_payload.as_ref().ok_or_else(|| {
        FlowError::InvalidModification {
            approval_id,
            reason: "modify decision carries no modified payload".to_string(),
        }
    })?;

    match approval.approval_type {
        ApprovalType::Requirements | ApprovalType::ScopeChange => {
            let object = payload.as_object().ok_or_else(|| FlowError::InvalidModification {
                approval_id,
                reason: "modified payload must be a requirements object".to_string(),
            })?;
            let allowed: BTreeSet<&str> = REQUIREMENTS_FIELDS.into_iter().collect();
            if let Some(extra) = object.keys().find(|k| !allowed.contains(k.as_str())) {
                return Err(FlowError::InvalidModification {
                    approval_id,
                    reason: format!("field '{extra}' is not modifiable at this gate"),
                });
            }
            serde_json::from_value::<Requirements>(payload.clone()).map_err(|e| {
                FlowError::InvalidModification {
                    approval_id,
                    reason: format!("modified payload is not a valid requirements record: {e}"),
                }
            })?;
        }
        ApprovalType::PhenotypeSql => {
            let object = payload.as_object().ok_or_else(|| FlowError::InvalidModification {
                approval_id,
                reason: "modified payload must be an object".to_string(),
            })?;
            if let Some(extra) = object.keys().find(|k| k.as_str() != "phenotype_sql") {
                return Err(FlowError::InvalidModification {
                    approval_id,
                    reason: format!("field '{extra}' is not modifiable at this gate"),
                });
            }
            if !object.get("phenotype_sql").is_some_and(|v| v.is_string()) {
                return Err(FlowError::InvalidModification {
                    approval_id,
                    reason: "phenotype_sql must be a string".to_string(),
                });
            }
        }
        ApprovalType::Extraction | ApprovalType::Qa => {
            return Err(FlowError::InvalidModification {
                approval_id,
                reason: format!(
                    "gate '{}' declares no modifiable fields",
                    approval.approval_type
                ),
            });
        }
    }
    Ok(())
}
