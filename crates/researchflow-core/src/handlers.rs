//! Node handlers: the per-node logic the engine invokes between routing
//! decisions.
//!
//! Each handler is a function of the pre-state that mutates a working copy
//! and appends audit events; side effects occur only through the agent
//! adapter and the approval store. Handlers are crash-safe: re-invoking one
//! from the same persisted pre-state produces the same observable effect,
//! keyed by the deterministic invocation key.

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use researchflow_config::FlowConfig;
use researchflow_contracts::agent::{AgentFailure, AgentInput, AgentOutput, InvocationKey};
use researchflow_contracts::approval::{
    Approval, ApprovalDecision, ApprovalStatus, ApprovalType, Decision, PendingFilter,
};
use researchflow_contracts::audit::{Actor, AuditKind, AuditRecord, Severity};
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::{
    FlowState, GateOutcome, LoopSite, NodeError, Requirements, WorkflowState,
};

use crate::adapter::AgentAdapter;
use crate::traits::ApprovalStore;

/// What a handler run did with the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// State advanced; the engine persists and routes again.
    Advanced,
    /// The workflow is waiting on an external decision; the engine persists,
    /// releases the lease, and returns.
    Parked,
}

/// Shared dependencies handed to every handler invocation.
pub struct HandlerCx<'a> {
    pub adapter: &'a AgentAdapter,
    pub approvals: &'a dyn ApprovalStore,
    pub config: &'a FlowConfig,
    pub cancel: &'a CancellationToken,
}

/// Run the handler for `node` against a working copy of the state.
pub async fn run_node(
    node: FlowState,
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    match node {
        FlowState::RequirementsGathering => gather_requirements(state, events, cx).await,
        FlowState::FeasibilityValidation => validate_feasibility(state, events, cx).await,
        FlowState::ScheduleKickoff => schedule_kickoff(state, events, cx).await,
        FlowState::DataExtraction => extract_data(state, events, cx).await,
        FlowState::QaValidation => validate_quality(state, events, cx).await,
        FlowState::DataDelivery => deliver(state, events, cx).await,
        FlowState::RequirementsReview
        | FlowState::PhenotypeReview
        | FlowState::ExtractionApproval
        | FlowState::QaReview => run_gate(node, state, events, cx).await,
        other => Err(FlowError::Internal {
            reason: format!("'{other}' has no node handler"),
        }),
    }
}

// ── Node entry / exit ─────────────────────────────────────────────────────────

fn enter_node(state: &mut WorkflowState, events: &mut Vec<AuditRecord>, node: FlowState) {
    // Re-invocation of the same node (crash recovery, agent retry-via-loop)
    // does not produce a second entry event.
    if state.current_state != node {
        debug!(
            request_id = %state.request_id,
            from = %state.current_state,
            node = %node,
            "node entered"
        );
        state.current_state = node;
        events.push(AuditRecord::new(state.request_id, AuditKind::NodeEntered).node(node));
    }
}

fn exit_node(state: &WorkflowState, events: &mut Vec<AuditRecord>, node: FlowState) {
    debug!(request_id = %state.request_id, node = %node, "node exited");
    events.push(AuditRecord::new(state.request_id, AuditKind::NodeExited).node(node));
}

/// Record a terminal agent failure against the state.
///
/// Cancellation is folded into the cancellation sentinel instead of the
/// error slot, so routing converges on `human_review` without mistaking it
/// for a retryable node failure.
fn record_failure(
    state: &mut WorkflowState,
    node: FlowState,
    attempts: u32,
    failure: AgentFailure,
) {
    if failure.kind == researchflow_contracts::agent::FailureKind::Cancelled {
        info!(
            request_id = %state.request_id,
            node = %node,
            "invocation cancelled; raising cancellation sentinel"
        );
        state.cancel_requested = true;
        return;
    }
    warn!(
        request_id = %state.request_id,
        node = %node,
        kind = %failure.kind,
        attempts,
        detail = %failure.detail,
        "terminal agent failure recorded"
    );
    state.error = Some(NodeError {
        kind: failure.kind,
        message: failure.detail,
        failed_node: node,
        attempt_no: attempts,
    });
}

// ── Agent nodes ───────────────────────────────────────────────────────────────

async fn gather_requirements(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    let node = FlowState::RequirementsGathering;
    enter_node(state, events, node);

    let iteration = state.iteration_counters.increment(LoopSite::Requirements);
    // Loop-back transition: clear the review outcome, carrying its reason
    // into the agent's context.
    let rejection_reason = state
        .requirements_approved
        .take()
        .and_then(|o| o.rejection_reason().map(str::to_string));

    let input = AgentInput::GatherRequirements {
        initial_request: state.initial_request.clone(),
        researcher: state.researcher.clone(),
        prior: state.requirements.clone(),
        rejection_reason,
        iteration,
    };
    let key =
        InvocationKey { request_id: state.request_id, node, attempt_no: iteration };
    let report = cx.adapter.invoke(input, key, state.deadline, cx.cancel).await;
    events.extend(report.events);

    match report.outcome {
        Ok(AgentOutput::Requirements { requirements, completeness_score, requirements_complete }) => {
            state.requirements = Some(requirements);
            state.completeness_score = Some(completeness_score);
            state.requirements_complete = requirements_complete;
            state.error = None;
            exit_node(state, events, node);
        }
        Ok(_) => unreachable!("adapter rejects mismatched output variants"),
        Err(failure) => record_failure(state, node, report.attempts, failure),
    }
    Ok(StepOutcome::Advanced)
}

async fn validate_feasibility(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    let node = FlowState::FeasibilityValidation;
    enter_node(state, events, node);

    let attempt = state.iteration_counters.increment(LoopSite::Phenotype);
    // Loop-back transition: discard the prior SQL, verdict, and review.
    state.phenotype_approved = None;
    state.phenotype_sql = None;
    state.feasibility = None;

    let requirements = state.requirements.clone().ok_or_else(|| FlowError::Internal {
        reason: "feasibility_validation reached without requirements".to_string(),
    })?;

    let input = AgentInput::ValidateFeasibility { requirements };
    let key = InvocationKey { request_id: state.request_id, node, attempt_no: attempt };
    let report = cx.adapter.invoke(input, key, state.deadline, cx.cancel).await;
    events.extend(report.events);

    match report.outcome {
        Ok(AgentOutput::Feasibility { phenotype_sql, feasibility }) => {
            state.phenotype_sql = Some(phenotype_sql);
            state.feasibility = Some(feasibility);
            state.error = None;
            exit_node(state, events, node);
        }
        Ok(_) => unreachable!("adapter rejects mismatched output variants"),
        Err(failure) => record_failure(state, node, report.attempts, failure),
    }
    Ok(StepOutcome::Advanced)
}

async fn schedule_kickoff(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    let node = FlowState::ScheduleKickoff;
    enter_node(state, events, node);

    let requirements = state.requirements.clone().ok_or_else(|| FlowError::Internal {
        reason: "schedule_kickoff reached without requirements".to_string(),
    })?;
    let feasibility = state.feasibility.clone().ok_or_else(|| FlowError::Internal {
        reason: "schedule_kickoff reached without feasibility".to_string(),
    })?;

    let input = AgentInput::ScheduleKickoff {
        researcher: state.researcher.clone(),
        study_title: requirements.study_title,
        estimated_cohort_size: feasibility.estimated_cohort_size,
    };
    let key = InvocationKey { request_id: state.request_id, node, attempt_no: 1 };
    let report = cx.adapter.invoke(input, key, state.deadline, cx.cancel).await;
    events.extend(report.events);

    match report.outcome {
        Ok(AgentOutput::Kickoff { kickoff_meeting }) => {
            state.kickoff_meeting = Some(kickoff_meeting);
            state.error = None;
            exit_node(state, events, node);
        }
        Ok(_) => unreachable!("adapter rejects mismatched output variants"),
        Err(failure) => record_failure(state, node, report.attempts, failure),
    }
    Ok(StepOutcome::Advanced)
}

async fn extract_data(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    let node = FlowState::DataExtraction;
    enter_node(state, events, node);

    let attempt = state.iteration_counters.increment(LoopSite::QaReextract);
    // Loop-back transition after a QA rejection: the old extract and its
    // report are superseded.
    state.qa_approved = None;
    state.qa_report = None;
    state.extraction = None;

    let phenotype_sql = state.phenotype_sql.clone().ok_or_else(|| FlowError::Internal {
        reason: "data_extraction reached without phenotype SQL".to_string(),
    })?;
    let phi_level = state
        .requirements
        .as_ref()
        .map(|r| r.phi_level)
        .ok_or_else(|| FlowError::Internal {
            reason: "data_extraction reached without requirements".to_string(),
        })?;

    let input = AgentInput::Extract { phenotype_sql, phi_level, attempt_no: attempt };
    let key = InvocationKey { request_id: state.request_id, node, attempt_no: attempt };
    let report = cx.adapter.invoke(input, key, state.deadline, cx.cancel).await;
    events.extend(report.events);

    match report.outcome {
        Ok(AgentOutput::Extraction { extraction }) => {
            state.extraction = Some(extraction);
            state.error = None;
            exit_node(state, events, node);
        }
        Ok(_) => unreachable!("adapter rejects mismatched output variants"),
        Err(failure) => record_failure(state, node, report.attempts, failure),
    }
    Ok(StepOutcome::Advanced)
}

async fn validate_quality(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    let node = FlowState::QaValidation;
    enter_node(state, events, node);

    let extraction = state.extraction.clone().ok_or_else(|| FlowError::Internal {
        reason: "qa_validation reached without an extraction".to_string(),
    })?;
    let data_elements = state
        .requirements
        .as_ref()
        .map(|r| r.data_elements.clone())
        .unwrap_or_default();

    // QA runs once per extraction attempt; keying by the re-extraction
    // counter keeps crash re-invocations deduplicable.
    let attempt = state.iteration_counters.get(LoopSite::QaReextract).max(1);
    let input = AgentInput::ValidateQuality { extraction, data_elements };
    let key = InvocationKey { request_id: state.request_id, node, attempt_no: attempt };
    let report = cx.adapter.invoke(input, key, state.deadline, cx.cancel).await;
    events.extend(report.events);

    match report.outcome {
        Ok(AgentOutput::Qa { qa_report }) => {
            state.qa_report = Some(qa_report);
            state.error = None;
            exit_node(state, events, node);
        }
        Ok(_) => unreachable!("adapter rejects mismatched output variants"),
        Err(failure) => record_failure(state, node, report.attempts, failure),
    }
    Ok(StepOutcome::Advanced)
}

async fn deliver(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    let node = FlowState::DataDelivery;
    enter_node(state, events, node);

    let extraction = state.extraction.clone().ok_or_else(|| FlowError::Internal {
        reason: "data_delivery reached without an extraction".to_string(),
    })?;

    let input = AgentInput::Deliver { extraction, researcher: state.researcher.clone() };
    let key = InvocationKey { request_id: state.request_id, node, attempt_no: 1 };
    let report = cx.adapter.invoke(input, key, state.deadline, cx.cancel).await;
    events.extend(report.events);

    match report.outcome {
        Ok(AgentOutput::Delivery { delivery }) => {
            state.delivery = Some(delivery);
            state.error = None;
            exit_node(state, events, node);
        }
        Ok(_) => unreachable!("adapter rejects mismatched output variants"),
        Err(failure) => record_failure(state, node, report.attempts, failure),
    }
    Ok(StepOutcome::Advanced)
}

// ── Gate nodes ────────────────────────────────────────────────────────────────

fn gate_approval_type(gate: FlowState) -> ApprovalType {
    match gate {
        FlowState::RequirementsReview => ApprovalType::Requirements,
        FlowState::PhenotypeReview => ApprovalType::PhenotypeSql,
        FlowState::ExtractionApproval => ApprovalType::Extraction,
        FlowState::QaReview => ApprovalType::Qa,
        other => unreachable!("'{other}' is not a gate node"),
    }
}

/// Snapshot of the material under review, stored on the approval record.
fn gate_payload(gate: FlowState, state: &WorkflowState) -> serde_json::Value {
    match gate {
        FlowState::RequirementsReview => json!({
            "requirements": state.requirements,
            "completeness_score": state.completeness_score,
        }),
        FlowState::PhenotypeReview => json!({
            "phenotype_sql": state.phenotype_sql,
            "feasibility": state.feasibility,
        }),
        FlowState::ExtractionApproval => json!({
            "study_title": state.requirements.as_ref().map(|r| r.study_title.clone()),
            "phenotype_sql": state.phenotype_sql,
            "estimated_cohort_size":
                state.feasibility.as_ref().map(|f| f.estimated_cohort_size),
            "phi_level": state.requirements.as_ref().map(|r| r.phi_level),
        }),
        FlowState::QaReview => json!({
            "qa_report": state.qa_report,
            "extraction": state.extraction,
        }),
        other => unreachable!("'{other}' is not a gate node"),
    }
}

async fn run_gate(
    gate: FlowState,
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    cx: &HandlerCx<'_>,
) -> FlowResult<StepOutcome> {
    enter_node(state, events, gate);
    let approval_type = gate_approval_type(gate);

    if let Some(approval) = cx.approvals.latest_for(state.request_id, approval_type).await? {
        if approval.status == ApprovalStatus::Pending {
            return Ok(StepOutcome::Parked);
        }
        if !state.applied_approvals.contains(&approval.approval_id) {
            apply_decision(gate, &approval, state, events)?;
            exit_node(state, events, gate);
            return Ok(StepOutcome::Advanced);
        }
    }

    // Either no approval exists yet, or the latest one was already applied
    // and a loop-back brought the workflow here again: open a fresh one.
    let now = Utc::now();
    let approval = Approval::pending(
        state.request_id,
        approval_type,
        gate_payload(gate, state),
        now,
        now + cx.config.approval.default_sla(),
    );
    events.push(
        AuditRecord::new(state.request_id, AuditKind::ApprovalRequested)
            .node(gate)
            .payload(json!({
                "approval_id": approval.approval_id,
                "approval_type": approval_type,
                "sla_deadline": approval.sla_deadline,
            })),
    );
    cx.approvals.create_pending(approval).await?;
    Ok(StepOutcome::Parked)
}

/// Apply a decided approval to the gate's tri-state field.
fn apply_decision(
    gate: FlowState,
    approval: &Approval,
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
) -> FlowResult<()> {
    info!(
        request_id = %state.request_id,
        gate = %gate,
        approval_id = %approval.approval_id,
        status = ?approval.status,
        reviewer = approval.reviewer.as_deref().unwrap_or("system"),
        "applying approval decision"
    );
    let actor = approval
        .reviewer
        .clone()
        .map(Actor::Reviewer)
        .unwrap_or(Actor::System);
    events.push(
        AuditRecord::new(state.request_id, AuditKind::ApprovalDecided)
            .node(gate)
            .actor(actor)
            .payload(json!({
                "approval_id": approval.approval_id,
                "approval_type": approval.approval_type,
                "status": approval.status,
                "notes": approval.notes,
            })),
    );
    state.applied_approvals.push(approval.approval_id);

    let outcome = match approval.status {
        ApprovalStatus::Approved => GateOutcome::Approved,
        ApprovalStatus::Modified => {
            merge_modified_payload(gate, approval, state)?;
            GateOutcome::Approved
        }
        ApprovalStatus::Rejected => GateOutcome::Rejected {
            reason: approval
                .notes
                .clone()
                .unwrap_or_else(|| "rejected by reviewer".to_string()),
        },
        ApprovalStatus::TimedOut => {
            warn!(
                request_id = %state.request_id,
                gate = %gate,
                approval_id = %approval.approval_id,
                "timed-out approval routed as rejection"
            );
            events.push(
                AuditRecord::new(state.request_id, AuditKind::Escalated)
                    .node(gate)
                    .severity(Severity::Warning)
                    .payload(json!({
                        "approval_id": approval.approval_id,
                        "reason": "approval timed out past its SLA deadline",
                    })),
            );
            GateOutcome::Rejected {
                reason: "approval timed out past its SLA deadline".to_string(),
            }
        }
        ApprovalStatus::Pending => {
            return Err(FlowError::Internal {
                reason: "apply_decision called with a pending approval".to_string(),
            });
        }
    };

    match gate {
        FlowState::RequirementsReview => state.requirements_approved = Some(outcome),
        FlowState::PhenotypeReview => state.phenotype_approved = Some(outcome),
        FlowState::ExtractionApproval => state.extraction_approved = Some(outcome),
        FlowState::QaReview => state.qa_approved = Some(outcome),
        other => unreachable!("'{other}' is not a gate node"),
    }
    Ok(())
}

/// Merge a reviewer's modified payload into the fields the gate declares
/// modifiable. The gate service validated the payload at decision time, so
/// a parse failure here is an internal error.
fn merge_modified_payload(
    gate: FlowState,
    approval: &Approval,
    state: &mut WorkflowState,
) -> FlowResult<()> {
    let payload = approval.modified_payload.clone().ok_or_else(|| FlowError::Internal {
        reason: format!("approval '{}' is modified but carries no payload", approval.approval_id),
    })?;
    match gate {
        FlowState::RequirementsReview => {
            let revised: Requirements =
                serde_json::from_value(payload).map_err(|e| FlowError::Internal {
                    reason: format!("modified requirements payload no longer parses: {e}"),
                })?;
            state.requirements = Some(revised);
        }
        FlowState::PhenotypeReview => {
            let sql = payload
                .get("phenotype_sql")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FlowError::Internal {
                    reason: "modified phenotype payload lost its SQL text".to_string(),
                })?;
            state.phenotype_sql = Some(sql.to_string());
        }
        other => {
            return Err(FlowError::Internal {
                reason: format!("gate '{other}' declares no modifiable fields"),
            });
        }
    }
    Ok(())
}

// ── Scope change ──────────────────────────────────────────────────────────────

/// Resolve a pending scope change before normal routing.
///
/// While the scope-change approval is pending the workflow stays parked.
/// Approval (or modification) replaces the requirements, clears every
/// downstream product, and lets routing re-enter feasibility validation;
/// rejection and timeout resume the workflow where it was.
pub async fn resolve_scope_change(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    approvals: &dyn ApprovalStore,
) -> FlowResult<StepOutcome> {
    let Some(approval_id) = state.pending_scope_change else {
        return Ok(StepOutcome::Advanced);
    };

    let approval = match approvals.get(approval_id).await {
        Ok(approval) => approval,
        Err(FlowError::ApprovalNotFound { .. }) => {
            state.pending_scope_change = None;
            return Ok(StepOutcome::Advanced);
        }
        Err(e) => return Err(e),
    };

    if approval.status == ApprovalStatus::Pending {
        return Ok(StepOutcome::Parked);
    }

    let actor = approval
        .reviewer
        .clone()
        .map(Actor::Reviewer)
        .unwrap_or(Actor::System);
    events.push(
        AuditRecord::new(state.request_id, AuditKind::ApprovalDecided)
            .actor(actor)
            .payload(json!({
                "approval_id": approval.approval_id,
                "approval_type": ApprovalType::ScopeChange,
                "status": approval.status,
            })),
    );

    match approval.status {
        ApprovalStatus::Approved | ApprovalStatus::Modified => {
            let source = approval
                .modified_payload
                .clone()
                .unwrap_or_else(|| approval.payload.clone());
            let revised: Requirements =
                serde_json::from_value(source).map_err(|e| FlowError::Internal {
                    reason: format!("scope change payload no longer parses: {e}"),
                })?;
            info!(
                request_id = %state.request_id,
                approval_id = %approval.approval_id,
                "scope change applied; downstream products cleared"
            );
            state.requirements = Some(revised);
            state.requirements_complete = true;
            state.requirements_approved = Some(GateOutcome::Approved);
            state.clear_downstream_of_requirements();
            supersede_stale_reviews(state, events, approvals).await?;
        }
        ApprovalStatus::TimedOut => {
            warn!(
                request_id = %state.request_id,
                approval_id = %approval.approval_id,
                "scope change timed out; workflow resumes unchanged"
            );
            events.push(
                AuditRecord::new(state.request_id, AuditKind::Escalated)
                    .severity(Severity::Warning)
                    .payload(json!({
                        "approval_id": approval.approval_id,
                        "reason": "scope change timed out past its SLA deadline",
                    })),
            );
        }
        ApprovalStatus::Rejected => {
            debug!(
                request_id = %state.request_id,
                approval_id = %approval.approval_id,
                "scope change rejected; workflow resumes unchanged"
            );
        }
        ApprovalStatus::Pending => unreachable!("pending handled above"),
    }

    state.pending_scope_change = None;
    Ok(StepOutcome::Advanced)
}

/// An applied scope change invalidates whatever the open gates were
/// reviewing. Close their pending approvals as rejected-superseded and mark
/// them applied, so the gates open fresh approvals over the revised
/// material instead of re-applying stale decisions.
async fn supersede_stale_reviews(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    approvals: &dyn ApprovalStore,
) -> FlowResult<()> {
    let stale = approvals
        .list_pending(&PendingFilter {
            request_id: Some(state.request_id),
            ..Default::default()
        })
        .await?;
    for pending in stale {
        let decision = ApprovalDecision {
            decision: Decision::Reject,
            reviewer: "system".to_string(),
            notes: Some("superseded by scope change".to_string()),
            modified_payload: None,
        };
        let superseded =
            approvals.decide(pending.approval_id, &decision, Utc::now()).await?;
        info!(
            request_id = %state.request_id,
            approval_id = %superseded.approval_id,
            approval_type = %superseded.approval_type,
            "open review superseded by scope change"
        );
        state.applied_approvals.push(superseded.approval_id);
        events.push(
            AuditRecord::new(state.request_id, AuditKind::ApprovalDecided)
                .payload(json!({
                    "approval_id": superseded.approval_id,
                    "approval_type": superseded.approval_type,
                    "status": superseded.status,
                    "superseded": true,
                })),
        );
    }
    Ok(())
}

// ── Terminal nodes ────────────────────────────────────────────────────────────

/// Bring the workflow to rest at `terminal`.
pub fn enter_terminal(
    state: &mut WorkflowState,
    events: &mut Vec<AuditRecord>,
    terminal: FlowState,
) {
    enter_node(state, events, terminal);

    if state.escalation_reason.is_none() {
        state.escalation_reason = escalation_reason_for(state, terminal);
    }

    if terminal == FlowState::Complete {
        info!(request_id = %state.request_id, "workflow complete");
    } else {
        warn!(
            request_id = %state.request_id,
            terminal = %terminal,
            reason = state.escalation_reason.as_deref().unwrap_or(""),
            "workflow terminated"
        );
    }

    if terminal == FlowState::HumanReview {
        events.push(
            AuditRecord::new(state.request_id, AuditKind::Escalated)
                .node(terminal)
                .severity(Severity::Warning)
                .payload(json!({ "reason": state.escalation_reason })),
        );
    }

    let (kind, severity) = if terminal == FlowState::Complete {
        (AuditKind::Completed, Severity::Info)
    } else {
        (AuditKind::Terminated, Severity::Warning)
    };
    events.push(
        AuditRecord::new(state.request_id, kind)
            .node(terminal)
            .severity(severity)
            .payload(json!({ "escalation_reason": state.escalation_reason })),
    );
}

fn escalation_reason_for(state: &WorkflowState, terminal: FlowState) -> Option<String> {
    match terminal {
        FlowState::Complete => None,
        FlowState::NotFeasible => {
            Some("Cohort size too small or infeasible criteria".to_string())
        }
        FlowState::QaFailed => {
            Some("QA validation failed and the failure was confirmed by review".to_string())
        }
        FlowState::HumanReview => {
            if state.cancel_requested {
                Some("Workflow cancelled by administrator".to_string())
            } else if let Some(error) = &state.error {
                Some(format!(
                    "Node '{}' failed after {} attempt(s): {}",
                    error.failed_node, error.attempt_no, error.message
                ))
            } else if let Some(reason) = state
                .extraction_approved
                .as_ref()
                .and_then(GateOutcome::rejection_reason)
            {
                Some(format!("Extraction approval rejected: {reason}"))
            } else {
                Some("Iteration cap exceeded; manual review required".to_string())
            }
        }
        _ => None,
    }
}
