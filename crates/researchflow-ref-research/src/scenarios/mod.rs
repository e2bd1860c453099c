//! Reference research-request scenarios.
//!
//! Each scenario is a self-contained module that wires real ResearchFlow
//! components (engine, in-memory store, scripted agents) and drives one
//! documented lifecycle to its resting state: the happy path, the
//! requirements rejection loop, an infeasible cohort, QA failure with
//! re-extraction, an approval timeout, and crash recovery mid-extraction.
//!
//! Every `run_scenario()` returns a `ScenarioReport` the demo prints and
//! the integration tests assert on.

pub mod approval_timeout;
pub mod crash_recovery;
pub mod happy_path;
pub mod not_feasible;
pub mod qa_reextract;
pub mod requirements_loop;

use std::sync::Arc;

use researchflow_contracts::approval::{Approval, ApprovalDecision, PendingFilter};
use researchflow_contracts::audit::AuditKind;
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::{FlowState, IterationCounters, RequestId};
use researchflow_core::traits::{ApprovalStore, StateStore};
use researchflow_core::{Engine, RunOutcome};
use researchflow_store::InMemoryStore;

/// What a scenario left behind, for printing and assertions.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub request_id: RequestId,
    pub final_state: FlowState,
    pub counters: IterationCounters,
    pub escalation_reason: Option<String>,
    pub audit_kinds: Vec<AuditKind>,
    pub chain_valid: bool,
}

impl ScenarioReport {
    /// Number of audit events of one kind.
    pub fn count(&self, kind: AuditKind) -> usize {
        self.audit_kinds.iter().filter(|k| **k == kind).count()
    }

    /// State transitions recorded: creation plus every node entry.
    pub fn transitions(&self) -> usize {
        self.count(AuditKind::Created) + self.count(AuditKind::NodeEntered)
    }
}

/// Collect the report for one request from the store.
pub async fn report(store: &InMemoryStore, request_id: RequestId) -> FlowResult<ScenarioReport> {
    let (state, _) = store.load(request_id).await?;
    let stream = store.audit_stream(request_id).await?;
    Ok(ScenarioReport {
        request_id,
        final_state: state.current_state,
        counters: state.iteration_counters,
        escalation_reason: state.escalation_reason,
        audit_kinds: stream.iter().map(|e| e.record.kind).collect(),
        chain_valid: store.verify_audit_chain(request_id),
    })
}

/// The single pending approval for one request.
pub async fn sole_pending(store: &InMemoryStore, request_id: RequestId) -> FlowResult<Approval> {
    let pending = store
        .list_pending(&PendingFilter { request_id: Some(request_id), ..Default::default() })
        .await?;
    match pending.as_slice() {
        [one] => Ok(one.clone()),
        other => Err(FlowError::Internal {
            reason: format!(
                "expected exactly one pending approval for '{request_id}', found {}",
                other.len()
            ),
        }),
    }
}

/// Approve whatever the workflow is currently parked on and resume it.
pub async fn approve_current(
    engine: &Arc<Engine>,
    store: &InMemoryStore,
    request_id: RequestId,
    reviewer: &str,
) -> FlowResult<RunOutcome> {
    let approval = sole_pending(store, request_id).await?;
    engine.decide(approval.approval_id, ApprovalDecision::approve(reviewer)).await
}


pub(crate) fn print_report(title: &str, report: &ScenarioReport) {
    println!("  ── {title} ──");
    println!("  Request:          {}", report.request_id);
    println!("  Final state:      {}", report.final_state);
    println!(
        "  Counters:         requirements={} phenotype={} qa_reextract={}",
        report.counters.requirements, report.counters.phenotype, report.counters.qa_reextract
    );
    if let Some(reason) = &report.escalation_reason {
        println!("  Escalation:       {reason}");
    }
    println!(
        "  Transitions:      {} | approvals decided: {}",
        report.transitions(),
        report.count(AuditKind::ApprovalDecided)
    );
    println!(
        "  Audit chain:      {} ({} event(s))",
        if report.chain_valid { "VERIFIED" } else { "FAILED" },
        report.audit_kinds.len()
    );
    println!();
}
