//! The routing function: a pure map from workflow state to the next node.
//!
//! `route` is deterministic and depends only on state fields and the loop
//! caps. The graph is acyclic except for the explicit loop edges at the
//! four loop sites (requirements, phenotype, extraction-from-QA, scope
//! change); every loop edge is guarded by its site's configured cap, and a
//! routing that would exceed the cap escalates to `human_review` instead.

use researchflow_config::FlowConfig;
use researchflow_contracts::state::{FlowState, GateOutcome, LoopSite, QaStatus, WorkflowState};

/// Where the engine goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Invoke this agent node's handler.
    Node(FlowState),
    /// Invoke this gate node's handler; the handler parks the workflow
    /// while the gate's approval is unresolved.
    Gate(FlowState),
    /// The workflow has come (or already came) to rest here.
    Terminal(FlowState),
}

/// Compute the next node for `state`.
pub fn route(state: &WorkflowState, config: &FlowConfig) -> Route {
    // Administrative cancellation wins over everything else.
    if state.cancel_requested {
        return Route::Terminal(FlowState::HumanReview);
    }

    if state.current_state.is_terminal() {
        return Route::Terminal(state.current_state);
    }

    // A recorded terminal node failure routes to its loop predecessor when
    // one exists and the cap allows another run, otherwise to escalation.
    if let Some(error) = &state.error {
        return match error.failed_node.loop_site() {
            Some(site) => loop_guarded(state, config, site, Route::Node(error.failed_node)),
            None => Route::Terminal(FlowState::HumanReview),
        };
    }

    // ── Requirements phase ───────────────────────────────────────────────
    if state.requirements.is_none() || !state.requirements_complete {
        return loop_guarded(
            state,
            config,
            LoopSite::Requirements,
            Route::Node(FlowState::RequirementsGathering),
        );
    }
    match &state.requirements_approved {
        None => return Route::Gate(FlowState::RequirementsReview),
        Some(GateOutcome::Rejected { .. }) => {
            return loop_guarded(
                state,
                config,
                LoopSite::Requirements,
                Route::Node(FlowState::RequirementsGathering),
            );
        }
        Some(GateOutcome::Approved) => {}
    }

    // ── Phenotype phase ──────────────────────────────────────────────────
    let Some(feasibility) = &state.feasibility else {
        return loop_guarded(
            state,
            config,
            LoopSite::Phenotype,
            Route::Node(FlowState::FeasibilityValidation),
        );
    };
    if !feasibility.feasible {
        return Route::Terminal(FlowState::NotFeasible);
    }
    match &state.phenotype_approved {
        None => return Route::Gate(FlowState::PhenotypeReview),
        Some(GateOutcome::Rejected { .. }) => {
            return loop_guarded(
                state,
                config,
                LoopSite::Phenotype,
                Route::Node(FlowState::FeasibilityValidation),
            );
        }
        Some(GateOutcome::Approved) => {}
    }

    // ── Kickoff and extraction approval ──────────────────────────────────
    if state.kickoff_meeting.is_none() {
        return Route::Node(FlowState::ScheduleKickoff);
    }
    match &state.extraction_approved {
        None => return Route::Gate(FlowState::ExtractionApproval),
        // Extraction rejection is not a loop edge; it escalates.
        Some(GateOutcome::Rejected { .. }) => return Route::Terminal(FlowState::HumanReview),
        Some(GateOutcome::Approved) => {}
    }

    // ── Extraction, QA, delivery ─────────────────────────────────────────
    if state.extraction.is_none() {
        return loop_guarded(
            state,
            config,
            LoopSite::QaReextract,
            Route::Node(FlowState::DataExtraction),
        );
    }
    let Some(qa_report) = &state.qa_report else {
        return Route::Node(FlowState::QaValidation);
    };
    match &state.qa_approved {
        None => return Route::Gate(FlowState::QaReview),
        Some(GateOutcome::Rejected { .. }) => {
            return loop_guarded(
                state,
                config,
                LoopSite::QaReextract,
                Route::Node(FlowState::DataExtraction),
            );
        }
        Some(GateOutcome::Approved) => {
            // Approving a failing report confirms the failure.
            if qa_report.overall_status == QaStatus::Failed {
                return Route::Terminal(FlowState::QaFailed);
            }
        }
    }

    if state.delivery.is_none() {
        return Route::Node(FlowState::DataDelivery);
    }

    Route::Terminal(FlowState::Complete)
}

/// Guard a loop-site route: if the next run would exceed the configured
/// cap, escalate to `human_review` instead.
fn loop_guarded(
    state: &WorkflowState,
    config: &FlowConfig,
    site: LoopSite,
    route: Route,
) -> Route {
    let cap = config.max_iterations.for_site(site);
    if state.iteration_counters.get(site) + 1 > cap {
        return Route::Terminal(FlowState::HumanReview);
    }
    route
}
