//! Scenario 2: requirements rejected, revised, then approved.
//!
//! The first requirements review is rejected with "missing time period".
//! Gathering re-runs with the rejection reason in its context, produces a
//! revised definition carrying the time window, and the second review
//! approves. The workflow then completes normally.
//!
//! Expected: 14 transitions, `iteration_counters.requirements = 2`, two
//! requirements approvals created and both decided.

use researchflow_config::FlowConfig;
use researchflow_contracts::approval::ApprovalDecision;
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::FlowState;
use researchflow_core::traits::StateStore;
use researchflow_core::RunOutcome;

use crate::agents::{engine_with, happy_registry, sample_researcher};
use crate::scenarios::{approve_current, print_report, report, sole_pending, ScenarioReport};

pub async fn run_scenario() -> FlowResult<ScenarioReport> {
    println!("=== Scenario 2: Requirements rejection then approval ===");
    println!();

    let (engine, store) = engine_with(happy_registry(), FlowConfig::default());
    let request_id = engine
        .submit(
            sample_researcher(),
            "Heart failure cohort on SGLT2 inhibitors; demographics, meds, labs.",
        )
        .await?;

    // First pass parks at requirements review; the reviewer rejects.
    let outcome = engine.run(request_id).await?;
    if outcome != (RunOutcome::Parked { gate: FlowState::RequirementsReview }) {
        return Err(FlowError::Internal {
            reason: format!("expected park at requirements_review, got {outcome:?}"),
        });
    }
    let first = sole_pending(&store, request_id).await?;
    println!("  rejecting first requirements draft: missing time period");
    let outcome = engine
        .decide(
            first.approval_id,
            ApprovalDecision::reject("dr-osei", "missing time period"),
        )
        .await?;

    // Gathering re-ran and the revised draft is back under review.
    if outcome != (RunOutcome::Parked { gate: FlowState::RequirementsReview }) {
        return Err(FlowError::Internal {
            reason: format!("expected second requirements review, got {outcome:?}"),
        });
    }
    let (state, _) = store.load(request_id).await?;
    let window = state.requirements.as_ref().and_then(|r| r.time_window);
    println!(
        "  revised draft carries time window: {}",
        window.map(|w| format!("{} .. {}", w.start, w.end)).unwrap_or_default()
    );

    // Approve everything from here to completion.
    let mut outcome = approve_current(&engine, &store, request_id, "dr-osei").await?;
    while let RunOutcome::Parked { .. } = outcome {
        outcome = approve_current(&engine, &store, request_id, "dr-osei").await?;
    }

    let report = report(&store, request_id).await?;
    print_report("Requirements loop", &report);
    Ok(report)
}
