//! Scenario 5: an approval times out past its SLA deadline.
//!
//! The phenotype review is never decided. The sweeper runs past the SLA
//! deadline, transitions the approval `pending → timed_out`, and resumes
//! the workflow; the gate applies the timeout as a rejection. With the
//! phenotype iteration cap set to 1 the loop guard refuses a second
//! feasibility run and the workflow escalates to `human_review`.

use researchflow_config::FlowConfig;
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::FlowState;

use crate::agents::{engine_with, happy_registry, sample_researcher};
use crate::scenarios::{approve_current, print_report, report, sole_pending, ScenarioReport};

fn tight_phenotype_cap() -> FlowConfig {
    let mut config = FlowConfig::default();
    config.max_iterations.phenotype = 1;
    config
}

pub async fn run_scenario() -> FlowResult<ScenarioReport> {
    println!("=== Scenario 5: Approval timeout ===");
    println!();

    let (engine, store) = engine_with(happy_registry(), tight_phenotype_cap());
    let request_id = engine
        .submit(sample_researcher(), "Heart failure cohort awaiting review.")
        .await?;

    engine.run(request_id).await?;
    // Requirements go through; the phenotype review then sits undecided.
    approve_current(&engine, &store, request_id, "dr-osei").await?;

    let review = sole_pending(&store, request_id).await?;
    println!(
        "  phenotype review {} pending, SLA deadline {}",
        review.approval_id, review.sla_deadline
    );

    // The sweeper runs well past the deadline.
    let swept = engine.sweep_approvals(review.sla_deadline + chrono::Duration::hours(1)).await?;
    println!("  sweeper timed out {swept} approval(s)");
    if swept != 1 {
        return Err(FlowError::Internal {
            reason: format!("expected one timed-out approval, swept {swept}"),
        });
    }

    let report = report(&store, request_id).await?;
    print_report("Approval timeout", &report);

    match report.final_state {
        FlowState::HumanReview => Ok(report),
        other => Err(FlowError::Internal {
            reason: format!("expected human_review, finished at '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use researchflow_contracts::approval::{ApprovalStatus, ApprovalType};
    use researchflow_contracts::audit::AuditKind;
    use researchflow_core::traits::ApprovalStore;

    use super::*;

    #[tokio::test]
    async fn timeout_routes_as_rejection_and_escalates_at_cap() {
        let report = run_scenario().await.unwrap();

        assert_eq!(report.final_state, FlowState::HumanReview);
        // One escalation from the timed-out gate, one from the terminal.
        assert!(report.count(AuditKind::Escalated) >= 1);
        assert_eq!(report.count(AuditKind::Terminated), 1);
        assert!(report.chain_valid);
    }

    #[tokio::test]
    async fn the_swept_approval_is_marked_timed_out() {
        let (engine, store) = engine_with(happy_registry(), tight_phenotype_cap());
        let request_id =
            engine.submit(sample_researcher(), "hf cohort").await.unwrap();
        engine.run(request_id).await.unwrap();
        approve_current(&engine, &store, request_id, "r").await.unwrap();

        let review = sole_pending(&store, request_id).await.unwrap();
        assert_eq!(review.approval_type, ApprovalType::PhenotypeSql);

        engine
            .sweep_approvals(review.sla_deadline + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let after = store.get(review.approval_id).await.unwrap();
        assert_eq!(after.status, ApprovalStatus::TimedOut);
        assert!(after.decided_at.is_some());
    }

    #[tokio::test]
    async fn below_the_cap_a_timeout_loops_back_instead() {
        // Default caps allow a second feasibility pass, so the timeout
        // behaves exactly like a rejection: re-run, then a fresh review.
        let (engine, store) = engine_with(happy_registry(), FlowConfig::default());
        let request_id =
            engine.submit(sample_researcher(), "hf cohort").await.unwrap();
        engine.run(request_id).await.unwrap();
        approve_current(&engine, &store, request_id, "r").await.unwrap();

        let first_review = sole_pending(&store, request_id).await.unwrap();
        engine
            .sweep_approvals(first_review.sla_deadline + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let (state, _) = researchflow_core::traits::StateStore::load(
            store.as_ref(),
            request_id,
        )
        .await
        .unwrap();
        assert_eq!(state.current_state, FlowState::PhenotypeReview);
        assert_eq!(state.iteration_counters.phenotype, 2);

        let second_review = sole_pending(&store, request_id).await.unwrap();
        assert_ne!(second_review.approval_id, first_review.approval_id);
        assert_eq!(second_review.status, ApprovalStatus::Pending);
    }
}
