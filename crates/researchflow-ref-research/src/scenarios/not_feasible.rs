//! Scenario 3: the cohort is not feasible.
//!
//! After requirements approval the phenotype agent reports
//! `{feasible: false, estimated_cohort_size: 0}`. Routing skips the
//! phenotype review gate entirely and rests the workflow at the
//! `not_feasible` terminal with its canonical escalation reason.

use std::sync::Arc;

use researchflow_config::FlowConfig;
use researchflow_contracts::agent::AgentTask;
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::FlowState;
use researchflow_core::{AgentRegistry, RunOutcome};

use crate::agents::{
    engine_with, sample_researcher, KeyedExtractionAgent, StubCalendarAgent,
    StubDeliveryAgent, StubPhenotypeAgent, StubQaAgent, StubRequirementsAgent,
};
use crate::scenarios::{approve_current, print_report, report, ScenarioReport};

fn infeasible_registry() -> Arc<AgentRegistry> {
    Arc::new(
        AgentRegistry::new()
            .register(AgentTask::GatherRequirements, Arc::new(StubRequirementsAgent::new()))
            .register(AgentTask::ValidateFeasibility, Arc::new(StubPhenotypeAgent::infeasible()))
            .register(AgentTask::ScheduleKickoff, Arc::new(StubCalendarAgent))
            .register(AgentTask::Extract, Arc::new(KeyedExtractionAgent::new(0)))
            .register(AgentTask::ValidateQuality, Arc::new(StubQaAgent::passing()))
            .register(AgentTask::Deliver, Arc::new(StubDeliveryAgent)),
    )
}

pub async fn run_scenario() -> FlowResult<ScenarioReport> {
    println!("=== Scenario 3: Not feasible ===");
    println!();

    let (engine, store) = engine_with(infeasible_registry(), FlowConfig::default());
    let request_id = engine
        .submit(
            sample_researcher(),
            "Patients with an ultra-rare metabolic condition and full genomic panels.",
        )
        .await?;

    engine.run(request_id).await?;
    // The only approval this workflow ever needs is the requirements one.
    let outcome = approve_current(&engine, &store, request_id, "dr-osei").await?;
    println!("  after requirements approval: {outcome:?}");

    let report = report(&store, request_id).await?;
    print_report("Not feasible", &report);

    match report.final_state {
        FlowState::NotFeasible => Ok(report),
        other => Err(FlowError::Internal {
            reason: format!("expected not_feasible, finished at '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use researchflow_contracts::approval::{ApprovalType, PendingFilter};
    use researchflow_contracts::audit::AuditKind;
    use researchflow_core::traits::ApprovalStore;

    use super::*;

    #[tokio::test]
    async fn infeasible_phenotype_terminates_with_reason() {
        let report = run_scenario().await.unwrap();

        assert_eq!(report.final_state, FlowState::NotFeasible);
        assert_eq!(
            report.escalation_reason.as_deref(),
            Some("Cohort size too small or infeasible criteria")
        );
        assert_eq!(report.count(AuditKind::Terminated), 1);
        assert_eq!(report.count(AuditKind::Completed), 0);
        // Only the requirements approval was ever decided.
        assert_eq!(report.count(AuditKind::ApprovalDecided), 1);
        assert!(report.chain_valid);
    }

    #[tokio::test]
    async fn phenotype_review_is_never_opened() {
        let (engine, store) = engine_with(infeasible_registry(), FlowConfig::default());
        let request_id =
            engine.submit(sample_researcher(), "ultra-rare cohort").await.unwrap();
        engine.run(request_id).await.unwrap();
        let outcome = approve_current(&engine, &store, request_id, "dr-osei").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(FlowState::NotFeasible));

        let sql_reviews = store
            .list_pending(&PendingFilter {
                approval_type: Some(ApprovalType::PhenotypeSql),
                request_id: Some(request_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(sql_reviews.is_empty(), "routing must skip the phenotype review gate");
    }
}
