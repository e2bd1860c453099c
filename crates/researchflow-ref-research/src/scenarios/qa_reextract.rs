//! Scenario 4: QA failure, re-extraction, then completion.
//!
//! The first extract fails QA on duplicate rows; the QA review rejects,
//! which loops back to `data_extraction`. The second extract (attempt 2,
//! same SQL, fresh invocation key) passes QA, the review approves, and the
//! workflow completes.
//!
//! Expected: final `complete`, `iteration_counters.qa_reextract = 2`, and
//! the delivered extract carrying `attempt_no = 2`.

use std::sync::Arc;

use researchflow_config::FlowConfig;
use researchflow_contracts::agent::AgentTask;
use researchflow_contracts::approval::ApprovalDecision;
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::{FlowState, QaStatus};
use researchflow_core::traits::StateStore;
use researchflow_core::{AgentRegistry, RunOutcome};

use crate::agents::{
    engine_with, sample_researcher, KeyedExtractionAgent, StubCalendarAgent,
    StubDeliveryAgent, StubPhenotypeAgent, StubQaAgent, StubRequirementsAgent,
};
use crate::scenarios::{approve_current, print_report, report, sole_pending, ScenarioReport};

fn flaky_extract_registry(extraction: Arc<KeyedExtractionAgent>) -> Arc<AgentRegistry> {
    Arc::new(
        AgentRegistry::new()
            .register(AgentTask::GatherRequirements, Arc::new(StubRequirementsAgent::new()))
            .register(
                AgentTask::ValidateFeasibility,
                Arc::new(StubPhenotypeAgent::feasible_cohort(187)),
            )
            .register(AgentTask::ScheduleKickoff, Arc::new(StubCalendarAgent))
            .register(AgentTask::Extract, extraction)
            .register(
                AgentTask::ValidateQuality,
                Arc::new(StubQaAgent::scripted(vec![QaStatus::Failed, QaStatus::Passed])),
            )
            .register(AgentTask::Deliver, Arc::new(StubDeliveryAgent)),
    )
}

pub async fn run_scenario() -> FlowResult<ScenarioReport> {
    println!("=== Scenario 4: QA failure then re-extraction ===");
    println!();

    let extraction_agent = Arc::new(KeyedExtractionAgent::new(187));
    let (engine, store) =
        engine_with(flaky_extract_registry(extraction_agent.clone()), FlowConfig::default());
    let request_id = engine
        .submit(sample_researcher(), "Heart failure cohort; de-identified extract.")
        .await?;

    // Approve through to the QA review of the first (failing) extract.
    engine.run(request_id).await?;
    let mut outcome = approve_current(&engine, &store, request_id, "dr-osei").await?;
    while let RunOutcome::Parked { gate } = outcome {
        if gate == FlowState::QaReview {
            break;
        }
        outcome = approve_current(&engine, &store, request_id, "dr-osei").await?;
    }

    let (state, _) = store.load(request_id).await?;
    let first_status = state.qa_report.as_ref().map(|r| r.overall_status);
    println!("  first QA report: {first_status:?}; rejecting for re-extraction");
    if first_status != Some(QaStatus::Failed) {
        return Err(FlowError::Internal {
            reason: "first QA report should fail on duplicates".to_string(),
        });
    }

    let review = sole_pending(&store, request_id).await?;
    let outcome = engine
        .decide(
            review.approval_id,
            ApprovalDecision::reject("qa-lead", "duplicate patient rows"),
        )
        .await?;
    println!("  after rejection: {outcome:?}");

    // The re-extract passed QA; approve the second review.
    let outcome = approve_current(&engine, &store, request_id, "qa-lead").await?;
    println!("  after second QA approval: {outcome:?}");

    let report = report(&store, request_id).await?;
    print_report("QA re-extraction", &report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use researchflow_contracts::audit::AuditKind;

    use super::*;

    #[tokio::test]
    async fn qa_rejection_drives_a_second_extraction_attempt() {
        let report = run_scenario().await.unwrap();
        assert_eq!(report.final_state, FlowState::Complete);
        assert_eq!(report.counters.qa_reextract, 2);
        assert!(report.chain_valid);
        // requirements, phenotype, extraction, two QA reviews.
        assert_eq!(report.count(AuditKind::ApprovalDecided), 5);
    }

    #[tokio::test]
    async fn the_delivered_extract_is_the_second_attempt() {
        let extraction_agent = Arc::new(KeyedExtractionAgent::new(187));
        let (engine, store) =
            engine_with(flaky_extract_registry(extraction_agent.clone()), FlowConfig::default());
        let request_id =
            engine.submit(sample_researcher(), "hf cohort").await.unwrap();

        engine.run(request_id).await.unwrap();
        let mut outcome = approve_current(&engine, &store, request_id, "r").await.unwrap();
        while let RunOutcome::Parked { gate } = outcome {
            outcome = if gate == FlowState::QaReview {
                let (state, _) = store.load(request_id).await.unwrap();
                let failed = state
                    .qa_report
                    .as_ref()
                    .is_some_and(|r| r.overall_status == QaStatus::Failed);
                let review = sole_pending(&store, request_id).await.unwrap();
                if failed {
                    engine
                        .decide(
                            review.approval_id,
                            ApprovalDecision::reject("qa-lead", "duplicates"),
                        )
                        .await
                        .unwrap()
                } else {
                    approve_current(&engine, &store, request_id, "qa-lead").await.unwrap()
                }
            } else {
                approve_current(&engine, &store, request_id, "r").await.unwrap()
            };
        }

        let (state, _) = store.load(request_id).await.unwrap();
        let extraction = state.extraction.unwrap();
        assert_eq!(extraction.attempt_no, 2);
        assert_eq!(
            extraction_agent.executions.load(std::sync::atomic::Ordering::SeqCst),
            2,
            "two distinct invocation keys, two real extractions"
        );
        assert!(state.delivery.unwrap().artifact_uri.contains("attempt-2"));
    }
}
