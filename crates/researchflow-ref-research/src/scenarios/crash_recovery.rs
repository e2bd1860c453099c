//! Scenario 6: a worker crashes mid-extraction and another recovers.
//!
//! Worker A acquires the lease, starts the extraction agent, and dies
//! before persisting anything. Its lease lapses. Worker B finds the
//! request via `list_pending_resumable`, re-acquires the lease, and
//! re-invokes extraction with the same invocation key; the agent
//! deduplicates on the key and returns the already-produced extract.
//!
//! Expected: exactly one real extraction, two agent invocations, and a
//! workflow that still reaches `complete`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use researchflow_config::FlowConfig;
use researchflow_contracts::agent::{AgentInput, AgentTask, InvocationKey};
use researchflow_contracts::approval::ApprovalDecision;
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::FlowState;
use researchflow_core::traits::{Agent, AgentContext, LeaseKeeper, StateStore};
use researchflow_core::{AgentRegistry, RunOutcome};

use crate::agents::{
    engine_with, sample_researcher, KeyedExtractionAgent, StubCalendarAgent,
    StubDeliveryAgent, StubPhenotypeAgent, StubQaAgent, StubRequirementsAgent,
};
use crate::scenarios::{approve_current, print_report, report, sole_pending, ScenarioReport};

fn registry_with(extraction: Arc<KeyedExtractionAgent>) -> Arc<AgentRegistry> {
    Arc::new(
        AgentRegistry::new()
            .register(AgentTask::GatherRequirements, Arc::new(StubRequirementsAgent::new()))
            .register(
                AgentTask::ValidateFeasibility,
                Arc::new(StubPhenotypeAgent::feasible_cohort(187)),
            )
            .register(AgentTask::ScheduleKickoff, Arc::new(StubCalendarAgent))
            .register(AgentTask::Extract, extraction)
            .register(AgentTask::ValidateQuality, Arc::new(StubQaAgent::passing()))
            .register(AgentTask::Deliver, Arc::new(StubDeliveryAgent)),
    )
}

pub async fn run_scenario() -> FlowResult<ScenarioReport> {
    println!("=== Scenario 6: Crash during extraction ===");
    println!();

    let extraction_agent = Arc::new(KeyedExtractionAgent::new(187));
    let (engine, store) =
        engine_with(registry_with(extraction_agent.clone()), FlowConfig::default());
    let request_id = engine
        .submit(sample_researcher(), "Heart failure cohort; crash-recovery drill.")
        .await?;

    // Drive to the extraction approval gate.
    engine.run(request_id).await?;
    approve_current(&engine, &store, request_id, "dr-osei").await?;
    approve_current(&engine, &store, request_id, "dr-osei").await?;

    // The data broker approves extraction, but no engine pass resumes yet.
    let approval = sole_pending(&store, request_id).await?;
    engine
        .gate_service()
        .decide(approval.approval_id, ApprovalDecision::approve("data-broker"))
        .await?;

    // Worker A claims the request and starts extracting, then crashes
    // before persisting anything. A zero TTL stands in for a lease that
    // has already lapsed by the time anyone looks.
    let stale_lease = store
        .try_acquire(request_id, "worker-a", Duration::ZERO)
        .await?
        .ok_or_else(|| FlowError::Internal { reason: "lease unexpectedly held".to_string() })?;
    let (state, _) = store.load(request_id).await?;
    let key = InvocationKey {
        request_id,
        node: FlowState::DataExtraction,
        attempt_no: 1,
    };
    let input = AgentInput::Extract {
        phenotype_sql: state.phenotype_sql.clone().unwrap_or_default(),
        phi_level: state
            .requirements
            .as_ref()
            .map(|r| r.phi_level)
            .unwrap_or(researchflow_contracts::state::PhiLevel::DeIdentified),
        attempt_no: 1,
    };
    let ctx = AgentContext {
        request_id,
        invocation_key: key,
        deadline: Utc::now() + chrono::Duration::seconds(30),
        cancel: CancellationToken::new(),
    };
    let _ = extraction_agent.execute(input, ctx).await;
    println!("  worker-a extracted once, crashed before persisting (lease {})", stale_lease.token);

    // Worker B's crash-recovery scan picks the request back up.
    let recovered = engine.recover().await?;
    println!("  recovery pass touched {} workflow(s)", recovered.len());
    let Some((_, RunOutcome::Parked { gate: FlowState::QaReview })) =
        recovered.iter().find(|(id, _)| *id == request_id)
    else {
        return Err(FlowError::Internal {
            reason: "recovery should park the request at qa_review".to_string(),
        });
    };

    approve_current(&engine, &store, request_id, "qa-lead").await?;

    let report = report(&store, request_id).await?;
    print_report("Crash recovery", &report);

    println!(
        "  extraction agent: {} invocation(s), {} real execution(s)",
        extraction_agent.invocations.load(Ordering::SeqCst),
        extraction_agent.executions.load(Ordering::SeqCst),
    );

    match report.final_state {
        FlowState::Complete => Ok(report),
        other => Err(FlowError::Internal {
            reason: format!("expected complete, finished at '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recovery_reuses_the_invocation_key_and_extracts_once() {
        let extraction_agent = Arc::new(KeyedExtractionAgent::new(187));
        let (engine, store) =
            engine_with(registry_with(extraction_agent.clone()), FlowConfig::default());
        let request_id =
            engine.submit(sample_researcher(), "crash drill").await.unwrap();

        engine.run(request_id).await.unwrap();
        approve_current(&engine, &store, request_id, "r").await.unwrap();
        approve_current(&engine, &store, request_id, "r").await.unwrap();
        let approval = sole_pending(&store, request_id).await.unwrap();
        engine
            .gate_service()
            .decide(approval.approval_id, ApprovalDecision::approve("broker"))
            .await
            .unwrap();

        // Crashed worker: expired lease plus one un-persisted agent call.
        store
            .try_acquire(request_id, "worker-a", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let (state, _) = store.load(request_id).await.unwrap();
        let ctx = AgentContext {
            request_id,
            invocation_key: InvocationKey {
                request_id,
                node: FlowState::DataExtraction,
                attempt_no: 1,
            },
            deadline: Utc::now() + chrono::Duration::seconds(30),
            cancel: CancellationToken::new(),
        };
        let input = AgentInput::Extract {
            phenotype_sql: state.phenotype_sql.clone().unwrap(),
            phi_level: state.requirements.as_ref().unwrap().phi_level,
            attempt_no: 1,
        };
        extraction_agent.execute(input, ctx).await;

        engine.recover().await.unwrap();
        approve_current(&engine, &store, request_id, "qa-lead").await.unwrap();

        let (state, _) = store.load(request_id).await.unwrap();
        assert_eq!(state.current_state, FlowState::Complete);
        let extraction = state.extraction.unwrap();
        assert_eq!(extraction.attempt_no, 1);

        assert_eq!(extraction_agent.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(
            extraction_agent.executions.load(Ordering::SeqCst),
            1,
            "the invocation key deduplicates the replayed extraction"
        );
    }

    #[tokio::test]
    async fn scenario_runs_clean() {
        let report = run_scenario().await.unwrap();
        assert_eq!(report.final_state, FlowState::Complete);
        assert!(report.chain_valid);
    }
}
