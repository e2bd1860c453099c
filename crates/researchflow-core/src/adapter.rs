//! The agent adapter: uniform invocation with retry, timeout, and
//! cancellation.
//!
//! Every automated node reaches its agent through `AgentAdapter::invoke`.
//! The adapter enforces a per-attempt timeout, retries retryable failures
//! with exponential backoff plus jitter up to the configured attempt cap,
//! elevates exhausted retryable failures to terminal, and returns promptly
//! on cancellation without retrying. Each attempt is audited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use researchflow_contracts::agent::{
    AgentFailure, AgentInput, AgentOutcome, AgentOutput, AgentTask, FailureKind, InvocationKey,
};
use researchflow_contracts::audit::{Actor, AuditKind, AuditRecord, Severity};

use researchflow_config::AgentConfig;

use crate::traits::{Agent, AgentContext};

/// Task-keyed registry of the agents the engine may invoke.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentTask, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the agent that owns `task`, replacing any prior binding.
    pub fn register(mut self, task: AgentTask, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(task, agent);
        self
    }

    pub fn get(&self, task: AgentTask) -> Option<Arc<dyn Agent>> {
        self.agents.get(&task).cloned()
    }
}

/// The outcome of one adapter invocation, with its audit trail.
#[derive(Debug)]
pub struct InvokeReport {
    /// The final classified result after retries.
    pub outcome: Result<AgentOutput, AgentFailure>,
    /// Attempts actually made (≥ 1 unless the agent is unregistered).
    pub attempts: u32,
    /// One `agent_attempt` per attempt plus the closing
    /// `agent_success`/`agent_failure`, in order.
    pub events: Vec<AuditRecord>,
}

/// Uniform invocation front for all automated agents.
pub struct AgentAdapter {
    registry: Arc<AgentRegistry>,
    config: AgentConfig,
}

impl AgentAdapter {
    pub fn new(registry: Arc<AgentRegistry>, config: AgentConfig) -> Self {
        Self { registry, config }
    }

    /// Invoke the agent owning `input`'s task.
    ///
    /// `workflow_deadline`, when set, bounds every attempt's timeout so the
    /// invocation cannot outlive the workflow's own deadline.
    pub async fn invoke(
        &self,
        input: AgentInput,
        key: InvocationKey,
        workflow_deadline: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> InvokeReport {
        let task = input.task();
        let mut events = Vec::new();

        let Some(agent) = self.registry.get(task) else {
            let failure = AgentFailure::new(
                FailureKind::PreconditionViolated,
                format!("no agent registered for task '{task}'"),
            );
            events.push(self.failure_event(key, task, &failure, 0, true));
            return InvokeReport { outcome: Err(failure), attempts: 0, events };
        };

        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            events.push(
                AuditRecord::new(key.request_id, AuditKind::AgentAttempt)
                    .node(key.node)
                    .actor(Actor::Agent(task.agent_id().to_string()))
                    .payload(json!({
                        "task": task.to_string(),
                        "invocation_key": key.to_string(),
                        "attempt": attempt,
                    })),
            );

            let timeout = self.attempt_timeout(workflow_deadline);
            let ctx = AgentContext {
                request_id: key.request_id,
                invocation_key: key,
                deadline: Utc::now()
                    + chrono::Duration::from_std(timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                cancel: cancel.child_token(),
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => AgentOutcome::Retryable(AgentFailure::new(
                    FailureKind::Cancelled,
                    "invocation cancelled",
                )),
                result = tokio::time::timeout(timeout, agent.execute(input.clone(), ctx)) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => AgentOutcome::Retryable(AgentFailure::new(
                            FailureKind::Timeout,
                            format!("attempt exceeded {}ms", timeout.as_millis()),
                        )),
                    }
                }
            };

            match outcome {
                AgentOutcome::Success(output) => {
                    if output.task() != task {
                        let failure = AgentFailure::new(
                            FailureKind::Malformed,
                            format!(
                                "agent returned output for task '{}' when '{}' was requested",
                                output.task(),
                                task
                            ),
                        );
                        events.push(self.failure_event(key, task, &failure, attempt, true));
                        return InvokeReport { outcome: Err(failure), attempts: attempt, events };
                    }

                    debug!(
                        request_id = %key.request_id,
                        task = %task,
                        attempt,
                        "agent invocation succeeded"
                    );
                    events.push(
                        AuditRecord::new(key.request_id, AuditKind::AgentSuccess)
                            .node(key.node)
                            .actor(Actor::Agent(task.agent_id().to_string()))
                            .payload(json!({
                                "task": task.to_string(),
                                "invocation_key": key.to_string(),
                                "attempt": attempt,
                            })),
                    );
                    return InvokeReport { outcome: Ok(output), attempts: attempt, events };
                }

                AgentOutcome::Retryable(failure) => {
                    // Cancellation is reported through the retryable variant
                    // but ends the invocation immediately.
                    if failure.kind == FailureKind::Cancelled || cancel.is_cancelled() {
                        let failure =
                            AgentFailure::new(FailureKind::Cancelled, failure.detail.clone());
                        events.push(self.failure_event(key, task, &failure, attempt, true));
                        return InvokeReport { outcome: Err(failure), attempts: attempt, events };
                    }

                    let exhausted = attempt == max_attempts;
                    events.push(self.failure_event(key, task, &failure, attempt, exhausted));

                    if exhausted {
                        warn!(
                            request_id = %key.request_id,
                            task = %task,
                            attempts = attempt,
                            kind = %failure.kind,
                            "retryable failure elevated to terminal after attempt cap"
                        );
                        return InvokeReport { outcome: Err(failure), attempts: attempt, events };
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        request_id = %key.request_id,
                        task = %task,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = %failure.kind,
                        "retrying agent invocation after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let failure = AgentFailure::new(
                                FailureKind::Cancelled,
                                "invocation cancelled during backoff",
                            );
                            events.push(self.failure_event(key, task, &failure, attempt, true));
                            return InvokeReport {
                                outcome: Err(failure),
                                attempts: attempt,
                                events,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                AgentOutcome::Terminal(failure) => {
                    events.push(self.failure_event(key, task, &failure, attempt, true));
                    return InvokeReport { outcome: Err(failure), attempts: attempt, events };
                }
            }
        }

        unreachable!("retry loop always returns within max_attempts iterations")
    }

    /// Per-attempt timeout: the configured default, bounded by the time
    /// remaining until the workflow deadline.
    fn attempt_timeout(&self, workflow_deadline: Option<DateTime<Utc>>) -> Duration {
        let default = self.config.default_timeout();
        match workflow_deadline {
            None => default,
            Some(deadline) => {
                let remaining = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(1));
                default.min(remaining.max(Duration::from_millis(1)))
            }
        }
    }

    /// Exponential backoff with uniform jitter: `base * 2^(attempt-1) + U(0, jitter)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry.backoff_base_ms;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = if self.config.retry.backoff_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.retry.backoff_jitter_ms)
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }

    fn failure_event(
        &self,
        key: InvocationKey,
        task: AgentTask,
        failure: &AgentFailure,
        attempt: u32,
        terminal: bool,
    ) -> AuditRecord {
        AuditRecord::new(key.request_id, AuditKind::AgentFailure)
            .node(key.node)
            .actor(Actor::Agent(task.agent_id().to_string()))
            .severity(if terminal { Severity::Error } else { Severity::Warning })
            .payload(json!({
                "task": task.to_string(),
                "invocation_key": key.to_string(),
                "attempt": attempt,
                "kind": failure.kind.as_str(),
                "detail": failure.detail,
                "terminal": terminal,
            }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use researchflow_contracts::state::{FlowState, RequestId};

    use super::*;

    /// Returns a queue of outcomes, one per attempt.
    struct SequencedAgent {
        outcomes: std::sync::Mutex<Vec<AgentOutcome>>,
        calls: AtomicU32,
    }

    impl SequencedAgent {
        fn new(outcomes: Vec<AgentOutcome>) -> Self {
            Self { outcomes: std::sync::Mutex::new(outcomes), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl Agent for SequencedAgent {
        async fn execute(&self, _input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                AgentOutcome::Terminal(AgentFailure::new(FailureKind::Internal, "exhausted"))
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn extraction_output() -> AgentOutput {
        AgentOutput::Extraction {
            extraction: researchflow_contracts::state::ExtractionRecord {
                row_count: 42,
                phi_level_applied: researchflow_contracts::state::PhiLevel::DeIdentified,
                artifact_uri: "s3://extracts/r1.parquet".to_string(),
                extracted_at: Utc::now(),
                attempt_no: 1,
            },
        }
    }

    fn extract_input() -> AgentInput {
        AgentInput::Extract {
            phenotype_sql: "SELECT patient_id FROM cohort".to_string(),
            phi_level: researchflow_contracts::state::PhiLevel::DeIdentified,
            attempt_no: 1,
        }
    }

    fn key() -> InvocationKey {
        InvocationKey {
            request_id: RequestId::new(),
            node: FlowState::DataExtraction,
            attempt_no: 1,
        }
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            retry: researchflow_config::RetryConfig {
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_jitter_ms: 0,
            },
            default_timeout_ms: 1_000,
        }
    }

    fn adapter_with(agent: Arc<dyn Agent>) -> AgentAdapter {
        let registry = Arc::new(AgentRegistry::new().register(AgentTask::Extract, agent));
        AgentAdapter::new(registry, fast_config())
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let agent = Arc::new(SequencedAgent::new(vec![AgentOutcome::Success(
            extraction_output(),
        )]));
        let adapter = adapter_with(agent.clone());

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        assert!(report.outcome.is_ok());
        assert_eq!(report.attempts, 1);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        // One attempt event, one success event.
        let kinds: Vec<AuditKind> = report.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::AgentAttempt, AuditKind::AgentSuccess]);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let agent = Arc::new(SequencedAgent::new(vec![
            AgentOutcome::Retryable(AgentFailure::new(FailureKind::RateLimited, "throttled")),
            AgentOutcome::Retryable(AgentFailure::new(FailureKind::UpstreamUnavailable, "503")),
            AgentOutcome::Success(extraction_output()),
        ]));
        let adapter = adapter_with(agent.clone());

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        assert!(report.outcome.is_ok());
        assert_eq!(report.attempts, 3);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retryable_at_last_attempt_is_elevated_to_terminal() {
        let agent = Arc::new(SequencedAgent::new(vec![
            AgentOutcome::Retryable(AgentFailure::new(FailureKind::Timeout, "slow")),
            AgentOutcome::Retryable(AgentFailure::new(FailureKind::Timeout, "slow")),
            AgentOutcome::Retryable(AgentFailure::new(FailureKind::Timeout, "slow")),
        ]));
        let adapter = adapter_with(agent.clone());

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        let failure = report.outcome.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(report.attempts, 3);
        // The final failure event is marked terminal with error severity.
        let last = report.events.last().unwrap();
        assert_eq!(last.kind, AuditKind::AgentFailure);
        assert_eq!(last.severity, Severity::Error);
        assert_eq!(last.payload["terminal"], true);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let agent = Arc::new(SequencedAgent::new(vec![AgentOutcome::Terminal(
            AgentFailure::new(FailureKind::PreconditionViolated, "no sql"),
        )]));
        let adapter = adapter_with(agent.clone());

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::PreconditionViolated);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_returns_promptly_without_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let agent = Arc::new(SequencedAgent::new(vec![AgentOutcome::Success(
            extraction_output(),
        )]));
        let adapter = adapter_with(agent.clone());

        let report = adapter.invoke(extract_input(), key(), None, &cancel).await;

        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::Cancelled);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatched_output_variant_is_malformed() {
        let agent = Arc::new(SequencedAgent::new(vec![AgentOutcome::Success(
            AgentOutput::Kickoff {
                kickoff_meeting: researchflow_contracts::state::KickoffMeeting {
                    scheduled_at: Utc::now(),
                    attendees: vec![],
                    agenda: String::new(),
                },
            },
        )]));
        let adapter = adapter_with(agent);

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::Malformed);
    }

    #[tokio::test]
    async fn unregistered_task_is_a_precondition_violation() {
        let adapter = AgentAdapter::new(Arc::new(AgentRegistry::new()), fast_config());

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.unwrap_err().kind, FailureKind::PreconditionViolated);
        assert_eq!(report.attempts, 0);
    }

    #[tokio::test]
    async fn slow_agent_times_out_and_retries() {
        struct SlowThenFast {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Agent for SlowThenFast {
            async fn execute(&self, _input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                AgentOutcome::Success(extraction_output())
            }
        }

        let agent = Arc::new(SlowThenFast { calls: AtomicU32::new(0) });
        let registry = Arc::new(AgentRegistry::new().register(AgentTask::Extract, agent.clone()));
        let config = AgentConfig {
            retry: researchflow_config::RetryConfig {
                max_attempts: 2,
                backoff_base_ms: 1,
                backoff_jitter_ms: 0,
            },
            default_timeout_ms: 20,
        };
        let adapter = AgentAdapter::new(registry, config);

        let report = adapter
            .invoke(extract_input(), key(), None, &CancellationToken::new())
            .await;

        assert!(report.outcome.is_ok());
        assert_eq!(report.attempts, 2);
        // The first attempt's failure event carries the timeout kind.
        let timeout_events: Vec<_> = report
            .events
            .iter()
            .filter(|e| e.kind == AuditKind::AgentFailure)
            .collect();
        assert_eq!(timeout_events.len(), 1);
        assert_eq!(timeout_events[0].payload["kind"], "timeout");
    }
}
