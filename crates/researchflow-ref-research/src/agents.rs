//! Scripted reference agents.
//!
//! These stand-ins satisfy the agent contract with hardcoded, fictional
//! clinical data so the scenarios exercise the orchestration core — retry,
//! gates, loops, recovery — without any real LLM, warehouse, or calendar
//! behind them. Scenario modules define further variants where a scenario
//! needs bespoke behavior.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use researchflow_config::FlowConfig;
use researchflow_contracts::agent::{
    AgentInput, AgentOutcome, AgentOutput, AgentTask, InvocationKey,
};
use researchflow_contracts::audit::Severity;
use researchflow_contracts::state::{
    ConfidenceInterval, DeliveryRecord, ElementAvailability, ExtractionRecord, Feasibility,
    KickoffMeeting, PhiLevel, QaCheck, QaReport, QaStatus, Requirements, Researcher, TimeWindow,
};
use researchflow_core::traits::{Agent, AgentContext};
use researchflow_core::{AgentRegistry, Engine};
use researchflow_store::InMemoryStore;

/// The researcher used across all reference scenarios.
pub fn sample_researcher() -> Researcher {
    Researcher {
        name: "Dr. Amara Diallo".to_string(),
        email: "adiallo@uhn.example".to_string(),
        department: "Cardiology".to_string(),
        irb_number: "IRB-2026-0412".to_string(),
    }
}

fn sample_requirements(with_time_window: bool) -> Requirements {
    Requirements {
        study_title: "Heart failure readmissions under SGLT2 inhibitors".to_string(),
        inclusion_criteria: vec![
            "heart failure diagnosis (I50.*)".to_string(),
            "SGLT2 inhibitor prescription".to_string(),
        ],
        exclusion_criteria: vec!["age < 18 at index admission".to_string()],
        time_window: with_time_window.then(|| TimeWindow {
            start: chrono::NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            end: chrono::NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
        }),
        data_elements: vec![
            "demographics".to_string(),
            "medications".to_string(),
            "lab_results".to_string(),
            "admissions".to_string(),
        ],
        phi_level: PhiLevel::DeIdentified,
    }
}

// ── Requirements agent ────────────────────────────────────────────────────────

/// Extracts a structured cohort definition from the free-text request.
///
/// On a re-gather after rejection it folds the reviewer's feedback in: the
/// canned fix adds the time window the first pass "forgot".
pub struct StubRequirementsAgent {
    pub calls: AtomicU32,
}

impl StubRequirementsAgent {
    pub fn new() -> Self {
        Self { calls: AtomicU32::new(0) }
    }
}

impl Default for StubRequirementsAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for StubRequirementsAgent {
    async fn execute(&self, input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let AgentInput::GatherRequirements { rejection_reason, .. } = input else {
            unreachable!("adapter dispatches by task");
        };
        let revised = rejection_reason.is_some();
        AgentOutcome::Success(AgentOutput::Requirements {
            requirements: sample_requirements(revised),
            completeness_score: if revised { 0.97 } else { 0.92 },
            requirements_complete: true,
        })
    }
}

// ── Phenotype agent ───────────────────────────────────────────────────────────

/// Generates the cohort SQL and a feasibility verdict.
pub struct StubPhenotypeAgent {
    pub feasible: bool,
    pub estimated_cohort_size: u64,
    pub calls: AtomicU32,
}

impl StubPhenotypeAgent {
    pub fn feasible_cohort(estimated_cohort_size: u64) -> Self {
        Self { feasible: true, estimated_cohort_size, calls: AtomicU32::new(0) }
    }

    pub fn infeasible() -> Self {
        Self { feasible: false, estimated_cohort_size: 0, calls: AtomicU32::new(0) }
    }
}

#[async_trait]
impl Agent for StubPhenotypeAgent {
    async fn execute(&self, _input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut availability = std::collections::BTreeMap::new();
        availability.insert(
            "lab_results".to_string(),
            ElementAvailability { present_fraction: 0.98, completeness_fraction: 0.91 },
        );
        availability.insert(
            "medications".to_string(),
            ElementAvailability { present_fraction: 0.99, completeness_fraction: 0.97 },
        );
        AgentOutcome::Success(AgentOutput::Feasibility {
            phenotype_sql: "SELECT patient_id FROM condition_occurrence co \
                            JOIN drug_exposure de USING (patient_id) \
                            WHERE co.icd10 LIKE 'I50%' AND de.atc = 'A10BK'"
                .to_string(),
            feasibility: Feasibility {
                feasible: self.feasible,
                estimated_cohort_size: self.estimated_cohort_size,
                confidence_interval: ConfidenceInterval {
                    low: self.estimated_cohort_size.saturating_sub(30),
                    high: self.estimated_cohort_size + 35,
                },
                data_availability: availability,
            },
        })
    }
}

// ── Calendar agent ────────────────────────────────────────────────────────────

pub struct StubCalendarAgent;

#[async_trait]
impl Agent for StubCalendarAgent {
    async fn execute(&self, input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
        let AgentInput::ScheduleKickoff { researcher, study_title, .. } = input else {
            unreachable!("adapter dispatches by task");
        };
        AgentOutcome::Success(AgentOutput::Kickoff {
            kickoff_meeting: KickoffMeeting {
                scheduled_at: Utc::now() + chrono::Duration::days(3),
                attendees: vec![
                    researcher.email,
                    "data-broker@uhn.example".to_string(),
                    "informatics@uhn.example".to_string(),
                ],
                agenda: format!("Kickoff: {study_title}"),
            },
        })
    }
}

// ── Extraction agent ──────────────────────────────────────────────────────────

/// Runs the cohort extraction, deduplicating side effects by invocation key.
///
/// Re-invocation with a key it has already served returns the recorded
/// output without running again — the agent-side half of crash-safe
/// idempotency.
pub struct KeyedExtractionAgent {
    cache: Mutex<HashMap<InvocationKey, AgentOutput>>,
    /// Calls received, including deduplicated replays.
    pub invocations: AtomicU32,
    /// Extractions actually performed.
    pub executions: AtomicU32,
    pub rows_per_attempt: u64,
}

impl KeyedExtractionAgent {
    pub fn new(rows_per_attempt: u64) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            invocations: AtomicU32::new(0),
            executions: AtomicU32::new(0),
            rows_per_attempt,
        }
    }
}

#[async_trait]
impl Agent for KeyedExtractionAgent {
    async fn execute(&self, input: AgentInput, ctx: AgentContext) -> AgentOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.cache.lock().expect("extraction cache lock poisoned");
        if let Some(prior) = cache.get(&ctx.invocation_key) {
            return AgentOutcome::Success(prior.clone());
        }

        let AgentInput::Extract { phi_level, attempt_no, .. } = input else {
            unreachable!("adapter dispatches by task");
        };
        self.executions.fetch_add(1, Ordering::SeqCst);
        let output = AgentOutput::Extraction {
            extraction: ExtractionRecord {
                row_count: self.rows_per_attempt,
                phi_level_applied: phi_level,
                artifact_uri: format!(
                    "s3://research-extracts/{}/attempt-{attempt_no}.parquet",
                    ctx.request_id
                ),
                extracted_at: Utc::now(),
                attempt_no,
            },
        };
        cache.insert(ctx.invocation_key, output.clone());
        AgentOutcome::Success(output)
    }
}

// ── QA agent ──────────────────────────────────────────────────────────────────

/// Validates extract quality, popping one scripted verdict per call.
///
/// An exhausted script keeps returning `Passed`.
pub struct StubQaAgent {
    verdicts: Mutex<VecDeque<QaStatus>>,
    pub calls: AtomicU32,
}

impl StubQaAgent {
    pub fn passing() -> Self {
        Self::scripted(vec![])
    }

    pub fn scripted(verdicts: Vec<QaStatus>) -> Self {
        Self { verdicts: Mutex::new(verdicts.into()), calls: AtomicU32::new(0) }
    }
}

#[async_trait]
impl Agent for StubQaAgent {
    async fn execute(&self, input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let AgentInput::ValidateQuality { extraction, .. } = input else {
            unreachable!("adapter dispatches by task");
        };
        let verdict = self
            .verdicts
            .lock()
            .expect("qa verdict lock poisoned")
            .pop_front()
            .unwrap_or(QaStatus::Passed);

        let checks = match verdict {
            QaStatus::Passed => vec![
                QaCheck {
                    name: "row_count".to_string(),
                    passed: true,
                    severity: Severity::Info,
                    details: format!("{} rows extracted", extraction.row_count),
                },
                QaCheck {
                    name: "duplicates".to_string(),
                    passed: true,
                    severity: Severity::Info,
                    details: "no duplicate patient rows".to_string(),
                },
                QaCheck {
                    name: "phi_scan".to_string(),
                    passed: true,
                    severity: Severity::Info,
                    details: "no direct identifiers at de_identified level".to_string(),
                },
            ],
            QaStatus::Failed => vec![
                QaCheck {
                    name: "row_count".to_string(),
                    passed: true,
                    severity: Severity::Info,
                    details: format!("{} rows extracted", extraction.row_count),
                },
                QaCheck {
                    name: "duplicates".to_string(),
                    passed: false,
                    severity: Severity::Error,
                    details: "112 duplicate patient rows detected".to_string(),
                },
            ],
        };
        AgentOutcome::Success(AgentOutput::Qa {
            qa_report: QaReport { overall_status: verdict, checks },
        })
    }
}

// ── Delivery agent ────────────────────────────────────────────────────────────

pub struct StubDeliveryAgent;

#[async_trait]
impl Agent for StubDeliveryAgent {
    async fn execute(&self, input: AgentInput, _ctx: AgentContext) -> AgentOutcome {
        let AgentInput::Deliver { extraction, .. } = input else {
            unreachable!("adapter dispatches by task");
        };
        AgentOutcome::Success(AgentOutput::Delivery {
            delivery: DeliveryRecord {
                artifact_uri: extraction.artifact_uri,
                checksum: "sha256:4f0c6e3db5".to_string(),
                delivered_at: Utc::now(),
                notification_sent: true,
            },
        })
    }
}

// ── Wiring helpers ────────────────────────────────────────────────────────────

/// Registry with the happy-path stub for every task.
pub fn happy_registry() -> Arc<AgentRegistry> {
    Arc::new(
        AgentRegistry::new()
            .register(AgentTask::GatherRequirements, Arc::new(StubRequirementsAgent::new()))
            .register(
                AgentTask::ValidateFeasibility,
                Arc::new(StubPhenotypeAgent::feasible_cohort(187)),
            )
            .register(AgentTask::ScheduleKickoff, Arc::new(StubCalendarAgent))
            .register(AgentTask::Extract, Arc::new(KeyedExtractionAgent::new(187)))
            .register(AgentTask::ValidateQuality, Arc::new(StubQaAgent::passing()))
            .register(AgentTask::Deliver, Arc::new(StubDeliveryAgent)),
    )
}

/// An engine over a fresh in-memory store, returning both.
pub fn engine_with(
    registry: Arc<AgentRegistry>,
    config: FlowConfig,
) -> (Arc<Engine>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let engine =
        Engine::new(store.clone(), store.clone(), store.clone(), registry, config);
    (engine, store)
}
