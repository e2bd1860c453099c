//! The agent invocation contract.
//!
//! Agents are external modules that perform one unit of domain work. They
//! are stateless with respect to workflow state: inputs are explicit slices
//! of the state document, outputs are explicit records the owning node
//! writes back. Agents never touch workflow storage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::{
    DeliveryRecord, ExtractionRecord, Feasibility, FlowState, KickoffMeeting, PhiLevel,
    QaReport, RequestId, Requirements, Researcher,
};

/// The six agent tasks the core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTask {
    GatherRequirements,
    ValidateFeasibility,
    ScheduleKickoff,
    Extract,
    ValidateQuality,
    Deliver,
}

impl AgentTask {
    /// The agent that owns this task.
    pub fn agent_id(&self) -> &'static str {
        match self {
            AgentTask::GatherRequirements => "requirements_agent",
            AgentTask::ValidateFeasibility => "phenotype_agent",
            AgentTask::ScheduleKickoff => "calendar_agent",
            AgentTask::Extract => "extraction_agent",
            AgentTask::ValidateQuality => "qa_agent",
            AgentTask::Deliver => "delivery_agent",
        }
    }

    /// The task name within the agent.
    pub fn task_name(&self) -> &'static str {
        match self {
            AgentTask::GatherRequirements => "gather",
            AgentTask::ValidateFeasibility => "validate_feasibility",
            AgentTask::ScheduleKickoff => "schedule_kickoff",
            AgentTask::Extract => "extract",
            AgentTask::ValidateQuality => "validate",
            AgentTask::Deliver => "deliver",
        }
    }
}

impl fmt::Display for AgentTask {
    /// `agent_id.task_name`, e.g. `requirements_agent.gather`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.agent_id(), self.task_name())
    }
}

/// Deterministic identifier for one agent invocation attempt.
///
/// Adapters and agents may use it to deduplicate side effects: re-invoking
/// with the same key after a crash must produce the same observable effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationKey {
    pub request_id: RequestId,
    pub node: FlowState,
    pub attempt_no: u32,
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.request_id, self.node, self.attempt_no)
    }
}

/// The closed failure taxonomy agents report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimited,
    UpstreamUnavailable,
    Malformed,
    PreconditionViolated,
    Invalid,
    Internal,
    Cancelled,
}

impl FailureKind {
    /// True for the transient kinds the adapter may retry.
    ///
    /// `Cancelled` is reported through the retryable variant but is never
    /// actually retried — the adapter returns promptly on cancellation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::RateLimited | FailureKind::UpstreamUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::UpstreamUnavailable => "upstream_unavailable",
            FailureKind::Malformed => "malformed",
            FailureKind::PreconditionViolated => "precondition_violated",
            FailureKind::Invalid => "invalid",
            FailureKind::Internal => "internal",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent failure with its kind and human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl AgentFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// The tagged result of one agent execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Success(AgentOutput),
    /// The adapter may retry per policy; elevated to terminal after the cap.
    Retryable(AgentFailure),
    /// The adapter must not retry; the handler decides routing.
    Terminal(AgentFailure),
}

/// The input slice a node handler builds from the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "task")]
pub enum AgentInput {
    GatherRequirements {
        initial_request: String,
        researcher: Researcher,
        /// Accumulated context from earlier gathering turns, if any.
        prior: Option<Requirements>,
        /// The reviewer's rejection reason when re-gathering after a
        /// requirements rejection.
        rejection_reason: Option<String>,
        iteration: u32,
    },
    ValidateFeasibility {
        requirements: Requirements,
    },
    ScheduleKickoff {
        researcher: Researcher,
        study_title: String,
        estimated_cohort_size: u64,
    },
    Extract {
        phenotype_sql: String,
        phi_level: PhiLevel,
        attempt_no: u32,
    },
    ValidateQuality {
        extraction: ExtractionRecord,
        data_elements: Vec<String>,
    },
    Deliver {
        extraction: ExtractionRecord,
        researcher: Researcher,
    },
}

impl AgentInput {
    pub fn task(&self) -> AgentTask {
        match self {
            AgentInput::GatherRequirements { .. } => AgentTask::GatherRequirements,
            AgentInput::ValidateFeasibility { .. } => AgentTask::ValidateFeasibility,
            AgentInput::ScheduleKickoff { .. } => AgentTask::ScheduleKickoff,
            AgentInput::Extract { .. } => AgentTask::Extract,
            AgentInput::ValidateQuality { .. } => AgentTask::ValidateQuality,
            AgentInput::Deliver { .. } => AgentTask::Deliver,
        }
    }
}

/// The output record an agent returns on success.
///
/// Each variant carries exactly the contractually required fields; the
/// owning node writes them back to the state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "task")]
pub enum AgentOutput {
    Requirements {
        requirements: Requirements,
        completeness_score: f64,
        requirements_complete: bool,
    },
    Feasibility {
        phenotype_sql: String,
        feasibility: Feasibility,
    },
    Kickoff {
        kickoff_meeting: KickoffMeeting,
    },
    Extraction {
        extraction: ExtractionRecord,
    },
    Qa {
        qa_report: QaReport,
    },
    Delivery {
        delivery: DeliveryRecord,
    },
}

impl AgentOutput {
    /// The task whose contract this output satisfies.
    pub fn task(&self) -> AgentTask {
        match self {
            AgentOutput::Requirements { .. } => AgentTask::GatherRequirements,
            AgentOutput::Feasibility { .. } => AgentTask::ValidateFeasibility,
            AgentOutput::Kickoff { .. } => AgentTask::ScheduleKickoff,
            AgentOutput::Extraction { .. } => AgentTask::Extract,
            AgentOutput::Qa { .. } => AgentTask::ValidateQuality,
            AgentOutput::Delivery { .. } => AgentTask::Deliver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_qualified_names_match_the_agent_interface() {
        assert_eq!(AgentTask::GatherRequirements.to_string(), "requirements_agent.gather");
        assert_eq!(
            AgentTask::ValidateFeasibility.to_string(),
            "phenotype_agent.validate_feasibility"
        );
        assert_eq!(AgentTask::ScheduleKickoff.to_string(), "calendar_agent.schedule_kickoff");
        assert_eq!(AgentTask::Extract.to_string(), "extraction_agent.extract");
        assert_eq!(AgentTask::ValidateQuality.to_string(), "qa_agent.validate");
        assert_eq!(AgentTask::Deliver.to_string(), "delivery_agent.deliver");
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        let retryable =
            [FailureKind::Timeout, FailureKind::RateLimited, FailureKind::UpstreamUnavailable];
        for kind in retryable {
            assert!(kind.is_retryable(), "{kind} must be retryable");
        }
        for kind in [
            FailureKind::Malformed,
            FailureKind::PreconditionViolated,
            FailureKind::Invalid,
            FailureKind::Internal,
            FailureKind::Cancelled,
        ] {
            assert!(!kind.is_retryable(), "{kind} must not be retryable");
        }
    }

    #[test]
    fn invocation_key_display_is_deterministic() {
        let key = InvocationKey {
            request_id: RequestId(uuid::Uuid::nil()),
            node: FlowState::DataExtraction,
            attempt_no: 2,
        };
        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000000/data_extraction/2"
        );
    }

    #[test]
    fn input_and_output_report_their_task() {
        let input = AgentInput::ValidateFeasibility {
            requirements: Requirements {
                study_title: "t".to_string(),
                inclusion_criteria: vec![],
                exclusion_criteria: vec![],
                time_window: None,
                data_elements: vec![],
                phi_level: PhiLevel::DeIdentified,
            },
        };
        assert_eq!(input.task(), AgentTask::ValidateFeasibility);

        let output = AgentOutput::Qa {
            qa_report: QaReport { overall_status: crate::state::QaStatus::Passed, checks: vec![] },
        };
        assert_eq!(output.task(), AgentTask::ValidateQuality);
    }
}
