//! The workflow state document and its enumeration of lifecycle states.
//!
//! `WorkflowState` is the single persisted record per research request. It
//! carries every field any node reads or writes; fields for stages not yet
//! reached are `Option` so "not yet produced" is distinguishable from
//! "explicitly empty". The engine is the only writer — observers (UIs,
//! dashboards, the approval sweeper) read through the persistence layer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::FailureKind;
use crate::approval::ApprovalId;
use crate::audit::Severity;

/// Current version of the persisted state document schema.
///
/// Migrations are additive: new fields must be `Option` or carry a serde
/// default so documents written by older versions remain loadable.
pub const SCHEMA_VERSION: u32 = 1;

/// Globally unique, opaque identifier for one research request.
///
/// Appears in every audit record, approval, and lease for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    /// Create a new, unique request ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing version assigned by the persistence layer.
///
/// Every `save` must present the version it loaded; a mismatch is a
/// `ConcurrencyConflict` and the write is refused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// The version assigned to a freshly created document.
    pub const INITIAL: Version = Version(1);

    /// The version a successful save produces.
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed enumeration of workflow lifecycle states.
///
/// Each non-terminal state is also the identifier of the node that runs
/// there: agent nodes invoke exactly one agent task, gate nodes create and
/// resolve one approval. The four terminal states accept no further
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    NewRequest,
    RequirementsGathering,
    RequirementsReview,
    FeasibilityValidation,
    PhenotypeReview,
    ScheduleKickoff,
    ExtractionApproval,
    DataExtraction,
    QaValidation,
    QaReview,
    DataDelivery,
    /// Terminal: the artifact was delivered. ✓
    Complete,
    /// Terminal: the phenotype is infeasible or the cohort too small. ✗
    NotFeasible,
    /// Terminal: a failing QA report was confirmed by review. ✗
    QaFailed,
    /// Terminal: escalated to a human operator (cap exceeded, extraction
    /// rejected, cancellation, schema drift). ✗
    HumanReview,
}

impl FlowState {
    /// All states, in topological order of the happy path followed by the
    /// terminal states. Used by schema validation and exhaustiveness tests.
    pub const ALL: [FlowState; 15] = [
        FlowState::NewRequest,
        FlowState::RequirementsGathering,
        FlowState::RequirementsReview,
        FlowState::FeasibilityValidation,
        FlowState::PhenotypeReview,
        FlowState::ScheduleKickoff,
        FlowState::ExtractionApproval,
        FlowState::DataExtraction,
        FlowState::QaValidation,
        FlowState::QaReview,
        FlowState::DataDelivery,
        FlowState::Complete,
        FlowState::NotFeasible,
        FlowState::QaFailed,
        FlowState::HumanReview,
    ];

    /// The wire name of this state (`snake_case`, matching serde).
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::NewRequest => "new_request",
            FlowState::RequirementsGathering => "requirements_gathering",
            FlowState::RequirementsReview => "requirements_review",
            FlowState::FeasibilityValidation => "feasibility_validation",
            FlowState::PhenotypeReview => "phenotype_review",
            FlowState::ScheduleKickoff => "schedule_kickoff",
            FlowState::ExtractionApproval => "extraction_approval",
            FlowState::DataExtraction => "data_extraction",
            FlowState::QaValidation => "qa_validation",
            FlowState::QaReview => "qa_review",
            FlowState::DataDelivery => "data_delivery",
            FlowState::Complete => "complete",
            FlowState::NotFeasible => "not_feasible",
            FlowState::QaFailed => "qa_failed",
            FlowState::HumanReview => "human_review",
        }
    }

    /// True for the four states from which no further transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Complete
                | FlowState::NotFeasible
                | FlowState::QaFailed
                | FlowState::HumanReview
        )
    }

    /// True for the four human-approval gate nodes.
    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            FlowState::RequirementsReview
                | FlowState::PhenotypeReview
                | FlowState::ExtractionApproval
                | FlowState::QaReview
        )
    }

    /// The loop site this node belongs to, if it is a loop-bearing node.
    ///
    /// Loop-bearing nodes increment their site counter on every entry, so
    /// the counter equals the number of times the node has run.
    pub fn loop_site(&self) -> Option<LoopSite> {
        match self {
            FlowState::RequirementsGathering => Some(LoopSite::Requirements),
            FlowState::FeasibilityValidation => Some(LoopSite::Phenotype),
            FlowState::DataExtraction => Some(LoopSite::QaReextract),
            _ => None,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three loop sites whose re-execution is bounded by a configured cap.
///
/// A fourth loop edge — scope change — re-enters `feasibility_validation`
/// and is therefore governed by the `Phenotype` site counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopSite {
    Requirements,
    Phenotype,
    QaReextract,
}

impl LoopSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopSite::Requirements => "requirements",
            LoopSite::Phenotype => "phenotype",
            LoopSite::QaReextract => "qa_reextract",
        }
    }
}

impl fmt::Display for LoopSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt counts for each loop-bearing node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationCounters {
    #[serde(default)]
    pub requirements: u32,
    #[serde(default)]
    pub phenotype: u32,
    #[serde(default)]
    pub qa_reextract: u32,
}

impl IterationCounters {
    pub fn get(&self, site: LoopSite) -> u32 {
        match site {
            LoopSite::Requirements => self.requirements,
            LoopSite::Phenotype => self.phenotype,
            LoopSite::QaReextract => self.qa_reextract,
        }
    }

    pub fn increment(&mut self, site: LoopSite) -> u32 {
        let slot = match site {
            LoopSite::Requirements => &mut self.requirements,
            LoopSite::Phenotype => &mut self.phenotype,
            LoopSite::QaReextract => &mut self.qa_reextract,
        };
        *slot += 1;
        *slot
    }
}

/// The researcher who submitted the request. Set at creation, immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Researcher {
    pub name: String,
    pub email: String,
    pub department: String,
    pub irb_number: String,
}

/// The PHI disclosure level the extract must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhiLevel {
    Identified,
    LimitedDataset,
    DeIdentified,
}

impl fmt::Display for PhiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhiLevel::Identified => "identified",
            PhiLevel::LimitedDataset => "limited_dataset",
            PhiLevel::DeIdentified => "de_identified",
        };
        f.write_str(s)
    }
}

/// Calendar window the cohort is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// The structured cohort definition extracted from the researcher's
/// free-text request. Mutable until requirements approval; a scope change
/// may replace it later under its own gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub study_title: String,
    pub inclusion_criteria: Vec<String>,
    pub exclusion_criteria: Vec<String>,
    pub time_window: Option<TimeWindow>,
    pub data_elements: Vec<String>,
    pub phi_level: PhiLevel,
}

/// Cohort-size estimate bounds reported by the phenotype agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub low: u64,
    pub high: u64,
}

/// Availability of one requested data element in the clinical store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementAvailability {
    /// Fraction of cohort members with at least one value present.
    pub present_fraction: f64,
    /// Fraction of expected observations actually recorded.
    pub completeness_fraction: f64,
}

/// Feasibility verdict for the generated phenotype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feasibility {
    pub feasible: bool,
    pub estimated_cohort_size: u64,
    pub confidence_interval: ConfidenceInterval,
    pub data_availability: BTreeMap<String, ElementAvailability>,
}

/// Kickoff meeting booked by the calendar agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickoffMeeting {
    pub scheduled_at: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub agenda: String,
}

/// The outcome of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub row_count: u64,
    pub phi_level_applied: PhiLevel,
    pub artifact_uri: String,
    pub extracted_at: DateTime<Utc>,
    /// 1-based attempt number; re-extractions after QA rejection increment it.
    pub attempt_no: u32,
}

/// Overall QA verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    Passed,
    Failed,
}

/// One named quality check inside a QA report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaCheck {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub details: String,
}

/// The QA agent's validation report over one extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub overall_status: QaStatus,
    pub checks: Vec<QaCheck>,
}

/// Delivery of the final artifact to the researcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub artifact_uri: String,
    pub checksum: String,
    pub delivered_at: DateTime<Utc>,
    pub notification_sent: bool,
}

/// Tri-state review outcome: absent = not yet decided.
///
/// Once set, the field may be cleared only by the explicit loop-back
/// transition that also increments the relevant iteration counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum GateOutcome {
    Approved,
    Rejected { reason: String },
}

impl GateOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateOutcome::Approved)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, GateOutcome::Rejected { .. })
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            GateOutcome::Rejected { reason } => Some(reason),
            GateOutcome::Approved => None,
        }
    }
}

/// The last terminal node failure recorded against the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: FailureKind,
    pub message: String,
    pub failed_node: FlowState,
    pub attempt_no: u32,
}

/// The single mutable document carrying all per-request data between nodes.
///
/// Created at submission, mutated only by engine-serialized writes, and
/// retained indefinitely — terminal states included — for audit and
/// resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub request_id: RequestId,
    pub current_state: FlowState,
    pub researcher: Researcher,
    pub initial_request: String,

    pub requirements: Option<Requirements>,
    pub completeness_score: Option<f64>,
    #[serde(default)]
    pub requirements_complete: bool,
    pub requirements_approved: Option<GateOutcome>,

    pub phenotype_sql: Option<String>,
    pub feasibility: Option<Feasibility>,
    pub phenotype_approved: Option<GateOutcome>,

    pub kickoff_meeting: Option<KickoffMeeting>,

    pub extraction_approved: Option<GateOutcome>,
    pub extraction: Option<ExtractionRecord>,

    pub qa_report: Option<QaReport>,
    pub qa_approved: Option<GateOutcome>,

    pub delivery: Option<DeliveryRecord>,

    pub error: Option<NodeError>,
    #[serde(default)]
    pub iteration_counters: IterationCounters,

    /// Human-readable reason shown on terminal escalation states.
    pub escalation_reason: Option<String>,
    /// Administrative cancellation sentinel; routing maps it to human_review.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Optional workflow deadline, propagated into agent invocation timeouts.
    pub deadline: Option<DateTime<Utc>>,
    /// Set while a scope-change approval awaits decision; parks the workflow.
    pub pending_scope_change: Option<ApprovalId>,
    /// Approvals whose decisions have been applied to this document.
    ///
    /// A gate consults this list so a decided approval is applied exactly
    /// once; after a loop-back clears the tri-state field, the gate creates
    /// a fresh approval instead of re-applying the old decision.
    #[serde(default)]
    pub applied_approvals: Vec<ApprovalId>,

    /// Opaque handle naming the ordered audit stream for this request.
    pub audit_ref: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Build the state for a freshly submitted request.
    pub fn new(researcher: Researcher, initial_request: impl Into<String>) -> Self {
        let request_id = RequestId::new();
        let now = Utc::now();
        Self {
            request_id,
            current_state: FlowState::NewRequest,
            researcher,
            initial_request: initial_request.into(),
            requirements: None,
            completeness_score: None,
            requirements_complete: false,
            requirements_approved: None,
            phenotype_sql: None,
            feasibility: None,
            phenotype_approved: None,
            kickoff_meeting: None,
            extraction_approved: None,
            extraction: None,
            qa_report: None,
            qa_approved: None,
            delivery: None,
            error: None,
            iteration_counters: IterationCounters::default(),
            escalation_reason: None,
            cancel_requested: false,
            deadline: None,
            pending_scope_change: None,
            applied_approvals: Vec::new(),
            audit_ref: format!("audit/{}", request_id),
            schema_version: SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clear every product downstream of the requirements, used when a
    /// scope change replaces the cohort definition.
    pub fn clear_downstream_of_requirements(&mut self) {
        self.phenotype_sql = None;
        self.feasibility = None;
        self.phenotype_approved = None;
        self.kickoff_meeting = None;
        self.extraction_approved = None;
        self.extraction = None;
        self.qa_report = None;
        self.qa_approved = None;
        self.delivery = None;
    }
}

/// The node that first writes each mutable document field.
///
/// Downstream nodes may read a field, and loop predecessors may reset it,
/// but only the owner listed here may produce its first value. Handler
/// tests assert their writes stay within this table.
pub fn field_owner(field: &str) -> Option<FlowState> {
    let owner = match field {
        "requirements" | "completeness_score" | "requirements_complete" => {
            FlowState::RequirementsGathering
        }
        "requirements_approved" => FlowState::RequirementsReview,
        "phenotype_sql" | "feasibility" => FlowState::FeasibilityValidation,
        "phenotype_approved" => FlowState::PhenotypeReview,
        "kickoff_meeting" => FlowState::ScheduleKickoff,
        "extraction_approved" => FlowState::ExtractionApproval,
        "extraction" => FlowState::DataExtraction,
        "qa_report" => FlowState::QaValidation,
        "qa_approved" => FlowState::QaReview,
        "delivery" => FlowState::DataDelivery,
        _ => return None,
    };
    Some(owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn researcher() -> Researcher {
        Researcher {
            name: "Dr. Osei".to_string(),
            email: "osei@hospital.example".to_string(),
            department: "Cardiology".to_string(),
            irb_number: "IRB-2026-0412".to_string(),
        }
    }

    #[test]
    fn new_state_starts_at_new_request_with_empty_products() {
        let state = WorkflowState::new(researcher(), "heart failure cohort");
        assert_eq!(state.current_state, FlowState::NewRequest);
        assert!(state.requirements.is_none());
        assert!(state.phenotype_sql.is_none());
        assert!(!state.requirements_complete);
        assert_eq!(state.iteration_counters, IterationCounters::default());
        assert_eq!(state.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn flow_state_terminal_and_gate_partition() {
        let terminals: Vec<FlowState> =
            FlowState::ALL.iter().copied().filter(FlowState::is_terminal).collect();
        assert_eq!(
            terminals,
            vec![
                FlowState::Complete,
                FlowState::NotFeasible,
                FlowState::QaFailed,
                FlowState::HumanReview
            ]
        );

        let gates: Vec<FlowState> =
            FlowState::ALL.iter().copied().filter(FlowState::is_gate).collect();
        assert_eq!(gates.len(), 4);
        // No state is both terminal and a gate.
        assert!(FlowState::ALL.iter().all(|s| !(s.is_terminal() && s.is_gate())));
    }

    #[test]
    fn flow_state_serde_uses_snake_case_wire_names() {
        for state in FlowState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            let back: FlowState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }

    #[test]
    fn iteration_counters_increment_per_site() {
        let mut counters = IterationCounters::default();
        assert_eq!(counters.increment(LoopSite::Requirements), 1);
        assert_eq!(counters.increment(LoopSite::Requirements), 2);
        assert_eq!(counters.increment(LoopSite::QaReextract), 1);
        assert_eq!(counters.get(LoopSite::Requirements), 2);
        assert_eq!(counters.get(LoopSite::Phenotype), 0);
        assert_eq!(counters.get(LoopSite::QaReextract), 1);
    }

    #[test]
    fn gate_outcome_rejection_carries_reason() {
        let outcome = GateOutcome::Rejected { reason: "missing time period".to_string() };
        assert!(outcome.is_rejected());
        assert_eq!(outcome.rejection_reason(), Some("missing time period"));
        assert!(GateOutcome::Approved.rejection_reason().is_none());
    }

    #[test]
    fn state_document_round_trips_field_by_field() {
        let mut state = WorkflowState::new(researcher(), "sepsis readmissions");
        state.current_state = FlowState::FeasibilityValidation;
        state.requirements = Some(Requirements {
            study_title: "Sepsis readmissions 2020-2024".to_string(),
            inclusion_criteria: vec!["sepsis dx".to_string()],
            exclusion_criteria: vec!["age < 18".to_string()],
            time_window: Some(TimeWindow {
                start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            }),
            data_elements: vec!["labs".to_string(), "vitals".to_string()],
            phi_level: PhiLevel::DeIdentified,
        });
        state.completeness_score = Some(0.92);
        state.requirements_complete = true;
        state.requirements_approved = Some(GateOutcome::Approved);

        let json = serde_json::to_value(&state).unwrap();
        let back: WorkflowState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn clear_downstream_preserves_requirements() {
        let mut state = WorkflowState::new(researcher(), "aki cohort");
        state.phenotype_sql = Some("SELECT 1".to_string());
        state.qa_approved = Some(GateOutcome::Approved);
        state.clear_downstream_of_requirements();
        assert!(state.phenotype_sql.is_none());
        assert!(state.qa_approved.is_none());
        assert_eq!(state.initial_request, "aki cohort");
    }

    #[test]
    fn field_ownership_covers_every_product_field() {
        assert_eq!(field_owner("requirements"), Some(FlowState::RequirementsGathering));
        assert_eq!(field_owner("phenotype_sql"), Some(FlowState::FeasibilityValidation));
        assert_eq!(field_owner("qa_approved"), Some(FlowState::QaReview));
        assert_eq!(field_owner("delivery"), Some(FlowState::DataDelivery));
        assert_eq!(field_owner("request_id"), None);
    }
}
