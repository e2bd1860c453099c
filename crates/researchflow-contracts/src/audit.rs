//! Audit record types.
//!
//! Every observable engine action produces exactly one `AuditRecord`,
//! appended to the per-request audit stream together with the state write
//! that caused it. Records are never updated or deleted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{FlowState, RequestId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Created,
    NodeEntered,
    NodeExited,
    AgentAttempt,
    AgentSuccess,
    AgentFailure,
    ApprovalRequested,
    ApprovalDecided,
    StatePersisted,
    Escalated,
    Completed,
    Terminated,
}

/// Who caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role", content = "id")]
pub enum Actor {
    System,
    Agent(String),
    Reviewer(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Agent(id) => write!(f, "agent:{id}"),
            Actor::Reviewer(id) => write!(f, "reviewer:{id}"),
        }
    }
}

/// How loud it should be in operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One immutable entry in a request's audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: uuid::Uuid,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    /// The node the event concerns, absent for request-level events.
    pub node: Option<FlowState>,
    pub actor: Actor,
    pub severity: Severity,
    pub payload: serde_json::Value,
}

impl AuditRecord {
    /// A system-actor, info-severity record with an empty payload.
    pub fn new(request_id: RequestId, kind: AuditKind) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4(),
            request_id,
            timestamp: Utc::now(),
            kind,
            node: None,
            actor: Actor::System,
            severity: Severity::Info,
            payload: serde_json::Value::Null,
        }
    }

    pub fn node(mut self, node: FlowState) -> Self {
        self.node = Some(node);
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_defaults_are_system_info_null() {
        let record = AuditRecord::new(RequestId::new(), AuditKind::Created);
        assert_eq!(record.actor, Actor::System);
        assert_eq!(record.severity, Severity::Info);
        assert!(record.node.is_none());
        assert!(record.payload.is_null());
    }

    #[test]
    fn builder_chain_overrides_every_field() {
        let record = AuditRecord::new(RequestId::new(), AuditKind::AgentFailure)
            .node(FlowState::DataExtraction)
            .actor(Actor::Agent("extraction_agent".to_string()))
            .severity(Severity::Error)
            .payload(json!({ "kind": "timeout" }));
        assert_eq!(record.node, Some(FlowState::DataExtraction));
        assert_eq!(record.actor, Actor::Agent("extraction_agent".to_string()));
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(record.payload["kind"], "timeout");
    }

    #[test]
    fn actor_serialization_is_role_tagged() {
        let json = serde_json::to_value(Actor::Reviewer("dr-okafor".to_string())).unwrap();
        assert_eq!(json, json!({ "role": "reviewer", "id": "dr-okafor" }));
        let system = serde_json::to_value(Actor::System).unwrap();
        assert_eq!(system, json!({ "role": "system" }));
    }

    #[test]
    fn audit_kind_wire_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditKind::ApprovalRequested).unwrap(),
            "\"approval_requested\""
        );
        assert_eq!(serde_json::to_string(&AuditKind::StatePersisted).unwrap(), "\"state_persisted\"");
    }
}
