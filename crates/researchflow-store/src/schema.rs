//! Schema-on-read validation for persisted workflow documents.
//!
//! The store keeps documents as raw JSON and validates them against this
//! schema on every load, before deserialization. A document that no longer
//! matches — an unknown `current_state`, a missing required field, a
//! mistyped counter — is schema drift: the engine refuses to run it and
//! quarantines it instead. The schema deliberately allows unknown extra
//! properties so forward migrations stay additive.

use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::{json, Value};

/// The JSON Schema every persisted workflow document must satisfy.
fn document_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "request_id",
            "current_state",
            "researcher",
            "initial_request",
            "iteration_counters",
            "audit_ref",
            "schema_version",
            "created_at",
            "updated_at"
        ],
        "properties": {
            "request_id": { "type": "string", "format": "uuid" },
            "current_state": {
                "enum": [
                    "new_request",
                    "requirements_gathering",
                    "requirements_review",
                    "feasibility_validation",
                    "phenotype_review",
                    "schedule_kickoff",
                    "extraction_approval",
                    "data_extraction",
                    "qa_validation",
                    "qa_review",
                    "data_delivery",
                    "complete",
                    "not_feasible",
                    "qa_failed",
                    "human_review"
                ]
            },
            "researcher": {
                "type": "object",
                "required": ["name", "email", "department", "irb_number"],
                "properties": {
                    "name": { "type": "string" },
                    "email": { "type": "string" },
                    "department": { "type": "string" },
                    "irb_number": { "type": "string" }
                }
            },
            "initial_request": { "type": "string" },
            "completeness_score": {
                "type": ["number", "null"],
                "minimum": 0.0,
                "maximum": 1.0
            },
            "requirements_complete": { "type": "boolean" },
            "cancel_requested": { "type": "boolean" },
            "iteration_counters": {
                "type": "object",
                "properties": {
                    "requirements": { "type": "integer", "minimum": 0 },
                    "phenotype": { "type": "integer", "minimum": 0 },
                    "qa_reextract": { "type": "integer", "minimum": 0 }
                }
            },
            "audit_ref": { "type": "string" },
            "schema_version": { "type": "integer", "minimum": 1 },
            "applied_approvals": {
                "type": "array",
                "items": { "type": "string", "format": "uuid" }
            }
        }
    })
}

fn validator() -> &'static Validator {
    static VALIDATOR: OnceLock<Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        jsonschema::validator_for(&document_schema())
            .expect("embedded document schema must be a valid JSON Schema")
    })
}

/// Validate a raw stored document, returning the first violation.
pub fn validate_document(document: &Value) -> Result<(), String> {
    match validator().iter_errors(document).next() {
        None => Ok(()),
        Some(error) => Err(format!(
            "document violates state schema at {}: {}",
            error.instance_path, error
        )),
    }
}
