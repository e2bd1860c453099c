//! # researchflow-contracts
//!
//! Shared types, records, and contracts for the ResearchFlow orchestration
//! core.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate — only data definitions and error types: the workflow state
//! document, approval and audit records, the agent invocation contract, and
//! the unified error taxonomy.

pub mod agent;
pub mod approval;
pub mod audit;
pub mod error;
pub mod state;
