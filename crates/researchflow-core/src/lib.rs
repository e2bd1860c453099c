//! # researchflow-core
//!
//! The durable, resumable workflow engine at the heart of ResearchFlow.
//!
//! The engine drives a directed graph of agent nodes and human-approval
//! gates across a long-lived request lifecycle:
//!
//!   load → route → handle → persist → … → park | terminal
//!
//! Components:
//!
//! - [`traits`]   — the seams: `Agent`, `StateStore`, `ApprovalStore`,
//!   `LeaseKeeper`
//! - [`adapter`]  — uniform agent invocation: retry, timeout, cancellation
//! - [`routing`]  — the pure state → next-node function with loop caps
//! - [`handlers`] — per-node logic for agent nodes, gates, and terminals
//! - [`gates`]    — the approval decision surface and timeout sweeper
//! - [`engine`]   — the execution loop, lease discipline, and recovery

pub mod adapter;
pub mod engine;
pub mod gates;
pub mod handlers;
pub mod routing;
pub mod traits;

pub use adapter::{AgentAdapter, AgentRegistry, InvokeReport};
pub use engine::{Engine, RunOutcome};
pub use gates::ApprovalGateService;
pub use routing::{route, Route};
pub use traits::{Agent, AgentContext, ApprovalStore, LeaseKeeper, LeaseToken, StateStore};
