//! # researchflow-config
//!
//! The recognized configuration surface for the ResearchFlow engine.
//!
//! `FlowConfig` is deserialized from TOML (string or file) and validated
//! before the engine accepts it. Every option has a default matching the
//! documented configuration surface, so an empty document is a valid
//! configuration.
//!
//! ```toml
//! [max_iterations]
//! requirements = 5
//! phenotype = 5
//! qa_reextract = 3
//!
//! [agent.retry]
//! max_attempts = 3
//! backoff_base_ms = 200
//! backoff_jitter_ms = 100
//!
//! [agent]
//! default_timeout_ms = 30000
//!
//! [approval]
//! default_sla_ms = 259200000
//!
//! [engine]
//! worker_count = 4
//! lease_ttl_ms = 30000
//! ```

pub mod config;

pub use config::{
    AgentConfig, ApprovalConfig, EngineConfig, FlowConfig, IterationCaps, RetryConfig,
};
