//! Configuration schema and TOML loading.
//!
//! Defaults follow the documented configuration surface. Loading never
//! panics: malformed TOML and out-of-range values both surface as
//! `FlowError::Config` with the offending key in the reason.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::LoopSite;

/// Per-loop-site re-execution caps.
///
/// A cap of `n` permits at most `n` runs of the loop-bearing node; routing
/// that would start run `n + 1` escalates to `human_review` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationCaps {
    pub requirements: u32,
    pub phenotype: u32,
    pub qa_reextract: u32,
}

impl Default for IterationCaps {
    fn default() -> Self {
        Self { requirements: 5, phenotype: 5, qa_reextract: 3 }
    }
}

impl IterationCaps {
    /// The cap governing one loop site.
    pub fn for_site(&self, site: LoopSite) -> u32 {
        match site {
            LoopSite::Requirements => self.requirements,
            LoopSite::Phenotype => self.phenotype,
            LoopSite::QaReextract => self.qa_reextract,
        }
    }
}

/// Retry policy for retryable agent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first (≥ 1).
    pub max_attempts: u32,
    /// Base delay before the first retry; doubles each retry.
    pub backoff_base_ms: u64,
    /// Uniform jitter added to each backoff delay.
    pub backoff_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_base_ms: 200, backoff_jitter_ms: 100 }
    }
}

/// Agent invocation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub retry: RetryConfig,
    /// Per-attempt timeout; bounded further by any workflow deadline.
    pub default_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { retry: RetryConfig::default(), default_timeout_ms: 30_000 }
    }
}

impl AgentConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Approval gate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// SLA applied to new approvals; the sweeper times out approvals whose
    /// deadline has passed. Default is 72 hours.
    pub default_sla_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { default_sla_ms: 72 * 60 * 60 * 1000 }
    }
}

impl ApprovalConfig {
    pub fn default_sla(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.default_sla_ms as i64)
    }
}

/// Engine scheduling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running workflows (≥ 1).
    pub worker_count: usize,
    /// Lease time-to-live; a worker renews while driving a workflow.
    pub lease_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { worker_count: 4, lease_ttl_ms: 30_000 }
    }
}

impl EngineConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

/// The full recognized configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FlowConfig {
    pub max_iterations: IterationCaps,
    pub agent: AgentConfig,
    pub approval: ApprovalConfig,
    pub engine: EngineConfig,
}

impl FlowConfig {
    /// Parse `s` as TOML and validate the result.
    pub fn from_toml_str(s: &str) -> FlowResult<Self> {
        let config: FlowConfig = toml::from_str(s).map_err(|e| FlowError::Config {
            reason: format!("failed to parse configuration TOML: {e}"),
        })?;
        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Read the file at `path` and parse it as TOML configuration.
    pub fn from_file(path: &Path) -> FlowResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| FlowError::Config {
            reason: format!("failed to read configuration file '{}': {e}", path.display()),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> FlowResult<()> {
        if self.agent.retry.max_attempts < 1 {
            return Err(FlowError::Config {
                reason: "agent.retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.engine.worker_count < 1 {
            return Err(FlowError::Config {
                reason: "engine.worker_count must be at least 1".to_string(),
            });
        }
        if self.engine.lease_ttl_ms == 0 {
            return Err(FlowError::Config {
                reason: "engine.lease_ttl_ms must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = FlowConfig::from_toml_str("").unwrap();
        assert_eq!(config, FlowConfig::default());
        assert_eq!(config.max_iterations.requirements, 5);
        assert_eq!(config.max_iterations.phenotype, 5);
        assert_eq!(config.max_iterations.qa_reextract, 3);
        assert_eq!(config.agent.retry.max_attempts, 3);
        assert_eq!(config.engine.worker_count, 4);
    }

    #[test]
    fn partial_document_overrides_only_named_keys() {
        let config = FlowConfig::from_toml_str(
            r#"
            [max_iterations]
            qa_reextract = 1

            [engine]
            worker_count = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.max_iterations.qa_reextract, 1);
        assert_eq!(config.max_iterations.requirements, 5);
        assert_eq!(config.engine.worker_count, 8);
        assert_eq!(config.engine.lease_ttl_ms, 30_000);
    }

    #[test]
    fn nested_retry_table_parses() {
        let config = FlowConfig::from_toml_str(
            r#"
            [agent]
            default_timeout_ms = 5000

            [agent.retry]
            max_attempts = 5
            backoff_base_ms = 50
            backoff_jitter_ms = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.retry.max_attempts, 5);
        assert_eq!(config.agent.retry.backoff_base_ms, 50);
        assert_eq!(config.agent.default_timeout_ms, 5000);
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let err = FlowConfig::from_toml_str(
            r#"
            [agent.retry]
            max_attempts = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn zero_worker_count_is_rejected() {
        let err = FlowConfig::from_toml_str(
            r#"
            [engine]
            worker_count = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = FlowConfig::from_toml_str("max_iterations = [not toml").unwrap_err();
        assert!(matches!(err, FlowError::Config { .. }));
    }

    #[test]
    fn caps_resolve_per_site() {
        let caps = IterationCaps { requirements: 2, phenotype: 4, qa_reextract: 1 };
        assert_eq!(caps.for_site(LoopSite::Requirements), 2);
        assert_eq!(caps.for_site(LoopSite::Phenotype), 4);
        assert_eq!(caps.for_site(LoopSite::QaReextract), 1);
    }
}
