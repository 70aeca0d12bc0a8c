//! Orchestrator configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `COC_MODE` | `mock` |
//! | `COC_OUT_DIR` | `out` |
//! | `TRACE_DIR` | `<out>/traces` |
//! | `BANDIT_PATH` | `<out>/bandit_state.json` |
//! | `TEMPLATE_DIR` | `agents/templates` |
//! | `COC_EPSILON` | `0.2` |
//! | `COC_ARM_SCOPE` | `global` |
//! | `COC_MAX_CONCURRENT` | `1` |
//! | `COC_CALL_TIMEOUT_MS` | `120000` |
//! | `COC_MAX_ESCALATION_DEPTH` | `0` (unbounded) |
//! | `MOCK_SEED` | `42` |
//! | `MOCK_INJECT_FAILURE_RATE` | `0.0` |
//! | `MOCK_LATENCY_MS` | `0` |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bandit::ArmScope;
use crate::error::{CocError, Result};

/// Which collaborators back a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Deterministic in-process model registry and retriever.
    #[default]
    Mock,
    /// Externally supplied registry and retriever.
    Real,
}

impl FromStr for RunMode {
    type Err = CocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(RunMode::Mock),
            "real" => Ok(RunMode::Real),
            other => Err(CocError::InvalidConfig(format!(
                "COC_MODE must be mock or real, got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Mock => f.write_str("mock"),
            RunMode::Real => f.write_str("real"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub mode: RunMode,
    pub out_dir: PathBuf,
    pub trace_dir: PathBuf,
    pub bandit_path: PathBuf,
    pub template_dir: PathBuf,
    pub epsilon: f64,
    pub arm_scope: ArmScope,
    /// Tasks allowed in flight at once.
    pub max_concurrent: usize,
    /// Deadline for each model or retrieval call.
    pub call_timeout: Duration,
    /// Escalation chain bound; 0 disables the bound.
    pub max_escalation_depth: u32,
    pub mock_seed: u64,
    pub mock_failure_rate: f64,
    pub mock_latency: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let out_dir = PathBuf::from("out");
        Self {
            mode: RunMode::Mock,
            trace_dir: out_dir.join("traces"),
            bandit_path: out_dir.join("bandit_state.json"),
            out_dir,
            template_dir: PathBuf::from("agents").join("templates"),
            epsilon: 0.2,
            arm_scope: ArmScope::Global,
            max_concurrent: 1,
            call_timeout: Duration::from_millis(120_000),
            max_escalation_depth: 0,
            mock_seed: 42,
            mock_failure_rate: 0.0,
            mock_latency: Duration::ZERO,
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let out_dir = get("COC_OUT_DIR").map(PathBuf::from).unwrap_or(defaults.out_dir);
        let config = Self {
            mode: get("COC_MODE").map(|v| v.parse::<RunMode>()).transpose()?.unwrap_or_default(),
            trace_dir: get("TRACE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| out_dir.join("traces")),
            bandit_path: get("BANDIT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| out_dir.join("bandit_state.json")),
            template_dir: get("TEMPLATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.template_dir),
            epsilon: parse_or("COC_EPSILON", get("COC_EPSILON"), defaults.epsilon)?,
            arm_scope: get("COC_ARM_SCOPE")
                .map(|v| v.parse::<ArmScope>())
                .transpose()?
                .unwrap_or_default(),
            max_concurrent: parse_or(
                "COC_MAX_CONCURRENT",
                get("COC_MAX_CONCURRENT"),
                defaults.max_concurrent,
            )?,
            call_timeout: Duration::from_millis(parse_or(
                "COC_CALL_TIMEOUT_MS",
                get("COC_CALL_TIMEOUT_MS"),
                120_000u64,
            )?),
            max_escalation_depth: parse_or(
                "COC_MAX_ESCALATION_DEPTH",
                get("COC_MAX_ESCALATION_DEPTH"),
                defaults.max_escalation_depth,
            )?,
            mock_seed: parse_or("MOCK_SEED", get("MOCK_SEED"), defaults.mock_seed)?,
            mock_failure_rate: parse_or(
                "MOCK_INJECT_FAILURE_RATE",
                get("MOCK_INJECT_FAILURE_RATE"),
                defaults.mock_failure_rate,
            )?,
            mock_latency: Duration::from_millis(parse_or(
                "MOCK_LATENCY_MS",
                get("MOCK_LATENCY_MS"),
                0u64,
            )?),
            out_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(CocError::InvalidConfig(format!(
                "epsilon must be in [0, 1], got {}",
                self.epsilon
            )));
        }
        if self.max_concurrent == 0 {
            return Err(CocError::InvalidConfig(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(CocError::InvalidConfig(
                "call timeout must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.mock_failure_rate) {
            return Err(CocError::InvalidConfig(format!(
                "MOCK_INJECT_FAILURE_RATE must be in [0, 1], got {}",
                self.mock_failure_rate
            )));
        }
        Ok(())
    }

    /// Path of the JSONL trace log.
    pub fn trace_log_path(&self) -> PathBuf {
        self.trace_dir.join("events.jsonl")
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CocError::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<OrchestratorConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.trace_log_path(), PathBuf::from("out/traces/events.jsonl"));
        assert_eq!(cfg.max_escalation_depth, 0);
        assert_eq!(cfg.mock_seed, 42);
    }

    #[test]
    fn out_dir_moves_derived_paths() {
        let cfg = load(&[("COC_OUT_DIR", "/var/coc")]).unwrap();
        assert_eq!(cfg.trace_dir, PathBuf::from("/var/coc/traces"));
        assert_eq!(cfg.bandit_path, PathBuf::from("/var/coc/bandit_state.json"));

        let cfg = load(&[("COC_OUT_DIR", "/var/coc"), ("TRACE_DIR", "/logs")]).unwrap();
        assert_eq!(cfg.trace_dir, PathBuf::from("/logs"));
    }

    #[test]
    fn parses_overrides() {
        let cfg = load(&[
            ("COC_MODE", "real"),
            ("COC_EPSILON", "0.05"),
            ("COC_ARM_SCOPE", "per_role"),
            ("COC_MAX_CONCURRENT", "4"),
            ("COC_CALL_TIMEOUT_MS", "1500"),
            ("MOCK_LATENCY_MS", "10"),
            ("COC_MAX_ESCALATION_DEPTH", "2"),
        ])
        .unwrap();
        assert_eq!(cfg.mode, RunMode::Real);
        assert_eq!(cfg.epsilon, 0.05);
        assert_eq!(cfg.arm_scope, ArmScope::PerRole);
        assert_eq!(cfg.max_concurrent, 4);
        assert_eq!(cfg.call_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.mock_latency, Duration::from_millis(10));
        assert_eq!(cfg.max_escalation_depth, 2);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("COC_EPSILON", "1.2")]),
            Err(CocError::InvalidConfig(_))
        ));
        assert!(load(&[("COC_MAX_CONCURRENT", "0")]).is_err());
        assert!(load(&[("MOCK_SEED", "forty-two")]).is_err());
        assert!(load(&[("COC_MODE", "staging")]).is_err());
    }

    #[test]
    fn blank_values_keep_defaults() {
        let cfg = load(&[("COC_EPSILON", "  ")]).unwrap();
        assert_eq!(cfg.epsilon, 0.2);
    }
}
