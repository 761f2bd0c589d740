//! Typed runtime configuration.
//!
//! Replaces the source's module-level mutable config dicts with a single
//! typed struct populated once at startup and propagated by reference.
//! Runtime mutation only happens through [`ConfigService`], which persists
//! its snapshots to the graph store as `config`-typed nodes.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// All recognized configuration options (spec §6), each with its documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_active_tasks: usize,
    pub max_active_thoughts: usize,
    pub max_depth: u32,
    pub conscience_retry_limit: u32,
    pub dma_retry_limit: u32,
    pub dma_timeout_seconds: f64,
    pub entropy_threshold: f64,
    pub coherence_threshold: f64,
    pub agent_occurrence_id: String,
    pub round_delay_seconds: f64,

    /// Consolidation window (spec's open question: expose as config, not a
    /// hard-coded 6h/24h constant).
    pub consolidation_window_seconds: u64,
    /// Circuit breaker failure threshold before opening (default 3).
    pub breaker_failure_threshold: u32,
    /// Circuit breaker cool-down before half-opening (default 60s).
    pub breaker_cooldown_seconds: u64,
    /// Conscience faculty timeout (default 10s).
    pub conscience_timeout_seconds: f64,
    /// Shutdown grace window before emergency kill (default 5s per spec).
    pub shutdown_grace_seconds: u64,
    /// Per init/shutdown step timeout (default 30s).
    pub init_step_timeout_seconds: f64,
    /// Verification step timeout (default 10s).
    pub init_verify_timeout_seconds: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_active_tasks: 10,
            max_active_thoughts: 50,
            max_depth: 20,
            conscience_retry_limit: 2,
            dma_retry_limit: 3,
            dma_timeout_seconds: 30.0,
            entropy_threshold: 0.40,
            coherence_threshold: 0.60,
            agent_occurrence_id: "default".to_string(),
            round_delay_seconds: 1.0,
            consolidation_window_seconds: 6 * 3600,
            breaker_failure_threshold: 3,
            breaker_cooldown_seconds: 60,
            conscience_timeout_seconds: 10.0,
            shutdown_grace_seconds: 5,
            init_step_timeout_seconds: 30.0,
            init_verify_timeout_seconds: 10.0,
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string, falling back to defaults for
    /// any option left unspecified.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Load configuration from a TOML file on disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Validate invariants that must hold before the runtime can start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid {
                message: "max_depth must be > 0".to_string(),
            });
        }
        if self.max_active_tasks == 0 {
            return Err(ConfigError::Invalid {
                message: "max_active_tasks must be > 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.entropy_threshold) {
            return Err(ConfigError::Invalid {
                message: "entropy_threshold must be in [0.0, 1.0]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.coherence_threshold) {
            return Err(ConfigError::Invalid {
                message: "coherence_threshold must be in [0.0, 1.0]".to_string(),
            });
        }
        if self.agent_occurrence_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "agent_occurrence_id must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Runtime-mutable wrapper around [`Config`].
///
/// Config is never mutated in place after init except through this service,
/// which persists each reload as a `config`-typed graph node (see
/// `crate::graph`) so the latest configuration survives restarts.
pub struct ConfigService {
    current: RwLock<Config>,
}

impl ConfigService {
    pub fn new(initial: Config) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Config {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Replace the active configuration after validating it.
    pub fn reload(&self, next: Config) -> Result<(), ConfigError> {
        next.validate()?;
        *self.current.write().expect("config lock poisoned") = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.max_active_tasks, 10);
        assert_eq!(cfg.max_active_thoughts, 50);
        assert_eq!(cfg.max_depth, 20);
        assert_eq!(cfg.conscience_retry_limit, 2);
        assert_eq!(cfg.dma_retry_limit, 3);
        assert!((cfg.dma_timeout_seconds - 30.0).abs() < f64::EPSILON);
        assert!((cfg.entropy_threshold - 0.40).abs() < f64::EPSILON);
        assert!((cfg.coherence_threshold - 0.60).abs() < f64::EPSILON);
        assert_eq!(cfg.agent_occurrence_id, "default");
    }

    #[test]
    fn validate_rejects_zero_max_depth() {
        let mut cfg = Config::default();
        cfg.max_depth = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_thresholds() {
        let mut cfg = Config::default();
        cfg.entropy_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let cfg = Config::from_toml("max_active_tasks = 5\n").unwrap();
        assert_eq!(cfg.max_active_tasks, 5);
        assert_eq!(cfg.max_depth, 20); // untouched default
    }

    #[test]
    fn config_service_reload_validates() {
        let svc = ConfigService::new(Config::default());
        let mut bad = Config::default();
        bad.max_active_tasks = 0;
        assert!(svc.reload(bad).is_err());
        assert_eq!(svc.get().max_active_tasks, 10);
    }
}
