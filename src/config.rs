//! Tunable bars for every learner and agent
//!
//! All numeric cutoffs live here so deployments (and tests) can move them
//! without touching the algorithms. Loaded from TOML; any missing section or
//! field falls back to its default.

use crate::error::{LoopError, Result};
use crate::types::{ConfidenceThresholds, Strategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub vocabulary: VocabularyConfig,
    pub rules: RuleConfig,
    pub calibration: CalibrationConfig,
    pub agent: AgentConfig,
    pub maverick: MaverickConfig,
    pub server: ServerConfig,
    pub locks: LockConfig,
}

/// Always/never-include flag bars for concept terms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
    /// Observations before a flag may flip
    pub min_observations: i64,
    /// Kept ratio at or above which a term is always included
    pub always_ratio: f64,
    /// Kept ratio at or below which a term is never included
    pub never_ratio: f64,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            min_observations: 5,
            always_ratio: 0.9,
            never_ratio: 0.1,
        }
    }
}

/// Rule synthesis and update parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Distinct documents a correction pattern needs before it becomes a rule
    pub min_support: usize,
    /// Step size of the exponential confidence update
    pub alpha: f64,
    /// Cap on a freshly synthesized rule's confidence
    pub max_initial_confidence: f64,
    /// Feedback on decisions at or above this confidence never touches rules.
    /// `None` uses the owner's calibrated `high` threshold.
    pub confidence_ceiling: Option<f64>,
    /// Default learning-run lookback
    pub lookback_days: i64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            min_support: 3,
            alpha: 0.1,
            max_initial_confidence: 0.9,
            confidence_ceiling: None,
            lookback_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Validated decisions required before calibrating
    pub min_validated: usize,
    pub bin_count: usize,
    /// Acceptance rate needed to automate without review
    pub high_bar: f64,
    pub medium_bar: f64,
    /// Below this everything is queued for review
    pub floor: f64,
    /// Minimum spacing enforced between adjacent thresholds
    pub min_gap: f64,
    /// Bins with fewer samples never end the downward walk
    pub min_bin_samples: usize,
    /// Credit a partial validation earns toward acceptance
    pub partial_credit: f64,
    /// Thresholds for owners never calibrated
    pub defaults: ConfidenceThresholds,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_validated: 50,
            bin_count: 10,
            high_bar: 0.95,
            medium_bar: 0.80,
            floor: 0.3,
            min_gap: 0.05,
            min_bin_samples: 3,
            partial_credit: 0.5,
            defaults: ConfidenceThresholds {
                high: 0.85,
                medium: 0.6,
                low: 0.3,
            },
        }
    }
}

/// Admission bars for one strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StrategyGate {
    pub min_rule_confidence: f64,
    /// Only checked once the rule's accuracy is defined
    pub min_accuracy: f64,
    pub min_applications: i64,
}

impl StrategyGate {
    pub fn admits(&self, rule: &crate::types::LearnedRule) -> bool {
        rule.active && self.admits_state(&rule.state())
    }

    pub fn admits_state(&self, state: &crate::types::RuleState) -> bool {
        state.confidence >= self.min_rule_confidence
            && state.times_applied >= self.min_applications
            && state.accuracy().map_or(self.min_applications == 0, |a| a >= self.min_accuracy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub initial_strategy: Strategy,
    pub conservative: StrategyGate,
    pub balanced: StrategyGate,
    pub aggressive: StrategyGate,
    /// Upper bound on autonomous actions per decide phase
    pub max_actions_per_run: usize,
    /// Window size `k` for the rolling accuracy trend
    pub trend_window: usize,
    pub degrade_threshold: f64,
    pub improve_threshold: f64,
    /// Consecutive improving evaluations before promotion
    pub sustain_evaluations: u32,
    /// Promotions wait for the experiment phase to confirm them
    pub require_experiment: bool,
    /// Held-out autonomous decisions replayed per experiment
    pub experiment_window: usize,
    pub experiment_accept_bar: f64,
    /// Entries kept in the accuracy history
    pub history_len: usize,
}

impl AgentConfig {
    pub fn gate(&self, strategy: Strategy) -> &StrategyGate {
        match strategy {
            Strategy::Conservative => &self.conservative,
            Strategy::Balanced => &self.balanced,
            Strategy::Aggressive => &self.aggressive,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            initial_strategy: Strategy::Conservative,
            conservative: StrategyGate {
                min_rule_confidence: 0.85,
                min_accuracy: 0.9,
                min_applications: 10,
            },
            balanced: StrategyGate {
                min_rule_confidence: 0.7,
                min_accuracy: 0.8,
                min_applications: 3,
            },
            aggressive: StrategyGate {
                min_rule_confidence: 0.5,
                min_accuracy: 0.6,
                min_applications: 0,
            },
            max_actions_per_run: 50,
            trend_window: 20,
            degrade_threshold: 0.05,
            improve_threshold: 0.02,
            sustain_evaluations: 2,
            require_experiment: true,
            experiment_window: 50,
            experiment_accept_bar: 0.85,
            history_len: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaverickConfig {
    /// Proposals per run at neutral mood
    pub base_proposals: usize,
    /// Hard cap on hypotheses waiting in `pending`
    pub max_pending: usize,
    pub max_concurrent_tests: usize,
    /// Observation window, whichever bound is reached first
    pub window_hours: i64,
    pub window_events: usize,
    pub min_sample: usize,
    pub min_improvement: f64,
    /// Extra margin a conservative Learning Agent demands before applying
    pub conservative_apply_margin: f64,
    /// Step tried when proposing a threshold shift
    pub threshold_step: f64,
    /// Rules at or below this accuracy are retirement candidates
    pub retire_accuracy: f64,
    pub retire_min_observations: i64,
    /// Treatment slice at neutral mood
    pub base_split_ratio: f64,
    pub mood_decay: f64,
    pub mood_boost: f64,
}

impl Default for MaverickConfig {
    fn default() -> Self {
        Self {
            base_proposals: 2,
            max_pending: 10,
            max_concurrent_tests: 3,
            window_hours: 72,
            window_events: 40,
            min_sample: 20,
            min_improvement: 0.02,
            conservative_apply_margin: 0.05,
            threshold_step: 0.05,
            retire_accuracy: 0.6,
            retire_min_observations: 10,
            base_split_ratio: 0.2,
            mood_decay: 0.1,
            mood_boost: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Bearer token → owner
    pub tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3200,
            tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Leases older than this are considered abandoned
    pub lease_ttl_secs: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { lease_ttl_secs: 900 }
    }
}

impl LoopConfig {
    /// Load from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| LoopError::InvalidInput(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: LoopConfig = toml::from_str(raw)
            .map_err(|e| LoopError::InvalidInput(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(LoopError::InvalidInput(format!("{} must be in [0, 1], got {}", name, v)))
            }
        };
        unit("vocabulary.always_ratio", self.vocabulary.always_ratio)?;
        unit("vocabulary.never_ratio", self.vocabulary.never_ratio)?;
        if self.vocabulary.never_ratio >= self.vocabulary.always_ratio {
            return Err(LoopError::InvalidInput(
                "vocabulary.never_ratio must be below always_ratio".into(),
            ));
        }
        unit("rules.alpha", self.rules.alpha)?;
        unit("rules.max_initial_confidence", self.rules.max_initial_confidence)?;
        unit("calibration.high_bar", self.calibration.high_bar)?;
        unit("calibration.medium_bar", self.calibration.medium_bar)?;
        unit("calibration.floor", self.calibration.floor)?;
        unit("calibration.partial_credit", self.calibration.partial_credit)?;
        if self.calibration.min_gap <= 0.0 || self.calibration.floor + 2.0 * self.calibration.min_gap > 1.0 {
            return Err(LoopError::InvalidInput(
                "calibration.min_gap must be positive and floor + 2 * min_gap must not exceed 1".into(),
            ));
        }
        if self.calibration.bin_count == 0 {
            return Err(LoopError::InvalidInput("calibration.bin_count must be positive".into()));
        }
        if !self.calibration.defaults.is_ordered() {
            return Err(LoopError::InvalidInput(
                "calibration.defaults must satisfy high > medium > low".into(),
            ));
        }
        if self.agent.trend_window == 0 {
            return Err(LoopError::InvalidInput("agent.trend_window must be positive".into()));
        }
        unit("maverick.base_split_ratio", self.maverick.base_split_ratio)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        LoopConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = LoopConfig::from_toml(
            r#"
            [vocabulary]
            min_observations = 10

            [server.tokens]
            "secret" = "alice"
            "#,
        )
        .unwrap();
        assert_eq!(config.vocabulary.min_observations, 10);
        assert_eq!(config.vocabulary.always_ratio, 0.9);
        assert_eq!(config.rules.min_support, 3);
        assert_eq!(config.server.tokens.get("secret").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let err = LoopConfig::from_toml("[calibration]\nhigh_bar = 1.5\n").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_floor_without_room_for_bands_rejected() {
        let err = LoopConfig::from_toml("[calibration]\nfloor = 0.95\n").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let err = LoopConfig::from_toml("[calibration]\nmin_gap = 0.0\n").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(LoopConfig::from_toml("[calibration]\nfloor = 0.8\n").is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoopConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.calibration.min_validated, 50);
    }
}
