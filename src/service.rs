//! Engine facade for embedding the loop in another process
//!
//! Initialize once, then call per owner:
//!
//! ```rust,ignore
//! let engine = LoopEngine::open(&data_dir.join("loop.db"), LoopConfig::default())?;
//! let id = engine.record_decision(&record)?;
//! let queue = engine.pending_validations("alice", 20, 0)?;
//! engine.submit_feedback("alice", &submission)?;
//! let run = engine.run_learning("alice", None)?;
//! ```

use crate::agent::LearningAgent;
use crate::calibration::{self, CalibrationReport};
use crate::config::LoopConfig;
use crate::db;
use crate::error::Result;
use crate::learning::{self, LearningParams, LearningRunResult};
use crate::ledger::{self, DecisionRecord, FeedbackSubmission};
use crate::maverick::Maverick;
use crate::metrics::{self, AccuracyMetrics};
use crate::rules;
use crate::types::*;
use crate::vocabulary::{self, TermFilter};
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;

pub struct LoopEngine {
    conn: Connection,
    config: LoopConfig,
}

impl LoopEngine {
    pub fn open(db_path: &Path, config: LoopConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let conn = db::init_db(db_path)?;
        Ok(Self { conn, config })
    }

    pub fn in_memory(config: LoopConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            conn: db::init_memory_db()?,
            config,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn record_decision(&self, record: &DecisionRecord) -> Result<String> {
        ledger::record_decision(&self.conn, record)
    }

    pub fn get_decision(&self, owner: &str, decision_id: &str) -> Result<AiDecision> {
        ledger::get_decision(&self.conn, owner, decision_id)
    }

    pub fn pending_validations(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<ValidationPrompt>> {
        ledger::list_pending_validations(&self.conn, owner, limit, offset)
    }

    pub fn submit_feedback(&self, owner: &str, submission: &FeedbackSubmission) -> Result<UserFeedback> {
        ledger::submit_feedback(&self.conn, owner, submission)
    }

    pub fn record_free_feedback(
        &self,
        owner: &str,
        feedback_type: FeedbackType,
        original_value: Option<Value>,
        new_value: Option<Value>,
        reasoning: Option<String>,
    ) -> Result<UserFeedback> {
        ledger::record_free_feedback(&self.conn, owner, feedback_type, original_value, new_value, reasoning)
    }

    pub fn accuracy_metrics(&self, owner: &str) -> Result<AccuracyMetrics> {
        metrics::accuracy_metrics(&self.conn, owner, &self.config)
    }

    pub fn list_rules(&self, owner: &str, rule_type: Option<DecisionType>, include_inactive: bool) -> Result<Vec<LearnedRule>> {
        rules::list_rules(&self.conn, owner, rule_type, include_inactive)
    }

    pub fn deactivate_rule(&self, owner: &str, rule_id: &str) -> Result<LearnedRule> {
        rules::deactivate_rule(&self.conn, owner, rule_id)
    }

    pub fn reactivate_rule(&self, owner: &str, rule_id: &str) -> Result<LearnedRule> {
        rules::reactivate_rule(&self.conn, owner, rule_id)
    }

    pub fn list_vocabulary(&self, owner: &str, filter: TermFilter) -> Result<Vec<VocabularyTerm>> {
        vocabulary::list_vocabulary(&self.conn, owner, filter)
    }

    pub fn delete_vocabulary_term(&self, owner: &str, term_id: &str) -> Result<()> {
        vocabulary::delete_term(&self.conn, owner, term_id)
    }

    /// Learning Run; `None` uses the configured lookback and support
    pub fn run_learning(&self, owner: &str, params: Option<LearningParams>) -> Result<LearningRunResult> {
        let params = params.unwrap_or_else(|| LearningParams::from_config(&self.config.rules));
        learning::run_learning(&self.conn, owner, params, &self.config)
    }

    pub fn thresholds(&self, owner: &str) -> Result<ConfidenceThresholds> {
        calibration::get_thresholds(&self.conn, owner, &self.config.calibration.defaults)
    }

    pub fn calibrate_thresholds(&self, owner: &str) -> Result<CalibrationReport> {
        calibration::calibrate_thresholds(&self.conn, owner, &self.config)
    }

    pub fn agent<'a>(&'a self, owner: &'a str) -> LearningAgent<'a> {
        LearningAgent::new(&self.conn, owner, &self.config)
    }

    pub fn maverick<'a>(&'a self, owner: &'a str) -> Maverick<'a> {
        Maverick::new(&self.conn, owner, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::cluster_record;

    #[test]
    fn test_engine_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.db");
        let id = {
            let engine = LoopEngine::open(&path, LoopConfig::default()).unwrap();
            engine.record_decision(&cluster_record("alice", "d1", "Misc", 0.42)).unwrap()
        };

        // Reopening sees the same ledger
        let engine = LoopEngine::open(&path, LoopConfig::default()).unwrap();
        let queue = engine.pending_validations("alice", 10, 0).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].decision_id, id);
        assert!(engine.pending_validations("bob", 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = LoopConfig::default();
        config.calibration.bin_count = 0;
        assert!(LoopEngine::in_memory(config).is_err());
    }
}
