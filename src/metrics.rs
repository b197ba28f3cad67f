//! Accuracy metrics and the per-owner learning profile

use crate::calibration;
use crate::config::LoopConfig;
use crate::db::{self, get_opt_ts};
use crate::error::Result;
use crate::ledger::{self, ValidatedOutcome};
use crate::types::{ConfidenceBand, ConfidenceThresholds, DecisionType, LearningProfile};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Credit-weighted acceptance over a set of outcomes
pub fn acceptance_rate(outcomes: &[ValidatedOutcome], partial_credit: f64) -> Option<f64> {
    if outcomes.is_empty() {
        return None;
    }
    let credit: f64 = outcomes.iter().map(|o| o.result.credit(partial_credit)).sum();
    Some(credit / outcomes.len() as f64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandAccuracy {
    pub band: ConfidenceBand,
    pub count: usize,
    pub acceptance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeCounts {
    pub decision_type: DecisionType,
    pub total: i64,
    pub validated: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub partial: i64,
}

/// Recent acceptance against the window before it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trend {
    pub window: usize,
    pub recent: Option<f64>,
    pub previous: Option<f64>,
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    pub owner: String,
    pub validated_count: usize,
    pub overall_acceptance: Option<f64>,
    pub by_band: Vec<BandAccuracy>,
    pub trend: Trend,
    pub by_type: Vec<TypeCounts>,
    pub pending_count: i64,
    pub thresholds: ConfidenceThresholds,
    pub profile: LearningProfile,
}

/// Last `k` against the `k` before them; outcomes are newest first
pub fn trend(outcomes: &[ValidatedOutcome], window: usize, partial_credit: f64) -> Trend {
    let recent = &outcomes[..outcomes.len().min(window)];
    let previous = if outcomes.len() > window {
        &outcomes[window..outcomes.len().min(2 * window)]
    } else {
        &[][..]
    };
    let recent_rate = acceptance_rate(recent, partial_credit);
    let previous_rate = acceptance_rate(previous, partial_credit);
    Trend {
        window,
        recent: recent_rate,
        previous: previous_rate,
        delta: recent_rate.zip(previous_rate).map(|(r, p)| r - p),
    }
}

fn type_counts(conn: &Connection, owner: &str) -> Result<Vec<TypeCounts>> {
    let mut stmt = conn.prepare(
        "SELECT decision_type,
                COUNT(*),
                SUM(validated),
                SUM(CASE WHEN validation_result = 'accepted' THEN 1 ELSE 0 END),
                SUM(CASE WHEN validation_result = 'rejected' THEN 1 ELSE 0 END),
                SUM(CASE WHEN validation_result = 'partial' THEN 1 ELSE 0 END)
         FROM decisions WHERE owner = ?1
         GROUP BY decision_type ORDER BY decision_type",
    )?;
    let counts = stmt
        .query_map([owner], |row| {
            Ok(TypeCounts {
                decision_type: db::get_parsed(row, 0)?,
                total: row.get(1)?,
                validated: row.get(2)?,
                accepted: row.get(3)?,
                rejected: row.get(4)?,
                partial: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

pub fn accuracy_metrics(conn: &Connection, owner: &str, config: &LoopConfig) -> Result<AccuracyMetrics> {
    let credit = config.calibration.partial_credit;
    let thresholds = calibration::get_thresholds(conn, owner, &config.calibration.defaults)?;
    let outcomes = ledger::list_validated(conn, owner, None)?;

    let by_band = [ConfidenceBand::High, ConfidenceBand::Medium, ConfidenceBand::Low]
        .into_iter()
        .map(|band| {
            let in_band: Vec<ValidatedOutcome> = outcomes
                .iter()
                .filter(|o| thresholds.band(o.confidence) == band)
                .cloned()
                .collect();
            BandAccuracy {
                band,
                count: in_band.len(),
                acceptance: acceptance_rate(&in_band, credit),
            }
        })
        .collect();

    Ok(AccuracyMetrics {
        owner: owner.to_string(),
        validated_count: outcomes.len(),
        overall_acceptance: acceptance_rate(&outcomes, credit),
        by_band,
        trend: trend(&outcomes, config.agent.trend_window, credit),
        by_type: type_counts(conn, owner)?,
        pending_count: ledger::count_pending(conn, owner)?,
        thresholds,
        profile: get_profile(conn, owner, &thresholds)?,
    })
}

/// The owner's learning profile; a fresh default when none was written yet
pub fn get_profile(conn: &Connection, owner: &str, thresholds: &ConfidenceThresholds) -> Result<LearningProfile> {
    let profile = conn
        .query_row(
            "SELECT accuracy_rate, confidence_threshold, last_learning_run, total_learning_runs
             FROM learning_profiles WHERE owner = ?1",
            [owner],
            |row| {
                Ok(LearningProfile {
                    owner: owner.to_string(),
                    accuracy_rate: row.get(0)?,
                    confidence_threshold: row.get(1)?,
                    last_learning_run: get_opt_ts(row, 2)?,
                    total_learning_runs: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(profile.unwrap_or_else(|| LearningProfile {
        owner: owner.to_string(),
        accuracy_rate: None,
        confidence_threshold: thresholds.high,
        last_learning_run: None,
        total_learning_runs: 0,
    }))
}

pub(crate) fn set_profile_threshold(conn: &Connection, owner: &str, threshold: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO learning_profiles (owner, accuracy_rate, confidence_threshold, last_learning_run, total_learning_runs)
         VALUES (?1, NULL, ?2, NULL, 0)
         ON CONFLICT(owner) DO UPDATE SET confidence_threshold = excluded.confidence_threshold",
        params![owner, threshold],
    )?;
    Ok(())
}

/// Stamp a completed learning run on the profile
pub(crate) fn record_learning_run(
    conn: &Connection,
    owner: &str,
    accuracy_rate: Option<f64>,
    threshold: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO learning_profiles (owner, accuracy_rate, confidence_threshold, last_learning_run, total_learning_runs)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(owner) DO UPDATE SET
            accuracy_rate = COALESCE(excluded.accuracy_rate, learning_profiles.accuracy_rate),
            last_learning_run = excluded.last_learning_run,
            total_learning_runs = learning_profiles.total_learning_runs + 1",
        params![owner, accuracy_rate, threshold, db::now_ts()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::cluster_record;
    use crate::ledger::{record_decision, submit_feedback, FeedbackSubmission};
    use crate::types::ValidationResult;
    use chrono::Utc;

    fn outcome(result: ValidationResult) -> ValidatedOutcome {
        ValidatedOutcome {
            decision_id: "d".into(),
            decision_type: DecisionType::ClusterAssignment,
            document_id: None,
            confidence: 0.5,
            result,
            validated_at: Utc::now(),
            rule_id: None,
            supersedes: None,
            rule_state: None,
        }
    }

    #[test]
    fn test_acceptance_rate_credits_partials() {
        let outcomes = vec![
            outcome(ValidationResult::Accepted),
            outcome(ValidationResult::Partial),
            outcome(ValidationResult::Rejected),
            outcome(ValidationResult::Accepted),
        ];
        assert_eq!(acceptance_rate(&outcomes, 0.5), Some(0.625));
        assert_eq!(acceptance_rate(&[], 0.5), None);
    }

    #[test]
    fn test_trend_compares_adjacent_windows() {
        let mut outcomes: Vec<ValidatedOutcome> = (0..4).map(|_| outcome(ValidationResult::Accepted)).collect();
        outcomes.extend((0..4).map(|_| outcome(ValidationResult::Rejected)));
        let t = trend(&outcomes, 4, 0.5);
        assert_eq!(t.recent, Some(1.0));
        assert_eq!(t.previous, Some(0.0));
        assert_eq!(t.delta, Some(1.0));

        let short = trend(&outcomes[..3], 4, 0.5);
        assert_eq!(short.previous, None);
        assert_eq!(short.delta, None);
    }

    #[test]
    fn test_accuracy_metrics_summary() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let a = record_decision(&conn, &cluster_record("alice", "d1", "Misc", 0.9)).unwrap();
        record_decision(&conn, &cluster_record("alice", "d2", "Misc", 0.2)).unwrap();
        submit_feedback(
            &conn,
            "alice",
            &FeedbackSubmission {
                decision_id: a,
                result: ValidationResult::Accepted,
                new_value: None,
                reasoning: Some("fine".into()),
            },
        )
        .unwrap();

        let m = accuracy_metrics(&conn, "alice", &config).unwrap();
        assert_eq!(m.validated_count, 1);
        assert_eq!(m.overall_acceptance, Some(1.0));
        assert_eq!(m.pending_count, 1);
        assert_eq!(m.by_type.len(), 1);
        assert_eq!(m.by_type[0].total, 2);
        assert_eq!(m.by_type[0].accepted, 1);
        assert_eq!(m.by_band[0].count, 1);
        assert_eq!(m.profile.total_learning_runs, 0);
        assert_eq!(m.thresholds, config.calibration.defaults);
    }

    #[test]
    fn test_learning_run_stamps_profile() {
        let conn = db::init_memory_db().unwrap();
        let defaults = LoopConfig::default().calibration.defaults;
        record_learning_run(&conn, "alice", Some(0.8), 0.85).unwrap();
        record_learning_run(&conn, "alice", None, 0.85).unwrap();
        let profile = get_profile(&conn, "alice", &defaults).unwrap();
        assert_eq!(profile.total_learning_runs, 2);
        assert_eq!(profile.accuracy_rate, Some(0.8));
        assert!(profile.last_learning_run.is_some());
    }
}
