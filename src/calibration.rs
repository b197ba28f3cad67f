//! Confidence Calibrator
//!
//! Recomputes an owner's high/medium/low thresholds from the acceptance
//! rates of validated decisions, bucketed by the confidence the producer
//! reported. The triple is replaced wholesale and audited.

use crate::config::{CalibrationConfig, LoopConfig};
use crate::db::{self, get_json, get_ts, OwnerLock};
use crate::error::{LoopError, Result};
use crate::ledger::{self, ValidatedOutcome};
use crate::metrics;
use crate::stats::AcceptancePosterior;
use crate::types::ConfidenceThresholds;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One fixed-width confidence bin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    /// Credit-weighted acceptance; `None` for empty bins
    pub acceptance: Option<f64>,
    pub credible_interval: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub owner: String,
    pub old_thresholds: ConfidenceThresholds,
    pub new_thresholds: ConfidenceThresholds,
    pub bins: Vec<CalibrationBin>,
    pub sample_count: usize,
    pub calibrated_at: DateTime<Utc>,
}

/// Audit row for any threshold change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRun {
    pub id: String,
    pub old_thresholds: ConfidenceThresholds,
    pub new_thresholds: ConfidenceThresholds,
    pub sample_count: i64,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Current thresholds; owners never calibrated read the defaults
pub fn get_thresholds(conn: &Connection, owner: &str, defaults: &ConfidenceThresholds) -> Result<ConfidenceThresholds> {
    let stored = conn
        .query_row(
            "SELECT high, medium, low FROM thresholds WHERE owner = ?1",
            [owner],
            |row| {
                Ok(ConfidenceThresholds {
                    high: row.get(0)?,
                    medium: row.get(1)?,
                    low: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(stored.unwrap_or(*defaults))
}

fn write_thresholds(
    conn: &Connection,
    owner: &str,
    old: &ConfidenceThresholds,
    new: &ConfidenceThresholds,
    bins: &[CalibrationBin],
    sample_count: usize,
    source: &str,
) -> Result<()> {
    if !new.is_ordered() {
        return Err(LoopError::Conflict(format!(
            "thresholds must satisfy high > medium > low, got {:.3} / {:.3} / {:.3}",
            new.high, new.medium, new.low
        )));
    }
    let now = db::now_ts();
    conn.execute(
        r#"
        INSERT INTO thresholds (owner, high, medium, low, sample_count, calibrated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(owner) DO UPDATE SET
            high = excluded.high,
            medium = excluded.medium,
            low = excluded.low,
            sample_count = excluded.sample_count,
            calibrated_at = excluded.calibrated_at
        "#,
        params![owner, new.high, new.medium, new.low, sample_count as i64, now],
    )?;
    conn.execute(
        "INSERT INTO calibration_runs (id, owner, old_json, new_json, bins_json, sample_count, source, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Uuid::new_v4().to_string(),
            owner,
            serde_json::to_string(old)?,
            serde_json::to_string(new)?,
            serde_json::to_string(bins)?,
            sample_count as i64,
            source,
            now,
        ],
    )?;
    metrics::set_profile_threshold(conn, owner, new.high)?;
    Ok(())
}

/// Bucket validated decisions into `bin_count` fixed-width bins
pub fn build_bins(outcomes: &[ValidatedOutcome], config: &CalibrationConfig) -> Vec<CalibrationBin> {
    let n = config.bin_count.max(1);
    let width = 1.0 / n as f64;
    let mut posteriors = vec![AcceptancePosterior::default(); n];
    let mut counts = vec![0usize; n];

    for outcome in outcomes {
        let idx = ((outcome.confidence * n as f64).floor() as usize).min(n - 1);
        counts[idx] += 1;
        posteriors[idx].update_partial(outcome.result.credit(config.partial_credit));
    }

    (0..n)
        .map(|i| {
            let count = counts[i];
            let posterior = posteriors[i];
            CalibrationBin {
                lower: i as f64 * width,
                upper: (i + 1) as f64 * width,
                count,
                acceptance: (count > 0).then(|| (posterior.alpha - 1.0) / count as f64),
                credible_interval: (count > 0).then(|| posterior.credible_interval_95()),
            }
        })
        .collect()
}

/// Lower edge of the lowest bin of the top run whose cumulative acceptance meets `bar`
fn walk_from_top(bins: &[CalibrationBin], bar: f64, min_samples: usize) -> Option<f64> {
    let mut credit = 0.0;
    let mut count = 0usize;
    let mut edge = None;

    for bin in bins.iter().rev() {
        let Some(acceptance) = bin.acceptance else {
            continue;
        };
        credit += acceptance * bin.count as f64;
        count += bin.count;
        if bin.count < min_samples {
            // Sparse bins fold into the run but neither extend nor end it
            continue;
        }
        if credit / count as f64 >= bar {
            edge = Some(bin.lower);
        } else {
            break;
        }
    }
    edge
}

/// Thresholds implied by a bin table, normalized to a strict ordering
pub fn derive_thresholds(bins: &[CalibrationBin], config: &CalibrationConfig) -> ConfidenceThresholds {
    // Keep room for three ordered bands under 1.0 whatever the config says
    let gap = config.min_gap.clamp(0.01, 0.3);
    let low = config.floor.clamp(0.0, 1.0 - 2.0 * gap);

    let high = walk_from_top(bins, config.high_bar, config.min_bin_samples).unwrap_or(1.0);
    let medium = walk_from_top(bins, config.medium_bar, config.min_bin_samples).unwrap_or(high);

    let high = high.clamp(low + 2.0 * gap, 1.0);
    let medium = medium.clamp(low + gap, high - gap);

    ConfidenceThresholds {
        high: round4(high),
        medium: round4(medium),
        low: round4(low),
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Recompute and replace an owner's thresholds
pub fn calibrate_thresholds(conn: &Connection, owner: &str, config: &LoopConfig) -> Result<CalibrationReport> {
    let _lock = OwnerLock::acquire(conn, owner, "calibration", config.locks.lease_ttl_secs)?;
    let cal = &config.calibration;

    let outcomes = ledger::list_validated(conn, owner, None)?;
    if outcomes.len() < cal.min_validated {
        return Err(LoopError::InsufficientData {
            operation: "calibration",
            needed: cal.min_validated,
            available: outcomes.len(),
        });
    }

    let old = get_thresholds(conn, owner, &cal.defaults)?;
    let bins = build_bins(&outcomes, cal);
    let new = derive_thresholds(&bins, cal);

    let tx = conn.unchecked_transaction()?;
    write_thresholds(&tx, owner, &old, &new, &bins, outcomes.len(), "calibration")?;
    tx.commit()?;

    tracing::info!(
        owner,
        samples = outcomes.len(),
        high = new.high,
        medium = new.medium,
        low = new.low,
        "Recalibrated thresholds"
    );

    Ok(CalibrationReport {
        owner: owner.to_string(),
        old_thresholds: old,
        new_thresholds: new,
        bins,
        sample_count: outcomes.len(),
        calibrated_at: Utc::now(),
    })
}

/// Move only the `high` threshold (hypothesis application)
///
/// The caller holds the owner lease. Fails with conflict when the result
/// would break `high > medium > low`.
pub(crate) fn shift_high(
    conn: &Connection,
    owner: &str,
    candidate_high: f64,
    source: &str,
    defaults: &ConfidenceThresholds,
) -> Result<ConfidenceThresholds> {
    let old = get_thresholds(conn, owner, defaults)?;
    let new = ConfidenceThresholds {
        high: candidate_high,
        ..old
    };
    write_thresholds(conn, owner, &old, &new, &[], 0, source)?;
    tracing::info!(owner, old_high = old.high, new_high = new.high, source, "Shifted high threshold");
    Ok(new)
}

/// Threshold change history, newest first
pub fn list_calibration_runs(conn: &Connection, owner: &str, limit: usize) -> Result<Vec<CalibrationRun>> {
    let mut stmt = conn.prepare(
        "SELECT id, old_json, new_json, sample_count, source, created_at
         FROM calibration_runs WHERE owner = ?1
         ORDER BY created_at DESC LIMIT ?2",
    )?;
    let runs = stmt
        .query_map(params![owner, limit as i64], |row| {
            Ok(CalibrationRun {
                id: row.get(0)?,
                old_thresholds: get_json(row, 1)?,
                new_thresholds: get_json(row, 2)?,
                sample_count: row.get(3)?,
                source: row.get(4)?,
                created_at: get_ts(row, 5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{record_decision, submit_feedback, DecisionRecord, FeedbackSubmission};
    use crate::types::{DecisionType, Scope, ValidationResult};
    use serde_json::json;

    fn outcome(confidence: f64, result: ValidationResult) -> ValidatedOutcome {
        ValidatedOutcome {
            decision_id: Uuid::new_v4().to_string(),
            decision_type: DecisionType::ClusterAssignment,
            document_id: None,
            confidence,
            result,
            validated_at: Utc::now(),
            rule_id: None,
            supersedes: None,
            rule_state: None,
        }
    }

    fn seed(conn: &Connection, owner: &str, confidence: f64, result: ValidationResult) {
        let id = record_decision(
            conn,
            &DecisionRecord {
                decision_type: DecisionType::ClusterAssignment,
                scope: Scope::owner(owner),
                input_snapshot: json!({}),
                output_snapshot: json!({"cluster": "A"}),
                confidence,
                model_identity: "m".into(),
            },
        )
        .unwrap();
        let new_value = (result == ValidationResult::Partial).then(|| json!("B"));
        submit_feedback(
            conn,
            owner,
            &FeedbackSubmission {
                decision_id: id,
                result,
                new_value,
                reasoning: None,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_bins_are_fixed_width_and_credit_partials() {
        let config = CalibrationConfig::default();
        let outcomes = vec![
            outcome(0.95, ValidationResult::Accepted),
            outcome(0.97, ValidationResult::Partial),
            outcome(1.0, ValidationResult::Rejected),
            outcome(0.05, ValidationResult::Accepted),
        ];
        let bins = build_bins(&outcomes, &config);
        assert_eq!(bins.len(), 10);
        assert_eq!(bins[9].count, 3);
        assert!((bins[9].acceptance.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(bins[0].count, 1);
        assert_eq!(bins[5].acceptance, None);
    }

    #[test]
    fn test_well_calibrated_history_sets_high_at_reliable_edge() {
        let config = CalibrationConfig::default();
        let mut outcomes = Vec::new();
        // Top three bins near-perfect, middle bins decent, bottom poor
        for bin in 0..10 {
            let conf = bin as f64 / 10.0 + 0.05;
            for i in 0..10 {
                let accepted = match bin {
                    7..=9 => true,
                    5..=6 => i < 6,
                    _ => i < 3,
                };
                let result = if accepted { ValidationResult::Accepted } else { ValidationResult::Rejected };
                outcomes.push(outcome(conf, result));
            }
        }
        let t = derive_thresholds(&build_bins(&outcomes, &config), &config);
        assert!((t.high - 0.7).abs() < 1e-9, "high = {}", t.high);
        assert!(t.medium < t.high && t.medium >= 0.5 - 1e-9, "medium = {}", t.medium);
        assert_eq!(t.low, 0.3);
        assert!(t.is_ordered());
    }

    #[test]
    fn test_sparse_bins_never_end_the_walk() {
        let config = CalibrationConfig::default();
        let mut outcomes = vec![outcome(0.95, ValidationResult::Rejected)];
        for _ in 0..30 {
            outcomes.push(outcome(0.85, ValidationResult::Accepted));
        }
        let t = derive_thresholds(&build_bins(&outcomes, &config), &config);
        assert!((t.high - 0.8).abs() < 1e-9, "high = {}", t.high);
    }

    #[test]
    fn test_ordering_holds_for_adversarial_histories() {
        let config = CalibrationConfig::default();
        let cases: Vec<Vec<ValidatedOutcome>> = vec![
            (0..60).map(|_| outcome(0.5, ValidationResult::Rejected)).collect(),
            (0..60).map(|_| outcome(0.99, ValidationResult::Accepted)).collect(),
            (0..60).map(|i| outcome(i as f64 / 60.0, ValidationResult::Accepted)).collect(),
            (0..60).map(|_| outcome(0.31, ValidationResult::Accepted)).collect(),
        ];
        for outcomes in cases {
            let t = derive_thresholds(&build_bins(&outcomes, &config), &config);
            assert!(t.is_ordered(), "{:?}", t);
            assert!(t.high - t.medium >= config.min_gap - 1e-9);
            assert!(t.medium - t.low >= config.min_gap - 1e-9);
            assert!(t.high <= 1.0 && t.low >= config.floor);
        }
    }

    #[test]
    fn test_floor_near_one_still_yields_ordered_thresholds() {
        let mut config = CalibrationConfig::default();
        config.floor = 0.95;
        config.min_gap = 0.05;
        let t = derive_thresholds(&[], &config);
        assert!(t.high <= 1.0 && t.high > t.medium && t.medium > t.low, "{:?}", t);
        assert!((t.low - 0.9).abs() < 1e-9);

        config.min_gap = 0.9;
        let t = derive_thresholds(&[], &config);
        assert!(t.high <= 1.0 && t.high > t.medium && t.medium > t.low, "{:?}", t);
    }

    #[test]
    fn test_calibration_refuses_below_min_validated() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        for _ in 0..5 {
            seed(&conn, "alice", 0.9, ValidationResult::Accepted);
        }
        match calibrate_thresholds(&conn, "alice", &config).unwrap_err() {
            LoopError::InsufficientData { needed, available, .. } => {
                assert_eq!((needed, available), (50, 5));
            }
            other => panic!("expected insufficient data, got {:?}", other),
        }
        assert_eq!(get_thresholds(&conn, "alice", &config.calibration.defaults).unwrap(), config.calibration.defaults);
    }

    #[test]
    fn test_calibration_replaces_and_audits() {
        let conn = db::init_memory_db().unwrap();
        let mut config = LoopConfig::default();
        config.calibration.min_validated = 20;
        for i in 0..30 {
            let conf = 0.5 + (i % 5) as f64 * 0.1;
            let result = if conf >= 0.7 { ValidationResult::Accepted } else { ValidationResult::Partial };
            seed(&conn, "alice", conf.min(0.99), result);
        }

        let report = calibrate_thresholds(&conn, "alice", &config).unwrap();
        assert_eq!(report.sample_count, 30);
        assert_eq!(report.old_thresholds, config.calibration.defaults);
        assert!(report.new_thresholds.is_ordered());

        let stored = get_thresholds(&conn, "alice", &config.calibration.defaults).unwrap();
        assert_eq!(stored, report.new_thresholds);
        let runs = list_calibration_runs(&conn, "alice", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].source, "calibration");
    }

    #[test]
    fn test_shift_high_rejects_broken_ordering() {
        let conn = db::init_memory_db().unwrap();
        let defaults = CalibrationConfig::default().defaults;
        let err = shift_high(&conn, "alice", 0.5, "hypothesis:x", &defaults).unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let t = shift_high(&conn, "alice", 0.9, "hypothesis:x", &defaults).unwrap();
        assert_eq!(t.high, 0.9);
        assert_eq!(t.medium, defaults.medium);
    }
}
