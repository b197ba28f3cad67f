//! Maverick Agent - hypothesis engine
//!
//! Mines the ledgers for systemic changes (threshold shifts, rule
//! retirements), tests each against a control over an observation window,
//! and applies the ones that clear the bar. The state machine is strict and
//! monotonic; mood and confidence only tune how much gets proposed and how
//! large the sampled slice is.

use crate::agent::LearningAgent;
use crate::calibration;
use crate::config::{LoopConfig, MaverickConfig};
use crate::db::{self, get_json, get_opt_json, get_opt_ts, get_parsed, get_ts, OwnerLock};
use crate::error::{LoopError, Result};
use crate::ledger;
use crate::metrics;
use crate::rules;
use crate::stats::{self, AcceptancePosterior};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Named Maverick tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaverickTask {
    ChallengeDecisions,
    TestHypotheses,
    MeasureAndLearn,
    ApplyImprovements,
    SelfImprove,
}

impl MaverickTask {
    pub const ALL: [MaverickTask; 5] = [
        MaverickTask::ChallengeDecisions,
        MaverickTask::TestHypotheses,
        MaverickTask::MeasureAndLearn,
        MaverickTask::ApplyImprovements,
        MaverickTask::SelfImprove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaverickTask::ChallengeDecisions => "challenge_decisions",
            MaverickTask::TestHypotheses => "test_hypotheses",
            MaverickTask::MeasureAndLearn => "measure_and_learn",
            MaverickTask::ApplyImprovements => "apply_improvements",
            MaverickTask::SelfImprove => "self_improve",
        }
    }
}

impl FromStr for MaverickTask {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        MaverickTask::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LoopError::InvalidInput(format!("unknown maverick task: {}", s)))
    }
}

/// Soft signals and learned category weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaverickState {
    pub owner: String,
    /// [0, 1]; scales the number of proposals
    pub mood: f64,
    /// [0, 1]; scales the sampled split ratio
    pub confidence: f64,
    pub expertise: BTreeMap<HypothesisCategory, f64>,
    pub runs: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MaverickState {
    fn fresh(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            mood: 0.5,
            confidence: 0.5,
            expertise: HypothesisCategory::ALL.into_iter().map(|c| (c, 0.5)).collect(),
            runs: 0,
            updated_at: None,
        }
    }

    /// Proposals per challenge run
    pub fn proposal_cap(&self, config: &MaverickConfig) -> usize {
        ((config.base_proposals as f64) * (0.5 + self.mood)).round().max(1.0) as usize
    }

    /// Treatment slice for sampled tests
    pub fn split_ratio(&self, config: &MaverickConfig) -> f64 {
        (config.base_split_ratio * (0.5 + self.confidence)).clamp(0.05, 0.5)
    }

    fn weight(&self, category: HypothesisCategory) -> f64 {
        self.expertise.get(&category).copied().unwrap_or(0.5)
    }
}

/// A rule currently under a sampled retirement test
#[derive(Debug, Clone)]
pub struct RetireTest {
    pub hypothesis_id: String,
    pub rule_id: String,
    pub split_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalReport {
    pub proposed: Vec<Hypothesis>,
    pub candidates: usize,
    pub skipped_duplicates: usize,
    pub cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conclusion {
    pub hypothesis_id: String,
    pub status: HypothesisStatus,
    pub improvement_score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureReport {
    pub concluded: Vec<Conclusion>,
    pub still_testing: usize,
    /// Hypotheses that could not be measured this pass; they stay testing
    pub skipped: Vec<SkippedHypothesis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedHypothesis {
    pub hypothesis_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// Validated but held back by the Learning Agent's strategy
    pub held: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproveReport {
    pub mood: f64,
    pub confidence: f64,
    pub expertise: BTreeMap<HypothesisCategory, f64>,
    pub new_conclusions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MaverickReport {
    Proposed(ProposalReport),
    Started { started: Vec<String> },
    Measured(MeasureReport),
    Applied(ApplyReport),
    Improved(ImproveReport),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaverickStatus {
    pub state: MaverickState,
    pub counts: BTreeMap<String, i64>,
    pub proposal_cap: usize,
    pub split_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryInsight {
    pub category: HypothesisCategory,
    pub proposed: usize,
    pub validated: usize,
    pub rejected: usize,
    pub applied: usize,
    pub success_rate: Option<f64>,
    pub best_improvement: Option<f64>,
    pub expertise: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insights {
    pub categories: Vec<CategoryInsight>,
    pub top: Vec<Hypothesis>,
}

const HYPOTHESIS_COLUMNS: &str = "id, owner, category, description, target_metric, reasoning,
    expected_improvement, status, change_json, split_ratio, baseline_json, post_json,
    improvement_score, conclusion_reason, created_at, test_start, concluded_at, applied_at";

fn hypothesis_from_row(row: &Row) -> rusqlite::Result<Hypothesis> {
    Ok(Hypothesis {
        id: row.get(0)?,
        owner: row.get(1)?,
        category: get_parsed(row, 2)?,
        description: row.get(3)?,
        target_metric: get_parsed(row, 4)?,
        reasoning: row.get(5)?,
        expected_improvement: row.get(6)?,
        status: get_parsed(row, 7)?,
        change: get_json(row, 8)?,
        split_ratio: row.get(9)?,
        baseline_metrics: get_opt_json(row, 10)?,
        post_metrics: get_opt_json(row, 11)?,
        improvement_score: row.get(12)?,
        conclusion_reason: row.get(13)?,
        created_at: get_ts(row, 14)?,
        test_start: get_opt_ts(row, 15)?,
        concluded_at: get_opt_ts(row, 16)?,
        applied_at: get_opt_ts(row, 17)?,
    })
}

pub fn get_hypothesis(conn: &Connection, owner: &str, id: &str) -> Result<Hypothesis> {
    conn.query_row(
        &format!("SELECT {} FROM hypotheses WHERE id = ?1 AND owner = ?2", HYPOTHESIS_COLUMNS),
        params![id, owner],
        hypothesis_from_row,
    )
    .optional()?
    .ok_or_else(|| LoopError::not_found("hypothesis", id))
}

/// Hypotheses of an owner, newest first
pub fn list_hypotheses(conn: &Connection, owner: &str, status: Option<HypothesisStatus>) -> Result<Vec<Hypothesis>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM hypotheses
         WHERE owner = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, id ASC",
        HYPOTHESIS_COLUMNS
    ))?;
    let hypotheses = stmt
        .query_map(params![owner, status.map(|s| s.as_str())], hypothesis_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(hypotheses)
}

fn insert_hypothesis(conn: &Connection, h: &Hypothesis) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO hypotheses ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, NULL, NULL, NULL, ?10, NULL, NULL, NULL)",
            HYPOTHESIS_COLUMNS
        ),
        params![
            h.id,
            h.owner,
            h.category.as_str(),
            h.description,
            h.target_metric.as_str(),
            h.reasoning,
            h.expected_improvement,
            h.status.as_str(),
            serde_json::to_string(&h.change)?,
            db::ts(h.created_at),
        ],
    )?;
    Ok(())
}

/// Move a hypothesis to a terminal or concluded status in one guarded update
fn conclude(
    conn: &Connection,
    h: &Hypothesis,
    to: HypothesisStatus,
    score: Option<f64>,
    post: Option<&serde_json::Value>,
    reason: &str,
) -> Result<()> {
    if h.status.is_terminal() {
        return Err(LoopError::Conflict(format!("hypothesis {} is already {}", h.id, h.status)));
    }
    if !h.status.can_transition_to(to) {
        return Err(LoopError::InvalidTransition {
            from: h.status.to_string(),
            to: to.to_string(),
        });
    }
    let updated = conn.execute(
        "UPDATE hypotheses
         SET status = ?3, improvement_score = COALESCE(?4, improvement_score),
             post_json = COALESCE(?5, post_json), conclusion_reason = ?6, concluded_at = ?7
         WHERE id = ?1 AND owner = ?2 AND status = ?8",
        params![
            h.id,
            h.owner,
            to.as_str(),
            score,
            post.map(serde_json::to_string).transpose()?,
            reason,
            db::now_ts(),
            h.status.as_str(),
        ],
    )?;
    if updated == 0 {
        return Err(LoopError::Conflict(format!("hypothesis {} changed concurrently", h.id)));
    }
    tracing::info!(owner = %h.owner, hypothesis_id = %h.id, from = %h.status, to = %to, reason, "Hypothesis transition");
    Ok(())
}

/// Rules currently withheld on a treatment slice
pub fn active_retire_tests(conn: &Connection, owner: &str) -> Result<Vec<RetireTest>> {
    Ok(list_hypotheses(conn, owner, Some(HypothesisStatus::Testing))?
        .into_iter()
        .filter_map(|h| match h.change {
            HypothesisChange::RetireRule { rule_id } => Some(RetireTest {
                hypothesis_id: h.id,
                rule_id,
                split_ratio: h.split_ratio.unwrap_or(0.0),
            }),
            _ => None,
        })
        .collect())
}

/// Candidate change before it becomes a row
struct Candidate {
    change: HypothesisChange,
    description: String,
    reasoning: String,
    expected_improvement: f64,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Handle over one owner's Maverick agent
pub struct Maverick<'a> {
    conn: &'a Connection,
    owner: &'a str,
    config: &'a LoopConfig,
}

impl<'a> Maverick<'a> {
    pub fn new(conn: &'a Connection, owner: &'a str, config: &'a LoopConfig) -> Self {
        Self { conn, owner, config }
    }

    fn cfg(&self) -> &MaverickConfig {
        &self.config.maverick
    }

    pub fn load_state(&self) -> Result<MaverickState> {
        let state = self
            .conn
            .query_row(
                "SELECT mood, confidence, expertise_json, runs, updated_at FROM maverick_state WHERE owner = ?1",
                [self.owner],
                |row| {
                    Ok(MaverickState {
                        owner: self.owner.to_string(),
                        mood: row.get(0)?,
                        confidence: row.get(1)?,
                        expertise: get_json(row, 2)?,
                        runs: row.get(3)?,
                        updated_at: Some(get_ts(row, 4)?),
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_else(|| MaverickState::fresh(self.owner)))
    }

    fn save_state(&self, state: &MaverickState) -> Result<()> {
        self.conn.execute(
            "INSERT INTO maverick_state (owner, mood, confidence, expertise_json, runs, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(owner) DO UPDATE SET
                mood = excluded.mood,
                confidence = excluded.confidence,
                expertise_json = excluded.expertise_json,
                runs = excluded.runs,
                updated_at = excluded.updated_at",
            params![
                self.owner,
                state.mood,
                state.confidence,
                serde_json::to_string(&state.expertise)?,
                state.runs,
                db::now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn run_task(&self, task: MaverickTask) -> Result<MaverickReport> {
        match task {
            MaverickTask::ChallengeDecisions => self.challenge_decisions().map(MaverickReport::Proposed),
            MaverickTask::TestHypotheses => self
                .test_hypotheses()
                .map(|started| MaverickReport::Started { started }),
            MaverickTask::MeasureAndLearn => self.measure_and_learn().map(MaverickReport::Measured),
            MaverickTask::ApplyImprovements => self.apply_improvements().map(MaverickReport::Applied),
            MaverickTask::SelfImprove => self.self_improve().map(MaverickReport::Improved),
        }
    }

    fn threshold_candidates(&self) -> Result<Vec<Candidate>> {
        let cfg = self.cfg();
        let cal = &self.config.calibration;
        let thresholds = calibration::get_thresholds(self.conn, self.owner, &cal.defaults)?;
        let outcomes = ledger::list_validated(self.conn, self.owner, None)?;
        let rate = |lo: f64, hi: f64| {
            let slice: Vec<_> = outcomes
                .iter()
                .filter(|o| o.confidence >= lo && o.confidence < hi)
                .cloned()
                .collect();
            (metrics::acceptance_rate(&slice, cal.partial_credit), slice.len())
        };

        let high = thresholds.high;
        let (control, control_n) = rate(high, f64::INFINITY);
        let mut candidates = Vec::new();

        // Automated band misses the bar: try raising
        let raised = round4(high + cfg.threshold_step);
        if let Some(control) = control {
            if control_n >= cal.min_bin_samples && control < cal.high_bar && raised < 1.0 {
                let (above, _) = rate(raised, f64::INFINITY);
                candidates.push(Candidate {
                    change: HypothesisChange::ThresholdShift {
                        current_high: high,
                        candidate_high: raised,
                    },
                    description: format!("Raise high threshold from {:.2} to {:.2}", high, raised),
                    reasoning: format!(
                        "Decisions at or above {:.2} were accepted {:.0}% of the time ({} samples), below the {:.0}% bar",
                        high,
                        control * 100.0,
                        control_n,
                        cal.high_bar * 100.0
                    ),
                    expected_improvement: above.map_or(cal.high_bar - control, |a| a - control).max(0.0),
                });
            }
        }

        // Band just under the threshold is already reliable: try lowering
        let lowered = round4(high - cfg.threshold_step);
        let (band, band_n) = rate(lowered, high);
        if let Some(band) = band {
            if band_n >= cal.min_bin_samples && band >= cal.high_bar && lowered > thresholds.medium {
                candidates.push(Candidate {
                    change: HypothesisChange::ThresholdShift {
                        current_high: high,
                        candidate_high: lowered,
                    },
                    description: format!("Lower high threshold from {:.2} to {:.2}", high, lowered),
                    reasoning: format!(
                        "Decisions in [{:.2}, {:.2}) were accepted {:.0}% of the time ({} samples)",
                        lowered,
                        high,
                        band * 100.0,
                        band_n
                    ),
                    expected_improvement: control.map_or(0.0, |c| (band - c).max(0.0)),
                });
            }
        }
        Ok(candidates)
    }

    fn retire_candidates(&self) -> Result<Vec<Candidate>> {
        let cfg = self.cfg();
        Ok(rules::list_rules(self.conn, self.owner, None, false)?
            .into_iter()
            .filter_map(|rule| {
                let observations = rule.times_applied + rule.times_overridden;
                let accuracy = rule.accuracy()?;
                (observations >= cfg.retire_min_observations && accuracy <= cfg.retire_accuracy).then(|| Candidate {
                    description: format!(
                        "Retire rule {} ({} → {:?})",
                        rule.id, rule.condition.original_value, rule.action
                    ),
                    reasoning: format!(
                        "Accuracy {:.0}% over {} applications and overrides",
                        accuracy * 100.0,
                        observations
                    ),
                    expected_improvement: 1.0 - accuracy,
                    change: HypothesisChange::RetireRule { rule_id: rule.id },
                })
            })
            .collect())
    }

    /// Propose new hypotheses
    pub fn challenge_decisions(&self) -> Result<ProposalReport> {
        let cfg = self.cfg();
        let state = self.load_state()?;
        let cap = state.proposal_cap(cfg);

        let mut candidates = self.threshold_candidates()?;
        candidates.extend(self.retire_candidates()?);
        candidates.sort_by(|a, b| {
            state
                .weight(b.change.category())
                .total_cmp(&state.weight(a.change.category()))
                .then(b.expected_improvement.total_cmp(&a.expected_improvement))
        });

        let mut open = list_hypotheses(self.conn, self.owner, Some(HypothesisStatus::Pending))?;
        let pending_count = open.len();
        open.extend(list_hypotheses(self.conn, self.owner, Some(HypothesisStatus::Testing))?);
        let room = cfg.max_pending.saturating_sub(pending_count).min(cap);

        let mut report = ProposalReport {
            proposed: Vec::new(),
            candidates: candidates.len(),
            skipped_duplicates: 0,
            cap,
        };
        for candidate in candidates {
            if report.proposed.len() >= room {
                break;
            }
            let duplicate = open.iter().any(|h| h.change.same_target(&candidate.change))
                || report.proposed.iter().any(|h| h.change.same_target(&candidate.change));
            if duplicate {
                report.skipped_duplicates += 1;
                continue;
            }
            let category = candidate.change.category();
            let h = Hypothesis {
                id: Uuid::new_v4().to_string(),
                owner: self.owner.to_string(),
                category,
                description: candidate.description,
                target_metric: category.target_metric(),
                reasoning: candidate.reasoning,
                expected_improvement: candidate.expected_improvement,
                status: HypothesisStatus::Pending,
                change: candidate.change,
                split_ratio: None,
                baseline_metrics: None,
                post_metrics: None,
                improvement_score: None,
                conclusion_reason: None,
                created_at: Utc::now(),
                test_start: None,
                concluded_at: None,
                applied_at: None,
            };
            insert_hypothesis(self.conn, &h)?;
            tracing::info!(owner = self.owner, hypothesis_id = %h.id, category = category.as_str(), "Hypothesis proposed");
            report.proposed.push(h);
        }
        Ok(report)
    }

    fn baseline(&self, change: &HypothesisChange) -> Result<MetricSnapshot> {
        match change {
            HypothesisChange::ThresholdShift { .. } => {
                let cal = &self.config.calibration;
                let high = calibration::get_thresholds(self.conn, self.owner, &cal.defaults)?.high;
                let automated: Vec<_> = ledger::list_validated(self.conn, self.owner, None)?
                    .into_iter()
                    .filter(|o| o.confidence >= high)
                    .collect();
                Ok(MetricSnapshot {
                    value: metrics::acceptance_rate(&automated, cal.partial_credit).unwrap_or(0.0),
                    sample_size: automated.len(),
                })
            }
            HypothesisChange::RetireRule { rule_id } => {
                let rule = rules::get_rule(self.conn, self.owner, rule_id)?;
                Ok(MetricSnapshot {
                    value: rule.accuracy().map_or(0.0, |a| 1.0 - a),
                    sample_size: (rule.times_applied + rule.times_overridden) as usize,
                })
            }
        }
    }

    /// Start tests for pending hypotheses, up to the concurrency cap
    pub fn test_hypotheses(&self) -> Result<Vec<String>> {
        let cfg = self.cfg();
        let state = self.load_state()?;
        let testing = list_hypotheses(self.conn, self.owner, Some(HypothesisStatus::Testing))?.len();
        let slots = cfg.max_concurrent_tests.saturating_sub(testing);

        let mut pending = list_hypotheses(self.conn, self.owner, Some(HypothesisStatus::Pending))?;
        pending.reverse();

        let mut started = Vec::new();
        for h in pending.into_iter().take(slots) {
            let baseline = self.baseline(&h.change)?;
            let split = match h.category.test_policy() {
                TestPolicy::Sampled => Some(state.split_ratio(cfg)),
                TestPolicy::Shadow => None,
            };
            let updated = self.conn.execute(
                "UPDATE hypotheses SET status = 'testing', test_start = ?3, baseline_json = ?4, split_ratio = ?5
                 WHERE id = ?1 AND owner = ?2 AND status = 'pending'",
                params![h.id, self.owner, db::now_ts(), serde_json::to_string(&baseline)?, split],
            )?;
            if updated == 1 {
                tracing::info!(owner = self.owner, hypothesis_id = %h.id, "Hypothesis test started");
                started.push(h.id);
            }
        }
        Ok(started)
    }

    /// Evaluate one testing hypothesis over its window so far
    fn measure(&self, h: &Hypothesis, test_start: DateTime<Utc>) -> Result<Measurement> {
        let credit = self.config.calibration.partial_credit;
        let window = ledger::list_validated_decisions_since(self.conn, self.owner, test_start)?;

        match &h.change {
            HypothesisChange::ThresholdShift {
                current_high,
                candidate_high,
            } => {
                let floor = current_high.min(*candidate_high);
                let considered: Vec<&AiDecision> = window.iter().filter(|d| d.confidence >= floor).collect();
                let arm = |threshold: f64| {
                    let mut posterior = AcceptancePosterior::default();
                    let mut n = 0usize;
                    for d in considered.iter().filter(|d| d.confidence >= threshold) {
                        if let Some(r) = d.validation_result {
                            posterior.update_partial(r.credit(credit));
                            n += 1;
                        }
                    }
                    (posterior, n)
                };
                let (control, control_n) = arm(*current_high);
                let (candidate, candidate_n) = arm(*candidate_high);
                let control_rate = rate_of(&control, control_n);
                let candidate_rate = rate_of(&candidate, candidate_n);
                Ok(Measurement {
                    events: window.len(),
                    sample: considered.len(),
                    score: h.target_metric.improvement(control_rate, candidate_rate),
                    post: json!({
                        "control": {"value": control_rate, "sample_size": control_n},
                        "treatment": {
                            "value": candidate_rate,
                            "sample_size": candidate_n,
                            "credible_interval": candidate.credible_interval_95(),
                        },
                        "events": window.len(),
                    }),
                })
            }
            HypothesisChange::RetireRule { rule_id } => {
                let rule = rules::get_rule(self.conn, self.owner, rule_id)?;
                let split = h.split_ratio.unwrap_or(0.0);
                let mut control = AcceptancePosterior::default();
                let mut treatment = AcceptancePosterior::default();
                let (mut control_n, mut treatment_n) = (0usize, 0usize);

                for d in &window {
                    let Some(result) = d.validation_result else {
                        continue;
                    };
                    // Posteriors track the bad-outcome rate here
                    let bad = if result == ValidationResult::Accepted { 0.0 } else { 1.0 };
                    if d.rule_id.as_deref() == Some(rule_id.as_str()) {
                        control.update_partial(bad);
                        control_n += 1;
                    } else if d.rule_id.is_none()
                        && d.signature().is_some_and(|sig| rule.condition.matches(&sig))
                        && stats::in_slice(&h.id, &d.id, split)
                    {
                        treatment.update_partial(bad);
                        treatment_n += 1;
                    }
                }
                let control_rate = rate_of(&control, control_n);
                let treatment_rate = rate_of(&treatment, treatment_n);
                let sample = if control_n == 0 || treatment_n == 0 { 0 } else { control_n + treatment_n };
                Ok(Measurement {
                    events: control_n + treatment_n,
                    sample,
                    score: h.target_metric.improvement(control_rate, treatment_rate),
                    post: json!({
                        "control": {"value": control_rate, "sample_size": control_n},
                        "treatment": {
                            "value": treatment_rate,
                            "sample_size": treatment_n,
                            "credible_interval": treatment.credible_interval_95(),
                        },
                        "split_ratio": split,
                    }),
                })
            }
        }
    }

    /// Conclude every testing hypothesis whose window is complete
    pub fn measure_and_learn(&self) -> Result<MeasureReport> {
        let mut report = MeasureReport {
            concluded: Vec::new(),
            still_testing: 0,
            skipped: Vec::new(),
        };

        for h in list_hypotheses(self.conn, self.owner, Some(HypothesisStatus::Testing))? {
            let Some(test_start) = h.test_start else {
                continue;
            };
            match self.measure_one(&h, test_start) {
                Ok(Some(conclusion)) => report.concluded.push(conclusion),
                Ok(None) => report.still_testing += 1,
                Err(e @ LoopError::Storage(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(owner = self.owner, hypothesis_id = %h.id, error = %e, "Skipping hypothesis measurement");
                    report.skipped.push(SkippedHypothesis {
                        hypothesis_id: h.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Measure one testing hypothesis and conclude it once its window is complete
    fn measure_one(&self, h: &Hypothesis, test_start: DateTime<Utc>) -> Result<Option<Conclusion>> {
        let cfg = self.cfg();
        let measurement = self.measure(h, test_start)?;
        let elapsed_hours = (Utc::now() - test_start).num_hours();
        if elapsed_hours < cfg.window_hours && measurement.events < cfg.window_events {
            return Ok(None);
        }

        let (status, reason) = if measurement.sample < cfg.min_sample {
            (
                HypothesisStatus::Rejected,
                format!("insufficient sample: {} < {}", measurement.sample, cfg.min_sample),
            )
        } else if measurement.score < cfg.min_improvement {
            (
                HypothesisStatus::Rejected,
                format!("improvement {:.4} below {:.4}", measurement.score, cfg.min_improvement),
            )
        } else {
            (
                HypothesisStatus::Validated,
                format!("improvement {:.4} over {} samples", measurement.score, measurement.sample),
            )
        };

        let tx = self.conn.unchecked_transaction()?;
        conclude(&tx, h, status, Some(measurement.score), Some(&measurement.post), &reason)?;
        tx.commit()?;

        Ok(Some(Conclusion {
            hypothesis_id: h.id.clone(),
            status,
            improvement_score: measurement.score,
            reason,
        }))
    }

    fn apply_change(&self, h: &Hypothesis) -> Result<()> {
        if h.status != HypothesisStatus::Validated {
            return Err(LoopError::Conflict(format!(
                "hypothesis {} is {}, only validated hypotheses can be applied",
                h.id, h.status
            )));
        }
        let tx = self.conn.unchecked_transaction()?;
        match &h.change {
            HypothesisChange::ThresholdShift { candidate_high, .. } => {
                calibration::shift_high(
                    &tx,
                    self.owner,
                    *candidate_high,
                    &format!("hypothesis:{}", h.id),
                    &self.config.calibration.defaults,
                )?;
            }
            HypothesisChange::RetireRule { rule_id } => {
                rules::deactivate_rule(&tx, self.owner, rule_id)?;
            }
        }
        let updated = tx.execute(
            "UPDATE hypotheses SET status = 'applied', applied_at = ?3
             WHERE id = ?1 AND owner = ?2 AND status = 'validated'",
            params![h.id, self.owner, db::now_ts()],
        )?;
        if updated == 0 {
            return Err(LoopError::Conflict(format!("hypothesis {} changed concurrently", h.id)));
        }
        tx.commit()?;
        tracing::info!(owner = self.owner, hypothesis_id = %h.id, "Hypothesis applied");
        Ok(())
    }

    /// Apply one hypothesis explicitly
    pub fn apply_hypothesis(&self, id: &str) -> Result<Hypothesis> {
        let _lock = OwnerLock::acquire(self.conn, self.owner, "maverick_apply", self.config.locks.lease_ttl_secs)?;
        let h = get_hypothesis(self.conn, self.owner, id)?;
        self.apply_change(&h)?;
        get_hypothesis(self.conn, self.owner, id)
    }

    /// Apply validated hypotheses the Learning Agent's strategy allows
    pub fn apply_improvements(&self) -> Result<ApplyReport> {
        let cfg = self.cfg();
        let _lock = OwnerLock::acquire(self.conn, self.owner, "maverick_apply", self.config.locks.lease_ttl_secs)?;
        let strategy = LearningAgent::new(self.conn, self.owner, self.config).load_state()?.strategy;
        let margin = match strategy {
            Strategy::Conservative => cfg.conservative_apply_margin,
            _ => 0.0,
        };

        let mut report = ApplyReport {
            applied: Vec::new(),
            held: Vec::new(),
            failed: Vec::new(),
        };
        for h in list_hypotheses(self.conn, self.owner, Some(HypothesisStatus::Validated))? {
            let score = h.improvement_score.unwrap_or(0.0);
            if score < cfg.min_improvement + margin {
                report.held.push(h.id);
                continue;
            }
            match self.apply_change(&h) {
                Ok(()) => report.applied.push(h.id),
                Err(e @ LoopError::Storage(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(owner = self.owner, hypothesis_id = %h.id, error = %e, "Hypothesis could not be applied");
                    report.failed.push((h.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Withdraw a pending or testing hypothesis
    pub fn abandon_hypothesis(&self, id: &str, reason: &str) -> Result<Hypothesis> {
        let h = get_hypothesis(self.conn, self.owner, id)?;
        if !matches!(h.status, HypothesisStatus::Pending | HypothesisStatus::Testing) {
            return Err(LoopError::InvalidTransition {
                from: h.status.to_string(),
                to: HypothesisStatus::Rejected.to_string(),
            });
        }
        conclude(self.conn, &h, HypothesisStatus::Rejected, None, None, &format!("abandoned: {}", reason))?;
        get_hypothesis(self.conn, self.owner, id)
    }

    /// Rebuild expertise weights and move mood/confidence
    pub fn self_improve(&self) -> Result<ImproveReport> {
        let cfg = self.cfg();
        let mut state = self.load_state()?;
        let all = list_hypotheses(self.conn, self.owner, None)?;

        for category in HypothesisCategory::ALL {
            let concluded: Vec<&Hypothesis> = all
                .iter()
                .filter(|h| h.category == category && h.concluded_at.is_some())
                .collect();
            let successes = concluded
                .iter()
                .filter(|h| matches!(h.status, HypothesisStatus::Validated | HypothesisStatus::Applied))
                .count();
            // Laplace-smoothed success rate
            let weight = (successes as f64 + 1.0) / (concluded.len() as f64 + 2.0);
            state.expertise.insert(category, weight);
        }

        let since = state.updated_at;
        let fresh: Vec<&Hypothesis> = all
            .iter()
            .filter(|h| match (h.concluded_at, since) {
                (Some(at), Some(since)) => at > since,
                (Some(_), None) => true,
                _ => false,
            })
            .collect();
        for h in &fresh {
            if matches!(h.status, HypothesisStatus::Validated | HypothesisStatus::Applied) {
                state.mood += cfg.mood_boost;
                state.confidence += cfg.mood_boost / 2.0;
            } else {
                state.mood -= cfg.mood_decay;
                state.confidence -= cfg.mood_decay / 2.0;
            }
        }
        state.mood = state.mood.clamp(0.0, 1.0);
        state.confidence = state.confidence.clamp(0.0, 1.0);
        state.runs += 1;
        self.save_state(&state)?;

        Ok(ImproveReport {
            mood: state.mood,
            confidence: state.confidence,
            expertise: state.expertise,
            new_conclusions: fresh.len(),
        })
    }

    pub fn status(&self) -> Result<MaverickStatus> {
        let state = self.load_state()?;
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM hypotheses WHERE owner = ?1 GROUP BY status")?;
        let counts = stmt
            .query_map([self.owner], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
        Ok(MaverickStatus {
            proposal_cap: state.proposal_cap(self.cfg()),
            split_ratio: state.split_ratio(self.cfg()),
            state,
            counts,
        })
    }

    /// Per-category track record and the best concluded hypotheses
    pub fn insights(&self) -> Result<Insights> {
        let state = self.load_state()?;
        let all = list_hypotheses(self.conn, self.owner, None)?;

        let categories = HypothesisCategory::ALL
            .into_iter()
            .map(|category| {
                let of: Vec<&Hypothesis> = all.iter().filter(|h| h.category == category).collect();
                let count = |s: HypothesisStatus| of.iter().filter(|h| h.status == s).count();
                let validated = count(HypothesisStatus::Validated);
                let applied = count(HypothesisStatus::Applied);
                let rejected = count(HypothesisStatus::Rejected);
                let concluded = validated + applied + rejected;
                CategoryInsight {
                    category,
                    proposed: of.len(),
                    validated,
                    rejected,
                    applied,
                    success_rate: (concluded > 0).then(|| (validated + applied) as f64 / concluded as f64),
                    best_improvement: of
                        .iter()
                        .filter_map(|h| h.improvement_score)
                        .max_by(|a, b| a.total_cmp(b)),
                    expertise: state.weight(category),
                }
            })
            .collect();

        let mut top: Vec<Hypothesis> = all
            .into_iter()
            .filter(|h| matches!(h.status, HypothesisStatus::Validated | HypothesisStatus::Applied))
            .collect();
        top.sort_by(|a, b| {
            b.improvement_score
                .unwrap_or(0.0)
                .total_cmp(&a.improvement_score.unwrap_or(0.0))
        });
        top.truncate(3);

        Ok(Insights { categories, top })
    }
}

struct Measurement {
    events: usize,
    sample: usize,
    score: f64,
    post: serde_json::Value,
}

fn rate_of(posterior: &AcceptancePosterior, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        (posterior.alpha - 1.0) / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::cluster_record;
    use crate::ledger::{record_decision, submit_feedback, FeedbackSubmission};

    fn test_config() -> LoopConfig {
        let mut config = LoopConfig::default();
        config.maverick.window_events = 10;
        config.maverick.min_sample = 5;
        config
    }

    fn seed(conn: &Connection, confidence: f64, result: ValidationResult, n: usize) {
        for i in 0..n {
            let id = record_decision(conn, &cluster_record("alice", &format!("s{}", i), "A", confidence)).unwrap();
            let new_value = (result == ValidationResult::Partial).then(|| json!("B"));
            submit_feedback(
                conn,
                "alice",
                &FeedbackSubmission {
                    decision_id: id,
                    result,
                    new_value,
                    reasoning: None,
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn test_threshold_shift_full_lifecycle() {
        let conn = db::init_memory_db().unwrap();
        let config = test_config();
        let maverick = Maverick::new(&conn, "alice", &config);

        // Automated band at 0.85+ is unreliable below 0.90
        seed(&conn, 0.87, ValidationResult::Rejected, 4);
        seed(&conn, 0.95, ValidationResult::Accepted, 4);

        let proposals = maverick.challenge_decisions().unwrap();
        assert_eq!(proposals.proposed.len(), 1);
        let h = &proposals.proposed[0];
        assert_eq!(
            h.change,
            HypothesisChange::ThresholdShift { current_high: 0.85, candidate_high: 0.9 }
        );
        assert_eq!(h.status, HypothesisStatus::Pending);

        // Same target is never proposed twice while open
        let again = maverick.challenge_decisions().unwrap();
        assert!(again.proposed.is_empty());
        assert_eq!(again.skipped_duplicates, 1);

        assert_eq!(maverick.test_hypotheses().unwrap(), vec![h.id.clone()]);
        let testing = get_hypothesis(&conn, "alice", &h.id).unwrap();
        assert_eq!(testing.status, HypothesisStatus::Testing);
        assert!(testing.test_start.is_some());
        assert_eq!(testing.baseline_metrics.unwrap().sample_size, 8);

        // Window not complete yet
        assert_eq!(maverick.measure_and_learn().unwrap().still_testing, 1);

        seed(&conn, 0.87, ValidationResult::Rejected, 5);
        seed(&conn, 0.95, ValidationResult::Accepted, 5);
        let measured = maverick.measure_and_learn().unwrap();
        assert_eq!(measured.concluded.len(), 1);
        assert_eq!(measured.concluded[0].status, HypothesisStatus::Validated);
        assert!((measured.concluded[0].improvement_score - 0.5).abs() < 1e-9);

        // Conservative agent demands the extra margin; 0.5 clears it
        let applied = maverick.apply_improvements().unwrap();
        assert_eq!(applied.applied, vec![h.id.clone()]);
        let thresholds = calibration::get_thresholds(&conn, "alice", &config.calibration.defaults).unwrap();
        assert_eq!(thresholds.high, 0.9);
        let runs = calibration::list_calibration_runs(&conn, "alice", 5).unwrap();
        assert_eq!(runs[0].source, format!("hypothesis:{}", h.id));

        let done = get_hypothesis(&conn, "alice", &h.id).unwrap();
        assert_eq!(done.status, HypothesisStatus::Applied);
        assert!(done.applied_at.is_some());
    }

    #[test]
    fn test_small_sample_is_rejected_and_terminal() {
        let conn = db::init_memory_db().unwrap();
        let mut config = test_config();
        config.maverick.min_sample = 50;
        let maverick = Maverick::new(&conn, "alice", &config);

        seed(&conn, 0.87, ValidationResult::Rejected, 4);
        seed(&conn, 0.95, ValidationResult::Accepted, 4);
        let h = maverick.challenge_decisions().unwrap().proposed.remove(0);
        maverick.test_hypotheses().unwrap();
        seed(&conn, 0.95, ValidationResult::Accepted, 10);

        let measured = maverick.measure_and_learn().unwrap();
        assert_eq!(measured.concluded[0].status, HypothesisStatus::Rejected);
        assert!(measured.concluded[0].reason.contains("insufficient sample"));

        let err = maverick.apply_hypothesis(&h.id).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let err = maverick.abandon_hypothesis(&h.id, "late").unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        let rejected = get_hypothesis(&conn, "alice", &h.id).unwrap();
        let err = conclude(&conn, &rejected, HypothesisStatus::Validated, None, None, "again").unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // A fresh proposal for the same change is a new row
        let next = maverick.challenge_decisions().unwrap();
        assert_eq!(next.proposed.len(), 1);
        assert_ne!(next.proposed[0].id, h.id);
    }

    #[test]
    fn test_abandon_pending_hypothesis() {
        let conn = db::init_memory_db().unwrap();
        let config = test_config();
        let maverick = Maverick::new(&conn, "alice", &config);
        seed(&conn, 0.87, ValidationResult::Rejected, 4);
        let h = maverick.challenge_decisions().unwrap().proposed.remove(0);

        let abandoned = maverick.abandon_hypothesis(&h.id, "operator request").unwrap();
        assert_eq!(abandoned.status, HypothesisStatus::Rejected);
        assert_eq!(abandoned.conclusion_reason.as_deref(), Some("abandoned: operator request"));
        assert_eq!(
            maverick.abandon_hypothesis("missing", "x").unwrap_err().kind(),
            "not_found"
        );
    }

    #[test]
    fn test_unmeasurable_hypothesis_does_not_block_others() {
        let conn = db::init_memory_db().unwrap();
        let config = test_config();
        let maverick = Maverick::new(&conn, "alice", &config);

        seed(&conn, 0.87, ValidationResult::Rejected, 4);
        seed(&conn, 0.95, ValidationResult::Accepted, 4);
        let threshold = maverick.challenge_decisions().unwrap().proposed.remove(0);
        maverick.test_hypotheses().unwrap();

        // A retire test whose rule no longer exists
        let orphan = Hypothesis {
            id: Uuid::new_v4().to_string(),
            owner: "alice".into(),
            category: HypothesisCategory::RetireRule,
            description: "retire a vanished rule".into(),
            target_metric: TargetMetric::OverrideRate,
            reasoning: "test".into(),
            expected_improvement: 0.1,
            status: HypothesisStatus::Pending,
            change: HypothesisChange::RetireRule { rule_id: "gone".into() },
            split_ratio: None,
            baseline_metrics: None,
            post_metrics: None,
            improvement_score: None,
            conclusion_reason: None,
            created_at: Utc::now(),
            test_start: None,
            concluded_at: None,
            applied_at: None,
        };
        insert_hypothesis(&conn, &orphan).unwrap();
        conn.execute(
            "UPDATE hypotheses SET status = 'testing', split_ratio = 0.1, test_start = ?2 WHERE id = ?1",
            params![orphan.id, db::now_ts()],
        )
        .unwrap();

        seed(&conn, 0.87, ValidationResult::Rejected, 5);
        seed(&conn, 0.95, ValidationResult::Accepted, 5);
        let measured = maverick.measure_and_learn().unwrap();
        assert_eq!(measured.concluded.len(), 1);
        assert_eq!(measured.concluded[0].hypothesis_id, threshold.id);
        assert_eq!(measured.skipped.len(), 1);
        assert_eq!(measured.skipped[0].hypothesis_id, orphan.id);
        assert_eq!(
            get_hypothesis(&conn, "alice", &orphan.id).unwrap().status,
            HypothesisStatus::Testing
        );
    }

    #[test]
    fn test_retire_rule_proposed_for_inaccurate_rule() {
        let conn = db::init_memory_db().unwrap();
        let config = test_config();
        let rule = rules::insert_rule(
            &conn,
            "alice",
            RuleCondition {
                decision_type: DecisionType::ClusterAssignment,
                knowledge_base: None,
                original_value: "Misc".into(),
            },
            RuleAction::Suppress,
            0.6,
            3,
        )
        .unwrap();
        conn.execute(
            "UPDATE rules SET times_applied = 4, times_overridden = 8 WHERE id = ?1",
            [&rule.id],
        )
        .unwrap();

        let maverick = Maverick::new(&conn, "alice", &config);
        let proposals = maverick.challenge_decisions().unwrap();
        let retire = proposals
            .proposed
            .iter()
            .find(|h| h.category == HypothesisCategory::RetireRule)
            .unwrap();
        assert_eq!(retire.target_metric, TargetMetric::OverrideRate);

        maverick.test_hypotheses().unwrap();
        let tests = active_retire_tests(&conn, "alice").unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].rule_id, rule.id);
        assert!(tests[0].split_ratio > 0.0);
    }

    #[test]
    fn test_self_improve_moves_soft_signals_within_bounds() {
        let conn = db::init_memory_db().unwrap();
        let config = test_config();
        let maverick = Maverick::new(&conn, "alice", &config);
        seed(&conn, 0.87, ValidationResult::Rejected, 4);
        let h = maverick.challenge_decisions().unwrap().proposed.remove(0);
        maverick.abandon_hypothesis(&h.id, "noise").unwrap();

        let before = maverick.load_state().unwrap();
        let report = maverick.self_improve().unwrap();
        assert_eq!(report.new_conclusions, 1);
        assert!(report.mood < before.mood);
        assert!((0.0..=1.0).contains(&report.mood));
        assert!(report.expertise[&HypothesisCategory::ThresholdShift] < 0.5);

        // Already counted conclusions do not move mood again
        let again = maverick.self_improve().unwrap();
        assert_eq!(again.new_conclusions, 0);
        assert_eq!(again.mood, report.mood);

        let insights = maverick.insights().unwrap();
        let shift = insights
            .categories
            .iter()
            .find(|c| c.category == HypothesisCategory::ThresholdShift)
            .unwrap();
        assert_eq!(shift.rejected, 1);
        assert_eq!(shift.success_rate, Some(0.0));
    }
}
