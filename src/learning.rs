//! Learning Run - folds unprocessed feedback into the rule and vocabulary stores
//!
//! This is the only routine path that mutates rules and vocabulary. It holds
//! the owner lease and runs in one transaction; each feedback item gets its
//! own savepoint so a malformed row is rolled back, reported, and left
//! unprocessed while the rest of the batch proceeds.

use crate::calibration;
use crate::config::{LoopConfig, RuleConfig};
use crate::db::OwnerLock;
use crate::error::{LoopError, Result};
use crate::ledger::{self, FeedbackRow};
use crate::metrics;
use crate::rules::{self, RuleAdjustment};
use crate::types::*;
use crate::vocabulary::{self, Observation};
use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-run knobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LearningParams {
    pub lookback_days: i64,
    pub min_support: usize,
}

impl LearningParams {
    pub fn from_config(config: &RuleConfig) -> Self {
        Self {
            lookback_days: config.lookback_days,
            min_support: config.min_support,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFeedback {
    pub feedback_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningRunResult {
    pub owner: String,
    pub rules_created: usize,
    pub rules_updated: usize,
    pub vocabulary_added: usize,
    pub vocabulary_updated: usize,
    pub feedback_processed: usize,
    pub discarded: usize,
    pub skipped_high_confidence: usize,
    pub skipped: Vec<SkippedFeedback>,
    pub recalibration_recommended: bool,
    pub adjustments: Vec<RuleAdjustment>,
}

/// How one feedback item was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Folded,
    Discarded,
    SkippedHighConfidence,
}

struct RunContext<'a> {
    owner: &'a str,
    params: LearningParams,
    config: &'a LoopConfig,
    /// Rules ignore feedback on decisions at or above this confidence
    ceiling: f64,
}

/// Run one learning pass for an owner
pub fn run_learning(
    conn: &Connection,
    owner: &str,
    params: LearningParams,
    config: &LoopConfig,
) -> Result<LearningRunResult> {
    if params.min_support == 0 {
        return Err(LoopError::InvalidInput("min_support must be at least 1".into()));
    }
    let _lock = OwnerLock::acquire(conn, owner, "learning_run", config.locks.lease_ttl_secs)?;

    let thresholds = calibration::get_thresholds(conn, owner, &config.calibration.defaults)?;
    let ctx = RunContext {
        owner,
        params,
        config,
        ceiling: config.rules.confidence_ceiling.unwrap_or(thresholds.high),
    };

    let since = Utc::now() - Duration::days(params.lookback_days.max(0));
    let rows = ledger::list_unprocessed_feedback(conn, owner, since)?;

    let mut result = LearningRunResult {
        owner: owner.to_string(),
        ..Default::default()
    };

    let tx = conn.unchecked_transaction()?;
    for row in &rows {
        tx.execute_batch("SAVEPOINT feedback_item")?;
        let mut item_result = LearningRunResult::default();
        match process_item(&tx, &ctx, row, &mut item_result) {
            Ok(outcome) => {
                tx.execute_batch("RELEASE feedback_item")?;
                merge(&mut result, item_result);
                match outcome {
                    ItemOutcome::Folded => result.feedback_processed += 1,
                    ItemOutcome::Discarded => result.discarded += 1,
                    ItemOutcome::SkippedHighConfidence => {
                        result.feedback_processed += 1;
                        result.skipped_high_confidence += 1;
                    }
                }
            }
            Err(LoopError::Storage(e)) => {
                // Storage failures abort the whole run; dropping tx rolls back
                return Err(LoopError::Storage(e));
            }
            Err(e) => {
                tx.execute_batch("ROLLBACK TO feedback_item; RELEASE feedback_item")?;
                tracing::warn!(owner, feedback_id = %row.id, error = %e, "Skipping malformed feedback");
                result.skipped.push(SkippedFeedback {
                    feedback_id: row.id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let validated = ledger::list_validated(&tx, owner, None)?;
    let accuracy = metrics::acceptance_rate(&validated, config.calibration.partial_credit);
    metrics::record_learning_run(&tx, owner, accuracy, thresholds.high)?;
    tx.commit()?;

    let changed = result.rules_created + result.rules_updated + result.vocabulary_added + result.vocabulary_updated;
    result.recalibration_recommended =
        changed > 0 && validated.len() >= config.calibration.min_validated;

    tracing::info!(
        owner,
        processed = result.feedback_processed,
        discarded = result.discarded,
        skipped = result.skipped.len(),
        rules_created = result.rules_created,
        rules_updated = result.rules_updated,
        vocabulary_added = result.vocabulary_added,
        vocabulary_updated = result.vocabulary_updated,
        "Learning run complete"
    );
    Ok(result)
}

fn merge(into: &mut LearningRunResult, item: LearningRunResult) {
    into.rules_created += item.rules_created;
    into.rules_updated += item.rules_updated;
    into.vocabulary_added += item.vocabulary_added;
    into.vocabulary_updated += item.vocabulary_updated;
    into.adjustments.extend(item.adjustments);
}

fn process_item(
    conn: &Connection,
    ctx: &RunContext,
    row: &FeedbackRow,
    result: &mut LearningRunResult,
) -> Result<ItemOutcome> {
    let feedback = ledger::parse_feedback(ctx.owner, row)?;

    // decision_id is a weak reference; a dangling one reads as free feedback
    let decision = match &feedback.decision_id {
        Some(id) => match ledger::get_decision(conn, ctx.owner, id) {
            Ok(d) => Some(d),
            Err(LoopError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };

    let outcome = match feedback.feedback_type {
        FeedbackType::ConceptCorrection => fold_concepts(conn, ctx, &feedback, result)?,
        FeedbackType::FreeText => ItemOutcome::Discarded,
        _ => fold_structural(conn, ctx, &feedback, decision.as_ref(), result)?,
    };

    let score = (!result.adjustments.is_empty())
        .then(|| result.adjustments.iter().map(|a| a.delta).sum::<f64>());
    ledger::mark_feedback_processed(conn, &feedback.id, score)?;
    Ok(outcome)
}

/// Concept lists → vocabulary kept/removed observations
fn fold_concepts(
    conn: &Connection,
    ctx: &RunContext,
    feedback: &UserFeedback,
    result: &mut LearningRunResult,
) -> Result<ItemOutcome> {
    let original = feedback.original_value.as_ref().map(value_as_list).unwrap_or_default();
    let corrected = match (&feedback.new_value, feedback.validation_result) {
        (Some(v), _) => value_as_list(v),
        (None, Some(ValidationResult::Accepted)) => original.clone(),
        (None, Some(ValidationResult::Rejected)) => Vec::new(),
        (None, Some(ValidationResult::Partial)) => {
            return Err(LoopError::InvalidInput("partial concept edit without a corrected list".into()));
        }
        (None, None) => return Ok(ItemOutcome::Discarded),
    };

    // normalized → (spelling, kept)
    let mut observed: BTreeMap<String, (String, bool)> = BTreeMap::new();
    for concept in &original {
        observed.insert(normalize_label(concept), (concept.clone(), false));
    }
    for concept in &corrected {
        observed.insert(normalize_label(concept), (concept.clone(), true));
    }
    observed.remove("");
    if observed.is_empty() {
        return Ok(ItemOutcome::Discarded);
    }

    for (spelling, kept) in observed.into_values() {
        let observation = if kept { Observation::Kept } else { Observation::Removed };
        let outcome = vocabulary::observe(conn, ctx.owner, &spelling, observation, &ctx.config.vocabulary)?;
        if outcome.created {
            result.vocabulary_added += 1;
        } else {
            result.vocabulary_updated += 1;
        }
    }
    Ok(ItemOutcome::Folded)
}

/// The action a reviewer's answer implies
fn human_target(feedback: &UserFeedback, decision_type: DecisionType, original: &str) -> Result<Option<RuleAction>> {
    if let Some(new_value) = &feedback.new_value {
        return match value_as_label(new_value, decision_type.output_field()) {
            Some(value) => Ok(Some(RuleAction::Assign { value })),
            None if new_value.is_null() => Ok(Some(RuleAction::Suppress)),
            None => Err(LoopError::InvalidInput(format!(
                "unusable corrected value for {}: {}",
                decision_type, new_value
            ))),
        };
    }
    match feedback.validation_result {
        Some(ValidationResult::Accepted) => Ok(Some(RuleAction::Assign {
            value: original.to_string(),
        })),
        Some(ValidationResult::Rejected) => Ok(Some(RuleAction::Suppress)),
        Some(ValidationResult::Partial) => Err(LoopError::InvalidInput(
            "partial validation without a corrected value".into(),
        )),
        None => Ok(None),
    }
}

/// Cluster/placement/merge corrections → rule updates and synthesis
fn fold_structural(
    conn: &Connection,
    ctx: &RunContext,
    feedback: &UserFeedback,
    decision: Option<&AiDecision>,
    result: &mut LearningRunResult,
) -> Result<ItemOutcome> {
    let alpha = ctx.config.rules.alpha;

    let signature = match decision {
        Some(d) => d.signature(),
        None => feedback.feedback_type.decision_type().and_then(|t| {
            let original = feedback.original_value.as_ref()?;
            Some(RuleCondition {
                decision_type: t,
                knowledge_base: None,
                original_value: value_as_label(original, t.output_field())?,
            })
        }),
    };
    let Some(signature) = signature else {
        return Ok(ItemOutcome::Discarded);
    };
    let Some(target) = human_target(feedback, signature.decision_type, &signature.original_value)? else {
        return Ok(ItemOutcome::Discarded);
    };

    // Feedback on a rule's own action goes straight to that rule
    if let Some(rule_id) = decision.and_then(|d| d.rule_id.as_deref()) {
        let mut rule = match rules::get_rule(conn, ctx.owner, rule_id) {
            Ok(rule) => rule,
            Err(LoopError::NotFound { .. }) => {
                return Err(LoopError::InvalidInput(format!(
                    "autonomous decision references unknown rule {}",
                    rule_id
                )));
            }
            Err(e) => return Err(e),
        };
        let accepted = feedback.validation_result == Some(ValidationResult::Accepted);
        result.adjustments.push(rules::record_outcome(conn, &mut rule, accepted, alpha)?);
        result.rules_updated += 1;
        return Ok(ItemOutcome::Folded);
    }

    if let Some(d) = decision {
        if d.confidence >= ctx.ceiling {
            return Ok(ItemOutcome::SkippedHighConfidence);
        }
    }

    let matching = rules::find_matching(conn, ctx.owner, &signature)?;
    if !matching.is_empty() {
        for mut rule in matching {
            let agrees = rule.action.agrees_with(&target);
            result.adjustments.push(rules::record_agreement(conn, &mut rule, agrees, alpha)?);
            result.rules_updated += 1;
        }
        return Ok(ItemOutcome::Folded);
    }

    let unchanged = RuleAction::Assign {
        value: signature.original_value.clone(),
    };
    if target.agrees_with(&unchanged) {
        return Ok(ItemOutcome::Folded);
    }

    let document_key = decision
        .and_then(|d| d.scope.document_id.clone())
        .or_else(|| feedback.decision_id.clone())
        .unwrap_or_else(|| feedback.id.clone());
    let support = rules::record_pattern(conn, ctx.owner, &signature, &target, &document_key, &feedback.id)?;

    if support >= ctx.params.min_support
        && rules::find_rule_for_pattern(conn, ctx.owner, &signature, &target)?.is_none()
    {
        let confidence = rules::initial_confidence(support, ctx.config.rules.max_initial_confidence);
        rules::insert_rule(conn, ctx.owner, signature, target, confidence, support as i64)?;
        result.rules_created += 1;
    }
    Ok(ItemOutcome::Folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::ledger::tests::cluster_record;
    use crate::ledger::{record_decision, record_free_feedback, submit_feedback, FeedbackSubmission};
    use serde_json::json;

    fn params() -> LearningParams {
        LearningParams::from_config(&RuleConfig::default())
    }

    fn reject_with(conn: &Connection, decision_id: &str, value: &str) {
        submit_feedback(
            conn,
            "alice",
            &FeedbackSubmission {
                decision_id: decision_id.to_string(),
                result: ValidationResult::Partial,
                new_value: Some(json!(value)),
                reasoning: None,
            },
        )
        .unwrap();
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_empty_run_is_idempotent_noop() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        for _ in 0..2 {
            let result = run_learning(&conn, "alice", params(), &config).unwrap();
            assert_eq!(result.feedback_processed, 0);
            assert_eq!(result.rules_created + result.rules_updated, 0);
            assert_eq!(result.vocabulary_added + result.vocabulary_updated, 0);
            assert!(result.skipped.is_empty());
        }
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM rules"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM vocabulary"), 0);
        assert_eq!(count(&conn, "SELECT total_learning_runs FROM learning_profiles"), 2);
    }

    #[test]
    fn test_rule_synthesized_after_min_support_distinct_documents() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();

        // Two corrections on the same document only count once
        for doc in ["doc-1", "doc-1", "doc-2"] {
            let id = record_decision(&conn, &cluster_record("alice", doc, "Misc", 0.42)).unwrap();
            reject_with(&conn, &id, "Finance");
        }
        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.rules_created, 0);
        assert_eq!(result.feedback_processed, 3);

        let id = record_decision(&conn, &cluster_record("alice", "doc-3", "Misc", 0.42)).unwrap();
        reject_with(&conn, &id, "Finance");
        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.rules_created, 1);

        let rules = rules::list_rules(&conn, "alice", None, false).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].times_applied, 0);
        assert_eq!(rules[0].support, 3);
        assert!((rules[0].confidence - 0.75).abs() < 1e-9);
        assert_eq!(rules[0].action, RuleAction::Assign { value: "Finance".into() });
    }

    #[test]
    fn test_matching_rule_counts_agreement_and_override() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let cond = RuleCondition {
            decision_type: DecisionType::ClusterAssignment,
            knowledge_base: None,
            original_value: "Misc".into(),
        };
        let rule = rules::insert_rule(&conn, "alice", cond, RuleAction::Assign { value: "Finance".into() }, 0.75, 3).unwrap();

        let agree = record_decision(&conn, &cluster_record("alice", "d1", "Misc", 0.4)).unwrap();
        reject_with(&conn, &agree, "finance");
        let disagree = record_decision(&conn, &cluster_record("alice", "d2", "Misc", 0.4)).unwrap();
        reject_with(&conn, &disagree, "Legal");

        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.rules_updated, 2);
        assert_eq!(result.rules_created, 0);

        let stored = rules::get_rule(&conn, "alice", &rule.id).unwrap();
        assert_eq!(stored.times_applied, 1);
        assert_eq!(stored.times_overridden, 1);
        assert_eq!(stored.accuracy(), Some(0.5));
    }

    #[test]
    fn test_high_confidence_feedback_leaves_rules_alone() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        for doc in ["a", "b", "c"] {
            let id = record_decision(&conn, &cluster_record("alice", doc, "Misc", 0.95)).unwrap();
            reject_with(&conn, &id, "Finance");
        }
        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.skipped_high_confidence, 3);
        assert_eq!(result.rules_created, 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM correction_patterns"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM feedback WHERE processed = 0"), 0);
    }

    #[test]
    fn test_concept_edits_feed_vocabulary() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let id = record_decision(
            &conn,
            &crate::ledger::DecisionRecord {
                decision_type: DecisionType::ConceptExtraction,
                scope: Scope::owner("alice").with_document("d1"),
                input_snapshot: json!({}),
                output_snapshot: json!({"concepts": ["Rust", "Misc"]}),
                confidence: 0.5,
                model_identity: "extractor".into(),
            },
        )
        .unwrap();
        submit_feedback(
            &conn,
            "alice",
            &FeedbackSubmission {
                decision_id: id,
                result: ValidationResult::Partial,
                new_value: Some(json!(["rust", "Tokio"])),
                reasoning: None,
            },
        )
        .unwrap();

        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.vocabulary_added, 3);

        let rust = vocabulary::find_term(&conn, "alice", "Rust").unwrap().unwrap();
        assert_eq!((rust.times_seen, rust.times_kept), (1, 1));
        let misc = vocabulary::find_term(&conn, "alice", "misc").unwrap().unwrap();
        assert_eq!(misc.times_removed, 1);
        let tokio = vocabulary::find_term(&conn, "alice", "tokio").unwrap().unwrap();
        assert_eq!(tokio.times_kept, 1);
    }

    #[test]
    fn test_free_text_is_discarded_and_processed() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        record_free_feedback(&conn, "alice", FeedbackType::FreeText, None, None, Some("meh".into())).unwrap();
        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.discarded, 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM feedback WHERE processed = 0"), 0);
    }

    #[test]
    fn test_malformed_item_is_skipped_and_left_unprocessed() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let good = record_decision(&conn, &cluster_record("alice", "d1", "Misc", 0.4)).unwrap();
        reject_with(&conn, &good, "Finance");
        let bad = record_free_feedback(
            &conn,
            "alice",
            FeedbackType::ClusterCorrection,
            Some(json!("Misc")),
            Some(json!({"nested": [1, 2]})),
            None,
        )
        .unwrap();

        let result = run_learning(&conn, "alice", params(), &config).unwrap();
        assert_eq!(result.feedback_processed, 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].feedback_id, bad.id);
        assert!(!ledger::get_feedback(&conn, "alice", &bad.id).unwrap().processed);
        // The bad item's pattern write was rolled back with its savepoint
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM correction_patterns"), 1);
    }

    #[test]
    fn test_busy_when_owner_lease_held() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let _held = OwnerLock::acquire(&conn, "alice", "calibration", 900).unwrap();
        let err = run_learning(&conn, "alice", params(), &config).unwrap_err();
        assert_eq!(err.kind(), "busy");
        assert!(run_learning(&conn, "bob", params(), &config).is_ok());
    }
}
