//! Rule store: condition → action heuristics
//!
//! Confidence moves by an exponential update toward each outcome; accuracy is
//! always derived from the applied/overridden counters. Rules are never
//! deleted, only deactivated.

use crate::db::{self, get_json, get_parsed, get_ts};
use crate::error::{LoopError, Result};
use crate::types::{normalize_label, DecisionType, LearnedRule, RuleAction, RuleCondition};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Record of a single confidence move
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAdjustment {
    pub rule_id: String,
    pub old_confidence: f64,
    pub new_confidence: f64,
    pub delta: f64,
    pub times_applied: i64,
    pub times_overridden: i64,
}

/// `c + α(outcome − c)`, clamped to [0, 1]
pub fn ema(confidence: f64, alpha: f64, outcome: f64) -> f64 {
    (confidence + alpha * (outcome - confidence)).clamp(0.0, 1.0)
}

/// Initial confidence of a rule minted from `support` distinct documents
pub fn initial_confidence(support: usize, max_initial: f64) -> f64 {
    (1.0 - 1.0 / (support as f64 + 1.0)).min(max_initial)
}

/// Stable identity of a (condition, action) correction pattern
pub fn pattern_key(condition: &RuleCondition, action: &RuleAction) -> String {
    let action_part = match action {
        RuleAction::Assign { value } => format!("assign:{}", normalize_label(value)),
        RuleAction::Suppress => "suppress".to_string(),
    };
    let canonical = format!(
        "{}|{}|{}|{}",
        condition.decision_type.as_str(),
        condition.knowledge_base.as_deref().unwrap_or("*"),
        normalize_label(&condition.original_value),
        action_part
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

const RULE_COLUMNS: &str = "id, owner, rule_type, condition_json, action_json, confidence,
    times_applied, times_overridden, support, active, created_at";

fn rule_from_row(row: &Row) -> rusqlite::Result<LearnedRule> {
    Ok(LearnedRule {
        id: row.get(0)?,
        owner: row.get(1)?,
        rule_type: get_parsed(row, 2)?,
        condition: get_json(row, 3)?,
        action: get_json(row, 4)?,
        confidence: row.get(5)?,
        times_applied: row.get(6)?,
        times_overridden: row.get(7)?,
        support: row.get(8)?,
        active: row.get::<_, i64>(9)? != 0,
        created_at: get_ts(row, 10)?,
    })
}

/// Insert a freshly synthesized rule
pub fn insert_rule(
    conn: &Connection,
    owner: &str,
    condition: RuleCondition,
    action: RuleAction,
    confidence: f64,
    support: i64,
) -> Result<LearnedRule> {
    let rule = LearnedRule {
        id: Uuid::new_v4().to_string(),
        owner: owner.to_string(),
        rule_type: condition.decision_type,
        condition,
        action,
        confidence: confidence.clamp(0.0, 1.0),
        times_applied: 0,
        times_overridden: 0,
        support,
        active: true,
        created_at: Utc::now(),
    };
    let now = db::ts(rule.created_at);
    conn.execute(
        r#"
        INSERT INTO rules (id, owner, rule_type, condition_json, action_json, original_key,
                           confidence, times_applied, times_overridden, support, active, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, 1, ?9, ?9)
        "#,
        params![
            rule.id,
            owner,
            rule.rule_type.as_str(),
            serde_json::to_string(&rule.condition)?,
            serde_json::to_string(&rule.action)?,
            normalize_label(&rule.condition.original_value),
            rule.confidence,
            rule.support,
            now,
        ],
    )?;
    tracing::info!(
        owner,
        rule_id = %rule.id,
        rule_type = %rule.rule_type,
        original = %rule.condition.original_value,
        confidence = rule.confidence,
        support,
        "Synthesized rule"
    );
    Ok(rule)
}

pub fn get_rule(conn: &Connection, owner: &str, rule_id: &str) -> Result<LearnedRule> {
    conn.query_row(
        &format!("SELECT {} FROM rules WHERE id = ?1 AND owner = ?2", RULE_COLUMNS),
        params![rule_id, owner],
        rule_from_row,
    )
    .optional()?
    .ok_or_else(|| LoopError::not_found("rule", rule_id))
}

/// Rules of an owner, most confident first
pub fn list_rules(
    conn: &Connection,
    owner: &str,
    rule_type: Option<DecisionType>,
    include_inactive: bool,
) -> Result<Vec<LearnedRule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rules
         WHERE owner = ?1
           AND (?2 IS NULL OR rule_type = ?2)
           AND (?3 = 1 OR active = 1)
         ORDER BY confidence DESC, created_at ASC",
        RULE_COLUMNS
    ))?;
    let rules = stmt
        .query_map(
            params![owner, rule_type.map(|t| t.as_str()), include_inactive as i64],
            rule_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

fn rules_for_key(conn: &Connection, owner: &str, signature: &RuleCondition, active_only: bool) -> Result<Vec<LearnedRule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rules
         WHERE owner = ?1 AND rule_type = ?2 AND original_key = ?3 AND (?4 = 0 OR active = 1)
         ORDER BY confidence DESC, created_at ASC",
        RULE_COLUMNS
    ))?;
    let rules = stmt
        .query_map(
            params![
                owner,
                signature.decision_type.as_str(),
                normalize_label(&signature.original_value),
                active_only as i64
            ],
            rule_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

/// Active rules whose condition matches a decision signature, best first
pub fn find_matching(conn: &Connection, owner: &str, signature: &RuleCondition) -> Result<Vec<LearnedRule>> {
    Ok(rules_for_key(conn, owner, signature, true)?
        .into_iter()
        .filter(|r| r.condition.matches(signature))
        .collect())
}

/// Any rule, active or not, already encoding this exact pattern
pub fn find_rule_for_pattern(
    conn: &Connection,
    owner: &str,
    condition: &RuleCondition,
    action: &RuleAction,
) -> Result<Option<LearnedRule>> {
    Ok(rules_for_key(conn, owner, condition, false)?
        .into_iter()
        .find(|r| r.condition.knowledge_base == condition.knowledge_base && r.action.agrees_with(action)))
}

fn write_counters(conn: &Connection, rule: &LearnedRule) -> Result<()> {
    conn.execute(
        "UPDATE rules
         SET confidence = ?2, times_applied = ?3, times_overridden = ?4, updated_at = ?5
         WHERE id = ?1",
        params![
            rule.id,
            rule.confidence,
            rule.times_applied,
            rule.times_overridden,
            db::now_ts()
        ],
    )?;
    Ok(())
}

fn adjust(
    conn: &Connection,
    rule: &mut LearnedRule,
    applied: i64,
    overridden: i64,
    outcome: f64,
    alpha: f64,
) -> Result<RuleAdjustment> {
    let old = rule.confidence;
    rule.times_applied += applied;
    rule.times_overridden += overridden;
    rule.confidence = ema(old, alpha, outcome);
    write_counters(conn, rule)?;
    Ok(RuleAdjustment {
        rule_id: rule.id.clone(),
        old_confidence: old,
        new_confidence: rule.confidence,
        delta: rule.confidence - old,
        times_applied: rule.times_applied,
        times_overridden: rule.times_overridden,
    })
}

/// Human feedback on a producer decision the rule matched
///
/// Agreement counts as an application, disagreement as an override.
pub fn record_agreement(conn: &Connection, rule: &mut LearnedRule, agrees: bool, alpha: f64) -> Result<RuleAdjustment> {
    if agrees {
        adjust(conn, rule, 1, 0, 1.0, alpha)
    } else {
        adjust(conn, rule, 0, 1, 0.0, alpha)
    }
}

/// Human feedback on a decision the rule itself produced
///
/// The application was already counted when the action was taken, so an
/// acceptance only moves confidence.
pub fn record_outcome(conn: &Connection, rule: &mut LearnedRule, accepted: bool, alpha: f64) -> Result<RuleAdjustment> {
    if accepted {
        adjust(conn, rule, 0, 0, 1.0, alpha)
    } else {
        adjust(conn, rule, 0, 1, 0.0, alpha)
    }
}

/// Count an autonomous application
pub(crate) fn record_application(conn: &Connection, rule_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE rules SET times_applied = times_applied + 1, updated_at = ?2 WHERE id = ?1",
        params![rule_id, db::now_ts()],
    )?;
    Ok(())
}

fn set_active(conn: &Connection, owner: &str, rule_id: &str, active: bool) -> Result<LearnedRule> {
    let updated = conn.execute(
        "UPDATE rules SET active = ?3, updated_at = ?4 WHERE id = ?1 AND owner = ?2",
        params![rule_id, owner, active as i64, db::now_ts()],
    )?;
    if updated == 0 {
        return Err(LoopError::not_found("rule", rule_id));
    }
    tracing::info!(owner, rule_id, active, "Rule activation changed");
    get_rule(conn, owner, rule_id)
}

pub fn deactivate_rule(conn: &Connection, owner: &str, rule_id: &str) -> Result<LearnedRule> {
    set_active(conn, owner, rule_id, false)
}

pub fn reactivate_rule(conn: &Connection, owner: &str, rule_id: &str) -> Result<LearnedRule> {
    set_active(conn, owner, rule_id, true)
}

/// Record one document's support for a correction pattern
///
/// Returns the number of distinct documents now supporting it.
pub fn record_pattern(
    conn: &Connection,
    owner: &str,
    condition: &RuleCondition,
    action: &RuleAction,
    document_key: &str,
    feedback_id: &str,
) -> Result<usize> {
    let key = pattern_key(condition, action);
    conn.execute(
        "INSERT OR IGNORE INTO correction_patterns (owner, pattern_key, document_key, feedback_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![owner, key, document_key, feedback_id, db::now_ts()],
    )?;
    let support: i64 = conn.query_row(
        "SELECT COUNT(*) FROM correction_patterns WHERE owner = ?1 AND pattern_key = ?2",
        params![owner, key],
        |row| row.get(0),
    )?;
    Ok(support as usize)
}
