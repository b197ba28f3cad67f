//! Decision Ledger, Feedback Ledger and Validation Queue
//!
//! Producers append decisions; reviewers (or the Learning Agent) validate
//! each one exactly once. Validation appends feedback but never touches the
//! rule or vocabulary stores; that work belongs to the learning run.

use crate::db::{self, get_json, get_opt_json, get_opt_ts, get_parsed, get_ts};
use crate::error::{LoopError, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Inbound decision from a producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_type: DecisionType,
    pub scope: Scope,
    #[serde(default)]
    pub input_snapshot: Value,
    pub output_snapshot: Value,
    pub confidence: f64,
    pub model_identity: String,
}

/// A reviewer's answer to a validation prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub decision_id: String,
    pub result: ValidationResult,
    #[serde(default)]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Slim view of a validated decision for statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedOutcome {
    pub decision_id: String,
    pub decision_type: DecisionType,
    pub document_id: Option<String>,
    pub confidence: f64,
    pub result: ValidationResult,
    pub validated_at: DateTime<Utc>,
    pub rule_id: Option<String>,
    pub supersedes: Option<String>,
    /// Rule state at application time, autonomous decisions only
    pub rule_state: Option<RuleState>,
}

const DECISION_COLUMNS: &str = "id, owner, decision_type, knowledge_base, document_id, cluster_id,
    input_json, output_json, confidence, model_identity, validated, validation_result,
    validated_at, rule_id, supersedes, created_at";

fn decision_from_row(row: &Row) -> rusqlite::Result<AiDecision> {
    let result: Option<String> = row.get(11)?;
    let validation_result = result
        .map(|r| {
            r.parse::<ValidationResult>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e)))
        })
        .transpose()?;
    Ok(AiDecision {
        id: row.get(0)?,
        scope: Scope {
            owner: row.get(1)?,
            knowledge_base: row.get(3)?,
            document_id: row.get(4)?,
            cluster_id: row.get(5)?,
        },
        decision_type: get_parsed(row, 2)?,
        input_snapshot: get_json(row, 6)?,
        output_snapshot: get_json(row, 7)?,
        confidence: row.get(8)?,
        model_identity: row.get(9)?,
        validated: row.get::<_, i64>(10)? != 0,
        validation_result,
        validated_at: get_opt_ts(row, 12)?,
        rule_id: row.get(13)?,
        supersedes: row.get(14)?,
        created_at: get_ts(row, 15)?,
    })
}

/// Record a decision made by a producer
pub fn record_decision(conn: &Connection, record: &DecisionRecord) -> Result<String> {
    if record.scope.owner.trim().is_empty() {
        return Err(LoopError::InvalidInput("scope.owner is required".into()));
    }
    if !record.confidence.is_finite() || !(0.0..=1.0).contains(&record.confidence) {
        return Err(LoopError::InvalidInput(format!(
            "confidence must be in [0, 1], got {}",
            record.confidence
        )));
    }

    let decision = AiDecision {
        id: Uuid::new_v4().to_string(),
        decision_type: record.decision_type,
        scope: record.scope.clone(),
        input_snapshot: record.input_snapshot.clone(),
        output_snapshot: record.output_snapshot.clone(),
        confidence: record.confidence,
        model_identity: record.model_identity.clone(),
        validated: false,
        validation_result: None,
        validated_at: None,
        rule_id: None,
        supersedes: None,
        created_at: Utc::now(),
    };
    insert_decision(conn, &decision)?;

    tracing::debug!(
        owner = %decision.scope.owner,
        decision_id = %decision.id,
        decision_type = %decision.decision_type,
        confidence = decision.confidence,
        "Recorded decision"
    );
    Ok(decision.id)
}

/// Append a fully formed decision row
pub(crate) fn insert_decision(conn: &Connection, decision: &AiDecision) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO decisions (id, owner, decision_type, knowledge_base, document_id, cluster_id,
                               input_json, output_json, confidence, model_identity,
                               validated, validation_result, validated_at, rule_id, supersedes, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, NULL, ?11, ?12, ?13)
        "#,
        params![
            decision.id,
            decision.scope.owner,
            decision.decision_type.as_str(),
            decision.scope.knowledge_base,
            decision.scope.document_id,
            decision.scope.cluster_id,
            serde_json::to_string(&decision.input_snapshot)?,
            serde_json::to_string(&decision.output_snapshot)?,
            decision.confidence,
            decision.model_identity,
            decision.rule_id,
            decision.supersedes,
            db::ts(decision.created_at),
        ],
    )?;
    Ok(())
}

/// Attach the rule state an autonomous decision was made under
pub(crate) fn record_rule_state(conn: &Connection, decision_id: &str, state: &RuleState) -> Result<()> {
    conn.execute(
        "UPDATE decisions SET rule_state_json = ?2 WHERE id = ?1",
        params![decision_id, serde_json::to_string(state)?],
    )?;
    Ok(())
}

/// Fetch one decision; other owners' ids are indistinguishable from unknown ones
pub fn get_decision(conn: &Connection, owner: &str, decision_id: &str) -> Result<AiDecision> {
    conn.query_row(
        &format!("SELECT {} FROM decisions WHERE id = ?1 AND owner = ?2", DECISION_COLUMNS),
        params![decision_id, owner],
        decision_from_row,
    )
    .optional()?
    .ok_or_else(|| LoopError::not_found("decision", decision_id))
}

/// Unvalidated decisions, most uncertain first
pub fn list_pending_decisions(
    conn: &Connection,
    owner: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<AiDecision>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM decisions
         WHERE owner = ?1 AND validated = 0
         ORDER BY confidence ASC, created_at ASC
         LIMIT ?2 OFFSET ?3",
        DECISION_COLUMNS
    ))?;
    let decisions = stmt
        .query_map(params![owner, limit as i64, offset as i64], decision_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(decisions)
}

/// The validation queue: pending decisions rendered as prompts
pub fn list_pending_validations(
    conn: &Connection,
    owner: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<ValidationPrompt>> {
    Ok(list_pending_decisions(conn, owner, limit, offset)?
        .iter()
        .map(build_prompt)
        .collect())
}

pub fn count_pending(conn: &Connection, owner: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM decisions WHERE owner = ?1 AND validated = 0",
        [owner],
        |row| row.get(0),
    )?)
}

/// Map a decision to its human-readable prompt
pub fn build_prompt(decision: &AiDecision) -> ValidationPrompt {
    let t = decision.decision_type;
    let value = t
        .primary_value(&decision.output_snapshot)
        .unwrap_or_else(|| "(none)".to_string());

    let (title, question) = match t {
        DecisionType::ClusterAssignment => (
            "Review cluster assignment",
            format!("Should this document belong to cluster \"{}\"?", value),
        ),
        DecisionType::ConceptExtraction => (
            "Review extracted concepts",
            format!(
                "Do these concepts describe the document: {}?",
                t.concepts(&decision.output_snapshot).join(", ")
            ),
        ),
        DecisionType::DuplicateMerge => (
            "Possible duplicate",
            format!("Merge this document with \"{}\"?", value),
        ),
        DecisionType::DocumentPlacement => (
            "Review document placement",
            format!("Should this document be filed under \"{}\"?", value),
        ),
    };

    let title = match &decision.scope.document_id {
        Some(doc) => format!("{} ({})", title, doc),
        None => title.to_string(),
    };

    ValidationPrompt {
        decision_id: decision.id.clone(),
        decision_type: t,
        title,
        question,
        confidence: decision.confidence,
        options: t.options(),
        output_snapshot: decision.output_snapshot.clone(),
        created_at: decision.created_at,
    }
}

/// The value a decision's output field holds, as stored on feedback
fn original_value(decision: &AiDecision) -> Value {
    decision
        .output_snapshot
        .get(decision.decision_type.output_field())
        .cloned()
        .unwrap_or_else(|| decision.output_snapshot.clone())
}

/// Validate a decision and append the matching feedback row
///
/// Fails with not-found for unknown ids and conflict when the decision was
/// already validated. Both writes commit together or not at all.
pub fn submit_feedback(
    conn: &Connection,
    owner: &str,
    submission: &FeedbackSubmission,
) -> Result<UserFeedback> {
    let decision = get_decision(conn, owner, &submission.decision_id)?;
    if decision.validated {
        return Err(LoopError::Conflict(format!(
            "decision {} is already validated",
            decision.id
        )));
    }
    if submission.result == ValidationResult::Partial && submission.new_value.is_none() {
        return Err(LoopError::InvalidInput(
            "a partial validation needs the corrected value".into(),
        ));
    }

    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let updated = tx.execute(
        "UPDATE decisions
         SET validated = 1, validation_result = ?3, validated_at = ?4
         WHERE id = ?1 AND owner = ?2 AND validated = 0",
        params![decision.id, owner, submission.result.as_str(), db::ts(now)],
    )?;
    if updated == 0 {
        // Lost a race with another validator
        return Err(LoopError::Conflict(format!(
            "decision {} is already validated",
            decision.id
        )));
    }

    let feedback = UserFeedback {
        id: Uuid::new_v4().to_string(),
        owner: owner.to_string(),
        feedback_type: decision.decision_type.feedback_type(),
        decision_id: Some(decision.id.clone()),
        validation_result: Some(submission.result),
        original_value: Some(original_value(&decision)),
        new_value: submission.new_value.clone(),
        reasoning: submission.reasoning.clone(),
        processed: false,
        improvement_score: None,
        created_at: now,
    };
    insert_feedback(&tx, &feedback)?;
    tx.commit()?;

    tracing::info!(
        owner,
        decision_id = %decision.id,
        result = submission.result.as_str(),
        "Feedback submitted"
    );
    Ok(feedback)
}

/// Record a correction that is not tied to any decision
pub fn record_free_feedback(
    conn: &Connection,
    owner: &str,
    feedback_type: FeedbackType,
    original_value: Option<Value>,
    new_value: Option<Value>,
    reasoning: Option<String>,
) -> Result<UserFeedback> {
    let feedback = UserFeedback {
        id: Uuid::new_v4().to_string(),
        owner: owner.to_string(),
        feedback_type,
        decision_id: None,
        validation_result: None,
        original_value,
        new_value,
        reasoning,
        processed: false,
        improvement_score: None,
        created_at: Utc::now(),
    };
    insert_feedback(conn, &feedback)?;
    Ok(feedback)
}

fn insert_feedback(conn: &Connection, feedback: &UserFeedback) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO feedback (id, owner, feedback_type, decision_id, validation_result,
                              original_json, new_json, reasoning, processed, improvement_score, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9)
        "#,
        params![
            feedback.id,
            feedback.owner,
            feedback.feedback_type.as_str(),
            feedback.decision_id,
            feedback.validation_result.map(|r| r.as_str()),
            feedback.original_value.as_ref().map(serde_json::to_string).transpose()?,
            feedback.new_value.as_ref().map(serde_json::to_string).transpose()?,
            feedback.reasoning,
            db::ts(feedback.created_at),
        ],
    )?;
    Ok(())
}

/// Write a validation outcome without feedback (Learning Agent resolutions)
pub(crate) fn resolve_decision(
    conn: &Connection,
    owner: &str,
    decision_id: &str,
    result: ValidationResult,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE decisions
         SET validated = 1, validation_result = ?3, validated_at = ?4
         WHERE id = ?1 AND owner = ?2 AND validated = 0",
        params![decision_id, owner, result.as_str(), db::now_ts()],
    )?;
    if updated == 0 {
        return Err(LoopError::Conflict(format!(
            "decision {} is already validated",
            decision_id
        )));
    }
    Ok(())
}

/// Raw feedback row; JSON columns stay unparsed so one bad row cannot
/// poison a whole batch
#[derive(Debug, Clone)]
pub struct FeedbackRow {
    pub id: String,
    pub feedback_type: String,
    pub decision_id: Option<String>,
    pub validation_result: Option<String>,
    pub original_json: Option<String>,
    pub new_json: Option<String>,
    pub reasoning: Option<String>,
    pub created_at: String,
}

/// Unprocessed feedback created at or after `since`, oldest first
pub fn list_unprocessed_feedback(
    conn: &Connection,
    owner: &str,
    since: DateTime<Utc>,
) -> Result<Vec<FeedbackRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, feedback_type, decision_id, validation_result, original_json, new_json,
                reasoning, created_at
         FROM feedback
         WHERE owner = ?1 AND processed = 0 AND created_at >= ?2
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![owner, db::ts(since)], |row| {
            Ok(FeedbackRow {
                id: row.get(0)?,
                feedback_type: row.get(1)?,
                decision_id: row.get(2)?,
                validation_result: row.get(3)?,
                original_json: row.get(4)?,
                new_json: row.get(5)?,
                reasoning: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Parse a raw feedback row into its typed form
pub fn parse_feedback(owner: &str, row: &FeedbackRow) -> Result<UserFeedback> {
    let parse_json = |raw: &Option<String>| -> Result<Option<Value>> {
        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    };
    Ok(UserFeedback {
        id: row.id.clone(),
        owner: owner.to_string(),
        feedback_type: row.feedback_type.parse()?,
        decision_id: row.decision_id.clone(),
        validation_result: row.validation_result.as_deref().map(str::parse).transpose()?,
        original_value: parse_json(&row.original_json)?,
        new_value: parse_json(&row.new_json)?,
        reasoning: row.reasoning.clone(),
        processed: false,
        improvement_score: None,
        created_at: db::parse_ts(&row.created_at)?,
    })
}

/// Flag feedback as folded into the stores; only ever called by a learning run
pub(crate) fn mark_feedback_processed(
    conn: &Connection,
    feedback_id: &str,
    improvement_score: Option<f64>,
) -> Result<()> {
    conn.execute(
        "UPDATE feedback SET processed = 1, improvement_score = ?2 WHERE id = ?1 AND processed = 0",
        params![feedback_id, improvement_score],
    )?;
    Ok(())
}

pub fn get_feedback(conn: &Connection, owner: &str, feedback_id: &str) -> Result<UserFeedback> {
    conn.query_row(
        "SELECT id, owner, feedback_type, decision_id, validation_result, original_json, new_json,
                reasoning, processed, improvement_score, created_at
         FROM feedback WHERE id = ?1 AND owner = ?2",
        params![feedback_id, owner],
        |row| {
            let result: Option<String> = row.get(4)?;
            Ok(UserFeedback {
                id: row.get(0)?,
                owner: row.get(1)?,
                feedback_type: get_parsed(row, 2)?,
                decision_id: row.get(3)?,
                validation_result: result.and_then(|r| r.parse().ok()),
                original_value: get_opt_json(row, 5)?,
                new_value: get_opt_json(row, 6)?,
                reasoning: row.get(7)?,
                processed: row.get::<_, i64>(8)? != 0,
                improvement_score: row.get(9)?,
                created_at: get_ts(row, 10)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| LoopError::not_found("feedback", feedback_id))
}

fn outcome_from_row(row: &Row) -> rusqlite::Result<ValidatedOutcome> {
    Ok(ValidatedOutcome {
        decision_id: row.get(0)?,
        decision_type: get_parsed(row, 1)?,
        document_id: row.get(2)?,
        confidence: row.get(3)?,
        result: get_parsed(row, 4)?,
        validated_at: get_ts(row, 5)?,
        rule_id: row.get(6)?,
        supersedes: row.get(7)?,
        rule_state: get_opt_json(row, 8)?,
    })
}

const OUTCOME_COLUMNS: &str =
    "id, decision_type, document_id, confidence, validation_result, validated_at, rule_id, supersedes, rule_state_json";

/// Every validated decision of an owner, most recent first
///
/// Decisions the Learning Agent resolved on a rule's behalf are excluded:
/// their outcome is the agent's, not a reviewer's.
pub fn list_validated(conn: &Connection, owner: &str, limit: Option<usize>) -> Result<Vec<ValidatedOutcome>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM decisions d
         WHERE owner = ?1 AND validated = 1
           AND NOT EXISTS (SELECT 1 FROM decisions a WHERE a.supersedes = d.id)
         ORDER BY validated_at DESC, id DESC
         LIMIT ?2",
        OUTCOME_COLUMNS
    ))?;
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let outcomes = stmt
        .query_map(params![owner, limit], outcome_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(outcomes)
}

/// Validated decisions since a timestamp, oldest first
pub fn list_validated_since(
    conn: &Connection,
    owner: &str,
    since: DateTime<Utc>,
) -> Result<Vec<ValidatedOutcome>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM decisions d
         WHERE owner = ?1 AND validated = 1 AND validated_at >= ?2
           AND NOT EXISTS (SELECT 1 FROM decisions a WHERE a.supersedes = d.id)
         ORDER BY validated_at ASC, id ASC",
        OUTCOME_COLUMNS
    ))?;
    let outcomes = stmt
        .query_map(params![owner, db::ts(since)], outcome_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(outcomes)
}

/// Full decisions validated since a timestamp, oldest first
pub fn list_validated_decisions_since(
    conn: &Connection,
    owner: &str,
    since: DateTime<Utc>,
) -> Result<Vec<AiDecision>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM decisions d
         WHERE owner = ?1 AND validated = 1 AND validated_at >= ?2
           AND NOT EXISTS (SELECT 1 FROM decisions a WHERE a.supersedes = d.id)
         ORDER BY validated_at ASC, id ASC",
        DECISION_COLUMNS
    ))?;
    let decisions = stmt
        .query_map(params![owner, db::ts(since)], decision_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(decisions)
}

/// Validated decisions the Learning Agent produced, most recent first
pub fn list_validated_autonomous(conn: &Connection, owner: &str, limit: usize) -> Result<Vec<ValidatedOutcome>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM decisions
         WHERE owner = ?1 AND validated = 1 AND rule_id IS NOT NULL
         ORDER BY validated_at DESC, id DESC
         LIMIT ?2",
        OUTCOME_COLUMNS
    ))?;
    let outcomes = stmt
        .query_map(params![owner, limit as i64], outcome_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(outcomes)
}

/// Autonomous decisions a reviewer did not accept since a timestamp
pub fn count_overrides_since(conn: &Connection, owner: &str, since: DateTime<Utc>) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM decisions
         WHERE owner = ?1 AND rule_id IS NOT NULL AND validated = 1
           AND validation_result != 'accepted' AND validated_at >= ?2",
        params![owner, db::ts(since)],
        |row| row.get(0),
    )?)
}
