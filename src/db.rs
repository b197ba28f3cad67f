//! Database layer for the decision feedback loop
//!
//! Uses SQLite: a single file holds the decision and feedback ledgers, the
//! rule and vocabulary stores, thresholds, agent state and hypotheses.
//! Every table is keyed by owner; nothing is shared across owners.

use crate::error::{LoopError, Result};
use anyhow::Context;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use uuid::Uuid;

/// Initialize the database with schema
pub fn init_db(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Open an in-memory database with the full schema (tests, dry runs)
pub fn init_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

const SCHEMA: &str = r#"
-- Decision ledger: append-only, validation written once
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    decision_type TEXT NOT NULL,
    knowledge_base TEXT,
    document_id TEXT,
    cluster_id TEXT,
    input_json TEXT NOT NULL,
    output_json TEXT NOT NULL,
    confidence REAL NOT NULL,
    model_identity TEXT NOT NULL,
    validated INTEGER NOT NULL DEFAULT 0,
    validation_result TEXT,      -- accepted | rejected | partial
    validated_at TEXT,
    rule_id TEXT,                -- set on autonomous actions
    supersedes TEXT,             -- producer decision an autonomous action replaced
    rule_state_json TEXT,        -- rule counters when the action was taken
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_pending ON decisions(owner, validated, confidence);
CREATE INDEX IF NOT EXISTS idx_decisions_validated_at ON decisions(owner, validated_at);
CREATE INDEX IF NOT EXISTS idx_decisions_supersedes ON decisions(supersedes);
CREATE INDEX IF NOT EXISTS idx_decisions_rule ON decisions(rule_id);

-- Feedback ledger: human (or agent) corrections
CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    feedback_type TEXT NOT NULL,
    decision_id TEXT,            -- weak reference, may be NULL
    validation_result TEXT,
    original_json TEXT,
    new_json TEXT,
    reasoning TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    improvement_score REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feedback_unprocessed ON feedback(owner, processed, created_at);

-- Rule store: soft-deactivated only
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    condition_json TEXT NOT NULL,
    action_json TEXT NOT NULL,
    original_key TEXT NOT NULL,  -- normalized value the condition matches
    confidence REAL NOT NULL,
    times_applied INTEGER NOT NULL DEFAULT 0,
    times_overridden INTEGER NOT NULL DEFAULT 0,
    support INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_lookup ON rules(owner, rule_type, original_key, active);

-- Recurring correction patterns, one row per distinct document
CREATE TABLE IF NOT EXISTS correction_patterns (
    owner TEXT NOT NULL,
    pattern_key TEXT NOT NULL,
    document_key TEXT NOT NULL,
    feedback_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (owner, pattern_key, document_key)
);

-- Vocabulary store: one row per normalized concept
CREATE TABLE IF NOT EXISTS vocabulary (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    canonical_name TEXT NOT NULL,
    normalized TEXT NOT NULL,
    category TEXT,
    variants_json TEXT NOT NULL DEFAULT '[]',
    always_include INTEGER NOT NULL DEFAULT 0,
    never_include INTEGER NOT NULL DEFAULT 0,
    times_seen INTEGER NOT NULL DEFAULT 0,
    times_kept INTEGER NOT NULL DEFAULT 0,
    times_removed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE(owner, normalized),
    CHECK (NOT (always_include = 1 AND never_include = 1))
);

-- Calibrated thresholds, replaced wholesale
CREATE TABLE IF NOT EXISTS thresholds (
    owner TEXT PRIMARY KEY,
    high REAL NOT NULL,
    medium REAL NOT NULL,
    low REAL NOT NULL,
    sample_count INTEGER NOT NULL DEFAULT 0,
    calibrated_at TEXT NOT NULL,
    CHECK (high > medium AND medium > low)
);

-- Calibration audit trail
CREATE TABLE IF NOT EXISTS calibration_runs (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    old_json TEXT NOT NULL,
    new_json TEXT NOT NULL,
    bins_json TEXT NOT NULL,
    sample_count INTEGER NOT NULL,
    source TEXT NOT NULL,        -- calibration | hypothesis:<id>
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS learning_profiles (
    owner TEXT PRIMARY KEY,
    accuracy_rate REAL,
    confidence_threshold REAL NOT NULL,
    last_learning_run TEXT,
    total_learning_runs INTEGER NOT NULL DEFAULT 0
);

-- Learning Agent persisted state
CREATE TABLE IF NOT EXISTS agent_state (
    owner TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    strategy TEXT NOT NULL,
    last_observation_at TEXT,
    observation_count INTEGER NOT NULL DEFAULT 0,
    action_count INTEGER NOT NULL DEFAULT 0,
    accuracy_history_json TEXT NOT NULL DEFAULT '[]',
    improvement_streak INTEGER NOT NULL DEFAULT 0,
    proposed_strategy TEXT,
    updated_at TEXT NOT NULL
);

-- Maverick hypotheses: never deleted
CREATE TABLE IF NOT EXISTS hypotheses (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    category TEXT NOT NULL,
    description TEXT NOT NULL,
    target_metric TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    expected_improvement REAL NOT NULL,
    status TEXT NOT NULL,
    change_json TEXT NOT NULL,
    split_ratio REAL,
    baseline_json TEXT,
    post_json TEXT,
    improvement_score REAL,
    conclusion_reason TEXT,
    created_at TEXT NOT NULL,
    test_start TEXT,
    concluded_at TEXT,
    applied_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_hypotheses_status ON hypotheses(owner, status);

-- Maverick soft signals and expertise weights
CREATE TABLE IF NOT EXISTS maverick_state (
    owner TEXT PRIMARY KEY,
    mood REAL NOT NULL,
    confidence REAL NOT NULL,
    expertise_json TEXT NOT NULL DEFAULT '{}',
    runs INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- Per-owner leases serializing read-modify-write learners
CREATE TABLE IF NOT EXISTS owner_locks (
    owner TEXT PRIMARY KEY,
    operation TEXT NOT NULL,
    token TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;

/// Canonical timestamp encoding (fixed width, sorts lexically)
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    ts(Utc::now())
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LoopError::InvalidInput(format!("bad timestamp {:?}: {}", raw, e)))
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Read a timestamp column
pub fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Read a nullable timestamp column
pub fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Read a JSON column
pub fn get_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Read a nullable JSON column
pub fn get_opt_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| serde_json::from_str(&r).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// Read an enum stored by its string form
pub fn get_parsed<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = LoopError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

/// Exclusive per-owner lease for read-modify-write operations
///
/// Backed by a row in `owner_locks`, so it holds across connections and
/// processes. Released on drop; abandoned leases expire after the TTL.
/// Each holder carries its own token, so a holder whose lease was reclaimed
/// cannot release the lease of whoever reclaimed it.
pub struct OwnerLock<'a> {
    conn: &'a Connection,
    owner: String,
    token: String,
}

impl<'a> OwnerLock<'a> {
    pub fn acquire(conn: &'a Connection, owner: &str, operation: &str, ttl_secs: i64) -> Result<Self> {
        let cutoff = ts(Utc::now() - Duration::seconds(ttl_secs));
        let reclaimed = conn.execute(
            "DELETE FROM owner_locks WHERE owner = ?1 AND acquired_at < ?2",
            params![owner, cutoff],
        )?;
        if reclaimed > 0 {
            tracing::warn!(owner, "Reclaimed expired owner lease");
        }

        let token = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO owner_locks (owner, operation, token, acquired_at) VALUES (?1, ?2, ?3, ?4)",
            params![owner, operation, token, now_ts()],
        )?;

        if inserted == 0 {
            let holder: Option<String> = conn
                .query_row(
                    "SELECT operation FROM owner_locks WHERE owner = ?1",
                    [owner],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(LoopError::Busy {
                owner: owner.to_string(),
                operation: holder.unwrap_or_else(|| "unknown".to_string()),
            });
        }

        tracing::debug!(owner, operation, "Acquired owner lease");
        Ok(Self {
            conn,
            owner: owner.to_string(),
            token,
        })
    }
}

impl Drop for OwnerLock<'_> {
    fn drop(&mut self) {
        match self.conn.execute(
            "DELETE FROM owner_locks WHERE owner = ?1 AND token = ?2",
            params![self.owner, self.token],
        ) {
            Ok(0) => tracing::warn!(owner = %self.owner, "Owner lease was reclaimed before release"),
            Ok(_) => {}
            Err(e) => tracing::warn!(owner = %self.owner, error = %e, "Failed to release owner lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_test_db() -> (Connection, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let conn = init_db(&path).unwrap();
        (conn, dir)
    }

    #[test]
    fn test_init_db() {
        let (conn, _dir) = setup_test_db();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "decisions",
            "feedback",
            "rules",
            "correction_patterns",
            "vocabulary",
            "thresholds",
            "agent_state",
            "hypotheses",
            "maverick_state",
            "owner_locks",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(3);
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(a)).unwrap().timestamp_micros(), a.timestamp_micros());
    }

    #[test]
    fn test_owner_lock_is_exclusive_per_owner() {
        let (conn, dir) = setup_test_db();
        let other = init_db(&dir.path().join("test.db")).unwrap();

        let lock = OwnerLock::acquire(&conn, "alice", "learning_run", 900).unwrap();

        // Same owner from another connection is rejected
        let err = OwnerLock::acquire(&other, "alice", "calibration", 900).err().unwrap();
        match err {
            LoopError::Busy { owner, operation } => {
                assert_eq!(owner, "alice");
                assert_eq!(operation, "learning_run");
            }
            other => panic!("expected busy, got {:?}", other),
        }

        // Another owner is independent
        let bob = OwnerLock::acquire(&other, "bob", "calibration", 900).unwrap();
        drop(bob);

        drop(lock);
        assert!(OwnerLock::acquire(&other, "alice", "calibration", 900).is_ok());
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let (conn, _dir) = setup_test_db();
        conn.execute(
            "INSERT INTO owner_locks (owner, operation, token, acquired_at) VALUES ('alice', 'stale', 't0', ?1)",
            [ts(Utc::now() - Duration::hours(2))],
        )
        .unwrap();

        assert!(OwnerLock::acquire(&conn, "alice", "learning_run", 60).is_ok());
    }

    #[test]
    fn test_reclaimed_holder_cannot_release_new_lease() {
        let (conn, dir) = setup_test_db();
        let other = init_db(&dir.path().join("test.db")).unwrap();

        let stale = OwnerLock::acquire(&conn, "alice", "learning_run", 60).unwrap();
        conn.execute(
            "UPDATE owner_locks SET acquired_at = ?1 WHERE owner = 'alice'",
            [ts(Utc::now() - Duration::hours(2))],
        )
        .unwrap();

        let current = OwnerLock::acquire(&other, "alice", "learning_run", 60).unwrap();
        drop(stale);

        // The reclaiming holder still owns the lease
        let err = OwnerLock::acquire(&conn, "alice", "learning_run", 60).err().unwrap();
        assert!(matches!(err, LoopError::Busy { .. }), "expected busy, got {:?}", err);

        drop(current);
        assert!(OwnerLock::acquire(&conn, "alice", "learning_run", 60).is_ok());
    }
}
