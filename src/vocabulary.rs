//! Vocabulary store: canonical concepts learned from concept edits

use crate::config::VocabularyConfig;
use crate::db::{self, get_json};
use crate::error::{LoopError, Result};
use crate::types::{normalize_label, VocabularyTerm};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

/// What happened to a concept in one correction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Kept,
    Removed,
}

/// Result of folding one observation into the store
#[derive(Debug, Clone)]
pub struct ObserveOutcome {
    pub term: VocabularyTerm,
    pub created: bool,
}

const TERM_COLUMNS: &str = "id, owner, canonical_name, category, variants_json, always_include,
    never_include, times_seen, times_kept, times_removed";

fn term_from_row(row: &Row) -> rusqlite::Result<VocabularyTerm> {
    let variants: Vec<String> = get_json(row, 4)?;
    Ok(VocabularyTerm {
        id: row.get(0)?,
        owner: row.get(1)?,
        canonical_name: row.get(2)?,
        category: row.get(3)?,
        variants: variants.into_iter().collect(),
        always_include: row.get::<_, i64>(5)? != 0,
        never_include: row.get::<_, i64>(6)? != 0,
        times_seen: row.get(7)?,
        times_kept: row.get(8)?,
        times_removed: row.get(9)?,
    })
}

/// Look a concept up by any spelling
pub fn find_term(conn: &Connection, owner: &str, name: &str) -> Result<Option<VocabularyTerm>> {
    let normalized = normalize_label(name);
    if normalized.is_empty() {
        return Ok(None);
    }
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM vocabulary WHERE owner = ?1 AND normalized = ?2",
                TERM_COLUMNS
            ),
            params![owner, normalized],
            term_from_row,
        )
        .optional()?)
}

/// Flags implied by the counters
fn flags_for(term: &VocabularyTerm, config: &VocabularyConfig) -> (bool, bool) {
    let Some(ratio) = term.kept_ratio() else {
        return (false, false);
    };
    if term.times_seen < config.min_observations {
        return (false, false);
    }
    if ratio >= config.always_ratio {
        (true, false)
    } else if ratio <= config.never_ratio {
        (false, true)
    } else {
        (false, false)
    }
}

/// Fold one kept/removed observation of a concept into the store
pub fn observe(
    conn: &Connection,
    owner: &str,
    name: &str,
    observation: Observation,
    config: &VocabularyConfig,
) -> Result<ObserveOutcome> {
    let spelling = name.trim();
    let normalized = normalize_label(spelling);
    if normalized.is_empty() {
        return Err(LoopError::InvalidInput(format!("empty concept name: {:?}", name)));
    }

    let (mut term, created) = match find_term(conn, owner, spelling)? {
        Some(term) => (term, false),
        None => (
            VocabularyTerm {
                id: Uuid::new_v4().to_string(),
                owner: owner.to_string(),
                canonical_name: spelling.to_string(),
                category: None,
                variants: BTreeSet::new(),
                always_include: false,
                never_include: false,
                times_seen: 0,
                times_kept: 0,
                times_removed: 0,
            },
            true,
        ),
    };

    if spelling != term.canonical_name {
        term.variants.insert(spelling.to_string());
    }
    term.times_seen += 1;
    match observation {
        Observation::Kept => term.times_kept += 1,
        Observation::Removed => term.times_removed += 1,
    }
    let (always, never) = flags_for(&term, config);
    if always != term.always_include || never != term.never_include {
        tracing::debug!(owner, term = %term.canonical_name, always, never, "Vocabulary flags changed");
    }
    term.always_include = always;
    term.never_include = never;

    let variants: Vec<&String> = term.variants.iter().collect();
    conn.execute(
        r#"
        INSERT INTO vocabulary (id, owner, canonical_name, normalized, category, variants_json,
                                always_include, never_include, times_seen, times_kept, times_removed, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(owner, normalized) DO UPDATE SET
            variants_json = excluded.variants_json,
            always_include = excluded.always_include,
            never_include = excluded.never_include,
            times_seen = excluded.times_seen,
            times_kept = excluded.times_kept,
            times_removed = excluded.times_removed,
            updated_at = excluded.updated_at
        "#,
        params![
            term.id,
            owner,
            term.canonical_name,
            normalized,
            term.category,
            serde_json::to_string(&variants)?,
            term.always_include as i64,
            term.never_include as i64,
            term.times_seen,
            term.times_kept,
            term.times_removed,
            db::now_ts(),
        ],
    )?;

    Ok(ObserveOutcome { term, created })
}

/// Narrow a vocabulary listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TermFilter {
    #[default]
    All,
    AlwaysInclude,
    NeverInclude,
}

impl std::str::FromStr for TermFilter {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(TermFilter::All),
            "always" | "always_include" => Ok(TermFilter::AlwaysInclude),
            "never" | "never_include" => Ok(TermFilter::NeverInclude),
            other => Err(LoopError::InvalidInput(format!("unknown vocabulary filter: {}", other))),
        }
    }
}

pub fn list_vocabulary(conn: &Connection, owner: &str, filter: TermFilter) -> Result<Vec<VocabularyTerm>> {
    let clause = match filter {
        TermFilter::All => "",
        TermFilter::AlwaysInclude => "AND always_include = 1",
        TermFilter::NeverInclude => "AND never_include = 1",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM vocabulary WHERE owner = ?1 {} ORDER BY times_seen DESC, canonical_name ASC",
        TERM_COLUMNS, clause
    ))?;
    let terms = stmt
        .query_map([owner], term_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(terms)
}

/// Operator removal of a term
pub fn delete_term(conn: &Connection, owner: &str, term_id: &str) -> Result<()> {
    let deleted = conn.execute(
        "DELETE FROM vocabulary WHERE id = ?1 AND owner = ?2",
        params![term_id, owner],
    )?;
    if deleted == 0 {
        return Err(LoopError::not_found("vocabulary term", term_id));
    }
    tracing::info!(owner, term_id, "Vocabulary term deleted");
    Ok(())
}
