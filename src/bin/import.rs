//! Import decision exports from producers
//!
//! Usage: cargo run --bin import -- [--db <path>] [--owner <owner>] <exports.jsonl...>
//!
//! One decision per line, in the `record_decision` shape. `--owner` overrides
//! the owner of every line (for exports produced per tenant).

use anyhow::{bail, Context, Result};
use learnloop::db;
use learnloop::ledger::{self, DecisionRecord};
use rusqlite::Connection;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct ImportCounts {
    imported: usize,
    skipped: usize,
}

fn import_file(conn: &Connection, path: &Path, owner: Option<&str>) -> Result<ImportCounts> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut counts = ImportCounts::default();

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut record: DecisionRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(file = ?path, line = line_no + 1, error = %e, "Skipping malformed line");
                counts.skipped += 1;
                continue;
            }
        };
        if let Some(owner) = owner {
            record.scope.owner = owner.to_string();
        }
        match ledger::record_decision(conn, &record) {
            Ok(_) => counts.imported += 1,
            Err(e @ learnloop::LoopError::Storage(_)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!(file = ?path, line = line_no + 1, error = %e, "Skipping invalid decision");
                counts.skipped += 1;
            }
        }
    }
    Ok(counts)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut take = |flag: &str| -> Result<Option<String>> {
        let Some(pos) = args.iter().position(|a| a == flag) else {
            return Ok(None);
        };
        if pos + 1 >= args.len() {
            bail!("{} needs a value", flag);
        }
        let value = args.remove(pos + 1);
        args.remove(pos);
        Ok(Some(value))
    };
    let db_path = take("--db")?;
    let owner = take("--owner")?;

    if args.is_empty() {
        eprintln!("Usage: import [--db <path>] [--owner <owner>] <exports.jsonl...>");
        std::process::exit(1);
    }

    let db_path = match db_path {
        Some(p) => PathBuf::from(p),
        None => {
            let data_dir = dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("learnloop");
            fs::create_dir_all(&data_dir)?;
            data_dir.join("loop.db")
        }
    };
    println!("Opening database at {:?}", db_path);
    let conn = db::init_db(&db_path)?;

    let mut total = ImportCounts::default();
    for file in &args {
        let counts = import_file(&conn, Path::new(file), owner.as_deref())?;
        println!("  {}: {} imported, {} skipped", file, counts.imported, counts.skipped);
        total.imported += counts.imported;
        total.skipped += counts.skipped;
    }
    println!("Imported {} decisions ({} skipped)", total.imported, total.skipped);
    Ok(())
}
