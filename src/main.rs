//! learnloop CLI and RPC server
//!
//! Run with: learnloop --serve [--port=3200]
//! Every other command operates on one owner and prints JSON to stdout.

use anyhow::{bail, Context, Result};
use learnloop::{
    agent::AgentTask,
    learning::LearningParams,
    ledger::FeedbackSubmission,
    maverick::{self, MaverickTask},
    server, tools,
    types::*,
    LoopConfig, LoopEngine,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: learnloop [--config <path>] [--db <path>] <command>

Commands:
  --serve [--port=N]                                   JSON-RPC server on POST /rpc
  --tools                                              Print tool definitions
  --pending <owner> [--limit=N]                        Validation queue
  --feedback <owner> <decision> <result> [--value V] [--reason R]
  --learn <owner> [--days N] [--support N]             Learning Run
  --calibrate <owner>                                  Recompute thresholds
  --metrics <owner>                                    Accuracy metrics
  --agent <owner> <task|status|step|strategy <name>>   Learning Agent
  --maverick <owner> <task|status|insights|hypotheses|apply <id>|abandon <id> <reason>>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_flag(&mut args, "--config")?.map(PathBuf::from);
    let db_path = match take_flag(&mut args, "--db")? {
        Some(p) => PathBuf::from(p),
        None => get_data_dir()?.join("loop.db"),
    };
    let config = load_config(config_path)?;

    let Some(command) = args.first().cloned() else {
        println!("{}", USAGE);
        return Ok(());
    };

    match command.as_str() {
        "--tools" => print_json(&tools::get_tools()),
        "--serve" => {
            let port = args
                .iter()
                .find_map(|a| a.strip_prefix("--port="))
                .map(|p| p.parse::<u16>().with_context(|| format!("invalid port: {}", p)))
                .transpose()?
                .unwrap_or(config.server.port);
            server::serve(db_path, config, port).await
        }
        "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => {
            let engine = LoopEngine::open(&db_path, config)?;
            run_owner_command(&engine, &command, &args[1..])
        }
    }
}

fn run_owner_command(engine: &LoopEngine, command: &str, args: &[String]) -> Result<()> {
    let owner = args.first().map(String::as_str).context(USAGE)?;
    let mut rest: Vec<String> = args[1..].to_vec();

    match command {
        "--pending" => {
            let limit = rest
                .iter()
                .find_map(|a| a.strip_prefix("--limit="))
                .map(|l| l.parse::<usize>())
                .transpose()?
                .unwrap_or(20);
            print_json(&engine.pending_validations(owner, limit, 0)?)
        }
        "--feedback" => {
            let value = take_flag(&mut rest, "--value")?.map(|v| parse_value(&v));
            let reasoning = take_flag(&mut rest, "--reason")?;
            let [decision_id, result] = rest.as_slice() else {
                bail!("Usage: --feedback <owner> <decision> <accepted|rejected|partial> [--value V] [--reason R]");
            };
            let submission = FeedbackSubmission {
                decision_id: decision_id.clone(),
                result: result.parse()?,
                new_value: value,
                reasoning,
            };
            print_json(&engine.submit_feedback(owner, &submission)?)
        }
        "--learn" => {
            let defaults = LearningParams::from_config(&engine.config().rules);
            let params = LearningParams {
                lookback_days: take_flag(&mut rest, "--days")?
                    .map(|d| d.parse())
                    .transpose()
                    .context("--days must be an integer")?
                    .unwrap_or(defaults.lookback_days),
                min_support: take_flag(&mut rest, "--support")?
                    .map(|s| s.parse())
                    .transpose()
                    .context("--support must be a positive integer")?
                    .unwrap_or(defaults.min_support),
            };
            print_json(&engine.run_learning(owner, Some(params))?)
        }
        "--calibrate" => print_json(&engine.calibrate_thresholds(owner)?),
        "--metrics" => print_json(&engine.accuracy_metrics(owner)?),
        "--agent" => {
            let agent = engine.agent(owner);
            match rest.first().map(String::as_str) {
                None | Some("status") => print_json(&agent.status()?),
                Some("step") => print_json(&agent.step()?),
                Some("strategy") => {
                    let strategy: Strategy = rest.get(1).context("Usage: --agent <owner> strategy <name>")?.parse()?;
                    print_json(&agent.set_strategy(strategy)?)
                }
                Some(task) => print_json(&agent.run_task(task.parse::<AgentTask>()?)?),
            }
        }
        "--maverick" => {
            let maverick = engine.maverick(owner);
            match rest.first().map(String::as_str) {
                None | Some("status") => print_json(&maverick.status()?),
                Some("insights") => print_json(&maverick.insights()?),
                Some("hypotheses") => {
                    let status = rest.get(1).map(|s| s.parse::<HypothesisStatus>()).transpose()?;
                    print_json(&maverick::list_hypotheses(engine.conn(), owner, status)?)
                }
                Some("apply") => {
                    let id = rest.get(1).context("Usage: --maverick <owner> apply <id>")?;
                    print_json(&maverick.apply_hypothesis(id)?)
                }
                Some("abandon") => {
                    let id = rest.get(1).context("Usage: --maverick <owner> abandon <id> <reason>")?;
                    let reason = rest[2..].join(" ");
                    print_json(&maverick.abandon_hypothesis(id, &reason)?)
                }
                Some(task) => print_json(&maverick.run_task(task.parse::<MaverickTask>()?)?),
            }
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

/// Remove `flag <value>` from args and return the value
fn take_flag(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} needs a value", flag);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

/// JSON if it parses, otherwise a plain string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<LoopConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {:?}", path);
            }
            path
        }
        None => get_data_dir()?.join("config.toml"),
    };
    LoopConfig::load(&path).with_context(|| format!("Failed to load config from {:?}", path))
}

fn get_data_dir() -> Result<PathBuf> {
    // XDG data dir on Linux, ~/Library/Application Support on macOS
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("learnloop");
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
    Ok(dir)
}
