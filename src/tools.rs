//! RPC tool surface
//!
//! `get_tools()` is the catalogue served by `tools/list`; `call_tool` routes a
//! `tools/call` to the owning module. Every call runs as the authenticated
//! owner, so ids belonging to anyone else resolve as not-found.

use crate::agent::{AgentTask, LearningAgent};
use crate::calibration;
use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::learning::{self, LearningParams};
use crate::ledger::{self, DecisionRecord, FeedbackSubmission};
use crate::maverick::{self, Maverick, MaverickTask};
use crate::metrics;
use crate::rules;
use crate::types::*;
use crate::vocabulary::{self, TermFilter};
use rusqlite::Connection;
use serde_json::{json, Value};

/// Tool definitions with JSON input schemas
pub fn get_tools() -> Vec<Value> {
    vec![
        // Ledger
        json!({
            "name": "record_decision",
            "description": "Record an automated decision with its confidence. Returns the decision id; the decision joins the validation queue.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "decision_type": {
                        "type": "string",
                        "enum": ["cluster-assignment", "concept-extraction", "duplicate-merge", "document-placement"]
                    },
                    "scope": {
                        "type": "object",
                        "description": "knowledge_base, document_id, cluster_id (owner is taken from the token)"
                    },
                    "input_snapshot": {"type": "object"},
                    "output_snapshot": {"description": "The producer's choice, e.g. {\"cluster\": \"Finance\"}"},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                    "model_identity": {"type": "string"}
                },
                "required": ["decision_type", "output_snapshot", "confidence", "model_identity"]
            }
        }),
        json!({
            "name": "get_pending_validations",
            "description": "Validation queue: unvalidated decisions as prompts with fixed options, lowest confidence first.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "default": 20},
                    "offset": {"type": "integer", "default": 0}
                }
            }
        }),
        json!({
            "name": "submit_feedback",
            "description": "Validate a pending decision. Partial results must carry new_value. A second submission for the same decision is a conflict.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "decision_id": {"type": "string"},
                    "result": {"type": "string", "enum": ["accepted", "rejected", "partial"]},
                    "new_value": {"description": "Corrected value (edit or move)"},
                    "reasoning": {"type": "string"}
                },
                "required": ["decision_id", "result"]
            }
        }),
        json!({
            "name": "get_accuracy_metrics",
            "description": "Overall acceptance, per-band accuracy, improvement trend, counts per decision type, pending count, thresholds and learning profile.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        // Rules and vocabulary
        json!({
            "name": "list_rules",
            "description": "Learned rules, most confident first, with derived accuracy.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "rule_type": {"type": "string"},
                    "include_inactive": {"type": "boolean", "default": false}
                }
            }
        }),
        json!({
            "name": "deactivate_rule",
            "description": "Stop a rule from matching. Counters are kept.",
            "inputSchema": {
                "type": "object",
                "properties": {"rule_id": {"type": "string"}},
                "required": ["rule_id"]
            }
        }),
        json!({
            "name": "reactivate_rule",
            "description": "Let a deactivated rule match again.",
            "inputSchema": {
                "type": "object",
                "properties": {"rule_id": {"type": "string"}},
                "required": ["rule_id"]
            }
        }),
        json!({
            "name": "list_vocabulary",
            "description": "Learned concept vocabulary with include/exclude flags.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "filter": {"type": "string", "enum": ["all", "always", "never"], "default": "all"}
                }
            }
        }),
        json!({
            "name": "delete_vocabulary_term",
            "description": "Remove a vocabulary term and its variants.",
            "inputSchema": {
                "type": "object",
                "properties": {"term_id": {"type": "string"}},
                "required": ["term_id"]
            }
        }),
        // Learning and calibration
        json!({
            "name": "run_learning",
            "description": "Fold unprocessed feedback into rules and vocabulary. Returns counts, skipped items and rule adjustments.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "lookback_days": {"type": "integer"},
                    "min_support": {"type": "integer", "minimum": 1}
                }
            }
        }),
        json!({
            "name": "calibrate_thresholds",
            "description": "Recompute high/medium/low confidence thresholds from validated decisions. Refuses below the minimum sample.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        // Learning Agent
        json!({
            "name": "learning_agent_status",
            "description": "Learning Agent mode, strategy, counters, accuracy history and active strategy gate.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "learning_agent_task",
            "description": "Run one Learning Agent task.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "enum": ["observe_outcomes", "make_autonomous_decisions", "self_evaluate", "run_experiments"]
                    }
                },
                "required": ["task"]
            }
        }),
        json!({
            "name": "learning_agent_step",
            "description": "Run the task for the agent's current mode, then advance the mode cycle.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "learning_agent_set_strategy",
            "description": "Override the Learning Agent's risk posture. Resets the accuracy history the gate reads.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "strategy": {"type": "string", "enum": ["conservative", "balanced", "aggressive"]}
                },
                "required": ["strategy"]
            }
        }),
        // Maverick
        json!({
            "name": "maverick_status",
            "description": "Maverick mood, confidence, expertise weights and hypothesis counts per status.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "maverick_hypotheses",
            "description": "Hypotheses, newest first, optionally filtered by status.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "status": {"type": "string", "enum": ["pending", "testing", "validated", "rejected", "applied"]}
                }
            }
        }),
        json!({
            "name": "maverick_insights",
            "description": "Per-category track record and the best validated hypotheses.",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "maverick_task",
            "description": "Run one Maverick task.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "enum": ["challenge_decisions", "test_hypotheses", "measure_and_learn", "apply_improvements", "self_improve"]
                    }
                },
                "required": ["task"]
            }
        }),
        json!({
            "name": "maverick_apply_hypothesis",
            "description": "Apply one validated hypothesis. The explicit human step between validation and application.",
            "inputSchema": {
                "type": "object",
                "properties": {"hypothesis_id": {"type": "string"}},
                "required": ["hypothesis_id"]
            }
        }),
        json!({
            "name": "maverick_abandon_hypothesis",
            "description": "Withdraw a pending or testing hypothesis with a recorded reason.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "hypothesis_id": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["hypothesis_id", "reason"]
            }
        }),
    ]
}

fn str_arg<'v>(args: &'v Value, key: &str) -> Result<&'v str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| LoopError::InvalidInput(format!("missing string argument: {}", key)))
}

fn opt_str<'v>(args: &'v Value, key: &str) -> Option<&'v str> {
    args.get(key).and_then(|v| v.as_str())
}

fn opt_u64(args: &Value, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| LoopError::InvalidInput(format!("{} must be a non-negative integer", key))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone()).map_err(|e| LoopError::InvalidInput(e.to_string()))
}

/// Execute one tool for `owner`
pub fn call_tool(conn: &Connection, config: &LoopConfig, owner: &str, name: &str, args: &Value) -> Result<Value> {
    tracing::debug!(owner, tool = name, "Tool call");
    let value = match name {
        "record_decision" => {
            if !args.is_object() {
                return Err(LoopError::InvalidInput("arguments must be an object".into()));
            }
            let mut args = args.clone();
            if !args.get("scope").is_some_and(Value::is_object) {
                args["scope"] = json!({});
            }
            args["scope"]["owner"] = json!(owner);
            let record: DecisionRecord = decode(&args)?;
            let decision_id = ledger::record_decision(conn, &record)?;
            json!({"decision_id": decision_id})
        }
        "get_pending_validations" => {
            let limit = opt_u64(args, "limit")?.unwrap_or(20) as usize;
            let offset = opt_u64(args, "offset")?.unwrap_or(0) as usize;
            let prompts = ledger::list_pending_validations(conn, owner, limit, offset)?;
            json!({
                "pending_count": ledger::count_pending(conn, owner)?,
                "validations": prompts,
            })
        }
        "submit_feedback" => {
            let submission: FeedbackSubmission = decode(args)?;
            serde_json::to_value(ledger::submit_feedback(conn, owner, &submission)?)?
        }
        "get_accuracy_metrics" => serde_json::to_value(metrics::accuracy_metrics(conn, owner, config)?)?,
        "list_rules" => {
            let rule_type = opt_str(args, "rule_type").map(str::parse::<DecisionType>).transpose()?;
            let include_inactive = args.get("include_inactive").and_then(|v| v.as_bool()).unwrap_or(false);
            let rules: Vec<Value> = rules::list_rules(conn, owner, rule_type, include_inactive)?
                .into_iter()
                .map(|rule| -> Result<Value> {
                    let accuracy = rule.accuracy();
                    let mut v = serde_json::to_value(rule)?;
                    v["accuracy"] = json!(accuracy);
                    Ok(v)
                })
                .collect::<Result<_>>()?;
            json!({"rules": rules})
        }
        "deactivate_rule" => serde_json::to_value(rules::deactivate_rule(conn, owner, str_arg(args, "rule_id")?)?)?,
        "reactivate_rule" => serde_json::to_value(rules::reactivate_rule(conn, owner, str_arg(args, "rule_id")?)?)?,
        "list_vocabulary" => {
            let filter: TermFilter = opt_str(args, "filter").unwrap_or("all").parse()?;
            json!({"terms": vocabulary::list_vocabulary(conn, owner, filter)?})
        }
        "delete_vocabulary_term" => {
            let term_id = str_arg(args, "term_id")?;
            vocabulary::delete_term(conn, owner, term_id)?;
            json!({"deleted": term_id})
        }
        "run_learning" => {
            let defaults = LearningParams::from_config(&config.rules);
            let params = LearningParams {
                lookback_days: opt_u64(args, "lookback_days")?.map_or(defaults.lookback_days, |d| d as i64),
                min_support: opt_u64(args, "min_support")?.map_or(defaults.min_support, |s| s as usize),
            };
            serde_json::to_value(learning::run_learning(conn, owner, params, config)?)?
        }
        "calibrate_thresholds" => serde_json::to_value(calibration::calibrate_thresholds(conn, owner, config)?)?,
        "learning_agent_status" => serde_json::to_value(LearningAgent::new(conn, owner, config).status()?)?,
        "learning_agent_task" => {
            let task: AgentTask = str_arg(args, "task")?.parse()?;
            serde_json::to_value(LearningAgent::new(conn, owner, config).run_task(task)?)?
        }
        "learning_agent_step" => serde_json::to_value(LearningAgent::new(conn, owner, config).step()?)?,
        "learning_agent_set_strategy" => {
            let strategy: Strategy = str_arg(args, "strategy")?.parse()?;
            serde_json::to_value(LearningAgent::new(conn, owner, config).set_strategy(strategy)?)?
        }
        "maverick_status" => serde_json::to_value(Maverick::new(conn, owner, config).status()?)?,
        "maverick_hypotheses" => {
            let status = opt_str(args, "status").map(str::parse::<HypothesisStatus>).transpose()?;
            json!({"hypotheses": maverick::list_hypotheses(conn, owner, status)?})
        }
        "maverick_insights" => serde_json::to_value(Maverick::new(conn, owner, config).insights()?)?,
        "maverick_task" => {
            let task: MaverickTask = str_arg(args, "task")?.parse()?;
            serde_json::to_value(Maverick::new(conn, owner, config).run_task(task)?)?
        }
        "maverick_apply_hypothesis" => {
            let id = str_arg(args, "hypothesis_id")?;
            serde_json::to_value(Maverick::new(conn, owner, config).apply_hypothesis(id)?)?
        }
        "maverick_abandon_hypothesis" => {
            let id = str_arg(args, "hypothesis_id")?;
            let reason = str_arg(args, "reason")?;
            serde_json::to_value(Maverick::new(conn, owner, config).abandon_hypothesis(id, reason)?)?
        }
        other => return Err(LoopError::not_found("tool", other)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn names() -> Vec<String> {
        get_tools()
            .iter()
            .filter_map(|t| t["name"].as_str().map(String::from))
            .collect()
    }

    #[test]
    fn test_catalogue_is_complete() {
        let names = names();
        assert_eq!(names.len(), 21);
        for expected in [
            "record_decision",
            "submit_feedback",
            "maverick_task",
            "maverick_apply_hypothesis",
            "maverick_abandon_hypothesis",
            "learning_agent_task",
            "learning_agent_step",
            "learning_agent_set_strategy",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
        for tool in get_tools() {
            assert!(tool["inputSchema"]["type"] == "object");
        }
    }

    #[test]
    fn test_every_listed_tool_is_routed() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        for name in names() {
            let err = call_tool(&conn, &config, "alice", &name, &json!({})).err();
            if let Some(err) = err {
                // Missing arguments or data, never an unknown tool
                assert_ne!(err.to_string(), format!("tool not found: {}", name));
            }
        }
        let err = call_tool(&conn, &config, "alice", "summarize", &json!({})).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_record_decision_is_scoped_to_caller() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let out = call_tool(
            &conn,
            &config,
            "alice",
            "record_decision",
            &json!({
                "decision_type": "cluster-assignment",
                "scope": {"owner": "mallory", "document_id": "d1"},
                "output_snapshot": {"cluster": "Misc"},
                "confidence": 0.42,
                "model_identity": "clusterer-v1"
            }),
        )
        .unwrap();
        let id = out["decision_id"].as_str().unwrap();
        assert!(ledger::get_decision(&conn, "alice", id).is_ok());
        assert_eq!(ledger::get_decision(&conn, "mallory", id).unwrap_err().kind(), "not_found");

        let pending = call_tool(&conn, &config, "alice", "get_pending_validations", &json!({})).unwrap();
        assert_eq!(pending["pending_count"], 1);
        assert_eq!(pending["validations"][0]["decision_id"], id);
    }

    #[test]
    fn test_bad_arguments_are_invalid_input() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let err = call_tool(&conn, &config, "alice", "learning_agent_task", &json!({"task": "dream"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        let err = call_tool(&conn, &config, "alice", "get_pending_validations", &json!({"limit": -1})).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_hypothesis_review_is_scoped_to_caller() {
        let conn = db::init_memory_db().unwrap();
        let mut config = LoopConfig::default();
        config.maverick.window_events = 10;
        config.maverick.min_sample = 5;
        for i in 0..4 {
            let id = ledger::record_decision(&conn, &ledger::tests::cluster_record("alice", &format!("s{}", i), "A", 0.87))
                .unwrap();
            let submission = FeedbackSubmission {
                decision_id: id,
                result: ValidationResult::Rejected,
                new_value: None,
                reasoning: None,
            };
            ledger::submit_feedback(&conn, "alice", &submission).unwrap();
        }
        let h = Maverick::new(&conn, "alice", &config)
            .challenge_decisions()
            .unwrap()
            .proposed
            .remove(0);

        let args = json!({"hypothesis_id": h.id, "reason": "not mine"});
        let err = call_tool(&conn, &config, "bob", "maverick_abandon_hypothesis", &args).unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let err = call_tool(&conn, &config, "bob", "maverick_apply_hypothesis", &args).unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let out = call_tool(&conn, &config, "alice", "maverick_abandon_hypothesis", &args).unwrap();
        assert_eq!(out["status"], "rejected");
        assert_eq!(out["conclusion_reason"], "abandoned: not mine");
    }

    #[test]
    fn test_strategy_override_over_rpc() {
        let conn = db::init_memory_db().unwrap();
        let config = LoopConfig::default();
        let out = call_tool(&conn, &config, "alice", "learning_agent_set_strategy", &json!({"strategy": "aggressive"})).unwrap();
        assert_eq!(out["strategy"], "aggressive");
        let err = call_tool(&conn, &config, "alice", "learning_agent_set_strategy", &json!({"strategy": "reckless"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(call_tool(&conn, &config, "alice", "learning_agent_step", &json!({})).is_ok());
    }
}
