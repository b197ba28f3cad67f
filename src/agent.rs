//! Learning Agent - bounded autonomy over learned rules
//!
//! A four-phase loop per owner:
//! 1. observe: count validations since the checkpoint
//! 2. decide: apply admitted rules to pending producer decisions
//! 3. evaluate: compare recent acceptance with the window before it
//! 4. experiment: replay strategy gates on held-out autonomous decisions
//!
//! The strategy only moves one level at a time, and promotions can be held
//! back until an experiment confirms them.

use crate::config::{LoopConfig, StrategyGate};
use crate::db::{self, get_json, get_opt_ts, get_parsed, get_ts, OwnerLock};
use crate::error::{LoopError, Result};
use crate::ledger::{self, ValidatedOutcome};
use crate::maverick;
use crate::metrics;
use crate::rules;
use crate::stats;
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Identity stamped on every decision the agent writes
pub const AGENT_IDENTITY: &str = "learning-agent";

/// Named agent tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentTask {
    ObserveOutcomes,
    MakeAutonomousDecisions,
    SelfEvaluate,
    RunExperiments,
}

impl AgentTask {
    pub const ALL: [AgentTask; 4] = [
        AgentTask::ObserveOutcomes,
        AgentTask::MakeAutonomousDecisions,
        AgentTask::SelfEvaluate,
        AgentTask::RunExperiments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTask::ObserveOutcomes => "observe_outcomes",
            AgentTask::MakeAutonomousDecisions => "make_autonomous_decisions",
            AgentTask::SelfEvaluate => "self_evaluate",
            AgentTask::RunExperiments => "run_experiments",
        }
    }

    /// The task a mode runs
    pub fn for_mode(mode: AgentMode) -> AgentTask {
        match mode {
            AgentMode::Observing => AgentTask::ObserveOutcomes,
            AgentMode::Deciding => AgentTask::MakeAutonomousDecisions,
            AgentMode::Evaluating => AgentTask::SelfEvaluate,
            AgentMode::Experimenting => AgentTask::RunExperiments,
        }
    }
}

impl FromStr for AgentTask {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        AgentTask::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LoopError::InvalidInput(format!("unknown agent task: {}", s)))
    }
}

/// One self-evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyPoint {
    pub at: DateTime<Utc>,
    pub recent: Option<f64>,
    pub previous: Option<f64>,
    pub strategy: Strategy,
}

/// Persisted per-owner agent state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub owner: String,
    pub mode: AgentMode,
    pub strategy: Strategy,
    pub last_observation_at: Option<DateTime<Utc>>,
    pub observation_count: i64,
    pub action_count: i64,
    pub accuracy_history: Vec<AccuracyPoint>,
    pub improvement_streak: u32,
    pub proposed_strategy: Option<Strategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationReport {
    pub validated: usize,
    pub overrides: i64,
    pub checkpoint: DateTime<Utc>,
}

/// One autonomous action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousAction {
    pub decision_id: String,
    pub supersedes: String,
    pub rule_id: String,
    pub confidence: f64,
    pub resolution: ValidationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionReport {
    pub strategy: Strategy,
    pub considered: usize,
    pub actions: Vec<AutonomousAction>,
    /// Matches held back for an active retire test
    pub withheld: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationVerdict {
    Held,
    Demoted,
    Promoted,
    PromotionProposed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub recent: Option<f64>,
    pub previous: Option<f64>,
    pub delta: f64,
    pub verdict: EvaluationVerdict,
    pub strategy: Strategy,
    pub improvement_streak: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyReplay {
    pub strategy: Strategy,
    pub admitted: usize,
    pub coverage: f64,
    pub acceptance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub held_out: usize,
    pub replays: Vec<StrategyReplay>,
    pub proposal: Option<Strategy>,
    pub committed: bool,
    pub strategy: Strategy,
}

/// Outcome of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskReport {
    Observed(ObservationReport),
    Decided(DecisionReport),
    Evaluated(EvaluationReport),
    Experimented(ExperimentReport),
    Skipped { task: AgentTask, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub mode_before: AgentMode,
    pub mode_after: AgentMode,
    pub report: TaskReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(flatten)]
    pub state: AgentState,
    pub gate: StrategyGate,
}

/// Handle over one owner's Learning Agent
pub struct LearningAgent<'a> {
    conn: &'a Connection,
    owner: &'a str,
    config: &'a LoopConfig,
}

impl<'a> LearningAgent<'a> {
    pub fn new(conn: &'a Connection, owner: &'a str, config: &'a LoopConfig) -> Self {
        Self { conn, owner, config }
    }

    /// Current state; a fresh observer at the configured strategy if none
    pub fn load_state(&self) -> Result<AgentState> {
        let state = self
            .conn
            .query_row(
                "SELECT mode, strategy, last_observation_at, observation_count, action_count,
                        accuracy_history_json, improvement_streak, proposed_strategy
                 FROM agent_state WHERE owner = ?1",
                [self.owner],
                |row| {
                    let proposed: Option<String> = row.get(7)?;
                    Ok(AgentState {
                        owner: self.owner.to_string(),
                        mode: get_parsed(row, 0)?,
                        strategy: get_parsed(row, 1)?,
                        last_observation_at: get_opt_ts(row, 2)?,
                        observation_count: row.get(3)?,
                        action_count: row.get(4)?,
                        accuracy_history: get_json(row, 5)?,
                        improvement_streak: row.get(6)?,
                        proposed_strategy: proposed.and_then(|p| p.parse().ok()),
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_else(|| AgentState {
            owner: self.owner.to_string(),
            mode: AgentMode::Observing,
            strategy: self.config.agent.initial_strategy,
            last_observation_at: None,
            observation_count: 0,
            action_count: 0,
            accuracy_history: Vec::new(),
            improvement_streak: 0,
            proposed_strategy: None,
        }))
    }

    fn save_state(&self, state: &AgentState) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO agent_state (owner, mode, strategy, last_observation_at, observation_count,
                                     action_count, accuracy_history_json, improvement_streak,
                                     proposed_strategy, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(owner) DO UPDATE SET
                mode = excluded.mode,
                strategy = excluded.strategy,
                last_observation_at = excluded.last_observation_at,
                observation_count = excluded.observation_count,
                action_count = excluded.action_count,
                accuracy_history_json = excluded.accuracy_history_json,
                improvement_streak = excluded.improvement_streak,
                proposed_strategy = excluded.proposed_strategy,
                updated_at = excluded.updated_at
            "#,
            params![
                self.owner,
                state.mode.as_str(),
                state.strategy.as_str(),
                state.last_observation_at.map(db::ts),
                state.observation_count,
                state.action_count,
                serde_json::to_string(&state.accuracy_history)?,
                state.improvement_streak,
                state.proposed_strategy.map(|s| s.as_str()),
                db::now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn status(&self) -> Result<AgentStatus> {
        let state = self.load_state()?;
        let gate = *self.config.agent.gate(state.strategy);
        Ok(AgentStatus { state, gate })
    }

    /// Operator override of the strategy; clears any pending proposal
    pub fn set_strategy(&self, strategy: Strategy) -> Result<AgentState> {
        let mut state = self.load_state()?;
        if state.strategy != strategy {
            tracing::info!(
                owner = self.owner,
                from = state.strategy.as_str(),
                to = strategy.as_str(),
                "Strategy set by operator"
            );
        }
        state.strategy = strategy;
        state.proposed_strategy = None;
        state.improvement_streak = 0;
        self.save_state(&state)?;
        Ok(state)
    }

    /// Run one named task against persisted state
    pub fn run_task(&self, task: AgentTask) -> Result<TaskReport> {
        let mut state = self.load_state()?;
        let report = self.dispatch(task, &mut state)?;
        self.save_state(&state)?;
        Ok(report)
    }

    /// Run the current mode's task, then advance the mode
    pub fn step(&self) -> Result<StepReport> {
        let mut state = self.load_state()?;
        let mode_before = state.mode;
        let report = self.dispatch(AgentTask::for_mode(mode_before), &mut state)?;
        state.mode = mode_before.next();
        self.save_state(&state)?;
        tracing::debug!(owner = self.owner, from = mode_before.as_str(), to = state.mode.as_str(), "Agent step");
        Ok(StepReport {
            mode_before,
            mode_after: state.mode,
            report,
        })
    }

    fn dispatch(&self, task: AgentTask, state: &mut AgentState) -> Result<TaskReport> {
        match task {
            AgentTask::ObserveOutcomes => self.observe_outcomes(state),
            AgentTask::MakeAutonomousDecisions => self.make_autonomous_decisions(state),
            AgentTask::SelfEvaluate => self.self_evaluate(state),
            AgentTask::RunExperiments => self.run_experiments(state),
        }
    }

    fn observe_outcomes(&self, state: &mut AgentState) -> Result<TaskReport> {
        let since = state.last_observation_at.unwrap_or_default();
        let validated = ledger::list_validated_since(self.conn, self.owner, since)?;
        let Some(latest) = validated.iter().map(|o| o.validated_at).max() else {
            return Ok(TaskReport::Skipped {
                task: AgentTask::ObserveOutcomes,
                reason: "no new validations".into(),
            });
        };
        let overrides = ledger::count_overrides_since(self.conn, self.owner, since)?;

        // Checkpoint just past the newest validation so it is not recounted
        let checkpoint = latest + Duration::microseconds(1);
        state.observation_count += validated.len() as i64;
        state.last_observation_at = Some(checkpoint);

        Ok(TaskReport::Observed(ObservationReport {
            validated: validated.len(),
            overrides,
            checkpoint,
        }))
    }

    fn make_autonomous_decisions(&self, state: &mut AgentState) -> Result<TaskReport> {
        let _lock = OwnerLock::acquire(self.conn, self.owner, "agent_decide", self.config.locks.lease_ttl_secs)?;
        let gate = self.config.agent.gate(state.strategy);
        let retire_tests = maverick::active_retire_tests(self.conn, self.owner)?;
        let max_actions = self.config.agent.max_actions_per_run;

        let pending = ledger::list_pending_decisions(self.conn, self.owner, i64::MAX as usize, 0)?;
        let mut report = DecisionReport {
            strategy: state.strategy,
            considered: 0,
            actions: Vec::new(),
            withheld: 0,
        };

        for decision in pending.iter().filter(|d| !d.is_autonomous()) {
            if report.actions.len() >= max_actions {
                break;
            }
            let Some(signature) = decision.signature() else {
                continue;
            };
            report.considered += 1;

            let mut chosen = None;
            for rule in rules::find_matching(self.conn, self.owner, &signature)? {
                if !gate.admits(&rule) {
                    continue;
                }
                let withheld = retire_tests.iter().any(|t| {
                    t.rule_id == rule.id && stats::in_slice(&t.hypothesis_id, &decision.id, t.split_ratio)
                });
                if withheld {
                    report.withheld += 1;
                    continue;
                }
                chosen = Some(rule);
                break;
            }
            let Some(rule) = chosen else {
                continue;
            };

            report.actions.push(self.apply_rule(decision, &rule, &signature)?);
        }

        state.action_count += report.actions.len() as i64;
        if !report.actions.is_empty() {
            tracing::info!(
                owner = self.owner,
                strategy = state.strategy.as_str(),
                actions = report.actions.len(),
                "Autonomous decisions made"
            );
        }
        Ok(TaskReport::Decided(report))
    }

    /// Supersede one producer decision with a rule's action
    fn apply_rule(&self, decision: &AiDecision, rule: &LearnedRule, signature: &RuleCondition) -> Result<AutonomousAction> {
        let autonomous = AiDecision {
            id: Uuid::new_v4().to_string(),
            decision_type: decision.decision_type,
            scope: decision.scope.clone(),
            input_snapshot: decision.input_snapshot.clone(),
            output_snapshot: rule.action.apply_to(decision.decision_type, &decision.output_snapshot),
            confidence: rule.confidence,
            model_identity: AGENT_IDENTITY.to_string(),
            validated: false,
            validation_result: None,
            validated_at: None,
            rule_id: Some(rule.id.clone()),
            supersedes: Some(decision.id.clone()),
            created_at: Utc::now(),
        };
        let unchanged = RuleAction::Assign {
            value: signature.original_value.clone(),
        };
        let resolution = if rule.action.agrees_with(&unchanged) {
            ValidationResult::Accepted
        } else {
            ValidationResult::Partial
        };

        let tx = self.conn.unchecked_transaction()?;
        ledger::insert_decision(&tx, &autonomous)?;
        ledger::record_rule_state(&tx, &autonomous.id, &rule.state())?;
        rules::record_application(&tx, &rule.id)?;
        ledger::resolve_decision(&tx, self.owner, &decision.id, resolution)?;
        tx.commit()?;

        tracing::debug!(
            owner = self.owner,
            rule_id = %rule.id,
            supersedes = %decision.id,
            "Rule applied autonomously"
        );
        Ok(AutonomousAction {
            decision_id: autonomous.id,
            supersedes: decision.id.clone(),
            rule_id: rule.id.clone(),
            confidence: rule.confidence,
            resolution,
        })
    }

    fn self_evaluate(&self, state: &mut AgentState) -> Result<TaskReport> {
        let cfg = &self.config.agent;
        let k = cfg.trend_window;
        let outcomes = ledger::list_validated(self.conn, self.owner, Some(2 * k))?;
        if outcomes.len() < 2 * k {
            return Ok(TaskReport::Skipped {
                task: AgentTask::SelfEvaluate,
                reason: format!("need {} validated decisions, have {}", 2 * k, outcomes.len()),
            });
        }

        let trend = metrics::trend(&outcomes, k, self.config.calibration.partial_credit);
        let delta = trend.delta.unwrap_or(0.0);
        let before = state.strategy;

        let verdict = if delta < -cfg.degrade_threshold {
            state.strategy = before.demote();
            state.improvement_streak = 0;
            state.proposed_strategy = None;
            if state.strategy != before {
                EvaluationVerdict::Demoted
            } else {
                EvaluationVerdict::Held
            }
        } else if delta > cfg.improve_threshold {
            state.improvement_streak += 1;
            if state.improvement_streak >= cfg.sustain_evaluations && before != Strategy::Aggressive {
                state.improvement_streak = 0;
                if cfg.require_experiment {
                    state.proposed_strategy = Some(before.promote());
                    EvaluationVerdict::PromotionProposed
                } else {
                    state.strategy = before.promote();
                    EvaluationVerdict::Promoted
                }
            } else {
                EvaluationVerdict::Held
            }
        } else {
            state.improvement_streak = 0;
            EvaluationVerdict::Held
        };

        if state.strategy != before {
            tracing::info!(
                owner = self.owner,
                from = before.as_str(),
                to = state.strategy.as_str(),
                delta,
                "Strategy changed by self-evaluation"
            );
        }

        state.accuracy_history.push(AccuracyPoint {
            at: Utc::now(),
            recent: trend.recent,
            previous: trend.previous,
            strategy: state.strategy,
        });
        let overflow = state.accuracy_history.len().saturating_sub(cfg.history_len);
        state.accuracy_history.drain(..overflow);

        Ok(TaskReport::Evaluated(EvaluationReport {
            recent: trend.recent,
            previous: trend.previous,
            delta,
            verdict,
            strategy: state.strategy,
            improvement_streak: state.improvement_streak,
        }))
    }

    fn run_experiments(&self, state: &mut AgentState) -> Result<TaskReport> {
        let cfg = &self.config.agent;
        let held_out = ledger::list_validated_autonomous(self.conn, self.owner, cfg.experiment_window)?;
        if held_out.is_empty() {
            return Ok(TaskReport::Skipped {
                task: AgentTask::RunExperiments,
                reason: "no validated autonomous decisions".into(),
            });
        }

        let replays: Vec<StrategyReplay> = Strategy::ALL
            .into_iter()
            .map(|strategy| {
                let gate = cfg.gate(strategy);
                let admitted: Vec<ValidatedOutcome> = held_out
                    .iter()
                    // Gate on the rule as it stood when it acted, not on
                    // counters that already absorbed these outcomes
                    .filter(|o| o.rule_state.is_some_and(|s| gate.admits_state(&s)))
                    .cloned()
                    .collect();
                StrategyReplay {
                    strategy,
                    admitted: admitted.len(),
                    coverage: admitted.len() as f64 / held_out.len() as f64,
                    acceptance: metrics::acceptance_rate(&admitted, self.config.calibration.partial_credit),
                }
            })
            .collect();

        let proposal = state.proposed_strategy.take();
        let committed = match proposal {
            Some(proposed) => {
                let accepted = replays
                    .iter()
                    .find(|r| r.strategy == proposed)
                    .and_then(|r| r.acceptance)
                    .is_some_and(|a| a >= cfg.experiment_accept_bar);
                if accepted {
                    tracing::info!(
                        owner = self.owner,
                        from = state.strategy.as_str(),
                        to = proposed.as_str(),
                        "Promotion confirmed by experiment"
                    );
                    state.strategy = proposed;
                } else {
                    tracing::info!(owner = self.owner, proposed = proposed.as_str(), "Promotion discarded by experiment");
                }
                accepted
            }
            None => false,
        };

        Ok(TaskReport::Experimented(ExperimentReport {
            held_out: held_out.len(),
            replays,
            proposal,
            committed,
            strategy: state.strategy,
        }))
    }
}
