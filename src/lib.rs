//! learnloop - decision feedback and self-tuning core
//!
//! Automated producers (clusterers, concept extractors, merge detectors)
//! record every decision with a confidence. Humans validate the uncertain
//! ones; their corrections become rules and vocabulary; validated outcomes
//! recalibrate the confidence thresholds; two agents close the loop:
//!
//! - the **Learning Agent** applies trusted rules autonomously and moves its
//!   own risk posture based on measured accuracy
//! - the **Maverick Agent** proposes systemic changes (threshold shifts,
//!   rule retirements), tests them against a control, and applies winners
//!
//! # Quick start
//!
//! ```rust,ignore
//! use learnloop::{LoopConfig, LoopEngine};
//!
//! let engine = LoopEngine::open(&db_path, LoopConfig::default())?;
//! let id = engine.record_decision(&record)?;
//! engine.submit_feedback("alice", &submission)?;
//! let run = engine.run_learning("alice", None)?;
//! if run.recalibration_recommended {
//!     engine.calibrate_thresholds("alice")?;
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! producers ──record_decision──▶ ledger ──pending──▶ reviewer
//!                                  ▲  │                 │
//!                  autonomous      │  │ validated       │ submit_feedback
//!                  decisions       │  ▼                 ▼
//!               learning agent ◀── rules ◀── learning run ◀── feedback
//!                                  │
//!               maverick ──▶ thresholds (calibration) / rule retirement
//! ```

pub mod agent;
pub mod calibration;
pub mod config;
pub mod db;
pub mod error;
pub mod learning;
pub mod ledger;
pub mod maverick;
pub mod metrics;
pub mod rules;
pub mod server;
pub mod service;
pub mod stats;
pub mod tools;
pub mod types;
pub mod vocabulary;

pub use config::LoopConfig;
pub use db::{init_db, init_memory_db};
pub use error::{LoopError, Result};
pub use service::LoopEngine;
pub use types::*;

// Ledger
pub use ledger::{record_decision, submit_feedback, DecisionRecord, FeedbackSubmission};

// Learning
pub use learning::{run_learning, LearningParams, LearningRunResult};
pub use calibration::{calibrate_thresholds, CalibrationReport};
pub use metrics::{accuracy_metrics, AccuracyMetrics};

// Agents
pub use agent::{AgentTask, LearningAgent};
pub use maverick::{Maverick, MaverickTask};
