//! Closed-loop scenarios across the ledger, learning run, agents and calibrator

use learnloop::agent::TaskReport;
use learnloop::vocabulary::TermFilter;
use learnloop::*;
use serde_json::{json, Value};

fn engine() -> LoopEngine {
    LoopEngine::in_memory(LoopConfig::default()).unwrap()
}

fn decision(owner: &str, decision_type: DecisionType, doc: &str, output: Value, confidence: f64) -> DecisionRecord {
    DecisionRecord {
        decision_type,
        scope: Scope::owner(owner).with_document(doc),
        input_snapshot: json!({"document": doc}),
        output_snapshot: output,
        confidence,
        model_identity: "producer-v1".into(),
    }
}

fn cluster(engine: &LoopEngine, doc: &str, cluster: &str, confidence: f64) -> String {
    engine
        .record_decision(&decision(
            "alice",
            DecisionType::ClusterAssignment,
            doc,
            json!({"cluster": cluster}),
            confidence,
        ))
        .unwrap()
}

fn feedback(engine: &LoopEngine, id: &str, result: ValidationResult, new_value: Option<Value>) -> UserFeedback {
    engine
        .submit_feedback(
            "alice",
            &FeedbackSubmission {
                decision_id: id.to_string(),
                result,
                new_value,
                reasoning: None,
            },
        )
        .unwrap()
}

#[test]
fn test_correction_to_autonomous_action() {
    let engine = engine();

    // Uncertain decision lands in the queue
    let first = cluster(&engine, "d1", "Misc", 0.42);
    let queue = engine.pending_validations("alice", 10, 0).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].decision_id, first);
    assert_eq!(queue[0].options[0].id, "accept");

    // Reviewer moves it, and two more documents like it
    feedback(&engine, &first, ValidationResult::Rejected, Some(json!("Finance")));
    for doc in ["d2", "d3"] {
        let id = cluster(&engine, doc, "Misc", 0.45);
        feedback(&engine, &id, ValidationResult::Rejected, Some(json!({"cluster": "Finance"})));
    }
    assert!(engine.pending_validations("alice", 10, 0).unwrap().is_empty());

    let run = engine.run_learning("alice", None).unwrap();
    assert_eq!(run.rules_created, 1);
    assert_eq!(run.feedback_processed, 3);
    let rules = engine.list_rules("alice", None, false).unwrap();
    assert_eq!(rules.len(), 1);
    let rule = &rules[0];
    assert_eq!(rule.action, RuleAction::Assign { value: "Finance".into() });
    assert_eq!(rule.times_applied, 0);
    assert!((rule.confidence - 0.75).abs() < 1e-9);

    // Aggressive agent applies the rule to the next match
    let agent = engine.agent("alice");
    agent.set_strategy(Strategy::Aggressive).unwrap();
    let next = cluster(&engine, "d4", "Misc", 0.5);
    let TaskReport::Decided(report) = agent.run_task(AgentTask::MakeAutonomousDecisions).unwrap() else {
        panic!("expected a decision report");
    };
    assert_eq!(report.actions.len(), 1);
    let action = &report.actions[0];
    assert_eq!(action.supersedes, next);
    assert_eq!(action.resolution, ValidationResult::Partial);

    let rule = engine.list_rules("alice", None, false).unwrap().remove(0);
    assert_eq!(rule.times_applied, 1);
    assert_eq!(rule.accuracy(), Some(1.0));

    let autonomous = engine.get_decision("alice", &action.decision_id).unwrap();
    assert_eq!(autonomous.output_snapshot["cluster"], "Finance");
    assert_eq!(autonomous.rule_id.as_deref(), Some(rule.id.as_str()));
    assert!(engine.get_decision("alice", &next).unwrap().validated);

    // Only the autonomous decision is left to review
    let queue = engine.pending_validations("alice", 10, 0).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].decision_id, action.decision_id);

    // A human override counts against the rule exactly once
    feedback(&engine, &action.decision_id, ValidationResult::Rejected, Some(json!("Legal")));
    engine.run_learning("alice", None).unwrap();
    let rule = engine.list_rules("alice", None, true).unwrap().remove(0);
    assert_eq!(rule.times_applied, 1);
    assert_eq!(rule.times_overridden, 1);
    assert_eq!(rule.accuracy(), Some(0.5));
    assert!(rule.confidence < 0.75);

    // Nothing left to learn from
    let idle = engine.run_learning("alice", None).unwrap();
    assert_eq!(idle.feedback_processed, 0);
    let again = engine.list_rules("alice", None, true).unwrap().remove(0);
    assert_eq!(again.times_overridden, 1);
    assert_eq!(again.confidence, rule.confidence);
}

#[test]
fn test_double_submission_is_conflict() {
    let engine = engine();
    let id = cluster(&engine, "d1", "Misc", 0.42);
    feedback(&engine, &id, ValidationResult::Accepted, None);
    let err = engine
        .submit_feedback(
            "alice",
            &FeedbackSubmission {
                decision_id: id.clone(),
                result: ValidationResult::Rejected,
                new_value: None,
                reasoning: None,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert_eq!(
        engine.get_decision("alice", &id).unwrap().validation_result,
        Some(ValidationResult::Accepted)
    );
}

#[test]
fn test_empty_learning_run_changes_nothing() {
    let engine = engine();
    let run = engine.run_learning("alice", None).unwrap();
    assert_eq!(run.rules_created + run.rules_updated, 0);
    assert_eq!(run.vocabulary_added + run.vocabulary_updated, 0);
    assert_eq!(run.feedback_processed, 0);
    assert!(!run.recalibration_recommended);
    assert!(engine.list_rules("alice", None, true).unwrap().is_empty());
    assert!(engine.list_vocabulary("alice", TermFilter::All).unwrap().is_empty());
}

#[test]
fn test_vocabulary_flags_from_concept_edits() {
    let engine = engine();
    for i in 0..10 {
        let id = engine
            .record_decision(&decision(
                "alice",
                DecisionType::ConceptExtraction,
                &format!("doc{}", i),
                json!({"concepts": ["Rust", "Java"]}),
                0.5,
            ))
            .unwrap();
        // Nine edits keep Rust and drop Java; one does the opposite
        let kept = if i < 9 { json!(["Rust"]) } else { json!(["Java"]) };
        feedback(&engine, &id, ValidationResult::Partial, Some(kept));
    }
    engine.run_learning("alice", None).unwrap();

    let always = engine.list_vocabulary("alice", TermFilter::AlwaysInclude).unwrap();
    assert_eq!(always.len(), 1);
    assert_eq!(always[0].canonical_name, "Rust");
    assert!(!always[0].never_include);

    let never = engine.list_vocabulary("alice", TermFilter::NeverInclude).unwrap();
    assert_eq!(never.len(), 1);
    assert_eq!(never[0].canonical_name, "Java");
    assert!(!never[0].always_include);
}

#[test]
fn test_calibration_keeps_order_and_refuses_small_samples() {
    let engine = engine();
    for i in 0..10 {
        let id = cluster(&engine, &format!("a{}", i), "A", 0.9);
        feedback(&engine, &id, ValidationResult::Accepted, None);
    }
    let err = engine.calibrate_thresholds("alice").unwrap_err();
    assert_eq!(err.kind(), "insufficient_data");
    assert_eq!(engine.thresholds("alice").unwrap(), LoopConfig::default().calibration.defaults);

    for i in 0..30 {
        let id = cluster(&engine, &format!("b{}", i), "A", 0.97);
        feedback(&engine, &id, ValidationResult::Accepted, None);
    }
    for i in 0..20 {
        let id = cluster(&engine, &format!("c{}", i), "A", 0.35);
        feedback(&engine, &id, ValidationResult::Rejected, None);
    }

    let report = engine.calibrate_thresholds("alice").unwrap();
    let t = report.new_thresholds;
    assert!(t.high > t.medium && t.medium > t.low, "{:?}", t);
    assert_eq!(engine.thresholds("alice").unwrap(), t);

    let metrics = engine.accuracy_metrics("alice").unwrap();
    assert_eq!(metrics.validated_count, 60);
    assert_eq!(metrics.thresholds, t);
}

#[test]
fn test_owners_are_isolated() {
    let engine = engine();
    let id = cluster(&engine, "d1", "Misc", 0.42);
    let err = engine
        .submit_feedback(
            "bob",
            &FeedbackSubmission {
                decision_id: id,
                result: ValidationResult::Accepted,
                new_value: None,
                reasoning: None,
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(engine.pending_validations("bob", 10, 0).unwrap().is_empty());
    assert_eq!(engine.pending_validations("alice", 10, 0).unwrap().len(), 1);
}
