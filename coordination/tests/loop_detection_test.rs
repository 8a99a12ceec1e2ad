//! Integration tests for loop detection
//!
//! Failures and consultations on a task share one counter. These tests drive
//! it through the coordinator with a scripted oracle and check when gates
//! open and which events clear the counter.

use serde_json::json;
use std::sync::Arc;

use coordination_core::loop_detector::ResetReason;
use coordination_core::router::RouteError;
use coordination_core::similarity::{
    LexicalSimilarity, SimilarityScorer, COLLABORATION_SIMILARITY_THRESHOLD,
};
use coordination_core::{
    AgentStatus, AgentType, ConsultOutcome, CoordinationError, Coordinator, CoordinatorConfig,
    FailureContext, GateTrigger, MemoryStateStore, ProgressSnapshot, ScriptedOracle, Task,
    TestMetrics, LOOP_THRESHOLD,
};

const STALLED: &str = r#"{"is_regressive": false, "no_progress": true, "reasoning": "same failure"}"#;

fn stalled_oracle() -> Arc<ScriptedOracle> {
    let reply: serde_json::Value = serde_json::from_str(STALLED).unwrap();
    Arc::new(ScriptedOracle::new().with_default(reply))
}

/// An oracle that reads every attempt as moving forward
fn optimistic_oracle() -> Arc<ScriptedOracle> {
    Arc::new(ScriptedOracle::new().with_default(json!({
        "is_regressive": false,
        "no_progress": false,
        "reasoning": "different approach this time"
    })))
}

fn consult_count(outcome: &ConsultOutcome) -> u32 {
    match outcome {
        ConsultOutcome::Routed { verdict, .. } | ConsultOutcome::Escalated { verdict, .. } => {
            verdict.loop_count
        }
    }
}

fn coordinator(oracle: Arc<ScriptedOracle>) -> Coordinator {
    Coordinator::builder(CoordinatorConfig::default())
        .oracle(oracle)
        .store(Arc::new(MemoryStateStore::new()))
        .build()
        .unwrap()
}

/// Register coder-1 and hand it task t1
fn with_assigned_task(c: &Coordinator) {
    c.register_agent("coder-1", AgentType::Coder).unwrap();
    c.enqueue_task(
        Task::new("t1", "implement", AgentType::Coder, 1).with_goal("parser accepts nested lists"),
    )
    .unwrap();
    c.assign("t1", "coder-1").unwrap();
}

/// Test: Three byte-identical failures gate exactly on the third
#[tokio::test]
async fn test_identical_failures_gate_on_third() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    let message = "error[E0308]: mismatched types\n  --> src/parser.rs:42:17";
    let ctx = FailureContext::default().with_file("src/parser.rs", Some(42));

    let mut gated = Vec::new();
    for expected in 1..=3 {
        let report = c
            .report_failure("t1", "coder-1", message, &ctx, ProgressSnapshot::empty())
            .await
            .unwrap();
        assert_eq!(report.verdict.loop_count, expected);
        gated.push(report.verdict.should_gate);
        if expected == 3 {
            let gate = report.gate.unwrap();
            assert_eq!(gate.trigger, GateTrigger::LoopDetected);
            assert_eq!(gate.task_id.as_deref(), Some("t1"));
        } else {
            assert!(report.gate.is_none());
        }
    }
    assert_eq!(gated, vec![false, false, true]);
    assert_eq!(
        c.registry().agent("coder-1").unwrap().status,
        AgentStatus::Paused
    );
}

/// Test: Identical failures still gate on the third when the oracle reports progress
#[tokio::test]
async fn test_identical_failures_gate_despite_optimistic_oracle() {
    let oracle = optimistic_oracle();
    let c = coordinator(oracle.clone());
    with_assigned_task(&c);
    let message = "error[E0599]: no method named `children` found for enum `Node`";
    let ctx = FailureContext::default().with_file("src/ast.rs", Some(88));

    let mut seen = Vec::new();
    for _ in 0..3 {
        let report = c
            .report_failure("t1", "coder-1", message, &ctx, ProgressSnapshot::empty())
            .await
            .unwrap();
        seen.push((report.verdict.loop_count, report.verdict.should_gate, report.gate.is_some()));
    }
    assert_eq!(seen, vec![(0, false, false), (2, false, false), (3, true, true)]);
    // Only the first occurrence went to the oracle
    assert_eq!(oracle.call_count(), 1);
    assert_eq!(
        c.registry().agent("coder-1").unwrap().status,
        AgentStatus::Paused
    );
}

/// Test: The same external error three times gates at the loop threshold
#[tokio::test]
async fn test_repeated_external_error_gates() {
    let oracle = Arc::new(ScriptedOracle::unavailable());
    let c = coordinator(oracle.clone());
    with_assigned_task(&c);
    let message = "request timed out after 30s";

    let mut reports = Vec::new();
    for _ in 0..LOOP_THRESHOLD {
        reports.push(
            c.report_failure(
                "t1",
                "coder-1",
                message,
                &FailureContext::default(),
                ProgressSnapshot::empty(),
            )
            .await
            .unwrap(),
        );
    }

    let counts: Vec<u32> = reports.iter().map(|r| r.verdict.loop_count).collect();
    assert_eq!(counts, vec![0, 0, LOOP_THRESHOLD]);
    assert!(reports[..2].iter().all(|r| r.gate.is_none()));
    let gate = reports[2].gate.as_ref().unwrap();
    assert_eq!(gate.trigger, GateTrigger::LoopDetected);
    assert_eq!(c.gates().pending().len(), 1);
    assert_eq!(oracle.call_count(), 0);
}

/// Test: Rising coverage with different errors never counts as a loop
#[tokio::test]
async fn test_improving_coverage_is_not_a_loop() {
    let oracle = Arc::new(ScriptedOracle::unavailable());
    let c = coordinator(oracle.clone());
    with_assigned_task(&c);

    let runs = [
        (60.0, "assertion failed: nested(\"[[]]\") at tests/parse.rs:10"),
        (75.0, "assertion failed: nested(\"[[1]]\") at tests/parse.rs:18"),
        (90.0, "thread 'deep' panicked at tests/parse.rs:31: index out of bounds"),
    ];
    for (coverage, message) in runs {
        let progress =
            ProgressSnapshot::with_metrics(TestMetrics::new(10, 3).with_coverage(coverage));
        let report = c
            .report_failure("t1", "coder-1", message, &FailureContext::default(), progress)
            .await
            .unwrap();
        assert_eq!(report.verdict.loop_count, 0);
        assert!(!report.verdict.should_gate);
    }
    assert_eq!(c.loops().loop_count("t1").await, 0);
    assert_eq!(oracle.call_count(), 0);
}

/// Test: After a completion reset, the next failure counts from one
#[tokio::test]
async fn test_reset_restarts_count() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    let ctx = FailureContext::default();

    for _ in 0..2 {
        c.report_failure("t1", "coder-1", "linker error", &ctx, ProgressSnapshot::empty())
            .await
            .unwrap();
    }
    assert_eq!(c.loops().loop_count("t1").await, 2);

    let previous = c.loops().reset("t1", ResetReason::TaskCompleted).await;
    assert_eq!(previous, 2);

    let report = c
        .report_failure("t1", "coder-1", "linker error", &ctx, ProgressSnapshot::empty())
        .await
        .unwrap();
    assert_eq!(report.verdict.loop_count, 1);
}

/// Test: Swapping agents without a human leaves the counter alone
#[tokio::test]
async fn test_agent_swap_keeps_count() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    c.register_agent("coder-2", AgentType::Coder).unwrap();
    let ctx = FailureContext::default();
    let message = "error: cannot borrow `x` as mutable more than once";

    for _ in 0..2 {
        c.report_failure("t1", "coder-1", message, &ctx, ProgressSnapshot::empty())
            .await
            .unwrap();
    }
    c.reassign_task("t1", "coder-2").unwrap();
    assert_eq!(c.loops().loop_count("t1").await, 2);

    let report = c
        .report_failure("t1", "coder-2", message, &ctx, ProgressSnapshot::empty())
        .await
        .unwrap();
    assert_eq!(report.verdict.loop_count, 3);
    assert!(report.verdict.should_gate);
    assert!(report.gate.is_some());
}

/// Test: Approving a loop gate clears the counter and resumes the agent
#[tokio::test]
async fn test_approval_resets_loop_gate() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    let ctx = FailureContext::default();

    let mut gate = None;
    for _ in 0..3 {
        let report = c
            .report_failure("t1", "coder-1", "same error", &ctx, ProgressSnapshot::empty())
            .await
            .unwrap();
        gate = report.gate.or(gate);
    }
    let gate = gate.unwrap();

    c.approve(&gate.id, "try a different parser strategy")
        .await
        .unwrap();
    assert_eq!(c.loops().loop_count("t1").await, 0);
    assert_eq!(
        c.registry().agent("coder-1").unwrap().status,
        AgentStatus::Active
    );
}

/// Test: Rejecting a loop gate does not clear the counter
#[tokio::test]
async fn test_rejection_keeps_count() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    let ctx = FailureContext::default();

    let mut gate = None;
    for _ in 0..3 {
        let report = c
            .report_failure("t1", "coder-1", "same error", &ctx, ProgressSnapshot::empty())
            .await
            .unwrap();
        gate = report.gate.or(gate);
    }

    c.reject(&gate.unwrap().id, "needs a new plan").unwrap();
    assert_eq!(c.loops().loop_count("t1").await, 3);
}

/// Test: Repeated consultations escalate through the same gate path
#[tokio::test]
async fn test_repeated_consultation_gates() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    c.register_agent("architect-1", AgentType::Architect)
        .unwrap();
    let question = "How should the parser represent nested list nodes in the AST?";

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(
            c.consult("coder-1", "t1", AgentType::Architect, question, json!({}), None)
                .await
                .unwrap(),
        );
    }

    let counts: Vec<u32> = outcomes
        .iter()
        .map(|o| match o {
            ConsultOutcome::Routed { verdict, .. } | ConsultOutcome::Escalated { verdict, .. } => {
                verdict.loop_count
            }
        })
        .collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);

    match &outcomes[3] {
        ConsultOutcome::Escalated { gate, consultant, .. } => {
            assert_eq!(consultant, "architect-1");
            assert_eq!(gate.trigger, GateTrigger::LoopDetected);
            assert!(gate.references_agent("coder-1"));
            assert!(gate.references_agent("architect-1"));
        }
        other => panic!("expected escalation, got {:?}", other),
    }
    // Only the three routed consultations were delivered
    assert_eq!(c.router().inbox_len("architect-1"), 3);
}

/// Test: Failures and consultations add to one counter
#[tokio::test]
async fn test_failures_and_consultations_share_counter() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    c.register_agent("architect-1", AgentType::Architect)
        .unwrap();
    let question = "Is a recursive descent parser right for nested lists?";

    let report = c
        .report_failure(
            "t1",
            "coder-1",
            "stack overflow in parse_list",
            &FailureContext::default(),
            ProgressSnapshot::empty(),
        )
        .await
        .unwrap();
    assert_eq!(report.verdict.loop_count, 1);

    c.consult("coder-1", "t1", AgentType::Architect, question, json!({}), None)
        .await
        .unwrap();
    c.consult("coder-1", "t1", AgentType::Architect, question, json!({}), None)
        .await
        .unwrap();
    let last = c
        .consult("coder-1", "t1", AgentType::Architect, question, json!({}), None)
        .await
        .unwrap();

    assert!(matches!(last, ConsultOutcome::Escalated { .. }));
    assert_eq!(c.loops().loop_count("t1").await, 3);
}

/// Test: Distinct questions to the same consultant are not repeats
#[tokio::test]
async fn test_distinct_consultations_not_counted() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    c.register_agent("architect-1", AgentType::Architect)
        .unwrap();

    for question in [
        "Which crate should handle tokenizing?",
        "Should errors carry byte offsets or line numbers?",
        "Where do we store the parsed configuration?",
    ] {
        let outcome = c
            .consult("coder-1", "t1", AgentType::Architect, question, json!({}), None)
            .await
            .unwrap();
        assert!(matches!(outcome, ConsultOutcome::Routed { .. }));
    }
    assert_eq!(c.loops().loop_count("t1").await, 0);
}

/// Test: A paraphrase just above the collaboration threshold repeats, one just below does not
#[tokio::test]
async fn test_paraphrase_around_collaboration_threshold() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    c.register_agent("architect-1", AgentType::Architect)
        .unwrap();

    let original = "how should the parser represent nested list nodes in ast";
    let loose = "how should the parser represent nested list nodes in ast for us right now please";
    let close = "how should the parser represent nested list nodes in ast for us please";

    let scorer = LexicalSimilarity;
    let below = scorer.score(original, loose);
    let above = scorer.score(original, close);
    assert!(below < COLLABORATION_SIMILARITY_THRESHOLD, "score {below}");
    assert!(below > 0.8, "score {below}");
    assert!(above > COLLABORATION_SIMILARITY_THRESHOLD, "score {above}");
    assert!(above < 0.9, "score {above}");

    let mut counts = Vec::new();
    for question in [original, loose] {
        let outcome = c
            .consult("coder-1", "t1", AgentType::Architect, question, json!({}), None)
            .await
            .unwrap();
        counts.push(consult_count(&outcome));
    }
    assert_eq!(counts, vec![0, 0]);

    c.register_agent("coder-2", AgentType::Coder).unwrap();
    let first = c
        .consult("coder-2", "t1", AgentType::Architect, original, json!({}), None)
        .await
        .unwrap();
    let second = c
        .consult("coder-2", "t1", AgentType::Architect, close, json!({}), None)
        .await
        .unwrap();
    assert_eq!(consult_count(&first), 0);
    assert!(matches!(second, ConsultOutcome::Routed { .. }));
    assert_eq!(consult_count(&second), 1);
}

/// Test: An agent paused by a gate cannot consult or send until the gate is resolved
#[tokio::test]
async fn test_paused_requester_is_refused() {
    let c = coordinator(stalled_oracle());
    with_assigned_task(&c);
    c.register_agent("architect-1", AgentType::Architect)
        .unwrap();
    let gate = c
        .escalate_to_human("check the approach", Some("t1"), vec!["coder-1".to_string()], json!({}))
        .unwrap();

    let err = c
        .consult("coder-1", "t1", AgentType::Architect, "which layer owns parsing?", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::Route(RouteError::SenderPaused(ref id)) if id == "coder-1"
    ));
    let err = c
        .route("coder-1", "architect-1", coordination_core::MessageType::Request, json!({}))
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Route(RouteError::SenderPaused(_))));
    assert_eq!(c.router().inbox_len("architect-1"), 0);
    assert_eq!(c.loops().loop_count("t1").await, 0);

    c.approve(&gate.id, "go on").await.unwrap();
    let outcome = c
        .consult("coder-1", "t1", AgentType::Architect, "which layer owns parsing?", json!({}), None)
        .await
        .unwrap();
    assert!(matches!(outcome, ConsultOutcome::Routed { .. }));
}
