//! Startup recovery
//!
//! Runs once when the process starts. Each project the store still marks
//! active is reconciled from two approximate sources: the last recorded
//! `ProjectState` and what is actually on disk. The oracle picks one of four
//! actions. Anything unclear, and any failure along the way, ends at a human
//! gate rather than a guess.

pub mod signals;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::escalation::{EscalationRequest, GateId, GateManager, GateTrigger, RECOVERY_AMBIGUOUS};
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::oracle::{OracleError, OracleRequest, SharedOracle};
use crate::registry::{AgentId, RegistryError, SharedRegistry, Task, TaskId, TaskStatus};
use crate::state::{ProjectId, ProjectState, SharedStateStore, StoreError};
pub use signals::{CategorySignal, FileCategory, FileSignals};

/// The four ways an interrupted project can resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Hand the same task to an agent of the same type
    ContinueTask,
    /// Drop the attempt log and run the task again from scratch
    RestartTask,
    /// Treat the current task as done and dispatch the next one
    NextTask,
    HumanReview,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContinueTask => "continue_task",
            Self::RestartTask => "restart_task",
            Self::NextTask => "next_task",
            Self::HumanReview => "human_review",
        }
    }

    /// Exact match only. Anything else is not a decision.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue_task" => Some(Self::ContinueTask),
            "restart_task" => Some(Self::RestartTask),
            "next_task" => Some(Self::NextTask),
            "human_review" => Some(Self::HumanReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Project has no recorded workspace")]
    NoWorkspace,

    #[error("Workspace unreadable: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Oracle returned no valid decision: {0}")]
    InvalidDecision(String),

    #[error("Project has no current task")]
    NoCurrentTask,

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// What recovery did for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub project_id: ProjectId,
    pub task_id: Option<TaskId>,
    pub action: RecoveryAction,
    /// Agent the resumed task went to, if one was idle
    pub assigned_agent: Option<AgentId>,
    pub gate_id: Option<GateId>,
    pub reasoning: String,
    /// `human_review` was forced by a failure, not chosen by the oracle
    pub fell_back: bool,
}

struct Decision {
    action: RecoveryAction,
    reasoning: String,
}

pub struct RecoveryCoordinator {
    registry: SharedRegistry,
    gates: Arc<GateManager>,
    store: SharedStateStore,
    oracle: SharedOracle,
    events: SharedEventBus,
}

impl RecoveryCoordinator {
    pub fn new(
        registry: SharedRegistry,
        gates: Arc<GateManager>,
        store: SharedStateStore,
        oracle: SharedOracle,
        events: SharedEventBus,
    ) -> Self {
        Self {
            registry,
            gates,
            store,
            oracle,
            events,
        }
    }

    /// Reconcile every active project
    ///
    /// Only failing to list projects aborts; per-project failures become
    /// `human_review` gates.
    pub async fn recover_all(&self) -> Result<Vec<RecoveryOutcome>, StoreError> {
        let projects = self.store.get_active_project_states()?;
        info!(projects = projects.len(), "Starting recovery");

        let mut outcomes = Vec::with_capacity(projects.len());
        for project in projects {
            let outcome = self.recover_project(&project).await;
            info!(
                project_id = %outcome.project_id,
                task_id = ?outcome.task_id,
                action = %outcome.action,
                gate_id = ?outcome.gate_id,
                fell_back = outcome.fell_back,
                "Project recovered"
            );
            self.events.publish(CoordinationEvent::RecoveryDecided {
                project_id: outcome.project_id.clone(),
                task_id: outcome.task_id.clone(),
                decision: outcome.action.as_str().to_string(),
                timestamp: Utc::now(),
            });
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn recover_project(&self, project: &ProjectState) -> RecoveryOutcome {
        let history = match self.restore_history(project) {
            Ok(history) => history,
            Err(e) => {
                warn!(project_id = %project.project_id, error = %e, "Task history unavailable");
                return self.escalate(project, e.to_string(), true);
            }
        };

        let decision = match self.decide(project, &history).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(project_id = %project.project_id, error = %e, "Recovery decision failed");
                return self.escalate(project, e.to_string(), true);
            }
        };

        if decision.action == RecoveryAction::HumanReview {
            return self.escalate(project, decision.reasoning, false);
        }

        match self.execute(project, decision.action, &decision.reasoning) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    project_id = %project.project_id,
                    action = %decision.action,
                    error = %e,
                    "Recovery action failed"
                );
                self.escalate(project, format!("{} failed: {}", decision.action, e), true)
            }
        }
    }

    /// Load the project's tasks into the registry. Returns them oldest first.
    fn restore_history(&self, project: &ProjectState) -> Result<Vec<Task>, RecoveryError> {
        let mut history = self.store.tasks_for_project(&project.project_id)?;
        if let Some(current) = &project.current_task_id {
            if !history.iter().any(|t| &t.id == current) {
                if let Some(task) = self.store.get_task(current)? {
                    history.push(task);
                }
            }
        }
        for task in &history {
            self.registry.restore_task(task.clone());
        }
        Ok(history)
    }

    async fn decide(
        &self,
        project: &ProjectState,
        history: &[Task],
    ) -> Result<Decision, RecoveryError> {
        let workspace = project.workspace.as_ref().ok_or(RecoveryError::NoWorkspace)?;
        let signals = FileSignals::scan(workspace)?;

        let current_task = project
            .current_task_id
            .as_ref()
            .and_then(|id| history.iter().find(|t| &t.id == id))
            .map(task_summary);

        let request = OracleRequest::RecoveryDecision {
            project_id: project.project_id.clone(),
            goal: project.goal.clone(),
            current_task,
            last_action: project.last_action.clone(),
            file_signals: signals.to_value(),
            task_history: history.iter().map(task_summary).collect(),
        };

        let reply = self.oracle.infer(&request).await?;
        self.events.publish(CoordinationEvent::OracleConsulted {
            kind: request.kind().to_string(),
            task_id: project.current_task_id.clone(),
            decision: reply.clone(),
            timestamp: Utc::now(),
        });

        let action = reply
            .get("decision")
            .and_then(Value::as_str)
            .and_then(RecoveryAction::parse)
            .ok_or_else(|| RecoveryError::InvalidDecision(reply.to_string()))?;
        let reasoning = reply
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        info!(
            project_id = %project.project_id,
            decision = %action,
            reasoning = %reasoning,
            "Recovery oracle decision"
        );
        Ok(Decision { action, reasoning })
    }

    fn execute(
        &self,
        project: &ProjectState,
        action: RecoveryAction,
        reasoning: &str,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let (task_id, assigned_agent) = match action {
            RecoveryAction::ContinueTask => {
                let task_id = project
                    .current_task_id
                    .clone()
                    .ok_or(RecoveryError::NoCurrentTask)?;
                let agent = self.dispatch(&task_id)?;
                (Some(task_id), agent)
            }
            RecoveryAction::RestartTask => {
                let task_id = project
                    .current_task_id
                    .clone()
                    .ok_or(RecoveryError::NoCurrentTask)?;
                let cleared = self.registry.clear_attempts(&task_id)?;
                info!(task_id = %task_id, cleared, "Attempt history cleared for restart");
                let agent = self.dispatch(&task_id)?;
                (Some(task_id), agent)
            }
            RecoveryAction::NextTask => {
                if let Some(current) = &project.current_task_id {
                    let open = self
                        .registry
                        .task(current)
                        .is_some_and(|t| !t.status.is_terminal());
                    if open {
                        let done = self.registry.complete_task(current)?;
                        self.store.upsert_task(&done)?;
                    }
                }
                match self.registry.next_queued_for_project(&project.project_id) {
                    Some(next) => {
                        let agent = self.dispatch(&next.id)?;
                        (Some(next.id), agent)
                    }
                    None => (None, None),
                }
            }
            RecoveryAction::HumanReview => {
                return Ok(self.escalate(project, reasoning.to_string(), false));
            }
        };

        let action_text = format!("recovered: {}", action);
        self.store.update_project_state(&project.project_id, &mut |state| {
            state.record(
                action_text.clone(),
                task_id.as_deref(),
                assigned_agent.as_deref(),
            );
        })?;

        Ok(RecoveryOutcome {
            project_id: project.project_id.clone(),
            task_id,
            action,
            assigned_agent,
            gate_id: None,
            reasoning: reasoning.to_string(),
            fell_back: false,
        })
    }

    /// Hand a pending task to an idle agent of its type, or leave it queued
    fn dispatch(&self, task_id: &str) -> Result<Option<AgentId>, RecoveryError> {
        let task = self
            .registry
            .task(task_id)
            .ok_or_else(|| RecoveryError::UnknownTask(task_id.to_string()))?;

        match task.status {
            TaskStatus::Assigned => return Ok(task.assigned_agent),
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(RegistryError::InvalidTaskStatus {
                    task_id: task_id.to_string(),
                    status: task.status,
                    expected: TaskStatus::Pending,
                }
                .into());
            }
            TaskStatus::Pending => {}
        }

        for agent in self.registry.idle_agents_of_type(task.agent_type) {
            match self.registry.assign(task_id, &agent.id) {
                Ok(assigned) => {
                    self.store.upsert_task(&assigned)?;
                    return Ok(Some(agent.id));
                }
                Err(RegistryError::AgentNotIdle { .. }) => continue,
                Err(RegistryError::TaskHeld(_)) => {
                    info!(task_id, "Task held by a pending gate, left queued");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(task_id, agent_type = %task.agent_type, "No idle agent, task left queued");
        if let Some(queued) = self.registry.task(task_id) {
            self.store.upsert_task(&queued)?;
        }
        Ok(None)
    }

    /// Open a `recovery_ambiguous` gate for the project
    fn escalate(&self, project: &ProjectState, reasoning: String, fell_back: bool) -> RecoveryOutcome {
        let agents: Vec<AgentId> = project
            .current_agent_id
            .iter()
            .filter(|a| self.registry.contains_agent(a))
            .cloned()
            .collect();

        let mut request = EscalationRequest::new(GateTrigger::RecoveryAmbiguous, RECOVERY_AMBIGUOUS)
            .for_project(Some(project.project_id.clone()))
            .with_agents(agents)
            .with_context(json!({
                "reasoning": reasoning,
                "last_action": project.last_action,
                "current_task_id": project.current_task_id,
                "fell_back": fell_back,
            }));
        if let Some(task_id) = &project.current_task_id {
            request = request.for_task(task_id.clone());
        }

        let gate_id = match self.gates.open(request) {
            Ok(gate) => Some(gate.id),
            Err(e) => {
                error!(
                    project_id = %project.project_id,
                    error = %e,
                    "Could not open recovery gate, project left for next startup"
                );
                None
            }
        };

        RecoveryOutcome {
            project_id: project.project_id.clone(),
            task_id: project.current_task_id.clone(),
            action: RecoveryAction::HumanReview,
            assigned_agent: None,
            gate_id,
            reasoning,
            fell_back,
        }
    }
}

fn task_summary(task: &Task) -> Value {
    json!({
        "id": task.id,
        "task_type": task.task_type,
        "goal": task.goal,
        "agent_type": task.agent_type,
        "status": task.status,
        "priority": task.priority,
        "attempts": task.attempts.len(),
        "failure_reason": task.failure_reason,
        "updated_at": task.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::ReplanQueue;
    use crate::events::EventBus;
    use crate::loop_detector::LoopDetector;
    use crate::oracle::ScriptedOracle;
    use crate::progress::{Attempt, ProgressEvaluator, ProgressSnapshot};
    use crate::registry::{Agent, AgentRegistry, AgentStatus, AgentType};
    use crate::similarity::{LexicalSimilarity, SimilarityScorer};
    use crate::state::{MemoryStateStore, ProjectStatus, StateStore};
    use tempfile::TempDir;

    struct Fixture {
        registry: SharedRegistry,
        gates: Arc<GateManager>,
        store: Arc<MemoryStateStore>,
        oracle: Arc<ScriptedOracle>,
        recovery: RecoveryCoordinator,
        workspace: TempDir,
    }

    fn fixture() -> Fixture {
        let events = EventBus::new().shared();
        let registry = AgentRegistry::new(events.clone()).shared();
        let scorer: Arc<dyn SimilarityScorer> = Arc::new(LexicalSimilarity);
        let evaluator =
            ProgressEvaluator::new(Arc::new(ScriptedOracle::unavailable()), scorer.clone());
        let loops = Arc::new(LoopDetector::new(evaluator, scorer, events.clone()));
        let store = Arc::new(MemoryStateStore::new());
        let gates = Arc::new(GateManager::new(
            registry.clone(),
            loops,
            store.clone(),
            Arc::new(ReplanQueue::new()),
            events.clone(),
        ));
        let oracle = Arc::new(ScriptedOracle::new());
        let recovery = RecoveryCoordinator::new(
            registry.clone(),
            gates.clone(),
            store.clone(),
            oracle.clone(),
            events,
        );
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("lib.rs"), "pub fn f() {}").unwrap();
        Fixture {
            registry,
            gates,
            store,
            oracle,
            recovery,
            workspace,
        }
    }

    /// One active project whose current task `t1` was assigned when the
    /// process died, plus a queued `t2`
    fn seed(f: &Fixture) {
        let mut t1 = Task::new("t1", "implement", AgentType::Coder, 5).with_project("p1");
        t1.status = TaskStatus::Assigned;
        t1.assigned_agent = Some("coder-old".to_string());
        t1.attempts.push(Attempt::new("coder-old", None, ProgressSnapshot::empty()));
        let t2 = Task::new("t2", "test", AgentType::Tester, 1).with_project("p1");
        f.store.upsert_task(&t1).unwrap();
        f.store.upsert_task(&t2).unwrap();

        let mut project = ProjectState::new("p1", "ship it").with_workspace(f.workspace.path());
        project.record("assigned t1", Some("t1"), Some("coder-old"));
        f.store.upsert_project_state(&project).unwrap();
    }

    #[test]
    fn test_action_parse_is_strict() {
        assert_eq!(
            RecoveryAction::parse("continue_task"),
            Some(RecoveryAction::ContinueTask)
        );
        assert_eq!(RecoveryAction::parse("Continue_Task"), None);
        assert_eq!(RecoveryAction::parse(" next_task"), None);
        assert_eq!(RecoveryAction::parse("skip"), None);
    }

    #[tokio::test]
    async fn test_continue_assigns_same_type() {
        let f = fixture();
        seed(&f);
        f.registry.register(Agent::new("coder-1", AgentType::Coder)).unwrap();
        f.oracle
            .push_response(json!({"decision": "continue_task", "reasoning": "files look partial"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert_eq!(outcome.action, RecoveryAction::ContinueTask);
        assert_eq!(outcome.assigned_agent.as_deref(), Some("coder-1"));
        assert_eq!(f.registry.task("t1").unwrap().status, TaskStatus::Assigned);

        let project = f.store.get_project_state("p1").unwrap().unwrap();
        assert_eq!(project.current_agent_id.as_deref(), Some("coder-1"));
        assert_eq!(project.last_action, "recovered: continue_task");
    }

    #[tokio::test]
    async fn test_continue_without_agents_leaves_task_queued() {
        let f = fixture();
        seed(&f);
        f.oracle.push_response(json!({"decision": "continue_task"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert_eq!(outcomes[0].assigned_agent, None);
        assert_eq!(f.registry.task("t1").unwrap().status, TaskStatus::Pending);
        assert_eq!(f.registry.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_clears_attempts() {
        let f = fixture();
        seed(&f);
        f.oracle.push_response(json!({"decision": "restart_task"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert_eq!(outcomes[0].action, RecoveryAction::RestartTask);
        assert!(f.registry.task("t1").unwrap().attempts.is_empty());
    }

    #[tokio::test]
    async fn test_next_completes_current_and_dispatches() {
        let f = fixture();
        seed(&f);
        f.registry.register(Agent::new("tester-1", AgentType::Tester)).unwrap();
        f.oracle.push_response(json!({"decision": "next_task"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.task_id.as_deref(), Some("t2"));
        assert_eq!(outcome.assigned_agent.as_deref(), Some("tester-1"));
        assert_eq!(f.registry.task("t1").unwrap().status, TaskStatus::Completed);
        assert_eq!(
            f.store.get_task("t1").unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_invalid_decision_opens_gate() {
        let f = fixture();
        seed(&f);
        f.oracle.push_response(json!({"decision": "probably_continue"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.action, RecoveryAction::HumanReview);
        assert!(outcome.fell_back);

        let gate = f.gates.get(outcome.gate_id.as_ref().unwrap()).unwrap();
        assert_eq!(gate.reason, RECOVERY_AMBIGUOUS);
        assert_eq!(gate.trigger, GateTrigger::RecoveryAmbiguous);
        assert_eq!(
            f.store.get_project_state("p1").unwrap().unwrap().status,
            ProjectStatus::Paused
        );
        assert_eq!(f.registry.task("t1").unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_oracle_unavailable_opens_gate() {
        let f = fixture();
        seed(&f);
        f.oracle.push_error(OracleError::Unavailable("down".to_string()));

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert_eq!(outcomes[0].action, RecoveryAction::HumanReview);
        assert!(outcomes[0].gate_id.is_some());
    }

    #[tokio::test]
    async fn test_missing_workspace_opens_gate_without_oracle() {
        let f = fixture();
        seed(&f);
        let moved = f.workspace.path().join("nope");
        f.store
            .update_project_state("p1", &mut |s| s.workspace = Some(moved.clone()))
            .unwrap();

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert_eq!(outcomes[0].action, RecoveryAction::HumanReview);
        assert_eq!(f.oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_human_review_pauses_registered_agent() {
        let f = fixture();
        seed(&f);
        f.registry.register(Agent::new("coder-old", AgentType::Coder)).unwrap();
        f.oracle
            .push_response(json!({"decision": "human_review", "reasoning": "conflicting edits"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert!(!outcomes[0].fell_back);
        assert_eq!(outcomes[0].reasoning, "conflicting edits");
        assert_eq!(
            f.registry.agent("coder-old").unwrap().status,
            AgentStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_only_active_projects_recovered() {
        let f = fixture();
        seed(&f);
        let mut done = ProjectState::new("p2", "old");
        done.status = ProjectStatus::Completed;
        f.store.upsert_project_state(&done).unwrap();
        f.oracle.push_response(json!({"decision": "continue_task"}));

        let outcomes = f.recovery.recover_all().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].project_id, "p1");
    }

    #[tokio::test]
    async fn test_store_unavailable_aborts() {
        let f = fixture();
        seed(&f);
        f.store.set_unavailable(true);
        assert!(f.recovery.recover_all().await.is_err());
    }
}
