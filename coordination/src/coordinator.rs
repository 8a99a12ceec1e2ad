//! Coordinator facade
//!
//! The operations the orchestration layer calls. Each one drives the
//! components in a fixed order and persists what recovery needs before it
//! returns.
//!
//! ```text
//! report_failure ──▶ signature ──▶ LoopDetector ──should_gate──▶ GateManager
//! consult ─────────▶ Router::select_consultant ──▶ LoopDetector ──▶ Router::route
//! enqueue/assign ──▶ Registry ──▶ StateStore
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::escalation::{
    EscalationRequest, Gate, GateManager, GateTrigger, PlanningSink, ReplanQueue,
};
use crate::events::{CoordinationEvent, EventBus, SharedEventBus};
use crate::loop_detector::{AttemptContext, LoopDetector, LoopVerdict, ResetReason, TrackerSummary};
use crate::oracle::{HttpOracle, ScriptedOracle, SharedOracle};
use crate::progress::{Attempt, ProgressEvaluator, ProgressSnapshot};
use crate::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::registry::{
    Agent, AgentId, AgentRegistry, AgentType, RegistryError, RegistrySnapshot, SharedRegistry,
    Task, TaskId,
};
use crate::router::{Envelope, MessageRouter, MessageType, SelectionSource};
use crate::signature::{self, FailureContext};
use crate::similarity::{LexicalSimilarity, SimilarityScorer};
use crate::state::{JsonFileStateStore, ProjectState, SharedStateStore};

/// Reason recorded on a task withdrawn by the orchestration layer
pub const CANCELLED: &str = "cancelled";

const STATUS_EVENT_LIMIT: usize = 50;

/// Result of [`Coordinator::report_failure`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub verdict: LoopVerdict,
    /// Opened (or joined) when the loop threshold was reached
    pub gate: Option<Gate>,
}

/// Result of [`Coordinator::consult`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsultOutcome {
    /// Delivered to the consultant's inbox
    Routed {
        consultant: AgentId,
        source: SelectionSource,
        envelope: Envelope,
        verdict: LoopVerdict,
    },
    /// Repeated consultation reached the loop threshold; nothing was delivered
    Escalated {
        consultant: AgentId,
        gate: Gate,
        verdict: LoopVerdict,
    },
}

/// Aggregate view returned by [`Coordinator::get_status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub registry: RegistrySnapshot,
    pub pending_count: usize,
    pub pending_gates: Vec<Gate>,
    pub trackers: Vec<TrackerSummary>,
    pub recent_events: Vec<CoordinationEvent>,
    pub generated_at: DateTime<Utc>,
}

/// Assembles a [`Coordinator`] from config plus injected collaborators
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    oracle: Option<SharedOracle>,
    store: Option<SharedStateStore>,
    planning: Option<Arc<dyn PlanningSink>>,
    scorer: Option<Arc<dyn SimilarityScorer>>,
    events: Option<SharedEventBus>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            oracle: None,
            store: None,
            planning: None,
            scorer: None,
            events: None,
        }
    }

    pub fn oracle(mut self, oracle: SharedOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn store(mut self, store: SharedStateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn planning(mut self, planning: Arc<dyn PlanningSink>) -> Self {
        self.planning = Some(planning);
        self
    }

    pub fn scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Missing collaborators come from config: the HTTP oracle if an endpoint
    /// is set (otherwise an always-unavailable one), the JSON file store at
    /// `state_path`, and an in-process replan queue.
    ///
    /// Gates left pending by an earlier process are reloaded from the store,
    /// with their tasks held.
    pub fn build(self) -> CoordinationResult<Coordinator> {
        let config = self.config;

        let oracle: SharedOracle = match self.oracle {
            Some(oracle) => oracle,
            None => match &config.oracle {
                Some(endpoint) => Arc::new(HttpOracle::new(endpoint.clone())?),
                None => {
                    warn!("No oracle endpoint configured, oracle calls will fall back");
                    Arc::new(ScriptedOracle::unavailable())
                }
            },
        };
        let store: SharedStateStore = match self.store {
            Some(store) => store,
            None => JsonFileStateStore::open(&config.state_path)?.shared(),
        };
        let planning: Arc<dyn PlanningSink> = match self.planning {
            Some(planning) => planning,
            None => Arc::new(ReplanQueue::new()),
        };
        let scorer: Arc<dyn SimilarityScorer> = match self.scorer {
            Some(scorer) => scorer,
            None => Arc::new(LexicalSimilarity),
        };
        let events = self.events.unwrap_or_else(|| EventBus::new().shared());

        let registry = AgentRegistry::new(events.clone()).shared();
        let evaluator = ProgressEvaluator::new(oracle.clone(), scorer.clone())
            .with_failure_similarity_threshold(config.failure_similarity_threshold)
            .with_event_bus(events.clone());
        let loops = Arc::new(
            LoopDetector::new(evaluator, scorer, events.clone())
                .with_history_window(config.history_window)
                .with_idle_ttl(config.tracker_idle_ttl())
                .with_collaboration_threshold(config.collaboration_similarity_threshold),
        );
        let router = MessageRouter::new(registry.clone(), oracle.clone(), events.clone());
        let gates = Arc::new(GateManager::new(
            registry.clone(),
            loops.clone(),
            store.clone(),
            planning,
            events.clone(),
        ));
        let restored = gates.restore(store.pending_gates()?)?;
        if restored > 0 {
            warn!(restored, "Pending gates reloaded, waiting for human");
        }
        let recovery = RecoveryCoordinator::new(
            registry.clone(),
            gates.clone(),
            store.clone(),
            oracle,
            events.clone(),
        );

        Ok(Coordinator {
            config,
            events,
            registry,
            loops,
            router,
            gates,
            recovery,
            store,
        })
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    events: SharedEventBus,
    registry: SharedRegistry,
    loops: Arc<LoopDetector>,
    router: MessageRouter,
    gates: Arc<GateManager>,
    recovery: RecoveryCoordinator,
    store: SharedStateStore,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn loops(&self) -> &Arc<LoopDetector> {
        &self.loops
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn gates(&self) -> &Arc<GateManager> {
        &self.gates
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// Persist a task and, if it belongs to a project, the project's last action
    fn checkpoint(&self, task: &Task, action: &str) -> CoordinationResult<()> {
        self.store.upsert_task(task)?;
        if let Some(project_id) = &task.project_id {
            self.store.update_project_state(project_id, &mut |state| {
                state.record(action, Some(task.id.as_str()), task.assigned_agent.as_deref());
            })?;
        }
        Ok(())
    }

    /// Record a new project so recovery knows about it
    pub fn start_project(&self, project: ProjectState) -> CoordinationResult<()> {
        self.store.upsert_project_state(&project)?;
        info!(project_id = %project.project_id, "Project started");
        Ok(())
    }

    pub fn register_agent(
        &self,
        agent_id: impl Into<AgentId>,
        agent_type: AgentType,
    ) -> CoordinationResult<()> {
        self.registry.register(Agent::new(agent_id, agent_type))?;
        Ok(())
    }

    /// Remove an agent, requeueing its task and dropping its inbox
    pub fn unregister_agent(&self, agent_id: &str) -> CoordinationResult<Agent> {
        let agent = self.registry.unregister(agent_id)?;
        let dropped = self.router.drop_inbox(agent_id);
        if dropped > 0 {
            warn!(agent_id, dropped, "Undelivered messages discarded");
        }
        if let Some(task) = agent
            .current_task_id
            .as_deref()
            .and_then(|id| self.registry.task(id))
        {
            self.checkpoint(&task, "agent left, task requeued")?;
        }
        Ok(agent)
    }

    /// Persist a task, then queue it
    pub fn enqueue_task(&self, task: Task) -> CoordinationResult<()> {
        if self.registry.task(&task.id).is_some() {
            return Err(RegistryError::DuplicateTask(task.id).into());
        }
        self.store.upsert_task(&task)?;
        self.registry.enqueue(task)?;
        Ok(())
    }

    pub fn get_pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    fn ensure_not_gated(&self, task_id: &str) -> CoordinationResult<()> {
        match self.gates.pending_for_task(task_id) {
            Some(gate) => Err(CoordinationError::TaskGated {
                task_id: task_id.to_string(),
                gate_id: gate.id,
            }),
            None => Ok(()),
        }
    }

    /// Hand a specific task to an idle agent
    ///
    /// A task behind a pending gate is refused; the registry enforces the
    /// same hold inside its own critical section.
    pub fn assign(&self, task_id: &str, agent_id: &str) -> CoordinationResult<Task> {
        self.ensure_not_gated(task_id)?;
        let task = self.registry.assign(task_id, agent_id)?;
        self.checkpoint(&task, "assigned")?;
        Ok(task)
    }

    /// Give an idle agent the best queued task it can take. Gated tasks are
    /// skipped.
    pub fn assign_next(&self, agent_id: &str) -> CoordinationResult<Option<Task>> {
        let Some(task) = self.registry.assign_next(agent_id)? else {
            return Ok(None);
        };
        self.checkpoint(&task, "assigned")?;
        Ok(Some(task))
    }

    /// Mark success. This is one of the two events that clear a loop counter.
    pub async fn complete_task(&self, task_id: &str) -> CoordinationResult<Task> {
        let task = self.registry.complete_task(task_id)?;
        self.loops.reset(task_id, ResetReason::TaskCompleted).await;
        self.loops.forget(task_id);
        self.checkpoint(&task, "completed")?;
        Ok(task)
    }

    /// Record a failed attempt on a task
    ///
    /// Opens a loop gate when the detector says so. The failing agent and the
    /// task's current holder are both paused.
    pub async fn report_failure(
        &self,
        task_id: &str,
        agent_id: &str,
        error_message: &str,
        context: &FailureContext,
        progress: ProgressSnapshot,
    ) -> CoordinationResult<FailureReport> {
        let task = self
            .registry
            .task(task_id)
            .ok_or_else(|| RegistryError::UnknownTask(task_id.to_string()))?;
        if !self.registry.contains_agent(agent_id) {
            return Err(RegistryError::UnknownAgent(agent_id.to_string()).into());
        }

        let failure = signature::extract(error_message, context);
        let error_type = failure.error_type;
        let attempt_context = AttemptContext::new(task.goal.clone(), progress.clone());
        let verdict = self
            .loops
            .record_failure(task_id, agent_id, failure.clone(), &attempt_context)
            .await;

        self.registry
            .append_attempt(task_id, Attempt::new(agent_id, Some(failure), progress))?;
        if let Some(task) = self.registry.task(task_id) {
            self.checkpoint(&task, &format!("attempt failed: {}", error_type))?;
        }

        let gate = if verdict.should_gate {
            let mut agents = vec![agent_id.to_string()];
            if let Some(holder) = task.assigned_agent.filter(|h| h != agent_id) {
                agents.push(holder);
            }
            let request = EscalationRequest::new(GateTrigger::LoopDetected, verdict.reason.clone())
                .for_task(task_id)
                .for_project(task.project_id.clone())
                .with_agents(agents)
                .with_context(json!({
                    "loop_count": verdict.loop_count,
                    "error_type": error_type,
                    "error_message": error_message,
                }));
            Some(self.gates.open(request)?)
        } else {
            None
        };

        Ok(FailureReport { verdict, gate })
    }

    /// Deliver a message through the hub
    pub fn route(
        &self,
        sender: &str,
        recipient: &str,
        message_type: MessageType,
        payload: Value,
    ) -> CoordinationResult<Envelope> {
        Ok(self.router.route(sender, recipient, message_type, payload)?)
    }

    /// Ask an agent of `target_type` a question about a task
    ///
    /// The router picks the consultant. The exchange is checked for repetition
    /// before delivery; a repeat that reaches the loop threshold opens a gate
    /// instead of reaching the consultant.
    pub async fn consult(
        &self,
        requesting_agent: &str,
        task_id: &str,
        target_type: AgentType,
        question: &str,
        context: Value,
        suggested: Option<&str>,
    ) -> CoordinationResult<ConsultOutcome> {
        let selection = self
            .router
            .select_consultant(requesting_agent, target_type, question, &context, suggested)
            .await?;
        let consultant = selection.agent.id.clone();

        let verdict = self
            .loops
            .record_collaboration(task_id, requesting_agent, &consultant, question)
            .await;

        if verdict.should_gate {
            let project_id = self.registry.task(task_id).and_then(|t| t.project_id);
            let request = EscalationRequest::new(GateTrigger::LoopDetected, verdict.reason.clone())
                .for_task(task_id)
                .for_project(project_id)
                .with_agents(vec![requesting_agent.to_string(), consultant.clone()])
                .with_context(json!({
                    "loop_count": verdict.loop_count,
                    "question": question,
                    "consultant": consultant,
                }));
            let gate = self.gates.open(request)?;
            return Ok(ConsultOutcome::Escalated {
                consultant,
                gate,
                verdict,
            });
        }

        let envelope = self.router.route(
            requesting_agent,
            &consultant,
            MessageType::Consultation,
            json!({
                "task_id": task_id,
                "question": question,
                "context": context,
            }),
        )?;

        Ok(ConsultOutcome::Routed {
            consultant,
            source: selection.source,
            envelope,
            verdict,
        })
    }

    /// Open a manual gate
    pub fn escalate_to_human(
        &self,
        reason: &str,
        task_id: Option<&str>,
        agent_ids: Vec<AgentId>,
        context: Value,
    ) -> CoordinationResult<Gate> {
        let mut request = EscalationRequest::new(GateTrigger::Manual, reason)
            .with_agents(agent_ids)
            .with_context(context);
        if let Some(task_id) = task_id {
            let project_id = self.registry.task(task_id).and_then(|t| t.project_id);
            request = request.for_task(task_id).for_project(project_id);
        }
        Ok(self.gates.open(request)?)
    }

    pub async fn approve(&self, gate_id: &str, human_feedback: &str) -> CoordinationResult<Gate> {
        Ok(self.gates.approve(gate_id, human_feedback).await?)
    }

    pub fn reject(&self, gate_id: &str, reason: &str) -> CoordinationResult<Gate> {
        Ok(self.gates.reject(gate_id, reason)?)
    }

    pub async fn recover_all(&self) -> CoordinationResult<Vec<RecoveryOutcome>> {
        Ok(self.recovery.recover_all().await?)
    }

    pub async fn get_status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            registry: self.registry.snapshot(),
            pending_count: self.registry.pending_count(),
            pending_gates: self.gates.pending(),
            trackers: self.loops.snapshot().await,
            recent_events: self.events.recent(STATUS_EVENT_LIMIT),
            generated_at: Utc::now(),
        }
    }

    /// Hand an assigned task to another idle agent of the same type
    ///
    /// The loop counter is left untouched. A gated task stays where it is.
    pub fn reassign_task(&self, task_id: &str, to_agent: &str) -> CoordinationResult<Task> {
        self.ensure_not_gated(task_id)?;
        let (from_agent, task) = self.registry.reassign(task_id, to_agent)?;
        self.checkpoint(&task, &format!("reassigned from {}", from_agent))?;
        Ok(task)
    }

    /// Withdraw a task, freeing its agent if it had one
    pub fn cancel_task(&self, task_id: &str) -> CoordinationResult<Task> {
        let task = self.registry.fail_task(task_id, CANCELLED)?;
        self.loops.forget(task_id);
        self.checkpoint(&task, CANCELLED)?;
        Ok(task)
    }

    /// Drop loop trackers idle past the configured TTL
    pub fn collect_idle_trackers(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let collected = self.loops.collect_idle(now);
        if !collected.is_empty() {
            info!(count = collected.len(), "Idle loop trackers collected");
        }
        collected
    }
}
