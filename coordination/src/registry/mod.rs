//! Agent registry and task queue
//!
//! Agents, tasks and the pending queue live behind one lock. Every check an
//! assignment depends on (agent known, agent idle, task pending, capability
//! match) and the resulting mutation happen inside that single critical
//! section, so no task can be handed to two agents and no agent can take a
//! second task. The lock is never held across an await.

pub mod queue;
pub mod types;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{CoordinationEvent, SharedEventBus};
use crate::progress::Attempt;
pub use queue::PriorityQueue;
pub use types::{Agent, AgentId, AgentStatus, AgentType, Task, TaskId, TaskStatus};

/// Assignment and registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(AgentId),

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Agent {agent_id} is {status}, not idle")]
    AgentNotIdle {
        agent_id: AgentId,
        status: AgentStatus,
    },

    #[error("Task {task_id} is {status}, expected {expected}")]
    InvalidTaskStatus {
        task_id: TaskId,
        status: TaskStatus,
        expected: TaskStatus,
    },

    #[error("Task {task_id} needs a {required} agent, {agent_id} is a {actual}")]
    CapabilityMismatch {
        task_id: TaskId,
        agent_id: AgentId,
        required: AgentType,
        actual: AgentType,
    },

    #[error("Task {0} is held by a pending gate")]
    TaskHeld(TaskId),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Shared reference to AgentRegistry
pub type SharedRegistry = Arc<AgentRegistry>;

/// Aggregate view for status reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub agents: Vec<Agent>,
    pub agents_by_status: BTreeMap<String, usize>,
    /// Pending task ids in dequeue order
    pub queued: Vec<TaskId>,
    /// (task, agent) for every assigned task
    pub assigned: Vec<(TaskId, AgentId)>,
}

#[derive(Default)]
struct Board {
    agents: BTreeMap<AgentId, Agent>,
    tasks: HashMap<TaskId, Task>,
    queue: PriorityQueue,
    /// Tasks behind an open gate; never handed out
    held: HashSet<TaskId>,
}

impl Board {
    fn agent(&self, agent_id: &str) -> RegistryResult<&Agent> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))
    }

    fn task(&self, task_id: &str) -> RegistryResult<&Task> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| RegistryError::UnknownTask(task_id.to_string()))
    }

    fn task_mut(&mut self, task_id: &str) -> RegistryResult<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::UnknownTask(task_id.to_string()))
    }

    fn push_queue(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            let seq = match task.queue_seq {
                Some(seq) => {
                    self.queue.push_with_seq(task.id.clone(), task.priority, seq);
                    seq
                }
                None => self.queue.push(task.id.clone(), task.priority),
            };
            task.queue_seq = Some(seq);
        }
    }

    /// Validate and perform one assignment
    fn assign(&mut self, task_id: &str, agent_id: &str) -> RegistryResult<Task> {
        if self.held.contains(task_id) {
            return Err(RegistryError::TaskHeld(task_id.to_string()));
        }
        let agent = self.agent(agent_id)?;
        if agent.status != AgentStatus::Idle {
            return Err(RegistryError::AgentNotIdle {
                agent_id: agent_id.to_string(),
                status: agent.status,
            });
        }
        let agent_type = agent.agent_type;

        let task = self.task(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(RegistryError::InvalidTaskStatus {
                task_id: task_id.to_string(),
                status: task.status,
                expected: TaskStatus::Pending,
            });
        }
        if task.agent_type != agent_type {
            return Err(RegistryError::CapabilityMismatch {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                required: task.agent_type,
                actual: agent_type,
            });
        }

        self.queue.remove(task_id);

        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent_id.to_string());
        task.touch();
        let assigned = task.clone();

        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.status = AgentStatus::Active;
            agent.current_task_id = Some(task_id.to_string());
        }

        Ok(assigned)
    }

    /// Detach the agent holding `task_id`, if any
    fn release_holder(&mut self, task_id: &str) -> Option<AgentId> {
        let holder = self.tasks.get(task_id)?.assigned_agent.clone()?;
        if let Some(agent) = self.agents.get_mut(&holder) {
            if agent.current_task_id.as_deref() == Some(task_id) {
                agent.current_task_id = None;
                if agent.status == AgentStatus::Active {
                    agent.status = AgentStatus::Idle;
                }
            }
        }
        Some(holder)
    }
}

/// Registry of live agents plus the task queue
pub struct AgentRegistry {
    board: Mutex<Board>,
    events: SharedEventBus,
}

impl AgentRegistry {
    pub fn new(events: SharedEventBus) -> Self {
        Self {
            board: Mutex::new(Board::default()),
            events,
        }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(self)
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an agent. It starts idle with no task.
    pub fn register(&self, mut agent: Agent) -> RegistryResult<()> {
        let agent_id = agent.id.clone();
        let agent_type = agent.agent_type;
        {
            let mut board = self.board();
            if board.agents.contains_key(&agent_id) {
                return Err(RegistryError::DuplicateAgent(agent_id));
            }
            agent.status = AgentStatus::Idle;
            agent.current_task_id = None;
            board.agents.insert(agent_id.clone(), agent);
        }

        info!(agent_id = %agent_id, agent_type = %agent_type, "Agent registered");
        self.events.publish(CoordinationEvent::AgentRegistered {
            agent_id,
            agent_type,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Remove an agent. A task it held goes back to the queue.
    pub fn unregister(&self, agent_id: &str) -> RegistryResult<Agent> {
        let (agent, requeued) = {
            let mut board = self.board();
            let agent = board
                .agents
                .remove(agent_id)
                .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;

            let requeued = agent.current_task_id.clone().filter(|task_id| {
                board
                    .tasks
                    .get(task_id)
                    .is_some_and(|t| t.status == TaskStatus::Assigned)
            });
            if let Some(task_id) = &requeued {
                if let Some(task) = board.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Pending;
                    task.assigned_agent = None;
                    task.touch();
                }
                board.push_queue(task_id);
            }
            (agent, requeued)
        };

        info!(agent_id, requeued = ?requeued, "Agent unregistered");
        self.events.publish(CoordinationEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(agent)
    }

    /// Add a task to the queue
    pub fn enqueue(&self, mut task: Task) -> RegistryResult<()> {
        let task_id = task.id.clone();
        let priority = task.priority;
        {
            let mut board = self.board();
            if board.tasks.contains_key(&task_id) {
                return Err(RegistryError::DuplicateTask(task_id));
            }
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.touch();
            board.tasks.insert(task_id.clone(), task);
            board.push_queue(&task_id);
        }

        debug!(task_id = %task_id, priority, "Task enqueued");
        self.events.publish(CoordinationEvent::TaskEnqueued {
            task_id,
            priority,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Put an assigned or dequeued task back in the queue at its original
    /// position, releasing its agent if it has one
    pub fn requeue(&self, task_id: &str) -> RegistryResult<Task> {
        let task = {
            let mut board = self.board();
            let status = board.task(task_id)?.status;
            if status.is_terminal() {
                return Err(RegistryError::InvalidTaskStatus {
                    task_id: task_id.to_string(),
                    status,
                    expected: TaskStatus::Assigned,
                });
            }
            board.release_holder(task_id);
            let task = board.task_mut(task_id)?;
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.touch();
            let task = task.clone();
            board.push_queue(task_id);
            task
        };

        debug!(task_id, "Task requeued");
        self.events.publish(CoordinationEvent::TaskEnqueued {
            task_id: task_id.to_string(),
            priority: task.priority,
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// Pop the highest-priority, earliest-enqueued task not held by a gate
    ///
    /// The task leaves the queue but stays pending and unowned. The caller
    /// must either `assign` it or hand it back with `requeue`, which restores
    /// its original queue position. Prefer `assign_next` when the agent is
    /// already known.
    pub fn dequeue(&self) -> Option<Task> {
        let mut board = self.board();
        let Board { queue, held, .. } = &mut *board;
        let task_id = queue.pop_matching(|id| !held.contains(id))?;
        board.tasks.get(&task_id).cloned()
    }

    /// Hand a pending task to an idle agent
    pub fn assign(&self, task_id: &str, agent_id: &str) -> RegistryResult<Task> {
        let task = self.board().assign(task_id, agent_id)?;
        self.announce_assignment(&task, agent_id);
        Ok(task)
    }

    /// Give an agent the best queued task it can run
    ///
    /// Agent status is checked inside the same critical section as the
    /// dequeue, so a gate that paused the agent is always observed.
    pub fn assign_next(&self, agent_id: &str) -> RegistryResult<Option<Task>> {
        let task = {
            let mut board = self.board();
            let agent = board.agent(agent_id)?;
            if agent.status != AgentStatus::Idle {
                return Err(RegistryError::AgentNotIdle {
                    agent_id: agent_id.to_string(),
                    status: agent.status,
                });
            }
            let agent_type = agent.agent_type;

            let Board {
                tasks, queue, held, ..
            } = &mut *board;
            let next = queue.pop_matching(|id| {
                !held.contains(id)
                    && tasks.get(id).is_some_and(|t| {
                        t.agent_type == agent_type && t.status == TaskStatus::Pending
                    })
            });
            match next {
                Some(task_id) => Some(board.assign(&task_id, agent_id)?),
                None => None,
            }
        };

        if let Some(task) = &task {
            self.announce_assignment(task, agent_id);
        }
        Ok(task)
    }

    fn announce_assignment(&self, task: &Task, agent_id: &str) {
        info!(task_id = %task.id, agent_id, "Task assigned");
        self.events.publish(CoordinationEvent::TaskAssigned {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Mark a task completed and free its agent
    ///
    /// Normally the task is assigned. Recovery may also close out a pending
    /// task whose work is already on disk.
    pub fn complete_task(&self, task_id: &str) -> RegistryResult<Task> {
        let (task, agent_id) = {
            let mut board = self.board();
            let status = board.task(task_id)?.status;
            if status.is_terminal() {
                return Err(RegistryError::InvalidTaskStatus {
                    task_id: task_id.to_string(),
                    status,
                    expected: TaskStatus::Assigned,
                });
            }
            board.queue.remove(task_id);
            let agent_id = board.release_holder(task_id).unwrap_or_default();
            let task = board.task_mut(task_id)?;
            task.status = TaskStatus::Completed;
            task.touch();
            (task.clone(), agent_id)
        };

        info!(task_id, agent_id = %agent_id, "Task completed");
        self.events.publish(CoordinationEvent::TaskCompleted {
            task_id: task_id.to_string(),
            agent_id,
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// Withdraw a task (cancelled, rejected). Frees its agent if assigned.
    pub fn fail_task(&self, task_id: &str, reason: &str) -> RegistryResult<Task> {
        let task = {
            let mut board = self.board();
            let status = board.task(task_id)?.status;
            if status.is_terminal() {
                return Err(RegistryError::InvalidTaskStatus {
                    task_id: task_id.to_string(),
                    status,
                    expected: TaskStatus::Pending,
                });
            }
            board.queue.remove(task_id);
            board.release_holder(task_id);
            let task = board.task_mut(task_id)?;
            task.status = TaskStatus::Failed;
            task.failure_reason = Some(reason.to_string());
            task.touch();
            task.clone()
        };

        info!(task_id, reason, "Task failed");
        self.events.publish(CoordinationEvent::TaskFailed {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// Move an assigned task to another idle agent of the same capability
    ///
    /// Returns the previous holder and the updated task.
    pub fn reassign(&self, task_id: &str, to_agent: &str) -> RegistryResult<(AgentId, Task)> {
        let (from_agent, task) = {
            let mut board = self.board();
            if board.held.contains(task_id) {
                return Err(RegistryError::TaskHeld(task_id.to_string()));
            }
            let task = board.task(task_id)?;
            if task.status != TaskStatus::Assigned {
                return Err(RegistryError::InvalidTaskStatus {
                    task_id: task_id.to_string(),
                    status: task.status,
                    expected: TaskStatus::Assigned,
                });
            }
            let required = task.agent_type;

            let target = board.agent(to_agent)?;
            if target.status != AgentStatus::Idle {
                return Err(RegistryError::AgentNotIdle {
                    agent_id: to_agent.to_string(),
                    status: target.status,
                });
            }
            if target.agent_type != required {
                return Err(RegistryError::CapabilityMismatch {
                    task_id: task_id.to_string(),
                    agent_id: to_agent.to_string(),
                    required,
                    actual: target.agent_type,
                });
            }

            let from_agent = board.release_holder(task_id).unwrap_or_default();
            let task = board.task_mut(task_id)?;
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            let task = board.assign(task_id, to_agent)?;
            (from_agent, task)
        };

        info!(task_id, from_agent = %from_agent, to_agent, "Task reassigned");
        self.events.publish(CoordinationEvent::TaskReassigned {
            task_id: task_id.to_string(),
            from_agent: from_agent.clone(),
            to_agent: to_agent.to_string(),
            timestamp: Utc::now(),
        });
        Ok((from_agent, task))
    }

    /// Append to a task's attempt log
    pub fn append_attempt(&self, task_id: &str, attempt: Attempt) -> RegistryResult<()> {
        let mut board = self.board();
        let task = board.task_mut(task_id)?;
        task.attempts.push(attempt);
        task.touch();
        Ok(())
    }

    /// Clear a task's attempt log, returning how many entries were dropped
    pub fn clear_attempts(&self, task_id: &str) -> RegistryResult<usize> {
        let mut board = self.board();
        let task = board.task_mut(task_id)?;
        let cleared = task.attempts.len();
        task.attempts.clear();
        task.touch();
        Ok(cleared)
    }

    /// Force agents to paused. Unknown and stopped agents are skipped.
    pub fn pause_agents(&self, agent_ids: &[AgentId]) -> Vec<AgentId> {
        let mut board = self.board();
        let mut paused = Vec::new();
        for agent_id in agent_ids {
            if let Some(agent) = board.agents.get_mut(agent_id) {
                if matches!(agent.status, AgentStatus::Idle | AgentStatus::Active) {
                    agent.status = AgentStatus::Paused;
                    paused.push(agent_id.clone());
                }
            }
        }
        paused
    }

    /// Lift a pause: agents holding a task go back to active, others to idle
    pub fn resume_agents(&self, agent_ids: &[AgentId]) -> Vec<AgentId> {
        let mut board = self.board();
        let Board { agents, tasks, .. } = &mut *board;
        let mut resumed = Vec::new();
        for agent_id in agent_ids {
            if let Some(agent) = agents.get_mut(agent_id) {
                if agent.status != AgentStatus::Paused {
                    continue;
                }
                let holds_task = agent.current_task_id.as_ref().is_some_and(|task_id| {
                    tasks
                        .get(task_id)
                        .is_some_and(|t| t.status == TaskStatus::Assigned)
                });
                if !holds_task {
                    agent.current_task_id = None;
                }
                agent.status = if holds_task {
                    AgentStatus::Active
                } else {
                    AgentStatus::Idle
                };
                resumed.push(agent_id.clone());
            }
        }
        resumed
    }

    /// Keep a task from being handed out until `release_task`
    ///
    /// Returns false if the task was already held.
    pub fn hold_task(&self, task_id: &str) -> bool {
        let held = self.board().held.insert(task_id.to_string());
        if held {
            debug!(task_id, "Task held");
        }
        held
    }

    /// Returns false if the task was not held
    pub fn release_task(&self, task_id: &str) -> bool {
        let released = self.board().held.remove(task_id);
        if released {
            debug!(task_id, "Task released");
        }
        released
    }

    pub fn is_held(&self, task_id: &str) -> bool {
        self.board().held.contains(task_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.board().agents.get(agent_id).cloned()
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.board().agents.contains_key(agent_id)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.board().tasks.get(task_id).cloned()
    }

    /// Agents of a type that can take work now or later (not stopped)
    pub fn candidates_of_type(&self, agent_type: AgentType) -> Vec<Agent> {
        self.board()
            .agents
            .values()
            .filter(|a| a.agent_type == agent_type && a.status != AgentStatus::Stopped)
            .cloned()
            .collect()
    }

    pub fn idle_agents_of_type(&self, agent_type: AgentType) -> Vec<Agent> {
        self.board()
            .agents
            .values()
            .filter(|a| a.agent_type == agent_type && a.is_idle())
            .cloned()
            .collect()
    }

    /// First queued task of a project, in dequeue order, without removing it
    pub fn next_queued_for_project(&self, project_id: &str) -> Option<Task> {
        let board = self.board();
        board
            .queue
            .ordered()
            .into_iter()
            .filter_map(|id| board.tasks.get(&id))
            .find(|t| t.project_id.as_deref() == Some(project_id))
            .cloned()
    }

    /// Number of tasks waiting in the queue
    pub fn pending_count(&self) -> usize {
        self.board().queue.len()
    }

    /// Load a task from durable state into a fresh process
    ///
    /// Agents do not survive a restart, so an assigned task comes back as
    /// pending. Tasks already known are left untouched.
    pub fn restore_task(&self, mut task: Task) -> bool {
        let mut board = self.board();
        if board.tasks.contains_key(&task.id) {
            return false;
        }
        let task_id = task.id.clone();
        if task.status == TaskStatus::Assigned {
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
        }
        let pending = task.status == TaskStatus::Pending;
        board.tasks.insert(task_id.clone(), task);
        if pending {
            board.push_queue(&task_id);
        }
        debug!(task_id = %task_id, pending, "Task restored");
        true
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let board = self.board();
        let agents: Vec<Agent> = board.agents.values().cloned().collect();

        let mut agents_by_status = BTreeMap::new();
        for agent in &agents {
            *agents_by_status.entry(agent.status.to_string()).or_insert(0) += 1;
        }

        let mut assigned: Vec<(TaskId, AgentId)> = board
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Assigned)
            .filter_map(|t| t.assigned_agent.clone().map(|a| (t.id.clone(), a)))
            .collect();
        assigned.sort();

        RegistrySnapshot {
            agents,
            agents_by_status,
            queued: board.queue.ordered(),
            assigned,
        }
    }
}
