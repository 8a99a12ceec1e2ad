//! Agent and task records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::Attempt;
use crate::state::ProjectId;

/// Unique identifier for agents
pub type AgentId = String;

/// Unique identifier for tasks
pub type TaskId = String;

/// Fixed set of agent roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Planner,
    Architect,
    Coder,
    Tester,
    Reviewer,
    Debugger,
    Documenter,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Debugger => "debugger",
            Self::Documenter => "documenter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "planner" => Some(Self::Planner),
            "architect" => Some(Self::Architect),
            "coder" => Some(Self::Coder),
            "tester" => Some(Self::Tester),
            "reviewer" => Some(Self::Reviewer),
            "debugger" => Some(Self::Debugger),
            "documenter" => Some(Self::Documenter),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    /// Held by a pending gate
    Paused,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A live worker known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    /// Back-reference to the task this agent holds, not ownership
    pub current_task_id: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            agent_type,
            status: AgentStatus::Idle,
            current_task_id: None,
            registered_at: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Assigned => write!(f, "assigned"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub task_type: String,
    /// What "done" means, handed to the progress evaluator
    pub goal: String,
    /// Capability required of the assigned agent
    pub agent_type: AgentType,
    /// Higher runs sooner
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    /// Append-only execution log
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// Insertion order within the queue, kept across requeues
    #[serde(default)]
    pub queue_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        task_type: impl Into<String>,
        agent_type: AgentType,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: None,
            task_type: task_type.into(),
            goal: String::new(),
            agent_type,
            priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            attempts: Vec::new(),
            queue_seq: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<ProjectId>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
