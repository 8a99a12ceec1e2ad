//! Durable records
//!
//! `ProjectState` is the only record recovery trusts for "what was happening".
//! It is coarse on purpose: the workspace on disk is the source of truth for
//! what was produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::escalation::{Gate, GateId};
use crate::registry::{AgentId, Task, TaskId};

/// Unique identifier for projects
pub type ProjectId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    /// Waiting on a human at a gate
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Last known state of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: ProjectId,
    #[serde(default)]
    pub goal: String,
    /// Root of the project's file area, scanned during recovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub current_task_id: Option<TaskId>,
    pub current_agent_id: Option<AgentId>,
    /// Free text describing the last transition
    pub last_action: String,
    pub status: ProjectStatus,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    pub fn new(project_id: impl Into<ProjectId>, goal: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            goal: goal.into(),
            workspace: None,
            current_task_id: None,
            current_agent_id: None,
            last_action: "created".to_string(),
            status: ProjectStatus::Active,
            updated_at: Utc::now(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Record a transition
    pub fn record(
        &mut self,
        action: impl Into<String>,
        task_id: Option<&str>,
        agent_id: Option<&str>,
    ) {
        self.last_action = action.into();
        self.current_task_id = task_id.map(str::to_string);
        self.current_agent_id = agent_id.map(str::to_string);
        self.updated_at = Utc::now();
    }
}

/// Everything the store holds, as written to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub projects: BTreeMap<ProjectId, ProjectState>,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, Task>,
    /// Gates in any status; pending ones are reloaded at startup
    #[serde(default)]
    pub gates: BTreeMap<GateId, Gate>,
}
