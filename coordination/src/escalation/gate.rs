//! Gate records
//!
//! `none -> pending -> {approved, rejected}`. Only a human-facing action
//! resolves a gate; there is no timeout and no auto-approval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::registry::{AgentId, TaskId};
use crate::state::{ProjectId, StoreError};

/// Unique identifier for gates
pub type GateId = String;

/// Reason string used for gates opened by startup recovery
pub const RECOVERY_AMBIGUOUS: &str = "recovery_ambiguous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// What opened the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTrigger {
    /// Loop count reached the threshold
    LoopDetected,
    /// Startup recovery could not settle on an action
    RecoveryAmbiguous,
    /// Explicit escalation by an operator or agent
    Manual,
}

/// Everything needed to open a gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub trigger: GateTrigger,
    pub reason: String,
    pub task_id: Option<TaskId>,
    pub project_id: Option<ProjectId>,
    /// Agents forced to paused while the gate is pending
    pub agent_ids: Vec<AgentId>,
    /// Snapshot of the triggering state
    pub context: Value,
}

impl EscalationRequest {
    pub fn new(trigger: GateTrigger, reason: impl Into<String>) -> Self {
        Self {
            trigger,
            reason: reason.into(),
            task_id: None,
            project_id: None,
            agent_ids: Vec::new(),
            context: Value::Null,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn for_project(mut self, project_id: Option<ProjectId>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_agents(mut self, agent_ids: Vec<AgentId>) -> Self {
        self.agent_ids = agent_ids;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// A pending-human-approval checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub id: GateId,
    pub reason: String,
    pub trigger: GateTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub agent_ids: Vec<AgentId>,
    pub context: Value,
    pub status: GateStatus,
    pub created_at: DateTime<Utc>,

    /// Human feedback on approval, reason on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Gate {
    pub fn open(request: EscalationRequest) -> Self {
        Self {
            id: format!("gate-{}", Uuid::new_v4()),
            reason: request.reason,
            trigger: request.trigger,
            task_id: request.task_id,
            project_id: request.project_id,
            agent_ids: request.agent_ids,
            context: request.context,
            status: GateStatus::Pending,
            created_at: Utc::now(),
            resolution: None,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == GateStatus::Pending
    }

    pub fn references_agent(&self, agent_id: &str) -> bool {
        self.agent_ids.iter().any(|a| a == agent_id)
    }

    pub(crate) fn resolve(&mut self, status: GateStatus, resolution: impl Into<String>) {
        self.status = status;
        self.resolution = Some(resolution.into());
        self.resolved_at = Some(Utc::now());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Unknown gate: {0}")]
    UnknownGate(GateId),

    #[error("Gate {gate_id} already {status}")]
    AlreadyResolved { gate_id: GateId, status: GateStatus },

    #[error("Rejecting a gate requires a non-empty reason")]
    EmptyReason,

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_gate_is_pending() {
        let gate = Gate::open(
            EscalationRequest::new(GateTrigger::LoopDetected, "loop")
                .for_task("t1")
                .with_agents(vec!["coder-1".to_string()])
                .with_context(json!({"loop_count": 3})),
        );
        assert!(gate.id.starts_with("gate-"));
        assert!(gate.is_pending());
        assert!(gate.references_agent("coder-1"));
        assert!(!gate.references_agent("coder-2"));
        assert_eq!(gate.context["loop_count"], 3);
    }

    #[test]
    fn test_resolve_records_outcome() {
        let mut gate = Gate::open(EscalationRequest::new(GateTrigger::Manual, "check"));
        gate.resolve(GateStatus::Rejected, "wrong approach");
        assert_eq!(gate.status, GateStatus::Rejected);
        assert_eq!(gate.resolution.as_deref(), Some("wrong approach"));
        assert!(gate.resolved_at.is_some());
    }
}
