//! Event types for the coordination core
//!
//! Every state transition the core performs is published as one of these
//! events. They form the audit trail for oracle decisions and gate activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::{GateId, GateStatus};
use crate::registry::{AgentId, AgentType, TaskId};
use crate::router::MessageType;
use crate::state::ProjectId;

/// All coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// An agent joined the registry
    AgentRegistered {
        agent_id: AgentId,
        agent_type: AgentType,
        timestamp: DateTime<Utc>,
    },

    /// An agent left the registry
    AgentUnregistered {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A task entered the priority queue
    TaskEnqueued {
        task_id: TaskId,
        priority: i32,
        timestamp: DateTime<Utc>,
    },

    /// A task was handed to an agent
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A task moved to another agent without human sign-off
    TaskReassigned {
        task_id: TaskId,
        from_agent: AgentId,
        to_agent: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A task finished successfully
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A task was withdrawn (cancelled, rejected at a gate)
    TaskFailed {
        task_id: TaskId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A failure was recorded against a task
    FailureRecorded {
        task_id: TaskId,
        agent_id: AgentId,
        is_loop: bool,
        loop_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A consultation between two agents was recorded
    CollaborationRecorded {
        task_id: TaskId,
        from_agent: AgentId,
        to_agent: AgentId,
        is_loop: bool,
        loop_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// The loop counter for a task crossed the gate threshold
    LoopDetected {
        task_id: TaskId,
        loop_count: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The loop counter for a task was cleared
    LoopReset {
        task_id: TaskId,
        reason: String,
        previous_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A message was delivered to an inbox
    MessageRouted {
        message_id: String,
        sender: AgentId,
        recipient: AgentId,
        message_type: MessageType,
        timestamp: DateTime<Utc>,
    },

    /// A gate opened and paused its agents
    GateOpened {
        gate_id: GateId,
        reason: String,
        task_id: Option<TaskId>,
        agent_ids: Vec<AgentId>,
        timestamp: DateTime<Utc>,
    },

    /// A human resolved a gate
    GateResolved {
        gate_id: GateId,
        status: GateStatus,
        timestamp: DateTime<Utc>,
    },

    /// The reasoning oracle returned a decision (kept for audit)
    OracleConsulted {
        kind: String,
        task_id: Option<TaskId>,
        decision: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// Startup recovery settled on an action for a project
    RecoveryDecided {
        project_id: ProjectId,
        task_id: Option<TaskId>,
        decision: String,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinationEvent::AgentRegistered { .. } => "agent_registered",
            CoordinationEvent::AgentUnregistered { .. } => "agent_unregistered",
            CoordinationEvent::TaskEnqueued { .. } => "task_enqueued",
            CoordinationEvent::TaskAssigned { .. } => "task_assigned",
            CoordinationEvent::TaskReassigned { .. } => "task_reassigned",
            CoordinationEvent::TaskCompleted { .. } => "task_completed",
            CoordinationEvent::TaskFailed { .. } => "task_failed",
            CoordinationEvent::FailureRecorded { .. } => "failure_recorded",
            CoordinationEvent::CollaborationRecorded { .. } => "collaboration_recorded",
            CoordinationEvent::LoopDetected { .. } => "loop_detected",
            CoordinationEvent::LoopReset { .. } => "loop_reset",
            CoordinationEvent::MessageRouted { .. } => "message_routed",
            CoordinationEvent::GateOpened { .. } => "gate_opened",
            CoordinationEvent::GateResolved { .. } => "gate_resolved",
            CoordinationEvent::OracleConsulted { .. } => "oracle_consulted",
            CoordinationEvent::RecoveryDecided { .. } => "recovery_decided",
        }
    }

    /// Get the task ID if this event is task-scoped
    pub fn task_id(&self) -> Option<&str> {
        match self {
            CoordinationEvent::TaskEnqueued { task_id, .. }
            | CoordinationEvent::TaskAssigned { task_id, .. }
            | CoordinationEvent::TaskReassigned { task_id, .. }
            | CoordinationEvent::TaskCompleted { task_id, .. }
            | CoordinationEvent::TaskFailed { task_id, .. }
            | CoordinationEvent::FailureRecorded { task_id, .. }
            | CoordinationEvent::CollaborationRecorded { task_id, .. }
            | CoordinationEvent::LoopDetected { task_id, .. }
            | CoordinationEvent::LoopReset { task_id, .. } => Some(task_id),
            CoordinationEvent::GateOpened { task_id, .. }
            | CoordinationEvent::OracleConsulted { task_id, .. }
            | CoordinationEvent::RecoveryDecided { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }

    /// Get the event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CoordinationEvent::AgentRegistered { timestamp, .. }
            | CoordinationEvent::AgentUnregistered { timestamp, .. }
            | CoordinationEvent::TaskEnqueued { timestamp, .. }
            | CoordinationEvent::TaskAssigned { timestamp, .. }
            | CoordinationEvent::TaskReassigned { timestamp, .. }
            | CoordinationEvent::TaskCompleted { timestamp, .. }
            | CoordinationEvent::TaskFailed { timestamp, .. }
            | CoordinationEvent::FailureRecorded { timestamp, .. }
            | CoordinationEvent::CollaborationRecorded { timestamp, .. }
            | CoordinationEvent::LoopDetected { timestamp, .. }
            | CoordinationEvent::LoopReset { timestamp, .. }
            | CoordinationEvent::MessageRouted { timestamp, .. }
            | CoordinationEvent::GateOpened { timestamp, .. }
            | CoordinationEvent::GateResolved { timestamp, .. }
            | CoordinationEvent::OracleConsulted { timestamp, .. }
            | CoordinationEvent::RecoveryDecided { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = CoordinationEvent::TaskEnqueued {
            task_id: "task-1".to_string(),
            priority: 5,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"task_enqueued\""), "JSON: {json}");

        let parsed: CoordinationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "task_enqueued");
        assert_eq!(parsed.task_id(), Some("task-1"));
    }

    #[test]
    fn test_gate_event_task_scope() {
        let event = CoordinationEvent::GateOpened {
            gate_id: "gate-1".to_string(),
            reason: "manual".to_string(),
            task_id: None,
            agent_ids: vec!["agent-1".to_string()],
            timestamp: Utc::now(),
        };
        assert_eq!(event.task_id(), None);
        assert_eq!(event.event_type(), "gate_opened");
    }
}
