//! Hand-off to the external planning collaborator
//!
//! A rejected gate does not resume execution. The work goes back upstream as
//! a [`ReplanRequest`] through a [`PlanningSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use super::gate::GateId;
use crate::registry::TaskId;
use crate::state::ProjectId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanRequest {
    pub gate_id: GateId,
    pub task_id: Option<TaskId>,
    pub project_id: Option<ProjectId>,
    /// Why the human rejected the gate
    pub reason: String,
    pub context: Value,
    pub requested_at: DateTime<Utc>,
}

/// Receives work that must be planned again
pub trait PlanningSink: Send + Sync {
    fn submit(&self, request: ReplanRequest);
}

/// In-process sink that buffers requests until a planner drains them
#[derive(Debug, Default)]
pub struct ReplanQueue {
    requests: Mutex<VecDeque<ReplanRequest>>,
}

impl ReplanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<ReplanRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PlanningSink for ReplanQueue {
    fn submit(&self, request: ReplanRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request);
    }
}
