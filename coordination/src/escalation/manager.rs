//! Gate manager
//!
//! Opening a gate pauses every referenced agent before control returns, so
//! the next assignment attempt for those agents fails. Approval lifts the
//! pause (for agents no other pending gate holds) and, for loop gates, resets
//! the task's loop counter. Rejection withdraws the task and sends the work
//! back to planning; it never resets the counter.
//!
//! Every gate transition is written to the state store before it takes
//! effect in memory, and a gate's task is held in the registry while the
//! gate is pending, so no assignment path can hand it out.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use super::gate::{EscalationRequest, Gate, GateError, GateId, GateStatus, GateTrigger};
use super::replan::{PlanningSink, ReplanRequest};
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::loop_detector::{LoopDetector, ResetReason};
use crate::registry::{AgentId, SharedRegistry};
use crate::state::{ProjectStatus, SharedStateStore};

/// Reason recorded on a task withdrawn by rejection
pub const GATE_REJECTED: &str = "gate_rejected";

pub struct GateManager {
    gates: Mutex<HashMap<GateId, Gate>>,
    registry: SharedRegistry,
    loops: Arc<LoopDetector>,
    store: SharedStateStore,
    planning: Arc<dyn PlanningSink>,
    events: SharedEventBus,
}

impl GateManager {
    pub fn new(
        registry: SharedRegistry,
        loops: Arc<LoopDetector>,
        store: SharedStateStore,
        planning: Arc<dyn PlanningSink>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            registry,
            loops,
            store,
            planning,
            events,
        }
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<GateId, Gate>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `pending` and pause the referenced agents
    ///
    /// A task already waiting on a pending gate keeps that gate; any new
    /// agents in the request are added to it and paused.
    pub fn open(&self, request: EscalationRequest) -> Result<Gate, GateError> {
        let mut gates = self.gates();

        if let Some(task_id) = &request.task_id {
            if let Some(existing) = gates
                .values_mut()
                .find(|g| g.is_pending() && g.task_id.as_ref() == Some(task_id))
            {
                let added: Vec<AgentId> = request
                    .agent_ids
                    .iter()
                    .filter(|a| !existing.references_agent(a))
                    .cloned()
                    .collect();
                if !added.is_empty() {
                    let mut widened = existing.clone();
                    widened.agent_ids.extend(added.iter().cloned());
                    self.store.upsert_gate(&widened)?;
                    *existing = widened;
                }
                self.registry.pause_agents(&added);
                info!(gate_id = %existing.id, task_id = %task_id, "Gate already pending for task");
                return Ok(existing.clone());
            }
        }

        let gate = Gate::open(request);
        self.store.upsert_gate(&gate)?;

        if let Some(project_id) = &gate.project_id {
            let action = format!("gate opened: {}", gate.reason);
            self.store.update_project_state(project_id, &mut |state| {
                state.status = ProjectStatus::Paused;
                state.last_action = action.clone();
            })?;
        }

        if let Some(task_id) = &gate.task_id {
            self.registry.hold_task(task_id);
        }
        let paused = self.registry.pause_agents(&gate.agent_ids);
        gates.insert(gate.id.clone(), gate.clone());
        drop(gates);

        warn!(
            gate_id = %gate.id,
            reason = %gate.reason,
            task_id = ?gate.task_id,
            paused = ?paused,
            "Gate opened, waiting for human"
        );
        self.events.publish(CoordinationEvent::GateOpened {
            gate_id: gate.id.clone(),
            reason: gate.reason.clone(),
            task_id: gate.task_id.clone(),
            agent_ids: gate.agent_ids.clone(),
            timestamp: Utc::now(),
        });
        Ok(gate)
    }

    /// Take a gate out of `pending`, returning it, the agents no other
    /// pending gate still holds, and whether its task may be released
    ///
    /// The task itself stays held; the caller releases it once done with it.
    fn resolve(
        &self,
        gate_id: &str,
        status: GateStatus,
        resolution: &str,
    ) -> Result<(Gate, Vec<AgentId>, bool), GateError> {
        let mut gates = self.gates();
        let gate = gates
            .get(gate_id)
            .ok_or_else(|| GateError::UnknownGate(gate_id.to_string()))?;
        if !gate.is_pending() {
            return Err(GateError::AlreadyResolved {
                gate_id: gate_id.to_string(),
                status: gate.status,
            });
        }

        let others: Vec<&Gate> = gates
            .values()
            .filter(|g| g.is_pending() && g.id != gate_id)
            .collect();
        let releasable: Vec<AgentId> = gate
            .agent_ids
            .iter()
            .filter(|a| !others.iter().any(|g| g.references_agent(a)))
            .cloned()
            .collect();
        let project_still_held = gate
            .project_id
            .as_ref()
            .is_some_and(|p| others.iter().any(|g| g.project_id.as_ref() == Some(p)));
        let task_still_held = gate
            .task_id
            .as_ref()
            .is_some_and(|t| others.iter().any(|g| g.task_id.as_ref() == Some(t)));

        if let Some(project_id) = gate.project_id.clone() {
            let action = format!("gate {}: {}", status, resolution);
            self.store.update_project_state(&project_id, &mut |state| {
                if !project_still_held {
                    state.status = ProjectStatus::Active;
                }
                state.last_action = action.clone();
            })?;
        }

        let mut resolved = gate.clone();
        resolved.resolve(status, resolution);
        self.store.upsert_gate(&resolved)?;

        if let Some(task_id) = &resolved.task_id {
            self.load_task(task_id)?;
        }
        gates.insert(resolved.id.clone(), resolved.clone());
        Ok((resolved, releasable, !task_still_held))
    }

    fn release_gated_task(&self, gate: &Gate, releasable: bool) {
        if let Some(task_id) = gate.task_id.as_deref().filter(|_| releasable) {
            self.registry.release_task(task_id);
        }
    }

    /// Make sure the registry knows a gated task, reading it from the store
    /// when this process never saw it
    fn load_task(&self, task_id: &str) -> Result<(), GateError> {
        if self.registry.task(task_id).is_none() {
            if let Some(task) = self.store.get_task(task_id)? {
                self.registry.restore_task(task);
            }
        }
        Ok(())
    }

    /// Reinstate pending gates read back from the state store at startup
    ///
    /// Their tasks are loaded into the registry and held. Agents do not
    /// survive a restart, so nothing is paused here; agents named by a
    /// restored gate are paused again if they re-register and the gate
    /// is widened.
    pub fn restore(&self, restored: Vec<Gate>) -> Result<usize, GateError> {
        let mut gates = self.gates();
        let mut count = 0;
        for gate in restored.into_iter().filter(Gate::is_pending) {
            if gates.contains_key(&gate.id) {
                continue;
            }
            if let Some(task_id) = &gate.task_id {
                self.load_task(task_id)?;
                self.registry.hold_task(task_id);
            }
            info!(gate_id = %gate.id, task_id = ?gate.task_id, "Pending gate restored");
            gates.insert(gate.id.clone(), gate);
            count += 1;
        }
        Ok(count)
    }

    /// Approve a pending gate with the human's feedback
    pub async fn approve(&self, gate_id: &str, human_feedback: &str) -> Result<Gate, GateError> {
        let (gate, releasable, task_free) =
            self.resolve(gate_id, GateStatus::Approved, human_feedback)?;

        self.release_gated_task(&gate, task_free);
        let resumed = self.registry.resume_agents(&releasable);

        if gate.trigger == GateTrigger::LoopDetected {
            if let Some(task_id) = &gate.task_id {
                self.loops.reset(task_id, ResetReason::HumanIntervention).await;
            }
        }

        info!(gate_id, resumed = ?resumed, "Gate approved");
        self.events.publish(CoordinationEvent::GateResolved {
            gate_id: gate.id.clone(),
            status: GateStatus::Approved,
            timestamp: Utc::now(),
        });
        Ok(gate)
    }

    /// Reject a pending gate. The task is withdrawn and re-planned upstream.
    pub fn reject(&self, gate_id: &str, reason: &str) -> Result<Gate, GateError> {
        if reason.trim().is_empty() {
            return Err(GateError::EmptyReason);
        }

        let (gate, releasable, task_free) = self.resolve(gate_id, GateStatus::Rejected, reason)?;

        if let Some(task_id) = &gate.task_id {
            let withdrawn = self.registry.fail_task(task_id, GATE_REJECTED);
            self.release_gated_task(&gate, task_free);
            match withdrawn {
                Ok(task) => self.store.upsert_task(&task)?,
                Err(e) => warn!(gate_id, task_id = %task_id, error = %e, "Rejected task not withdrawn"),
            }
        }
        let released = self.registry.resume_agents(&releasable);

        self.planning.submit(ReplanRequest {
            gate_id: gate.id.clone(),
            task_id: gate.task_id.clone(),
            project_id: gate.project_id.clone(),
            reason: reason.to_string(),
            context: gate.context.clone(),
            requested_at: Utc::now(),
        });

        info!(gate_id, reason, released = ?released, "Gate rejected, sent back to planning");
        self.events.publish(CoordinationEvent::GateResolved {
            gate_id: gate.id.clone(),
            status: GateStatus::Rejected,
            timestamp: Utc::now(),
        });
        Ok(gate)
    }

    pub fn get(&self, gate_id: &str) -> Option<Gate> {
        self.gates().get(gate_id).cloned()
    }

    /// Pending gates, oldest first
    pub fn pending(&self) -> Vec<Gate> {
        let mut pending: Vec<Gate> = self
            .gates()
            .values()
            .filter(|g| g.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    pub fn pending_for_task(&self, task_id: &str) -> Option<Gate> {
        self.gates()
            .values()
            .find(|g| g.is_pending() && g.task_id.as_deref() == Some(task_id))
            .cloned()
    }

    pub fn is_agent_held(&self, agent_id: &str) -> bool {
        self.gates()
            .values()
            .any(|g| g.is_pending() && g.references_agent(agent_id))
    }
}
