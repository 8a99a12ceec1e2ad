//! Message router (the hub)
//!
//! The only path between agents. Both ends of every message are validated
//! against the registry before anything is delivered; there is no API for
//! one agent to reach another's inbox directly. An agent paused by a gate
//! cannot send or consult until the gate is resolved.
//!
//! ```text
//! agent ──route()──▶ Router ──validate──▶ Registry
//!                      │
//!                      └──deliver──▶ inbox[recipient] (ordered)
//! ```
//!
//! For consultations the router, not the caller, picks which concrete agent
//! of the requested type answers. A caller's suggestion is passed to the
//! oracle as a hint and nothing more.

pub mod inbox;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{CoordinationEvent, SharedEventBus};
use crate::oracle::{CandidateSummary, OracleRequest, SharedOracle};
use crate::registry::{Agent, AgentId, AgentStatus, AgentType, SharedRegistry};
pub use inbox::{Envelope, Inbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Consultation,
    Notification,
    Handoff,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Consultation => write!(f, "consultation"),
            Self::Notification => write!(f, "notification"),
            Self::Handoff => write!(f, "handoff"),
        }
    }
}

/// Routing errors. Rejected messages are never partially delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Unknown sender: {0}")]
    UnknownSender(AgentId),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(AgentId),

    #[error("Sender {0} is paused")]
    SenderPaused(AgentId),

    #[error("No {0} agent available")]
    NoAgentAvailable(AgentType),
}

/// How the consultant was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    OnlyCandidate,
    Oracle,
    /// Oracle unavailable or named a non-candidate
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultantSelection {
    pub agent: Agent,
    pub source: SelectionSource,
}

type SharedInbox = Arc<Mutex<Inbox>>;

pub struct MessageRouter {
    registry: SharedRegistry,
    inboxes: RwLock<HashMap<AgentId, SharedInbox>>,
    oracle: SharedOracle,
    events: SharedEventBus,
}

impl MessageRouter {
    pub fn new(registry: SharedRegistry, oracle: SharedOracle, events: SharedEventBus) -> Self {
        Self {
            registry,
            inboxes: RwLock::new(HashMap::new()),
            oracle,
            events,
        }
    }

    fn inbox(&self, agent_id: &str) -> SharedInbox {
        if let Some(inbox) = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
        {
            return inbox.clone();
        }
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    fn check_sender(&self, sender: &str) -> Result<(), RouteError> {
        match self.registry.agent(sender) {
            None => Err(RouteError::UnknownSender(sender.to_string())),
            Some(agent) if agent.status == AgentStatus::Paused => {
                Err(RouteError::SenderPaused(sender.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Deliver a message from one registered agent to another
    pub fn route(
        &self,
        sender: &str,
        recipient: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Result<Envelope, RouteError> {
        if let Err(e) = self.check_sender(sender) {
            warn!(sender, recipient, error = %e, "Rejected message");
            return Err(e);
        }
        if !self.registry.contains_agent(recipient) {
            warn!(sender, recipient, "Rejected message to unknown recipient");
            return Err(RouteError::UnknownRecipient(recipient.to_string()));
        }

        let envelope = {
            let inbox = self.inbox(recipient);
            let mut inbox = inbox.lock().unwrap_or_else(PoisonError::into_inner);
            inbox.deliver(sender, recipient, message_type, payload)
        };

        debug!(
            message_id = %envelope.id,
            sender,
            recipient,
            message_type = %message_type,
            sequence = envelope.sequence,
            "Message routed"
        );
        self.events.publish(CoordinationEvent::MessageRouted {
            message_id: envelope.id.clone(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            message_type,
            timestamp: Utc::now(),
        });
        Ok(envelope)
    }

    /// Take every message waiting for an agent
    pub fn drain_inbox(&self, agent_id: &str) -> Vec<Envelope> {
        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned();
        match inbox {
            Some(inbox) => inbox.lock().unwrap_or_else(PoisonError::into_inner).drain(),
            None => Vec::new(),
        }
    }

    pub fn inbox_len(&self, agent_id: &str) -> usize {
        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned();
        inbox.map_or(0, |i| i.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    /// Discard an agent's inbox (on unregistration)
    pub fn drop_inbox(&self, agent_id: &str) -> usize {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
            .map_or(0, |i| i.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    /// Choose the agent of `target_type` that answers a consultation
    ///
    /// Paused and stopped agents are never chosen, nor is the requester, and a
    /// paused requester is refused outright. With several candidates the
    /// oracle decides; if its answer is unusable the choice falls back to idle
    /// agents first, then lowest id.
    pub async fn select_consultant(
        &self,
        requesting_agent: &str,
        target_type: AgentType,
        question: &str,
        context: &Value,
        suggested: Option<&str>,
    ) -> Result<ConsultantSelection, RouteError> {
        self.check_sender(requesting_agent)?;

        let mut candidates: Vec<Agent> = self
            .registry
            .candidates_of_type(target_type)
            .into_iter()
            .filter(|a| a.id != requesting_agent)
            .filter(|a| matches!(a.status, AgentStatus::Idle | AgentStatus::Active))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        match candidates.len() {
            0 => return Err(RouteError::NoAgentAvailable(target_type)),
            1 => {
                let agent = candidates.remove(0);
                return Ok(ConsultantSelection {
                    agent,
                    source: SelectionSource::OnlyCandidate,
                });
            }
            _ => {}
        }

        let request = OracleRequest::AgentSelection {
            requesting_agent: requesting_agent.to_string(),
            target_type: target_type.to_string(),
            question: question.to_string(),
            context: context.clone(),
            candidates: candidates
                .iter()
                .map(|a| CandidateSummary {
                    agent_id: a.id.clone(),
                    status: a.status.to_string(),
                    current_task_id: a.current_task_id.clone(),
                })
                .collect(),
            suggested: suggested.map(str::to_string),
        };

        let chosen = match self.oracle.infer(&request).await {
            Ok(reply) => {
                info!(requesting_agent, decision = %reply, "Consultant oracle decision");
                self.events.publish(CoordinationEvent::OracleConsulted {
                    kind: request.kind().to_string(),
                    task_id: None,
                    decision: reply.clone(),
                    timestamp: Utc::now(),
                });
                reply
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .and_then(|id| candidates.iter().position(|a| a.id == id))
            }
            Err(e) => {
                warn!(requesting_agent, error = %e, "Consultant oracle unavailable");
                None
            }
        };

        let selection = match chosen {
            Some(index) => ConsultantSelection {
                agent: candidates.swap_remove(index),
                source: SelectionSource::Oracle,
            },
            None => {
                let index = candidates.iter().position(Agent::is_idle).unwrap_or(0);
                ConsultantSelection {
                    agent: candidates.swap_remove(index),
                    source: SelectionSource::Fallback,
                }
            }
        };

        debug!(
            requesting_agent,
            consultant = %selection.agent.id,
            source = ?selection.source,
            "Consultant selected"
        );
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::oracle::ScriptedOracle;
    use crate::registry::AgentRegistry;
    use serde_json::json;

    fn setup(oracle: Arc<ScriptedOracle>) -> (SharedRegistry, MessageRouter) {
        let events = EventBus::new().shared();
        let registry = AgentRegistry::new(events.clone()).shared();
        let router = MessageRouter::new(registry.clone(), oracle, events);
        (registry, router)
    }

    #[test]
    fn test_route_validates_both_ends() {
        let (registry, router) = setup(Arc::new(ScriptedOracle::unavailable()));
        registry.register(Agent::new("agent-1", AgentType::Coder)).unwrap();

        assert_eq!(
            router.route("agent-404", "agent-1", MessageType::Request, json!({})),
            Err(RouteError::UnknownSender("agent-404".to_string()))
        );
        assert_eq!(
            router.route("agent-1", "agent-404", MessageType::Request, json!({})),
            Err(RouteError::UnknownRecipient("agent-404".to_string()))
        );
        assert_eq!(router.inbox_len("agent-1"), 0);
        assert_eq!(router.inbox_len("agent-404"), 0);
    }

    #[tokio::test]
    async fn test_paused_sender_is_refused() {
        let oracle = Arc::new(ScriptedOracle::unavailable());
        let (registry, router) = setup(oracle.clone());
        registry.register(Agent::new("coder-1", AgentType::Coder)).unwrap();
        registry.register(Agent::new("arch-1", AgentType::Architect)).unwrap();
        registry.pause_agents(&["coder-1".to_string()]);

        assert_eq!(
            router.route("coder-1", "arch-1", MessageType::Request, json!({})),
            Err(RouteError::SenderPaused("coder-1".to_string()))
        );
        let err = router
            .select_consultant("coder-1", AgentType::Architect, "which layer?", &json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::SenderPaused("coder-1".to_string()));
        assert_eq!(router.inbox_len("arch-1"), 0);

        assert_eq!(
            router
                .route("arch-1", "coder-1", MessageType::Notification, json!({}))
                .unwrap()
                .recipient,
            "coder-1"
        );

        registry.resume_agents(&["coder-1".to_string()]);
        assert!(router
            .route("coder-1", "arch-1", MessageType::Request, json!({}))
            .is_ok());
    }

    #[test]
    fn test_per_sender_order_is_preserved() {
        let (registry, router) = setup(Arc::new(ScriptedOracle::unavailable()));
        registry.register(Agent::new("a", AgentType::Coder)).unwrap();
        registry.register(Agent::new("b", AgentType::Tester)).unwrap();

        for n in 0..5 {
            router
                .route("a", "b", MessageType::Notification, json!({ "n": n }))
                .unwrap();
        }
        let drained = router.drain_inbox("b");
        let order: Vec<i64> = drained
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(router.inbox_len("b"), 0);
    }

    #[tokio::test]
    async fn test_single_candidate_skips_oracle() {
        let oracle = Arc::new(ScriptedOracle::unavailable());
        let (registry, router) = setup(oracle.clone());
        registry.register(Agent::new("coder-1", AgentType::Coder)).unwrap();
        registry.register(Agent::new("arch-1", AgentType::Architect)).unwrap();

        let selection = router
            .select_consultant("coder-1", AgentType::Architect, "q", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(selection.agent.id, "arch-1");
        assert_eq!(selection.source, SelectionSource::OnlyCandidate);
        assert_eq!(oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_oracle_overrides_suggestion() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_response(json!({"agent_id": "arch-2", "reasoning": "owns the module"}));
        let (registry, router) = setup(oracle);
        registry.register(Agent::new("coder-1", AgentType::Coder)).unwrap();
        registry.register(Agent::new("arch-1", AgentType::Architect)).unwrap();
        registry.register(Agent::new("arch-2", AgentType::Architect)).unwrap();

        let selection = router
            .select_consultant("coder-1", AgentType::Architect, "q", &json!({}), Some("arch-1"))
            .await
            .unwrap();
        assert_eq!(selection.agent.id, "arch-2");
        assert_eq!(selection.source, SelectionSource::Oracle);
    }

    #[tokio::test]
    async fn test_invalid_oracle_choice_falls_back() {
        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_response(json!({"agent_id": "arch-999"}));
        let (registry, router) = setup(oracle);
        registry.register(Agent::new("coder-1", AgentType::Coder)).unwrap();
        registry.register(Agent::new("arch-1", AgentType::Architect)).unwrap();
        registry.register(Agent::new("arch-2", AgentType::Architect)).unwrap();
        registry.pause_agents(&["arch-1".to_string()]);
        registry.register(Agent::new("arch-3", AgentType::Architect)).unwrap();

        let selection = router
            .select_consultant("coder-1", AgentType::Architect, "q", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(selection.agent.id, "arch-2");
        assert_eq!(selection.source, SelectionSource::Fallback);
    }

    #[tokio::test]
    async fn test_no_candidate() {
        let (registry, router) = setup(Arc::new(ScriptedOracle::unavailable()));
        registry.register(Agent::new("coder-1", AgentType::Coder)).unwrap();
        let err = router
            .select_consultant("coder-1", AgentType::Reviewer, "q", &json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::NoAgentAvailable(AgentType::Reviewer));
    }
}
