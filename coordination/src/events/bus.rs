//! Event bus for coordination transitions
//!
//! Tokio broadcast pub/sub plus a bounded in-memory history. Publishing never
//! fails the operation that produced the event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::CoordinationEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Number of events retained for status snapshots
const HISTORY_CAPACITY: usize = 512;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channel and bounded history
pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
    history: Mutex<VecDeque<CoordinationEvent>>,
    history_capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the default history size
    pub fn new() -> Self {
        Self::with_history_capacity(HISTORY_CAPACITY)
    }

    /// Create a new event bus keeping at most `capacity` events
    pub fn with_history_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY))),
            history_capacity: capacity.max(1),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to history and all subscribers
    pub fn publish(&self, event: CoordinationEvent) {
        let event_type = event.event_type();

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No receivers is fine, history still has it
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Most recent `n` events, oldest first
    pub fn recent(&self, n: usize) -> Vec<CoordinationEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// All retained events scoped to one task, oldest first
    pub fn history_for_task(&self, task_id: &str) -> Vec<CoordinationEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .filter(|e| e.task_id() == Some(task_id))
            .cloned()
            .collect()
    }

    /// Retained events of one type, oldest first
    pub fn events_of_type(&self, event_type: &str) -> Vec<CoordinationEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
