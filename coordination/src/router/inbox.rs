//! Per-recipient inbox
//!
//! Messages are appended under the inbox lock, so delivery order within one
//! sender -> recipient stream matches the order `route` was called.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use super::MessageType;
use crate::registry::AgentId;

/// A routed message as it sits in an inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub sender: AgentId,
    pub recipient: AgentId,
    pub message_type: MessageType,
    pub payload: Value,
    /// Position in the recipient's inbox, starting at 1
    pub sequence: u64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Inbox {
    messages: VecDeque<Envelope>,
    delivered: u64,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, stamping its sequence number
    pub fn deliver(
        &mut self,
        sender: &str,
        recipient: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Envelope {
        self.delivered += 1;
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            message_type,
            payload,
            sequence: self.delivered,
            sent_at: Utc::now(),
        };
        self.messages.push_back(envelope.clone());
        envelope
    }

    /// Take every waiting message, oldest first
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.messages.drain(..).collect()
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.messages.front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total messages ever delivered here
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_and_drain_order() {
        let mut inbox = Inbox::new();
        inbox.deliver("a", "b", MessageType::Request, json!({"n": 1}));
        inbox.deliver("a", "b", MessageType::Request, json!({"n": 2}));

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.peek().unwrap().sequence, 1);

        let drained = inbox.drain();
        assert_eq!(drained[0].payload["n"], 1);
        assert_eq!(drained[1].payload["n"], 2);
        assert!(inbox.is_empty());
        assert_eq!(inbox.delivered(), 2);
    }
}
