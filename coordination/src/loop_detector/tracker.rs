//! Per-task loop state
//!
//! One tracker holds everything loop detection knows about a task: a bounded
//! window of recent attempts, the consultation chain for each ordered agent
//! pair, and the single shared `loop_count` both feed into.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::progress::Attempt;
use crate::registry::{AgentId, TaskId};
use crate::signature::FailureSignature;

/// Ordered (from, to) agent pair. `a -> b` and `b -> a` are distinct chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentPair {
    pub from: AgentId,
    pub to: AgentId,
}

impl AgentPair {
    pub fn new(from: impl Into<AgentId>, to: impl Into<AgentId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl std::fmt::Display for AgentPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// An attempt plus whether it has already moved the counter
#[derive(Debug, Clone)]
struct RecordedAttempt {
    attempt: Attempt,
    counted: bool,
}

impl RecordedAttempt {
    fn is_identical(&self, signature: &FailureSignature) -> bool {
        self.attempt
            .failure_signature
            .as_ref()
            .is_some_and(|prior| prior.matches_exactly(signature))
    }
}

/// Loop state for a single task
#[derive(Debug, Clone)]
pub struct LoopTracker {
    task_id: TaskId,
    loop_count: u32,
    attempts: VecDeque<RecordedAttempt>,
    collaboration_chains: HashMap<AgentPair, VecDeque<String>>,
    history_window: usize,
    last_reason: Option<String>,
    last_activity: DateTime<Utc>,
}

impl LoopTracker {
    pub fn new(task_id: impl Into<TaskId>, history_window: usize) -> Self {
        Self {
            task_id: task_id.into(),
            loop_count: 0,
            attempts: VecDeque::new(),
            collaboration_chains: HashMap::new(),
            history_window: history_window.max(1),
            last_reason: None,
            last_activity: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Recent attempts, oldest first
    pub fn attempts(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter().map(|r| &r.attempt)
    }

    /// Retained failures byte-identical to `signature`
    pub fn identical_failures(&self, signature: &FailureSignature) -> usize {
        self.attempts
            .iter()
            .filter(|r| r.is_identical(signature))
            .count()
    }

    /// Mark identical failures that never moved the counter as counted,
    /// returning how many there were
    pub(crate) fn claim_identical(&mut self, signature: &FailureSignature) -> u32 {
        let mut claimed = 0;
        for recorded in self.attempts.iter_mut() {
            if !recorded.counted && recorded.is_identical(signature) {
                recorded.counted = true;
                claimed += 1;
            }
        }
        claimed
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Prior consultation requests for one ordered pair, oldest first
    pub fn chain(&self, pair: &AgentPair) -> impl Iterator<Item = &String> {
        self.collaboration_chains.get(pair).into_iter().flatten()
    }

    pub fn pair_count(&self) -> usize {
        self.collaboration_chains.len()
    }

    pub(crate) fn push_attempt(&mut self, attempt: Attempt, counted: bool) {
        if self.attempts.len() == self.history_window {
            self.attempts.pop_front();
        }
        self.attempts.push_back(RecordedAttempt { attempt, counted });
        self.touch();
    }

    pub(crate) fn push_request(&mut self, pair: AgentPair, request: String) {
        let window = self.history_window;
        let chain = self.collaboration_chains.entry(pair).or_default();
        if chain.len() == window {
            chain.pop_front();
        }
        chain.push_back(request);
        self.touch();
    }

    /// Count one more loop. The counter never goes down except through `reset`.
    pub(crate) fn increment(&mut self, reason: impl Into<String>) -> u32 {
        self.increment_by(1, reason)
    }

    pub(crate) fn increment_by(&mut self, by: u32, reason: impl Into<String>) -> u32 {
        self.loop_count += by;
        self.last_reason = Some(reason.into());
        self.touch();
        self.loop_count
    }

    /// Clear the counter and both histories, returning the previous count
    pub(crate) fn reset(&mut self) -> u32 {
        let previous = self.loop_count;
        self.loop_count = 0;
        self.attempts.clear();
        self.collaboration_chains.clear();
        self.last_reason = None;
        self.touch();
        previous
    }

    pub fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_activity > ttl
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
