//! Loop detector
//!
//! Task failures and agent-to-agent consultations feed one counter per task.
//! Trackers are locked per key so recording a failure for one task never
//! waits on another task's oracle call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::tracker::{AgentPair, LoopTracker};
use super::LOOP_THRESHOLD;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::progress::{Attempt, ProgressEvaluator, ProgressSnapshot};
use crate::registry::TaskId;
use crate::signature::FailureSignature;
use crate::similarity::{SimilarityScorer, COLLABORATION_SIMILARITY_THRESHOLD};

/// Default number of attempts retained per tracker
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Default inactivity window before a tracker is collected
pub const DEFAULT_IDLE_TTL_HOURS: i64 = 24;

/// What the caller knows about the attempt that just failed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptContext {
    pub goal: String,
    #[serde(default)]
    pub progress: ProgressSnapshot,
}

impl AttemptContext {
    pub fn new(goal: impl Into<String>, progress: ProgressSnapshot) -> Self {
        Self {
            goal: goal.into(),
            progress,
        }
    }
}

/// Outcome of recording a failure or consultation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopVerdict {
    pub is_loop: bool,
    pub loop_count: u32,
    pub should_gate: bool,
    pub reason: String,
}

impl LoopVerdict {
    fn new(is_loop: bool, loop_count: u32, reason: String) -> Self {
        Self {
            is_loop,
            loop_count,
            should_gate: loop_count >= LOOP_THRESHOLD,
            reason,
        }
    }
}

/// Explicit events that may clear a loop counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    TaskCompleted,
    HumanIntervention,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompleted => "task_completed",
            Self::HumanIntervention => "human_intervention",
        }
    }
}

/// Point-in-time view of one tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSummary {
    pub task_id: TaskId,
    pub loop_count: u32,
    pub attempts: usize,
    pub collaboration_pairs: usize,
    pub last_reason: Option<String>,
    pub last_activity: DateTime<Utc>,
}

type TrackerHandle = Arc<tokio::sync::Mutex<LoopTracker>>;

/// Tracks loops across all tasks
pub struct LoopDetector {
    trackers: Mutex<HashMap<TaskId, TrackerHandle>>,
    evaluator: ProgressEvaluator,
    scorer: Arc<dyn SimilarityScorer>,
    collaboration_threshold: f64,
    history_window: usize,
    idle_ttl: Duration,
    events: SharedEventBus,
}

impl LoopDetector {
    pub fn new(
        evaluator: ProgressEvaluator,
        scorer: Arc<dyn SimilarityScorer>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
            evaluator,
            scorer,
            collaboration_threshold: COLLABORATION_SIMILARITY_THRESHOLD,
            history_window: DEFAULT_HISTORY_WINDOW,
            idle_ttl: Duration::hours(DEFAULT_IDLE_TTL_HOURS),
            events,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn with_collaboration_threshold(mut self, threshold: f64) -> Self {
        self.collaboration_threshold = threshold;
        self
    }

    /// Fetch or create the tracker for a task. The map lock is released
    /// before the caller awaits the per-task lock.
    fn tracker(&self, task_id: &str) -> TrackerHandle {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        trackers
            .entry(task_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(LoopTracker::new(
                    task_id,
                    self.history_window,
                )))
            })
            .clone()
    }

    fn existing(&self, task_id: &str) -> Option<TrackerHandle> {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    /// Record a failed attempt and decide whether the task is looping
    ///
    /// An exact repeat of any retained failure message counts immediately,
    /// together with any earlier identical occurrence that had not yet been
    /// counted, so the third identical failure always reaches the threshold.
    /// An external error is only a repeat once it has occurred identically
    /// `LOOP_THRESHOLD` times. Anything else goes through the progress
    /// evaluator.
    pub async fn record_failure(
        &self,
        task_id: &str,
        agent_id: &str,
        signature: FailureSignature,
        context: &AttemptContext,
    ) -> LoopVerdict {
        let handle = self.tracker(task_id);
        let mut tracker = handle.lock().await;

        let attempt = Attempt::new(agent_id, Some(signature.clone()), context.progress.clone());

        let identical = tracker.identical_failures(&signature);
        let exact_repeat = if signature.error_type.is_external() {
            identical as u32 + 1 >= LOOP_THRESHOLD
        } else {
            identical > 0
        };

        let verdict = if exact_repeat {
            let reason = format!("identical failure repeated: {}", signature.exact_message);
            let owed = tracker.claim_identical(&signature);
            let count = tracker.increment_by(owed + 1, reason.clone());
            LoopVerdict::new(true, count, reason)
        } else {
            let history: Vec<Attempt> = tracker.attempts().cloned().collect();
            let progress = self
                .evaluator
                .evaluate(task_id, &context.goal, &history, &attempt)
                .await;

            if progress.counts_as_loop() {
                let count = tracker.increment(progress.reasoning.clone());
                LoopVerdict::new(true, count, progress.reasoning)
            } else {
                LoopVerdict::new(false, tracker.loop_count(), progress.reasoning)
            }
        };

        tracker.push_attempt(attempt, verdict.is_loop);
        drop(tracker);

        debug!(
            task_id,
            agent_id,
            is_loop = verdict.is_loop,
            loop_count = verdict.loop_count,
            "Failure recorded"
        );

        self.events.publish(CoordinationEvent::FailureRecorded {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            is_loop: verdict.is_loop,
            loop_count: verdict.loop_count,
            timestamp: Utc::now(),
        });
        self.announce_gate(task_id, &verdict);

        verdict
    }

    /// Record a consultation from `from` to `to` on a task
    ///
    /// A request more similar than the collaboration threshold to an earlier
    /// request on the same ordered pair increments the task's loop counter,
    /// the same one failures use.
    pub async fn record_collaboration(
        &self,
        task_id: &str,
        from: &str,
        to: &str,
        request_text: &str,
    ) -> LoopVerdict {
        let handle = self.tracker(task_id);
        let mut tracker = handle.lock().await;
        let pair = AgentPair::new(from, to);

        let closest = tracker
            .chain(&pair)
            .map(|prior| self.scorer.score(prior, request_text))
            .reduce(f64::max);

        let verdict = match closest {
            Some(similarity) if similarity > self.collaboration_threshold => {
                let reason = format!(
                    "consultation {} repeats an earlier request (similarity {:.2})",
                    pair, similarity
                );
                let count = tracker.increment(reason.clone());
                LoopVerdict::new(true, count, reason)
            }
            _ => LoopVerdict::new(
                false,
                tracker.loop_count(),
                format!("new consultation {}", pair),
            ),
        };

        tracker.push_request(pair, request_text.to_string());
        drop(tracker);

        debug!(
            task_id,
            from,
            to,
            is_loop = verdict.is_loop,
            loop_count = verdict.loop_count,
            "Collaboration recorded"
        );

        self.events.publish(CoordinationEvent::CollaborationRecorded {
            task_id: task_id.to_string(),
            from_agent: from.to_string(),
            to_agent: to.to_string(),
            is_loop: verdict.is_loop,
            loop_count: verdict.loop_count,
            timestamp: Utc::now(),
        });
        self.announce_gate(task_id, &verdict);

        verdict
    }

    fn announce_gate(&self, task_id: &str, verdict: &LoopVerdict) {
        if verdict.is_loop && verdict.should_gate {
            warn!(
                task_id,
                loop_count = verdict.loop_count,
                reason = %verdict.reason,
                "Loop threshold reached"
            );
            self.events.publish(CoordinationEvent::LoopDetected {
                task_id: task_id.to_string(),
                loop_count: verdict.loop_count,
                reason: verdict.reason.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Clear a task's counter and histories, returning the previous count
    pub async fn reset(&self, task_id: &str, reason: ResetReason) -> u32 {
        let Some(handle) = self.existing(task_id) else {
            return 0;
        };
        let previous = handle.lock().await.reset();

        info!(task_id, reason = reason.as_str(), previous, "Loop counter reset");
        self.events.publish(CoordinationEvent::LoopReset {
            task_id: task_id.to_string(),
            reason: reason.as_str().to_string(),
            previous_count: previous,
            timestamp: Utc::now(),
        });
        previous
    }

    pub async fn loop_count(&self, task_id: &str) -> u32 {
        match self.existing(task_id) {
            Some(handle) => handle.lock().await.loop_count(),
            None => 0,
        }
    }

    /// Retained attempts for a task, oldest first
    pub async fn attempts(&self, task_id: &str) -> Vec<Attempt> {
        match self.existing(task_id) {
            Some(handle) => handle.lock().await.attempts().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Drop a task's tracker entirely
    pub fn forget(&self, task_id: &str) -> bool {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
            .is_some()
    }

    /// Remove trackers idle longer than the TTL. Trackers in use are kept.
    pub fn collect_idle(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut collected = Vec::new();

        trackers.retain(|task_id, handle| match handle.try_lock() {
            Ok(tracker) if tracker.is_idle(now, self.idle_ttl) => {
                collected.push(task_id.clone());
                false
            }
            _ => true,
        });

        if !collected.is_empty() {
            info!(count = collected.len(), "Collected idle loop trackers");
        }
        collected
    }

    pub fn tracked_count(&self) -> usize {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Summaries of every live tracker, ordered by task id
    pub async fn snapshot(&self) -> Vec<TrackerSummary> {
        let handles: Vec<TrackerHandle> = self
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let tracker = handle.lock().await;
            summaries.push(TrackerSummary {
                task_id: tracker.task_id().to_string(),
                loop_count: tracker.loop_count(),
                attempts: tracker.attempt_count(),
                collaboration_pairs: tracker.pair_count(),
                last_reason: tracker.last_reason().map(str::to_string),
                last_activity: tracker.last_activity(),
            });
        }
        summaries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        summaries
    }
}
