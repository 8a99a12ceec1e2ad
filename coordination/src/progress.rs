//! Progress evaluation
//!
//! Decides whether the latest attempt at a task moved toward its goal, stood
//! still, or went backwards. Rules are applied in priority order:
//!
//! 1. External failures (timeouts, network, dependency outages) are not held
//!    against the agent unless the identical error has now occurred three times.
//! 2. Test metrics, when present, decide on their own.
//! 3. Completion markers (files, dependencies, a non-trivial diff) count as
//!    progress unless they contradict the goal.
//! 4. Otherwise the reasoning oracle is asked. Its answer is authoritative and
//!    logged. An unreachable oracle or an unusable reply means no progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::{CoordinationEvent, SharedEventBus};
use crate::loop_detector::LOOP_THRESHOLD;
use crate::oracle::{AttemptSummary, OracleRequest, SharedOracle};
use crate::registry::AgentId;
use crate::signature::FailureSignature;
use crate::similarity::{SimilarityScorer, FAILURE_SIMILARITY_THRESHOLD};

/// Diff size at which a change counts as non-trivial
pub const NON_TRIVIAL_DIFF_LINES: u32 = 20;

/// Test results for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    pub passed: u32,
    pub failed: u32,
    /// Line coverage in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

impl TestMetrics {
    pub fn new(passed: u32, failed: u32) -> Self {
        Self {
            passed,
            failed,
            coverage: None,
        }
    }

    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Fraction of tests passing, 0 when nothing ran
    pub fn pass_rate(&self) -> f64 {
        let total = self.passed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.passed as f64 / total as f64
        }
    }
}

/// Concrete artifacts an attempt produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarkers {
    pub files_created: u32,
    pub dependencies_added: u32,
    pub diff_lines: u32,
    /// Set when the artifacts work against the stated goal
    #[serde(default)]
    pub contradicts_goal: bool,
}

impl CompletionMarkers {
    pub fn is_substantive(&self) -> bool {
        self.files_created > 0
            || self.dependencies_added > 0
            || self.diff_lines >= NON_TRIVIAL_DIFF_LINES
    }
}

/// What an attempt achieved, as far as the agent could measure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_metrics: Option<TestMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<CompletionMarkers>,
    /// Free-form note from the agent, passed to the oracle verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ProgressSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: TestMetrics) -> Self {
        Self {
            test_metrics: Some(metrics),
            ..Self::default()
        }
    }

    pub fn with_markers(markers: CompletionMarkers) -> Self {
        Self {
            markers: Some(markers),
            ..Self::default()
        }
    }

    pub fn has_test_metrics(&self) -> bool {
        self.test_metrics.is_some()
    }
}

/// One execution cycle of a task. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub agent_id: AgentId,
    /// `None` when the attempt succeeded
    pub failure_signature: Option<FailureSignature>,
    pub progress_snapshot: ProgressSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl Attempt {
    pub fn new(
        agent_id: impl Into<AgentId>,
        failure_signature: Option<FailureSignature>,
        progress_snapshot: ProgressSnapshot,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            failure_signature,
            progress_snapshot,
            timestamp: Utc::now(),
        }
    }

    fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            agent_id: self.agent_id.clone(),
            error_type: self
                .failure_signature
                .as_ref()
                .map(|s| s.error_type.as_str().to_string()),
            error_message: self
                .failure_signature
                .as_ref()
                .map(|s| s.exact_message.clone()),
            progress: serde_json::to_value(&self.progress_snapshot)
                .unwrap_or(serde_json::Value::Null),
            timestamp: self.timestamp.to_rfc3339(),
        }
    }
}

/// Which rule produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    ExternalError,
    TestMetrics,
    CompletionMarkers,
    Oracle,
    /// Oracle unreachable or reply unusable
    OracleFallback,
}

/// Result of evaluating one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressVerdict {
    pub is_regressive: bool,
    pub no_progress: bool,
    pub reasoning: String,
    pub source: VerdictSource,
}

impl ProgressVerdict {
    fn progress(source: VerdictSource, reasoning: impl Into<String>) -> Self {
        Self {
            is_regressive: false,
            no_progress: false,
            reasoning: reasoning.into(),
            source,
        }
    }

    fn stalled(source: VerdictSource, reasoning: impl Into<String>) -> Self {
        Self {
            is_regressive: false,
            no_progress: true,
            reasoning: reasoning.into(),
            source,
        }
    }

    fn regressed(source: VerdictSource, reasoning: impl Into<String>) -> Self {
        Self {
            is_regressive: true,
            no_progress: true,
            reasoning: reasoning.into(),
            source,
        }
    }

    /// Whether the loop counter should advance
    pub fn counts_as_loop(&self) -> bool {
        self.is_regressive || self.no_progress
    }
}

#[derive(Debug, Deserialize)]
struct OracleProgressReply {
    is_regressive: bool,
    no_progress: bool,
    #[serde(default)]
    reasoning: String,
}

/// Judges attempts against a goal
pub struct ProgressEvaluator {
    oracle: SharedOracle,
    scorer: Arc<dyn SimilarityScorer>,
    failure_similarity_threshold: f64,
    events: Option<SharedEventBus>,
}

impl ProgressEvaluator {
    pub fn new(oracle: SharedOracle, scorer: Arc<dyn SimilarityScorer>) -> Self {
        Self {
            oracle,
            scorer,
            failure_similarity_threshold: FAILURE_SIMILARITY_THRESHOLD,
            events: None,
        }
    }

    pub fn with_failure_similarity_threshold(mut self, threshold: f64) -> Self {
        self.failure_similarity_threshold = threshold;
        self
    }

    /// Publish oracle decisions on this bus
    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Evaluate `current` against the prior attempts of the same task
    ///
    /// `history` is oldest first and does not include `current`.
    pub async fn evaluate(
        &self,
        task_id: &str,
        goal: &str,
        history: &[Attempt],
        current: &Attempt,
    ) -> ProgressVerdict {
        if let Some(verdict) = external_error_rule(history, current) {
            debug!(task_id, reasoning = %verdict.reasoning, "External error rule applied");
            return verdict;
        }

        if let Some(metrics) = current.progress_snapshot.test_metrics {
            return metrics_rule(history, metrics);
        }

        if let Some(markers) = current.progress_snapshot.markers {
            if markers.is_substantive() && !markers.contradicts_goal {
                return ProgressVerdict::progress(
                    VerdictSource::CompletionMarkers,
                    format!(
                        "produced {} files, {} dependencies, {} diff lines",
                        markers.files_created, markers.dependencies_added, markers.diff_lines
                    ),
                );
            }
        }

        self.ask_oracle(task_id, goal, history, current).await
    }

    async fn ask_oracle(
        &self,
        task_id: &str,
        goal: &str,
        history: &[Attempt],
        current: &Attempt,
    ) -> ProgressVerdict {
        let closest = current.failure_signature.as_ref().and_then(|sig| {
            history
                .iter()
                .filter_map(|a| a.failure_signature.as_ref())
                .map(|prior| sig.similarity(prior, self.scorer.as_ref()))
                .reduce(f64::max)
        });

        let request = OracleRequest::ProgressEvaluation {
            goal: goal.to_string(),
            attempt_history: history.iter().map(Attempt::summary).collect(),
            current_attempt: current.summary(),
            closest_prior_similarity: closest,
            near_duplicate: closest.is_some_and(|s| s > self.failure_similarity_threshold),
        };

        let reply = match self.oracle.infer(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(task_id, error = %e, "Progress oracle unavailable, assuming no progress");
                return ProgressVerdict::stalled(
                    VerdictSource::OracleFallback,
                    format!("oracle unavailable: {}", e),
                );
            }
        };

        info!(task_id, decision = %reply, "Progress oracle decision");
        if let Some(events) = &self.events {
            events.publish(CoordinationEvent::OracleConsulted {
                kind: request.kind().to_string(),
                task_id: Some(task_id.to_string()),
                decision: reply.clone(),
                timestamp: Utc::now(),
            });
        }

        match serde_json::from_value::<OracleProgressReply>(reply) {
            Ok(parsed) => ProgressVerdict {
                is_regressive: parsed.is_regressive,
                no_progress: parsed.no_progress || parsed.is_regressive,
                reasoning: parsed.reasoning,
                source: VerdictSource::Oracle,
            },
            Err(e) => {
                warn!(task_id, error = %e, "Unusable progress oracle reply, assuming no progress");
                ProgressVerdict::stalled(
                    VerdictSource::OracleFallback,
                    format!("unusable oracle reply: {}", e),
                )
            }
        }
    }
}

/// External failures only count once the identical error has recurred
/// `LOOP_THRESHOLD` times, current attempt included
fn external_error_rule(history: &[Attempt], current: &Attempt) -> Option<ProgressVerdict> {
    let signature = current.failure_signature.as_ref()?;
    if !signature.error_type.is_external() {
        return None;
    }

    let occurrences = 1 + history
        .iter()
        .filter_map(|a| a.failure_signature.as_ref())
        .filter(|prior| prior.matches_exactly(signature))
        .count();

    if occurrences as u32 >= LOOP_THRESHOLD {
        Some(ProgressVerdict::stalled(
            VerdictSource::ExternalError,
            format!(
                "{} error recurred identically {} times",
                signature.error_type, occurrences
            ),
        ))
    } else {
        Some(ProgressVerdict::progress(
            VerdictSource::ExternalError,
            format!(
                "{} error is outside the agent's control, not penalized",
                signature.error_type
            ),
        ))
    }
}

fn metrics_rule(history: &[Attempt], current: TestMetrics) -> ProgressVerdict {
    let mut prior_metrics = history
        .iter()
        .rev()
        .filter_map(|a| a.progress_snapshot.test_metrics);

    let Some(previous) = prior_metrics.next() else {
        return ProgressVerdict::progress(
            VerdictSource::TestMetrics,
            format!(
                "baseline: {} passed, {} failed",
                current.passed, current.failed
            ),
        );
    };

    let coverage_increased = matches!(
        (previous.coverage, current.coverage),
        (Some(before), Some(after)) if after > before
    );
    let failures_decreased = current.failed < previous.failed;

    if coverage_increased || failures_decreased {
        return ProgressVerdict::progress(
            VerdictSource::TestMetrics,
            format!(
                "failures {} -> {}, coverage {:?} -> {:?}",
                previous.failed, current.failed, previous.coverage, current.coverage
            ),
        );
    }

    let rising_twice = current.failed > previous.failed
        && prior_metrics
            .next()
            .is_some_and(|earlier| previous.failed > earlier.failed);

    if rising_twice {
        ProgressVerdict::regressed(
            VerdictSource::TestMetrics,
            format!(
                "failure count rose on consecutive attempts, now {}",
                current.failed
            ),
        )
    } else {
        ProgressVerdict::stalled(
            VerdictSource::TestMetrics,
            format!(
                "no improvement: failures {} -> {}",
                previous.failed, current.failed
            ),
        )
    }
}
