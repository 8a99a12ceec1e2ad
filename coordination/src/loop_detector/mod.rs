//! Loop detection for task retries and agent consultations
//!
//! Failures and repeated consultations on a task share one counter. When the
//! counter reaches [`LOOP_THRESHOLD`] the caller is told to open a gate. The
//! counter only moves down through an explicit reset (task success or a human
//! approving a gate); handing the task to another agent does not clear it.

pub mod detector;
pub mod tracker;

pub use detector::{
    AttemptContext, LoopDetector, LoopVerdict, ResetReason, TrackerSummary,
    DEFAULT_HISTORY_WINDOW, DEFAULT_IDLE_TTL_HOURS,
};
pub use tracker::{AgentPair, LoopTracker};

/// Loop count at which a gate is opened. Applies to every agent type and
/// consultation path alike.
pub const LOOP_THRESHOLD: u32 = 3;
