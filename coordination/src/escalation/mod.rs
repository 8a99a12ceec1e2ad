//! Escalation gates: human checkpoints for stalled work
//!
//! ```text
//!                 LoopDetector should_gate
//!                 Recovery ambiguity          ┌──────────┐
//!   none ───────  manual escalation ────────▶ │ pending  │  agents paused
//!                                             └────┬─────┘
//!                          approve(feedback)       │      reject(reason)
//!                 ┌────────────────────────────────┴──────────────────┐
//!                 ▼                                                   ▼
//!           ┌──────────┐  loop counter reset                   ┌──────────┐
//!           │ approved │  agents resumed                       │ rejected │  task withdrawn
//!           └──────────┘                                       └──────────┘  replan requested
//! ```
//!
//! Gates wait indefinitely. Nothing in the core approves a gate on its own.

pub mod gate;
pub mod manager;
pub mod replan;

pub use gate::{
    EscalationRequest, Gate, GateError, GateId, GateStatus, GateTrigger, RECOVERY_AMBIGUOUS,
};
pub use manager::{GateManager, GATE_REJECTED};
pub use replan::{PlanningSink, ReplanQueue, ReplanRequest};
