//! Coordination core for a multi-agent coding swarm
//!
//! Every unit of work, every inter-agent question, every failure and every
//! crash-recovery decision passes through this crate:
//!
//! - [`registry`]: agents, tasks and the priority queue behind one lock, so a
//!   task is never held by two agents
//! - [`router`]: the only path between agents, plus consultant selection
//! - [`loop_detector`]: exact, semantic and progress-based repetition checks
//!   over task retries and consultations
//! - [`escalation`]: human gates that pause agents until someone decides
//! - [`recovery`]: startup reconciliation of durable state with the workspace
//! - [`coordinator`]: the facade the orchestration layer calls
//!
//! The reasoning oracle is an injected [`oracle::ReasoningOracle`]; tests use
//! [`oracle::ScriptedOracle`].
//!
//! # Usage
//!
//! ```ignore
//! use coordination_core::{Coordinator, CoordinatorConfig};
//! use coordination_core::registry::{AgentType, Task};
//!
//! let coordinator = Coordinator::builder(CoordinatorConfig::from_env()?).build()?;
//! coordinator.recover_all().await?;
//! coordinator.register_agent("coder-1", AgentType::Coder)?;
//! coordinator.enqueue_task(Task::new("t1", "implement", AgentType::Coder, 5))?;
//! let task = coordinator.assign_next("coder-1")?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod escalation;
pub mod events;
pub mod loop_detector;
pub mod oracle;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod signature;
pub mod similarity;
pub mod state;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{
    ConsultOutcome, Coordinator, CoordinatorBuilder, CoordinatorStatus, FailureReport, CANCELLED,
};
pub use error::{CoordinationError, CoordinationResult};
pub use escalation::{Gate, GateStatus, GateTrigger, ReplanQueue, ReplanRequest};
pub use events::{CoordinationEvent, EventBus, SharedEventBus};
pub use loop_detector::{LoopVerdict, LOOP_THRESHOLD};
pub use oracle::{HttpOracle, OracleRequest, ReasoningOracle, ScriptedOracle, SharedOracle};
pub use progress::{CompletionMarkers, ProgressSnapshot, ProgressVerdict, TestMetrics};
pub use recovery::{RecoveryAction, RecoveryOutcome};
pub use registry::{Agent, AgentStatus, AgentType, Task, TaskStatus};
pub use router::{Envelope, MessageType};
pub use signature::{ErrorType, FailureContext, FailureSignature};
pub use state::{JsonFileStateStore, MemoryStateStore, ProjectState, ProjectStatus, StateStore};
