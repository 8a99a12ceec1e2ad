//! Durable state for crash recovery
//!
//! The coordinator writes a [`ProjectState`] on every assignment, completion
//! and gate transition, and a task snapshot whenever a task changes hands,
//! before returning to the caller. At startup the recovery coordinator reads
//! the active projects back.
//!
//! # Usage
//!
//! ```ignore
//! use coordination_core::state::{JsonFileStateStore, ProjectState, StateStore};
//!
//! let store = JsonFileStateStore::open("./coordinator-state")?;
//! store.upsert_project_state(&ProjectState::new("proj-1", "ship the login flow"))?;
//! let active = store.get_active_project_states()?;
//! ```

pub mod store;
pub mod types;

pub use store::{
    JsonFileStateStore, MemoryStateStore, SharedStateStore, StateStore, StoreError, StoreResult,
};
pub use types::{ProjectId, ProjectState, ProjectStatus, StateDocument};
