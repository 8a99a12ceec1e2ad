//! Umbrella error for the coordinator facade

use thiserror::Error;

use crate::config::ConfigError;
use crate::escalation::GateError;
use crate::oracle::OracleError;
use crate::registry::RegistryError;
use crate::router::RouteError;
use crate::state::StoreError;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Task {task_id} is waiting on gate {gate_id}")]
    TaskGated { task_id: String, gate_id: String },
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;
