//! Durable state stores
//!
//! Two implementations of [`StateStore`]: an in-memory store for tests and
//! embedding, and a JSON file store that rewrites one document atomically
//! (temp file + rename) on every upsert, so a crash never leaves a torn file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::types::{ProjectState, ProjectStatus, StateDocument};
use crate::escalation::Gate;
use crate::registry::Task;

/// File name of the state document inside the state directory
pub const STATE_FILE_NAME: &str = "coordination-state.json";

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a StateStore
pub type SharedStateStore = Arc<dyn StateStore>;

/// What the coordinator persists and reads back at startup
pub trait StateStore: Send + Sync {
    fn upsert_project_state(&self, state: &ProjectState) -> StoreResult<()>;

    fn get_project_state(&self, project_id: &str) -> StoreResult<Option<ProjectState>>;

    fn list_project_states(&self) -> StoreResult<Vec<ProjectState>>;

    /// Projects recovery must act on
    fn get_active_project_states(&self) -> StoreResult<Vec<ProjectState>> {
        Ok(self
            .list_project_states()?
            .into_iter()
            .filter(|p| p.status == ProjectStatus::Active)
            .collect())
    }

    /// Read-modify-write of one project. Returns `None` if it is unknown.
    fn update_project_state(
        &self,
        project_id: &str,
        change: &mut dyn FnMut(&mut ProjectState),
    ) -> StoreResult<Option<ProjectState>> {
        let Some(mut state) = self.get_project_state(project_id)? else {
            return Ok(None);
        };
        change(&mut state);
        state.updated_at = chrono::Utc::now();
        self.upsert_project_state(&state)?;
        Ok(Some(state))
    }

    fn upsert_task(&self, task: &Task) -> StoreResult<()>;

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;

    /// Every task recorded for a project, oldest first
    fn tasks_for_project(&self, project_id: &str) -> StoreResult<Vec<Task>>;

    fn upsert_gate(&self, gate: &Gate) -> StoreResult<()>;

    fn list_gates(&self) -> StoreResult<Vec<Gate>>;

    /// Gates still waiting on a human, oldest first
    fn pending_gates(&self) -> StoreResult<Vec<Gate>> {
        let mut pending: Vec<Gate> = self
            .list_gates()?
            .into_iter()
            .filter(Gate::is_pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }
}

fn project_tasks(doc: &StateDocument, project_id: &str) -> Vec<Task> {
    let mut tasks: Vec<Task> = doc
        .tasks
        .values()
        .filter(|t| t.project_id.as_deref() == Some(project_id))
        .cloned()
        .collect();
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    tasks
}

/// Volatile store
#[derive(Default)]
pub struct MemoryStateStore {
    doc: RwLock<StateDocument>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Make every call fail, as if the storage engine went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, StateDocument>> {
        self.check()?;
        Ok(self.doc.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, StateDocument>> {
        self.check()?;
        Ok(self.doc.write().unwrap_or_else(PoisonError::into_inner))
    }
}

impl StateStore for MemoryStateStore {
    fn upsert_project_state(&self, state: &ProjectState) -> StoreResult<()> {
        self.write()?
            .projects
            .insert(state.project_id.clone(), state.clone());
        Ok(())
    }

    fn get_project_state(&self, project_id: &str) -> StoreResult<Option<ProjectState>> {
        Ok(self.read()?.projects.get(project_id).cloned())
    }

    fn list_project_states(&self) -> StoreResult<Vec<ProjectState>> {
        Ok(self.read()?.projects.values().cloned().collect())
    }

    fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        self.write()?.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self.read()?.tasks.get(task_id).cloned())
    }

    fn tasks_for_project(&self, project_id: &str) -> StoreResult<Vec<Task>> {
        Ok(project_tasks(&*self.read()?, project_id))
    }

    fn upsert_gate(&self, gate: &Gate) -> StoreResult<()> {
        self.write()?.gates.insert(gate.id.clone(), gate.clone());
        Ok(())
    }

    fn list_gates(&self) -> StoreResult<Vec<Gate>> {
        Ok(self.read()?.gates.values().cloned().collect())
    }
}

/// Store backed by a single JSON document in a state directory
pub struct JsonFileStateStore {
    path: PathBuf,
    doc: RwLock<StateDocument>,
}

impl JsonFileStateStore {
    /// Open or create a store in `dir`
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE_NAME);

        let doc = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?
        } else {
            StateDocument::default()
        };

        debug!(
            path = %path.display(),
            projects = doc.projects.len(),
            tasks = doc.tasks.len(),
            gates = doc.gates.len(),
            "State store opened"
        );

        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy, persist the copy, then commit it in memory
    fn update(&self, change: impl FnOnce(&mut StateDocument)) -> StoreResult<()> {
        let mut doc = self.doc.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = doc.clone();
        change(&mut next);
        self.persist(&next)?;
        *doc = next;
        Ok(())
    }

    fn persist(&self, doc: &StateDocument) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, StateDocument> {
        self.doc.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for JsonFileStateStore {
    fn upsert_project_state(&self, state: &ProjectState) -> StoreResult<()> {
        self.update(|doc| {
            doc.projects
                .insert(state.project_id.clone(), state.clone());
        })
    }

    fn get_project_state(&self, project_id: &str) -> StoreResult<Option<ProjectState>> {
        Ok(self.read().projects.get(project_id).cloned())
    }

    fn list_project_states(&self) -> StoreResult<Vec<ProjectState>> {
        Ok(self.read().projects.values().cloned().collect())
    }

    fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        self.update(|doc| {
            doc.tasks.insert(task.id.clone(), task.clone());
        })
    }

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self.read().tasks.get(task_id).cloned())
    }

    fn tasks_for_project(&self, project_id: &str) -> StoreResult<Vec<Task>> {
        Ok(project_tasks(&*self.read(), project_id))
    }

    fn upsert_gate(&self, gate: &Gate) -> StoreResult<()> {
        self.update(|doc| {
            doc.gates.insert(gate.id.clone(), gate.clone());
        })
    }

    fn list_gates(&self) -> StoreResult<Vec<Gate>> {
        Ok(self.read().gates.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{EscalationRequest, GateStatus, GateTrigger};
    use crate::registry::AgentType;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_active_filter() {
        let store = MemoryStateStore::new();
        let active = ProjectState::new("p1", "build api");
        let mut done = ProjectState::new("p2", "write docs");
        done.status = ProjectStatus::Completed;

        store.upsert_project_state(&active).unwrap();
        store.upsert_project_state(&done).unwrap();

        let found = store.get_active_project_states().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].project_id, "p1");
    }

    #[test]
    fn test_memory_store_tasks_for_project() {
        let store = MemoryStateStore::new();
        store
            .upsert_task(&Task::new("t1", "implement", AgentType::Coder, 1).with_project("p1"))
            .unwrap();
        store
            .upsert_task(&Task::new("t2", "implement", AgentType::Coder, 1).with_project("p2"))
            .unwrap();

        let tasks = store.tasks_for_project("p1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");
    }

    #[test]
    fn test_memory_store_unavailable() {
        let store = MemoryStateStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.upsert_project_state(&ProjectState::new("p1", "g")),
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.list_project_states().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonFileStateStore::open(dir.path()).unwrap();
            let mut state = ProjectState::new("p1", "build api");
            state.record("task assigned", Some("t1"), Some("coder-1"));
            store.upsert_project_state(&state).unwrap();
            store
                .upsert_task(&Task::new("t1", "implement", AgentType::Coder, 1).with_project("p1"))
                .unwrap();
        }

        let store = JsonFileStateStore::open(dir.path()).unwrap();
        let state = store.get_project_state("p1").unwrap().unwrap();
        assert_eq!(state.current_task_id.as_deref(), Some("t1"));
        assert_eq!(state.last_action, "task assigned");
        assert_eq!(store.tasks_for_project("p1").unwrap().len(), 1);
        assert!(store.get_task("missing").unwrap().is_none());
        assert!(!dir.path().join("coordination-state.json.tmp").exists());
    }

    #[test]
    fn test_json_store_keeps_gates_across_reopen() {
        let dir = TempDir::new().unwrap();
        let pending = Gate::open(
            EscalationRequest::new(GateTrigger::RecoveryAmbiguous, "recovery_ambiguous")
                .for_task("t1")
                .for_project(Some("p1".to_string())),
        );
        let mut approved = Gate::open(EscalationRequest::new(GateTrigger::Manual, "look"));
        approved.resolve(GateStatus::Approved, "fine");
        {
            let store = JsonFileStateStore::open(dir.path()).unwrap();
            store.upsert_gate(&pending).unwrap();
            store.upsert_gate(&approved).unwrap();
        }

        let store = JsonFileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.list_gates().unwrap().len(), 2);
        assert_eq!(store.pending_gates().unwrap(), vec![pending]);
    }

    #[test]
    fn test_state_file_without_gates_still_loads() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(STATE_FILE_NAME),
            r#"{"projects": {}, "tasks": {}}"#,
        )
        .unwrap();
        let store = JsonFileStateStore::open(dir.path()).unwrap();
        assert!(store.pending_gates().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE_NAME), "{ not json").unwrap();
        assert!(matches!(
            JsonFileStateStore::open(dir.path()),
            Err(StoreError::Deserialization(_))
        ));
    }
}
