//! Durable task records
//!
//! The state manager works on a whole JSON document, but persists it as a
//! [`TaskRecord`] with separately updatable fields. Stores implement
//! [`TaskRecordStore`]; [`InMemoryTaskStore`] is the default and
//! `RocksTaskStore` (feature `heavy-state`) persists to disk.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::StorageField;
use super::types::{Plan, SharedState, TaskError, TaskMetrics, TaskStatus};

/// Error type for record store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task record not found: {0}")]
    NotFound(String),

    #[error("Task record already exists: {0}")]
    AlreadyExists(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

/// Result type for record store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a record store
pub type SharedTaskStore = Arc<dyn TaskRecordStore>;

/// Persisted form of one task's shared state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub user_id: String,
    pub objective: String,
    pub status: TaskStatus,
    /// The plan document as written, including unknown fields
    pub plan_json: Value,
    pub current_phase: u32,
    pub total_phases: u32,
    /// Every root without a dedicated field
    pub memory_context: Map<String, Value>,
    pub metrics: TaskMetrics,
    pub error: Option<TaskError>,
    pub updated_at: DateTime<Utc>,
}

/// A single-field change to a record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    Status(TaskStatus),
    Plan {
        plan_json: Value,
        current_phase: u32,
        total_phases: u32,
    },
    Memory(Map<String, Value>),
    Metrics(TaskMetrics),
    Error(Option<TaskError>),
}

impl RecordUpdate {
    pub fn field(&self) -> StorageField {
        match self {
            Self::Status(_) => StorageField::Status,
            Self::Plan { .. } => StorageField::Plan,
            Self::Memory(_) => StorageField::Memory,
            Self::Metrics(_) => StorageField::Metrics,
            Self::Error(_) => StorageField::Error,
        }
    }

    /// Extract the update for `field` from a full state document
    pub fn from_document(field: StorageField, doc: &Value) -> StoreResult<Option<Self>> {
        let root = |key: &str| doc.get(key).cloned().unwrap_or(Value::Null);
        let update = match field {
            StorageField::Header => return Ok(None),
            StorageField::Status => Self::Status(serde_json::from_value(root("status"))?),
            StorageField::Plan => {
                let plan_json = root("plan");
                let plan: Plan = serde_json::from_value(plan_json.clone())?;
                Self::Plan {
                    plan_json,
                    current_phase: plan.current_phase,
                    total_phases: plan.total_phases,
                }
            }
            StorageField::Memory => Self::Memory(memory_roots(doc)),
            StorageField::Metrics => Self::Metrics(serde_json::from_value(root("metrics"))?),
            StorageField::Error => Self::Error(serde_json::from_value(root("error"))?),
        };
        Ok(Some(update))
    }
}

fn memory_roots(doc: &Value) -> Map<String, Value> {
    doc.as_object()
        .map(|map| {
            map.iter()
                .filter(|(key, _)| StorageField::for_root(key) == StorageField::Memory)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

impl TaskRecord {
    pub fn from_state(state: &SharedState) -> StoreResult<Self> {
        let doc = serde_json::to_value(state)?;
        Ok(Self {
            task_id: state.task_id.clone(),
            user_id: state.user_id.clone(),
            objective: state.objective.clone(),
            status: state.status,
            plan_json: serde_json::to_value(&state.plan)?,
            current_phase: state.plan.current_phase,
            total_phases: state.plan.total_phases,
            memory_context: memory_roots(&doc),
            metrics: state.metrics.clone(),
            error: state.error.clone(),
            updated_at: Utc::now(),
        })
    }

    /// Reassemble the full state document
    pub fn to_document(&self) -> StoreResult<Value> {
        let mut doc = self.memory_context.clone();
        doc.insert("taskId".into(), Value::String(self.task_id.clone()));
        doc.insert("userId".into(), Value::String(self.user_id.clone()));
        doc.insert("objective".into(), Value::String(self.objective.clone()));
        doc.insert("status".into(), serde_json::to_value(self.status)?);
        doc.insert("plan".into(), self.plan_json.clone());
        doc.insert("metrics".into(), serde_json::to_value(&self.metrics)?);
        doc.insert("error".into(), serde_json::to_value(&self.error)?);
        Ok(Value::Object(doc))
    }

    pub fn to_state(&self) -> StoreResult<SharedState> {
        Ok(serde_json::from_value(self.to_document()?)?)
    }

    pub fn apply(&mut self, update: RecordUpdate) {
        match update {
            RecordUpdate::Status(status) => self.status = status,
            RecordUpdate::Plan {
                plan_json,
                current_phase,
                total_phases,
            } => {
                self.plan_json = plan_json;
                self.current_phase = current_phase;
                self.total_phases = total_phases;
            }
            RecordUpdate::Memory(memory) => self.memory_context = memory,
            RecordUpdate::Metrics(metrics) => self.metrics = metrics,
            RecordUpdate::Error(error) => self.error = error,
        }
        self.updated_at = Utc::now();
    }
}

/// Computes a change from the current record; `None` leaves it untouched
pub type RecordEdit<'a> = Box<dyn FnOnce(&TaskRecord) -> Option<RecordUpdate> + Send + 'a>;

/// Durable storage for task records
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    async fn load(&self, task_id: &str) -> StoreResult<Option<TaskRecord>>;

    /// Insert a new record; fails if one exists
    async fn create(&self, record: &TaskRecord) -> StoreResult<()>;

    /// Replace one field of an existing record
    async fn update(&self, task_id: &str, update: RecordUpdate) -> StoreResult<()>;

    /// Read-modify-write of one record. No other write to the store lands
    /// between the read handed to `edit` and the write of its result.
    async fn modify(&self, task_id: &str, edit: RecordEdit<'_>) -> StoreResult<()>;
}

/// Process-local record store
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedTaskStore {
        Arc::new(self)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskRecordStore for InMemoryTaskStore {
    async fn load(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(task_id).cloned())
    }

    async fn create(&self, record: &TaskRecord) -> StoreResult<()> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        if records.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists(record.task_id.clone()));
        }
        records.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, task_id: &str, update: RecordUpdate) -> StoreResult<()> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        record.apply(update);
        Ok(())
    }

    async fn modify(&self, task_id: &str, edit: RecordEdit<'_>) -> StoreResult<()> {
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if let Some(update) = edit(&*record) {
            record.apply(update);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        let mut state = SharedState::new("t1", "u1", "Summarize papers");
        state.context.facts.push("rust is fast".into());
        state
            .extensions
            .insert("vectorClocks".into(), json!({"status": {"a": 1}}));
        TaskRecord::from_state(&state).unwrap()
    }

    #[test]
    fn test_record_splits_roots() {
        let record = record();
        assert!(record.memory_context.contains_key("context"));
        assert!(record.memory_context.contains_key("vectorClocks"));
        assert!(record.memory_context.contains_key("agents"));
        assert!(!record.memory_context.contains_key("status"));
        assert!(!record.memory_context.contains_key("taskId"));
    }

    #[test]
    fn test_record_document_roundtrip() {
        let record = record();
        let state = record.to_state().unwrap();
        assert_eq!(state.task_id, "t1");
        assert_eq!(state.context.facts, vec!["rust is fast"]);
        assert_eq!(state.extensions["vectorClocks"]["status"]["a"], 1);
    }

    #[test]
    fn test_update_from_document_plan_mirrors() {
        let doc = json!({
            "plan": {"phases": [], "currentPhase": 2, "totalPhases": 3, "note": "kept"}
        });
        let update = RecordUpdate::from_document(StorageField::Plan, &doc)
            .unwrap()
            .unwrap();
        match update {
            RecordUpdate::Plan {
                plan_json,
                current_phase,
                total_phases,
            } => {
                assert_eq!(current_phase, 2);
                assert_eq!(total_phases, 3);
                assert_eq!(plan_json["note"], "kept");
            }
            other => panic!("unexpected update {other:?}"),
        }
        assert!(RecordUpdate::from_document(StorageField::Header, &doc)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_crud() {
        let store = InMemoryTaskStore::new();
        assert!(store.load("t1").await.unwrap().is_none());

        store.create(&record()).await.unwrap();
        assert!(matches!(
            store.create(&record()).await,
            Err(StoreError::AlreadyExists(_))
        ));

        store
            .update("t1", RecordUpdate::Status(TaskStatus::Executing))
            .await
            .unwrap();
        let loaded = store.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Executing);

        assert!(matches!(
            store
                .update("missing", RecordUpdate::Status(TaskStatus::Failed))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_modify_reads_current_record() {
        let store = InMemoryTaskStore::new();
        store.create(&record()).await.unwrap();

        for key in ["a", "b"] {
            store
                .modify(
                    "t1",
                    Box::new(move |current: &TaskRecord| {
                        let mut memory = current.memory_context.clone();
                        memory.insert(key.into(), json!(true));
                        Some(RecordUpdate::Memory(memory))
                    }),
                )
                .await
                .unwrap();
        }
        store.modify("t1", Box::new(|_: &TaskRecord| None)).await.unwrap();

        let loaded = store.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.memory_context["a"], true);
        assert_eq!(loaded.memory_context["b"], true);
        assert!(loaded.memory_context.contains_key("context"));

        assert!(matches!(
            store.modify("missing", Box::new(|_: &TaskRecord| None)).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
