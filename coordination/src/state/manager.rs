//! Shared state manager
//!
//! Path-addressed reads and writes over a task's [`SharedState`], persisted
//! through a [`TaskRecordStore`] and announced to every agent on the task's
//! state channel.
//!
//! Reads go through a short-lived per-path cache. A write applies the change
//! to a copy of the current document while the store holds its write lock,
//! validates the copy against the typed schema and persists only the field
//! the path maps to. Agents sharing a store therefore never drop each
//! other's writes; competing writes to the same path go to the conflict
//! resolver.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::path::{self, PathError};
use super::schema::{StorageField, HEADER_ROOTS};
use super::store::{RecordEdit, RecordUpdate, SharedTaskStore, StoreError, TaskRecord};
use super::types::{AgentStatus, Artifact, SharedState, TaskStatus};
use crate::config::StateConfig;
use crate::messaging::{
    state_channel, AgentMessage, MessageType, SharedTransport, TransportError, Unsubscribe,
    EVENT_STATE_CHANGE,
};

/// Error type for shared state operations
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid path: {0}")]
    Path(#[from] PathError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State for task {0} has not been initialized")]
    NotInitialized(String),

    #[error("Field {0} is immutable after creation")]
    ImmutableField(String),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Write to {path} does not fit the state schema: {message}")]
    Schema { path: String, message: String },

    #[error("{0} is not a list")]
    NotAList(String),

    #[error("No item with id {id} in {path}")]
    ListItemNotFound { path: String, id: String },

    #[error("Artifact {0} already exists")]
    ArtifactExists(String),

    #[error("Phase {phase_id} still has open subtask {subtask_id}")]
    PhaseIncomplete { phase_id: String, subtask_id: String },
}

/// Result type for shared state operations
pub type StateResult<T> = Result<T, StateError>;

/// Shared reference to a SharedStateManager
pub type SharedStateHandle = Arc<SharedStateManager>;

/// Change notification published after every successful write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub path: String,
    pub value: Value,
    #[serde(default)]
    pub old_value: Option<Value>,
    pub changed_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Boxed async change handler
pub type StateChangeHandler =
    Arc<dyn Fn(StateChange) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type ChangeHandlers = RwLock<Vec<(u64, StateChangeHandler)>>;

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Seed used when a task's state does not exist yet
#[derive(Debug, Clone, Default)]
pub struct TaskSeed {
    pub user_id: String,
    pub objective: String,
}

impl TaskSeed {
    pub fn new(user_id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            objective: objective.into(),
        }
    }
}

pub struct SharedStateManager {
    task_id: String,
    agent_id: String,
    store: SharedTaskStore,
    transport: SharedTransport,
    config: StateConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    handlers: Arc<ChangeHandlers>,
    next_handler_id: AtomicU64,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl SharedStateManager {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        store: SharedTaskStore,
        transport: SharedTransport,
        config: StateConfig,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            store,
            transport,
            config,
            cache: Mutex::new(HashMap::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_handler_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            listener: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Create a shared reference to this manager
    pub fn shared(self) -> SharedStateHandle {
        Arc::new(self)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Load the task's state, creating the initial state from `seed` when
    /// none exists, then start listening for change notifications.
    pub async fn initialize(self: &Arc<Self>, seed: TaskSeed) -> StateResult<SharedState> {
        let state = match self.store.load(&self.task_id).await? {
            Some(record) => record.to_state()?,
            None => {
                let state = SharedState::new(&self.task_id, seed.user_id, seed.objective);
                match self.store.create(&TaskRecord::from_state(&state)?).await {
                    Ok(()) => state,
                    // Another process created it first
                    Err(StoreError::AlreadyExists(_)) => self.load_state().await?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if !self.initialized.swap(true, Ordering::SeqCst) {
            let receiver = self
                .transport
                .subscribe(&state_channel(&self.task_id), EVENT_STATE_CHANGE)
                .await;
            match receiver {
                Ok(receiver) => {
                    let handle = self.spawn_listener(receiver);
                    *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                }
                Err(e) => {
                    self.initialized.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
            info!(task_id = %self.task_id, agent_id = %self.agent_id, "Shared state initialized");
        }
        Ok(state)
    }

    /// Stop listening for change notifications
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value at `path`, or `None` when absent. An empty path reads the
    /// whole document.
    pub async fn get_value(&self, path: &str) -> StateResult<Option<Value>> {
        if let Some(value) = self.cached(path) {
            return Ok(Some(value));
        }
        let doc = self.load_document().await?;
        let value = path::get(&doc, path).cloned();
        if let Some(value) = &value {
            self.cache_put(path, value.clone());
        }
        Ok(value)
    }

    /// Value at `path` read from the store, bypassing the cache
    pub async fn get_fresh(&self, path: &str) -> StateResult<Option<Value>> {
        let doc = self.load_document().await?;
        let value = path::get(&doc, path).cloned();
        match &value {
            Some(value) => self.cache_put(path, value.clone()),
            None => self.invalidate(path),
        }
        Ok(value)
    }

    /// Typed read
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> StateResult<Option<T>> {
        match self.get_value(path).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Full typed state, always read from the store
    pub async fn snapshot(&self) -> StateResult<SharedState> {
        self.load_state().await
    }

    pub async fn status(&self) -> StateResult<TaskStatus> {
        Ok(self.get("status").await?.unwrap_or_default())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `value` at `path` and announce the change
    pub async fn set<T: Serialize>(&self, path: &str, value: &T) -> StateResult<StateChange> {
        let value = serde_json::to_value(value)?;
        self.write(path, move |_| Ok(value)).await
    }

    pub async fn set_status(&self, status: TaskStatus) -> StateResult<StateChange> {
        self.set("status", &status).await
    }

    /// Append `item` to the list at `path`, creating the list if absent
    pub async fn append_to_list<T: Serialize>(&self, path: &str, item: &T) -> StateResult<StateChange> {
        let item = serde_json::to_value(item)?;
        let list_path = path.to_string();
        self.write(path, move |current| match current {
            None | Some(Value::Null) => Ok(Value::Array(vec![item])),
            Some(Value::Array(items)) => {
                let mut items = items.clone();
                items.push(item);
                Ok(Value::Array(items))
            }
            Some(_) => Err(StateError::NotAList(list_path)),
        })
        .await
    }

    /// Shallow-merge `patch` into the list element whose `id` equals `id`
    pub async fn update_list_item(&self, path: &str, id: &str, patch: Value) -> StateResult<StateChange> {
        let list_path = path.to_string();
        let id = id.to_string();
        self.write(path, move |current| {
            let Some(Value::Array(items)) = current else {
                return Err(StateError::NotAList(list_path));
            };
            let mut items = items.clone();
            let item = items
                .iter_mut()
                .find(|item| item.get("id").and_then(Value::as_str) == Some(id.as_str()))
                .ok_or_else(|| StateError::ListItemNotFound {
                    path: list_path.clone(),
                    id: id.clone(),
                })?;
            match (item, patch) {
                (Value::Object(target), Value::Object(fields)) => target.extend(fields),
                (target, replacement) => *target = replacement,
            }
            Ok(Value::Array(items))
        })
        .await
    }

    /// Record or refresh an agent's status under `agents.<id>`
    pub async fn upsert_agent(&self, agent: &AgentStatus) -> StateResult<StateChange> {
        self.set(&format!("agents.{}", agent.id), agent).await
    }

    /// Store a new artifact under `artifacts.<id>`. Artifacts are never
    /// overwritten.
    pub async fn add_artifact(&self, artifact: &Artifact) -> StateResult<StateChange> {
        let value = serde_json::to_value(artifact)?;
        let artifact_id = artifact.id.clone();
        self.write(&format!("artifacts.{}", artifact.id), move |current| match current {
            None | Some(Value::Null) => Ok(value),
            Some(_) => Err(StateError::ArtifactExists(artifact_id)),
        })
        .await
    }

    /// Read-modify-write against the current record, under the store's lock
    async fn write<F>(&self, path: &str, compute: F) -> StateResult<StateChange>
    where
        F: FnOnce(Option<&Value>) -> StateResult<Value> + Send,
    {
        let root = path::root(path);
        if HEADER_ROOTS.contains(&root) {
            return Err(StateError::ImmutableField(root.to_string()));
        }

        let mut outcome: Option<StateResult<(Option<Value>, Value)>> = None;
        let edit: RecordEdit<'_> = Box::new(|record: &TaskRecord| match prepare_write(record, path, compute) {
            Ok((update, old_value, value)) => {
                outcome = Some(Ok((old_value, value)));
                update
            }
            Err(e) => {
                outcome = Some(Err(e));
                None
            }
        });
        match self.store.modify(&self.task_id, edit).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(StateError::NotInitialized(self.task_id.clone())),
            Err(e) => return Err(e.into()),
        }
        let (old_value, value) = match outcome {
            Some(result) => result?,
            None => return Err(StateError::NotInitialized(self.task_id.clone())),
        };

        self.invalidate(path);
        self.cache_put(path, value.clone());

        let change = StateChange {
            path: path.to_string(),
            value,
            old_value,
            changed_by: self.agent_id.clone(),
            timestamp: Utc::now(),
        };
        self.announce(&change).await;
        debug!(task_id = %self.task_id, path = %path, "State updated");
        Ok(change)
    }

    async fn announce(&self, change: &StateChange) {
        let message = match AgentMessage::with_payload(MessageType::StateUpdate, change) {
            Ok(mut message) => {
                message.id = uuid::Uuid::new_v4().to_string();
                message.sender_id = self.agent_id.clone();
                message.task_id = self.task_id.clone();
                message
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode state change");
                return;
            }
        };
        let channel = state_channel(&self.task_id);
        if let Err(e) = self
            .transport
            .publish(&channel, EVENT_STATE_CHANGE, &message)
            .await
        {
            // The write is durable; peers will see it on their next read
            warn!(task_id = %self.task_id, path = %change.path, error = %e, "Failed to announce state change");
        }
    }

    // =========================================================================
    // Change notifications
    // =========================================================================

    /// Register a handler for every announced change, local or remote
    pub fn on_state_change<F, Fut>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: StateChangeHandler = Arc::new(move |change: StateChange| handler(change).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));

        let table: Weak<ChangeHandlers> = Arc::downgrade(&self.handlers);
        Unsubscribe::new(move || {
            if let Some(table) = table.upgrade() {
                table
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    fn spawn_listener(self: &Arc<Self>, mut receiver: broadcast::Receiver<AgentMessage>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => received,
                };
                let message = match message {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "State change listener lagged");
                        if let Some(manager) = manager.upgrade() {
                            manager.clear_cache();
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_change_message(message).await;
            }
        })
    }

    async fn handle_change_message(&self, message: AgentMessage) {
        if message.message_type != MessageType::StateUpdate {
            return;
        }
        let change: StateChange = match message.payload_as() {
            Ok(change) => change,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Malformed state change");
                return;
            }
        };
        if change.changed_by != self.agent_id {
            self.invalidate(&change.path);
        }

        let handlers: Vec<StateChangeHandler> = self
            .handlers
            .read()
            .map(|h| h.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in handlers {
            match AssertUnwindSafe(handler(change.clone())).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(path = %change.path, error = %e, "State change handler failed"),
                Err(_) => warn!(path = %change.path, "State change handler panicked"),
            }
        }
    }

    // =========================================================================
    // Cache and storage
    // =========================================================================

    fn cached(&self, path: &str) -> Option<Value> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(path) {
            Some(entry) if entry.stored_at.elapsed() < self.config.cache_ttl() => {
                Some(entry.value.clone())
            }
            Some(_) => {
                cache.remove(path);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, path: &str, value: Value) {
        if self.config.cache_ttl_ms == 0 {
            return;
        }
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).insert(
            path.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every cached path that overlaps `path`
    fn invalidate(&self, path: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|cached, _| !path::overlaps(cached, path));
    }

    fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn cached_path_count(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    async fn load_record(&self) -> StateResult<TaskRecord> {
        self.store
            .load(&self.task_id)
            .await?
            .ok_or_else(|| StateError::NotInitialized(self.task_id.clone()))
    }

    async fn load_document(&self) -> StateResult<Value> {
        Ok(self.load_record().await?.to_document()?)
    }

    async fn load_state(&self) -> StateResult<SharedState> {
        Ok(self.load_record().await?.to_state()?)
    }
}

/// Apply a write to a copy of `record`'s document and check it against the
/// schema. Returns the field update to persist with the old and new values.
fn prepare_write<F>(
    record: &TaskRecord,
    path: &str,
    compute: F,
) -> StateResult<(Option<RecordUpdate>, Option<Value>, Value)>
where
    F: FnOnce(Option<&Value>) -> StateResult<Value>,
{
    let doc = record.to_document()?;
    let old_value = path::get(&doc, path).cloned();
    let value = compute(old_value.as_ref())?;
    let next = path::with_value(&doc, path, value.clone())?;

    let next_state: SharedState =
        serde_json::from_value(next.clone()).map_err(|e| StateError::Schema {
            path: path.to_string(),
            message: e.to_string(),
        })?;
    if !record.status.can_transition_to(next_state.status) {
        return Err(StateError::InvalidTransition {
            from: record.status,
            to: next_state.status,
        });
    }

    let update = RecordUpdate::from_document(StorageField::for_path(path), &next)?;
    Ok((update, old_value, value))
}

impl Drop for SharedStateManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
