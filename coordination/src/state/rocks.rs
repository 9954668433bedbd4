//! RocksDB-backed record store
//!
//! One column family per record field, keyed by `task:<id>`. Values are
//! JSON so records stay readable with `ldb`. The same database also keeps
//! the message audit trail in its own column family.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::schema::{self, ALL_CFS};
use super::store::{
    RecordEdit, RecordUpdate, StoreError, StoreResult, TaskRecord, TaskRecordStore,
};
use super::types::{TaskError, TaskMetrics, TaskStatus};
use crate::messaging::{AuditEntry, AuditError, AuditResult, AuditSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    task_id: String,
    user_id: String,
    objective: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPlan {
    plan_json: serde_json::Value,
    current_phase: u32,
    total_phases: u32,
}

/// Shared reference to RocksTaskStore
pub type SharedRocksTaskStore = Arc<RocksTaskStore>;

pub struct RocksTaskStore {
    db: RwLock<DB>,
    /// Serializes record writes so a read-modify-write sees no interleaving
    write_lock: Mutex<()>,
    path: PathBuf,
}

impl RocksTaskStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            write_lock: Mutex::new(()),
            path,
        })
    }

    pub fn shared(self) -> SharedRocksTaskStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn touch(&self, key: &str) -> StoreResult<()> {
        let mut header: Header = self
            .get(schema::CF_HEADER, key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        header.updated_at = Utc::now();
        self.put(schema::CF_HEADER, key, &header)
    }

    fn read_record(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let key = schema::keys::task(task_id);
        let Some(header) = self.get::<Header>(schema::CF_HEADER, &key)? else {
            return Ok(None);
        };
        let status: TaskStatus = self.get(schema::CF_STATUS, &key)?.unwrap_or_default();
        let plan: Option<StoredPlan> = self.get(schema::CF_PLAN, &key)?;
        let memory_context: serde_json::Map<String, serde_json::Value> =
            self.get(schema::CF_MEMORY, &key)?.unwrap_or_default();
        let metrics: TaskMetrics = self.get(schema::CF_METRICS, &key)?.unwrap_or_default();
        let error: Option<TaskError> = self.get::<Option<TaskError>>(schema::CF_ERROR, &key)?.flatten();

        let (plan_json, current_phase, total_phases) = match plan {
            Some(p) => (p.plan_json, p.current_phase, p.total_phases),
            None => (serde_json::Value::Null, 0, 0),
        };

        Ok(Some(TaskRecord {
            task_id: header.task_id,
            user_id: header.user_id,
            objective: header.objective,
            status,
            plan_json,
            current_phase,
            total_phases,
            memory_context,
            metrics,
            error,
            updated_at: header.updated_at,
        }))
    }

    /// Caller holds `write_lock`
    fn write_update(&self, task_id: &str, update: RecordUpdate) -> StoreResult<()> {
        let key = schema::keys::task(task_id);
        if self.get::<Header>(schema::CF_HEADER, &key)?.is_none() {
            return Err(StoreError::NotFound(task_id.to_string()));
        }
        let cf = update.field().column_family();
        match update {
            RecordUpdate::Status(status) => self.put(cf, &key, &status)?,
            RecordUpdate::Plan {
                plan_json,
                current_phase,
                total_phases,
            } => self.put(
                cf,
                &key,
                &StoredPlan {
                    plan_json,
                    current_phase,
                    total_phases,
                },
            )?,
            RecordUpdate::Memory(memory) => self.put(cf, &key, &memory)?,
            RecordUpdate::Metrics(metrics) => self.put(cf, &key, &metrics)?,
            RecordUpdate::Error(error) => self.put(cf, &key, &error)?,
        }
        self.touch(&key)
    }

    /// Audit entries recorded between two instants, oldest first
    pub fn audit_range(&self, start_nanos: i64, end_nanos: i64) -> StoreResult<Vec<AuditEntry>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_AUDIT)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_AUDIT.to_string()))?;

        let start_key = schema::keys::audit(start_nanos, "");
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(start_key.as_bytes(), rocksdb::Direction::Forward),
        );

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            match schema::keys::parse_audit_timestamp(&key) {
                Some(ts) if ts > end_nanos => break,
                Some(_) => entries.push(serde_json::from_slice(&value)?),
                None => continue,
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl TaskRecordStore for RocksTaskStore {
    async fn load(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        self.read_record(task_id)
    }

    async fn create(&self, record: &TaskRecord) -> StoreResult<()> {
        let key = schema::keys::task(&record.task_id);
        if self.get::<Header>(schema::CF_HEADER, &key)?.is_some() {
            return Err(StoreError::AlreadyExists(record.task_id.clone()));
        }
        self.put(schema::CF_STATUS, &key, &record.status)?;
        self.put(
            schema::CF_PLAN,
            &key,
            &StoredPlan {
                plan_json: record.plan_json.clone(),
                current_phase: record.current_phase,
                total_phases: record.total_phases,
            },
        )?;
        self.put(schema::CF_MEMORY, &key, &record.memory_context)?;
        self.put(schema::CF_METRICS, &key, &record.metrics)?;
        self.put(schema::CF_ERROR, &key, &record.error)?;
        // Header last: its presence marks the record as complete
        self.put(
            schema::CF_HEADER,
            &key,
            &Header {
                task_id: record.task_id.clone(),
                user_id: record.user_id.clone(),
                objective: record.objective.clone(),
                updated_at: record.updated_at,
            },
        )
    }

    async fn update(&self, task_id: &str, update: RecordUpdate) -> StoreResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        self.write_update(task_id, update)
    }

    async fn modify(&self, task_id: &str, edit: RecordEdit<'_>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let record = self
            .read_record(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        match edit(&record) {
            Some(update) => self.write_update(task_id, update),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AuditSink for RocksTaskStore {
    async fn record(&self, entry: AuditEntry) -> AuditResult<()> {
        let nanos = entry.recorded_at.timestamp_nanos_opt().unwrap_or_default();
        let key = schema::keys::audit(nanos, &entry.message_id);
        self.put(schema::CF_AUDIT, &key, &entry)
            .map_err(|e| AuditError::StoreError(e.to_string()))
    }
}
