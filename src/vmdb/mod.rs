//! VM database: the guest VMs this host knows about and how often kernels
//! ran for them.
//!
//! A kernel only ever holds an immutable [`VmDbEntry`] snapshot. Updates go
//! through a [`VmStore`], which the supervisor drives.

mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub use sqlite::SqliteVmStore;

/// One VM record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDbEntry {
    /// VM identifier, matching the link's `vm_id`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Where the VM's configuration came from (file path or URL), if known.
    pub config_source: Option<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last time a kernel finished a run for this VM.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Completed kernel runs.
    pub run_count: u64,
}

impl VmDbEntry {
    /// Fresh record with no runs.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config_source: None,
            created_at: Utc::now(),
            last_run_at: None,
            run_count: 0,
        }
    }

    /// Set the configuration source.
    pub fn with_config_source(mut self, source: impl Into<String>) -> Self {
        self.config_source = Some(source.into());
        self
    }
}

/// VM store failures.
#[derive(Debug, thiserror::Error)]
pub enum VmStoreError {
    /// No record with this id.
    #[error("vm `{0}` is not registered")]
    NotFound(String),
    /// A record with this id already exists.
    #[error("vm `{0}` is already registered")]
    Duplicate(String),
    /// The backing database failed.
    #[error("vm database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored row could not be decoded.
    #[error("corrupt vm record `{id}`: {reason}")]
    Corrupt {
        /// Record id.
        id: String,
        /// What failed to decode.
        reason: String,
    },
}

/// Persistence for [`VmDbEntry`] records.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// Fetch a record.
    async fn get(&self, id: &str) -> Result<Option<VmDbEntry>, VmStoreError>;

    /// Register a new VM.
    async fn insert(&self, entry: &VmDbEntry) -> Result<(), VmStoreError>;

    /// Count one completed run and return the updated record.
    async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<VmDbEntry, VmStoreError>;

    /// Every record, oldest registration first.
    async fn list(&self) -> Result<Vec<VmDbEntry>, VmStoreError>;
}

/// Process-local store, used by tests and the CLI.
#[derive(Debug, Default)]
pub struct InMemoryVmStore {
    entries: RwLock<HashMap<String, VmDbEntry>>,
}

impl InMemoryVmStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VmStore for InMemoryVmStore {
    async fn get(&self, id: &str) -> Result<Option<VmDbEntry>, VmStoreError> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn insert(&self, entry: &VmDbEntry) -> Result<(), VmStoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.id) {
            return Err(VmStoreError::Duplicate(entry.id.clone()));
        }
        entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<VmDbEntry, VmStoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| VmStoreError::NotFound(id.to_owned()))?;
        entry.run_count = entry.run_count.saturating_add(1);
        entry.last_run_at = Some(at);
        Ok(entry.clone())
    }

    async fn list(&self) -> Result<Vec<VmDbEntry>, VmStoreError> {
        let mut all: Vec<VmDbEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}
