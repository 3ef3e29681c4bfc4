//! Local file-based state storage backend.
//!
//! This module provides a JSON file state store for local development and
//! single-machine deployments. Every write goes to a temporary file that is
//! synced and renamed over the state file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StateError, TieredError};
use crate::graph::NodeId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ensure_available};
use super::store::StateStore;
use super::types::{ObservedResource, RunRecord, StackState};

/// Default state directory name.
pub const STATE_DIR: &str = ".tiered";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Stack name for a fresh document.
    stack: String,
    /// Environment for a fresh document.
    environment: String,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store in `.tiered` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TieredError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            stack: String::new(),
            environment: String::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Sets the stack identity written into a fresh document.
    #[must_use]
    pub fn for_stack(mut self, stack: &str, environment: &str) -> Self {
        self.stack = stack.to_string();
        self.environment = environment.to_string();
        self
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                TieredError::State(StateError::backend(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_state(&self) -> Result<Option<StackState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            TieredError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: StackState = serde_json::from_str(&content).map_err(|e| {
            TieredError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;
        state.check_version()?;

        Ok(Some(state))
    }

    async fn write_state(&self, state: &StackState) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state).map_err(|e| {
            TieredError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        let temp_path = self.state_path.with_extension("tmp");
        write_synced(&temp_path, &content).await?;

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            TieredError::State(StateError::backend(format!("Failed to rename state file: {e}")))
        })?;

        Ok(())
    }

    /// Loads, mutates and writes back the document under the write mutex.
    async fn modify(&self, mutate: impl FnOnce(&mut StackState) + Send) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .read_state()
            .await?
            .unwrap_or_else(|| StackState::new(&self.stack, &self.environment));
        mutate(&mut state);
        self.write_state(&state).await
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            TieredError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            TieredError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                TieredError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, content: &str) -> Result<()> {
    let backend = |what: &str, e: std::io::Error| {
        TieredError::State(StateError::backend(format!(
            "Failed to {what} {}: {e}",
            path.display()
        )))
    };

    let mut file = fs::File::create(path).await.map_err(|e| backend("create", e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| backend("write", e))?;
    file.sync_all().await.map_err(|e| backend("sync", e))?;
    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        info!("Loading state from: {}", self.state_path.display());
        self.read_state().await
    }

    async fn save(&self, resource: &ObservedResource) -> Result<()> {
        debug!(node = %resource.node_id, "Recording resource in local state");
        let resource = resource.clone();
        self.modify(move |state| state.upsert(resource)).await
    }

    async fn remove(&self, node: &NodeId) -> Result<()> {
        debug!(node = %node, "Removing resource from local state");
        self.modify(|state| {
            state.remove(node);
        })
        .await
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        let record = record.clone();
        self.modify(move |state| state.add_history(record)).await
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                TieredError::State(StateError::backend(format!(
                    "Failed to delete state file: {e}"
                )))
            })?;
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        ensure_available(self.read_lock_file().await?.as_ref())?;

        let lock_info = LockInfo::new(holder, operation);
        self.ensure_dir().await?;
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            TieredError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        write_synced(&self.lock_path, &content).await.map_err(|e| {
            TieredError::State(StateError::LockFailed {
                message: e.to_string(),
            })
        })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
