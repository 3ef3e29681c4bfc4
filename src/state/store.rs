//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Writes are scoped to one node entry; each backend serializes the
//! read-modify-write of its document internally.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{ObservedResource, RunRecord, StackState};
use crate::error::Result;
use crate::graph::NodeId;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the stack state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StackState>>;

    /// Durably records one observed resource.
    async fn save(&self, resource: &ObservedResource) -> Result<()>;

    /// Durably removes one node entry.
    async fn remove(&self, node: &NodeId) -> Result<()>;

    /// Appends a run record and stores its configuration hash.
    async fn record_run(&self, record: &RunRecord) -> Result<()>;

    /// Deletes the whole state document.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the stack lock.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the stack lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|l| !l.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StackState>> {
        (**self).load().await
    }

    async fn save(&self, resource: &ObservedResource) -> Result<()> {
        (**self).save(resource).await
    }

    async fn remove(&self, node: &NodeId) -> Result<()> {
        (**self).remove(node).await
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        (**self).record_run(record).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
