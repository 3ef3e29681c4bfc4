//! In-memory state storage backend.
//!
//! Used for rehearsals against the simulated cloud and in tests. Individual
//! node writes can be made to fail.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::{Result, StateError, TieredError};
use crate::graph::NodeId;

use super::lock::{LockInfo, ensure_available};
use super::store::StateStore;
use super::types::{ObservedResource, RunRecord, StackState};

/// In-memory state store.
#[derive(Debug)]
pub struct MemoryStateStore {
    stack: String,
    environment: String,
    state: Mutex<Option<StackState>>,
    lock: Mutex<Option<LockInfo>>,
    failing_nodes: Mutex<HashSet<NodeId>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            stack: stack.to_string(),
            environment: environment.to_string(),
            state: Mutex::new(None),
            lock: Mutex::new(None),
            failing_nodes: Mutex::new(HashSet::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Creates a store seeded with an existing document.
    #[must_use]
    pub fn with_state(state: StackState) -> Self {
        Self {
            stack: state.stack.clone(),
            environment: state.environment.clone(),
            state: Mutex::new(Some(state)),
            ..Self::new("", "")
        }
    }

    /// Makes every write for `node` fail with a backend error.
    pub async fn fail_writes_for(&self, node: impl Into<NodeId>) {
        self.failing_nodes.lock().await.insert(node.into());
    }

    /// Returns the number of successful node writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns a copy of the current document.
    pub async fn snapshot(&self) -> Option<StackState> {
        self.state.lock().await.clone()
    }

    async fn check_writable(&self, node: &NodeId) -> Result<()> {
        if self.failing_nodes.lock().await.contains(node) {
            return Err(TieredError::State(StateError::backend(format!(
                "injected write failure for {node}"
            ))));
        }
        Ok(())
    }

    async fn modify(&self, mutate: impl FnOnce(&mut StackState) + Send) {
        let mut guard = self.state.lock().await;
        let state = guard.get_or_insert_with(|| StackState::new(&self.stack, &self.environment));
        mutate(state);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, resource: &ObservedResource) -> Result<()> {
        self.check_writable(&resource.node_id).await?;
        let resource = resource.clone();
        self.modify(move |state| state.upsert(resource)).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, node: &NodeId) -> Result<()> {
        self.check_writable(node).await?;
        self.modify(|state| {
            state.remove(node);
        })
        .await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        let record = record.clone();
        self.modify(move |state| state.add_history(record)).await;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        ensure_available(guard.as_ref())?;
        let info = LockInfo::new(holder, operation);
        *guard = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStateStore::new("shop", "dev");
        store.fail_writes_for("vpc.main").await;

        let vpc = ObservedResource::created(
            NodeId::from("vpc.main"),
            ResourceKind::Vpc,
            "vpc-1",
            Attributes::new(),
        );
        assert!(store.save(&vpc).await.is_err());
        assert_eq!(store.write_count(), 0);
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_lock_roundtrip() {
        let store = MemoryStateStore::new("shop", "dev");
        let lock = store.acquire_lock("a", "apply").await.expect("lock");
        assert!(store.acquire_lock("b", "apply").await.is_err());
        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
