//! S3-based state storage backend.
//!
//! This module provides remote state storage in AWS S3 (or compatible
//! services) for shared deployments. The whole document is one object;
//! per-node writes rewrite it under an in-process mutex.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StateError, TieredError};
use crate::graph::NodeId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, ensure_available};
use super::store::StateStore;
use super::types::{ObservedResource, RunRecord, StackState};

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
    /// Stack name for a fresh document.
    stack: String,
    /// Environment for a fresh document.
    environment: String,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

fn s3_error(message: String) -> TieredError {
    TieredError::State(StateError::backend(message))
}

impl S3StateStore {
    /// Creates a new S3 state store from the AWS environment.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
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

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_error(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    TieredError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(s3_error(format!("S3 get error: {service_err}")))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| s3_error(format!("S3 put error: {e}")))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error(format!("S3 delete error: {e}")))?;
        Ok(())
    }

    async fn read_state(&self) -> Result<Option<StackState>> {
        let Some(json) = self.get_object(&self.key(STATE_KEY)).await? else {
            return Ok(None);
        };
        let state: StackState = serde_json::from_str(&json).map_err(|e| {
            TieredError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;
        state.check_version()?;
        Ok(Some(state))
    }

    async fn modify(&self, mutate: impl FnOnce(&mut StackState) + Send) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .read_state()
            .await?
            .unwrap_or_else(|| StackState::new(&self.stack, &self.environment));
        mutate(&mut state);

        let content = serde_json::to_string_pretty(&state).map_err(|e| {
            TieredError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;
        self.put_object(&self.key(STATE_KEY), content).await
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        debug!("Loading state from s3://{}/{}", self.bucket, self.key(STATE_KEY));
        let state = self.read_state().await?;
        if let Some(state) = &state {
            info!(
                "Loaded state for stack: {}/{}",
                state.stack, state.environment
            );
        }
        Ok(state)
    }

    async fn save(&self, resource: &ObservedResource) -> Result<()> {
        debug!(node = %resource.node_id, "Recording resource in S3 state");
        let resource = resource.clone();
        self.modify(move |state| state.upsert(resource)).await
    }

    async fn remove(&self, node: &NodeId) -> Result<()> {
        debug!(node = %node, "Removing resource from S3 state");
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
        info!("Deleting state from s3://{}/{}", self.bucket, self.key(STATE_KEY));
        self.delete_object(&self.key(STATE_KEY)).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(s3_error(format!("S3 head error: {service_err}")))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        ensure_available(self.get_lock_info().await?.as_ref())?;

        let lock_info = LockInfo::new(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            TieredError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        self.put_object(&self.key(LOCK_KEY), content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            TieredError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;
        Ok(Some(lock_info))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("shop/prod/")), "shop/prod/");
        assert_eq!(normalize_prefix(Some("/shop")), "shop/");
    }
}
