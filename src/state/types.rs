//! State types for tracking reconciled resources.
//!
//! These types represent the observed state of a stack: the provider identity
//! and attributes of every node that has been created, plus a short run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::StateError;
use crate::graph::{Attributes, NodeId, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run records kept in the history.
pub const MAX_HISTORY: usize = 100;

/// The persisted state document of one stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the configuration of the last recorded run.
    pub config_hash: String,
    /// Observed resources keyed by node id.
    pub resources: BTreeMap<NodeId, ObservedResource>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunRecord>,
}

/// Last-known provider view of a single node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedResource {
    /// Node this resource realizes.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Resolved desired attributes merged with provider-computed ones.
    pub attributes: Attributes,
    /// Nodes this node depended on when it was written.
    #[serde(default)]
    pub depends_on: BTreeSet<NodeId>,
    /// Hash of the resolved desired attributes.
    #[serde(default)]
    pub desired_hash: String,
    /// When the provider was last consulted about this resource.
    pub last_synced_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: ResourceStatus,
}

/// Lifecycle status of an observed resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Creation was requested but not confirmed.
    Pending,
    /// The resource exists and matches its last applied attributes.
    Created,
    /// The resource exists but is not healthy.
    Degraded,
    /// The provider reports the resource gone.
    Deleted,
}

/// One entry of the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of run.
    pub operation: RunOperation,
    /// Configuration hash at the time of the run.
    pub config_hash: String,
    /// Number of actions in the plan.
    pub actions: usize,
    /// Nodes that converged.
    pub succeeded: usize,
    /// Nodes that failed.
    #[serde(default)]
    pub failed: Vec<NodeId>,
    /// Number of nodes skipped because a dependency did not converge.
    pub skipped: usize,
    /// Number of nodes left undispatched by cancellation.
    #[serde(default)]
    pub cancelled: usize,
}

/// Kinds of runs recorded in the history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge toward the declared topology.
    Apply,
    /// Remove every recorded resource.
    Destroy,
}

impl StackState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Rejects documents written by an incompatible format version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] when the major version differs.
    pub fn check_version(&self) -> Result<(), StateError> {
        let major = |v: &str| v.split('.').next().map(str::to_owned);
        if major(&self.version) == major(STATE_VERSION) {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }

    /// Gets a resource by node id.
    #[must_use]
    pub fn get(&self, node: &NodeId) -> Option<&ObservedResource> {
        self.resources.get(node)
    }

    /// Adds or replaces a resource.
    pub fn upsert(&mut self, resource: ObservedResource) {
        self.resources.insert(resource.node_id.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource.
    pub fn remove(&mut self, node: &NodeId) -> Option<ObservedResource> {
        let removed = self.resources.remove(node);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Appends a run record, keeping the last [`MAX_HISTORY`] entries.
    pub fn add_history(&mut self, record: RunRecord) {
        self.config_hash.clone_from(&record.config_hash);
        self.history.push(record);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.last_updated = Utc::now();
    }

    /// Returns resources with status `Created`.
    #[must_use]
    pub fn created(&self) -> Vec<&ObservedResource> {
        self.resources
            .values()
            .filter(|r| r.status == ResourceStatus::Created)
            .collect()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns the most recent run, if any.
    #[must_use]
    pub fn last_run(&self) -> Option<&RunRecord> {
        self.history.last()
    }
}

impl ObservedResource {
    /// Creates a resource in status `Created`.
    #[must_use]
    pub fn created(
        node_id: NodeId,
        kind: ResourceKind,
        provider_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        Self {
            node_id,
            kind,
            provider_id: provider_id.into(),
            attributes,
            depends_on: BTreeSet::new(),
            desired_hash: String::new(),
            last_synced_at: Utc::now(),
            status: ResourceStatus::Created,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_depends_on(mut self, depends_on: BTreeSet<NodeId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Sets the lifecycle status.
    #[must_use]
    pub const fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the desired hash.
    #[must_use]
    pub fn with_desired_hash(mut self, hash: impl Into<String>) -> Self {
        self.desired_hash = hash.into();
        self
    }

    /// Looks up an attribute path.
    ///
    /// `id` yields the provider identifier. Other paths are dot separated and
    /// walk nested objects; numeric segments index into arrays.
    #[must_use]
    pub fn attribute(&self, path: &str) -> Option<Value> {
        if path == "id" {
            return Some(Value::String(self.provider_id.clone()));
        }

        let mut segments = path.split('.');
        let mut current = self.attributes.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Returns true if the resource is usable by dependents.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status == ResourceStatus::Created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource() -> ObservedResource {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("dns_name"), json!("web-123.elb.amazonaws.com"));
        attributes.insert(
            String::from("endpoint"),
            json!({ "address": "db.internal", "ports": [3306, 3307] }),
        );
        ObservedResource::created(
            NodeId::from("load_balancer.web"),
            ResourceKind::LoadBalancer,
            "arn:aws:elasticloadbalancing:1",
            attributes,
        )
    }

    #[test]
    fn test_attribute_paths() {
        let r = resource();
        assert_eq!(r.attribute("id"), Some(json!("arn:aws:elasticloadbalancing:1")));
        assert_eq!(r.attribute("dns_name"), Some(json!("web-123.elb.amazonaws.com")));
        assert_eq!(r.attribute("endpoint.address"), Some(json!("db.internal")));
        assert_eq!(r.attribute("endpoint.ports.1"), Some(json!(3307)));
        assert_eq!(r.attribute("endpoint.missing"), None);
        assert_eq!(r.attribute("dns_name.deeper"), None);
    }

    #[test]
    fn test_history_is_capped() {
        let mut state = StackState::new("shop", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(RunRecord {
                run_id: i.to_string(),
                timestamp: Utc::now(),
                operation: RunOperation::Apply,
                config_hash: format!("hash-{i}"),
                actions: 0,
                succeeded: 0,
                failed: Vec::new(),
                skipped: 0,
                cancelled: 0,
            });
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].run_id, "5");
        assert_eq!(state.config_hash, format!("hash-{}", MAX_HISTORY + 4));
    }

    #[test]
    fn test_version_check() {
        let mut state = StackState::new("shop", "dev");
        assert!(state.check_version().is_ok());
        state.version = String::from("2.0");
        assert!(matches!(
            state.check_version(),
            Err(StateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_state_serializes_with_string_keys() {
        let mut state = StackState::new("shop", "dev");
        state.upsert(resource());
        let json = serde_json::to_string(&state).expect("serialize");
        assert!(json.contains("\"load_balancer.web\""));
        let back: StackState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
