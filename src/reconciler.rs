//! Reconciler for maintaining desired state.
//!
//! One pass locks the stack, refreshes recorded state from the provider,
//! plans against the declared graph, executes the plan and records the run.
//! Outputs are resolved once every action succeeded.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, DeployConfig, ExecutionConfig};
use crate::error::{ReconcileError, Result, TieredError};
use crate::graph::{Graph, NodeId};
use crate::outputs::{OutputSpec, default_outputs, resolve_outputs, validate_outputs};
use crate::planner::{Plan, PlanExecutor, Planner, ReconciliationResult};
use crate::provider::{ProviderAdapter, ResourceHandle};
use crate::state::{
    ResourceStatus, RunOperation, RunRecord, StackState, StateStore, generate_holder_id,
};

/// What a refresh learned from the provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    /// Recorded resources the provider no longer knows.
    pub missing: Vec<NodeId>,
    /// Resources whose provider-computed attributes changed.
    pub changed: Vec<NodeId>,
    /// Resources that could not be read; their entries were left untouched.
    pub unreadable: Vec<NodeId>,
    /// Refreshed resources whose new entry could not be written to the store.
    pub unrecorded: Vec<NodeId>,
}

/// Report of one apply or destroy.
#[derive(Debug, Serialize)]
pub struct ApplyReport {
    /// Run identifier.
    pub run_id: String,
    /// What the refresh found.
    pub refresh: RefreshSummary,
    /// The executed plan.
    pub plan: Plan,
    /// Per-node result.
    #[serde(skip)]
    pub result: ReconciliationResult,
    /// Resolved outputs, present when the run converged.
    pub outputs: Option<BTreeMap<String, Value>>,
    /// Why outputs could not be resolved.
    pub output_error: Option<String>,
}

impl ApplyReport {
    /// Returns true if every planned action succeeded.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.result.is_success()
    }

    /// Turns an incomplete run into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Cancelled`] if the run was cancelled, or
    /// [`ReconcileError::PartialFailure`] if any node failed or was skipped.
    pub fn ensure_converged(&self) -> Result<()> {
        if self.result.was_cancelled() {
            return Err(ReconcileError::Cancelled {
                completed: self.result.completed_actions(),
            }
            .into());
        }
        if !self.result.is_success() {
            return Err(ReconcileError::PartialFailure {
                failed: self.result.failed.len(),
                skipped: self.result.skipped.len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// What the refresh found.
    pub refresh: RefreshSummary,
    /// Plan that would restore the declared topology.
    pub plan: Plan,
    /// Number of declared nodes.
    pub total_resources: usize,
}

impl DriftReport {
    /// Returns true if live or declared state differs from the record.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.refresh.missing.is_empty() || !self.refresh.changed.is_empty() || !self.plan.is_empty()
    }

    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

/// Reconciler for one stack.
pub struct Reconciler<'a, P: ?Sized, S: ?Sized> {
    /// Declared topology.
    graph: &'a Graph,
    /// Provider adapter.
    provider: &'a P,
    /// State store.
    store: &'a S,
    stack: String,
    environment: String,
    config_hash: String,
    execution: ExecutionConfig,
    outputs: Vec<OutputSpec>,
    planner: Planner,
    cancel: CancellationToken,
}

impl<P: ?Sized, S: ?Sized> fmt::Debug for Reconciler<'_, P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("stack", &self.stack)
            .field("environment", &self.environment)
            .field("nodes", &self.graph.len())
            .finish_non_exhaustive()
    }
}

impl<'a, P, S> Reconciler<'a, P, S>
where
    P: ProviderAdapter + ?Sized,
    S: StateStore + ?Sized,
{
    /// Creates a reconciler for a configuration and its graph.
    #[must_use]
    pub fn new(config: &DeployConfig, graph: &'a Graph, provider: &'a P, store: &'a S) -> Self {
        Self {
            graph,
            provider,
            store,
            stack: config.project.name.clone(),
            environment: config.project.environment.clone(),
            config_hash: ConfigHasher::new().hash_config(config),
            execution: config.execution.clone(),
            outputs: default_outputs(&config.outputs),
            planner: Planner::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the cancellation token passed to the executor.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the executor pool size.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.execution.max_parallel = max_parallel;
        self
    }

    /// Converges live resources toward the declared graph.
    ///
    /// Per-node failures are reported, not returned; use
    /// [`ApplyReport::ensure_converged`] to turn them into an error.
    ///
    /// # Errors
    ///
    /// Returns an error if outputs name undeclared nodes, the lock is held by
    /// someone else, state cannot be read, or recorded dependencies are
    /// corrupt.
    pub async fn apply(&self) -> Result<ApplyReport> {
        validate_outputs(self.graph, &self.outputs)?;
        info!(stack = %self.stack, environment = %self.environment, "Starting reconciliation");
        self.locked("apply", || self.run(self.graph, RunOperation::Apply)).await
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`Self::apply`].
    pub async fn destroy(&self) -> Result<ApplyReport> {
        info!(stack = %self.stack, environment = %self.environment, "Starting destroy");
        let empty = Graph::empty();
        self.locked("destroy", || self.run(&empty, RunOperation::Destroy)).await
    }

    /// Computes the plan an apply would execute, without writing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or is corrupt.
    pub async fn plan_only(&self) -> Result<Plan> {
        let mut state = self.load().await?;
        self.refresh(&mut state, false).await;
        Ok(self.planner.plan(self.graph, &state, &self.config_hash)?)
    }

    /// Computes the plan a destroy would execute.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or is corrupt.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let state = self.load().await?;
        Ok(self.planner.plan(&Graph::empty(), &state, &self.config_hash)?)
    }

    /// Refreshes and plans without applying or writing.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or is corrupt.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(stack = %self.stack, environment = %self.environment, "Checking for drift");
        let mut state = self.load().await?;
        let refresh = self.refresh(&mut state, false).await;
        let plan = self.planner.plan(self.graph, &state, &self.config_hash)?;
        Ok(DriftReport {
            refresh,
            plan,
            total_resources: self.graph.len(),
        })
    }

    /// Resolves outputs from recorded state.
    ///
    /// # Errors
    ///
    /// Returns an output error if a bound node is not reconciled.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let state = self.load().await?;
        Ok(resolve_outputs(&state, &self.outputs)?)
    }

    /// Runs `body` under the stack lock, releasing it on every path.
    async fn locked<F, Fut>(&self, operation: &str, body: F) -> Result<ApplyReport>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ApplyReport>>,
    {
        let lock = self.store.acquire_lock(&generate_holder_id(), operation).await?;
        debug!(holder = %lock.holder, lock_id = %lock.lock_id, "Acquired state lock");

        let outcome = body().await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(lock_id = %lock.lock_id, error = %e, "Failed to release state lock");
        }
        outcome
    }

    async fn run(&self, graph: &Graph, operation: RunOperation) -> Result<ApplyReport> {
        let mut state = self.load().await?;
        let refresh = self.refresh(&mut state, true).await;
        let plan = self.planner.plan(graph, &state, &self.config_hash)?;
        info!("Plan: {}", plan.summary());

        let run_id = uuid::Uuid::new_v4().to_string();
        let executor = PlanExecutor::new(self.provider, self.store, &self.execution)
            .with_stack(format!("{}-{}", self.stack, self.environment))
            .with_run_id(run_id.as_str())
            .with_cancellation(self.cancel.clone());
        let result = executor.execute(&plan).await?;

        let record = RunRecord {
            run_id: run_id.clone(),
            timestamp: Utc::now(),
            operation,
            config_hash: self.config_hash.clone(),
            actions: plan.len(),
            succeeded: result.succeeded.len(),
            failed: result.failed.keys().cloned().collect(),
            skipped: result.skipped.len(),
            cancelled: result.cancelled.len(),
        };
        self.store.record_run(&record).await?;

        let (outputs, output_error) = if operation == RunOperation::Apply && result.is_success() {
            let state = self.load().await?;
            match resolve_outputs(&state, &self.outputs) {
                Ok(outputs) => (Some(outputs), None),
                Err(e) => {
                    warn!(error = %e, "Outputs unavailable");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        info!(run_id = %run_id, "Reconciliation finished: {}", result.summary());
        Ok(ApplyReport {
            run_id,
            refresh,
            plan,
            result,
            outputs,
            output_error,
        })
    }

    async fn load(&self) -> Result<StackState> {
        let state = self
            .store
            .load()
            .await?
            .unwrap_or_else(|| StackState::new(&self.stack, &self.environment));
        if state.stack != self.stack || state.environment != self.environment {
            return Err(TieredError::internal(format!(
                "state belongs to {}/{}, not {}/{}",
                state.stack, state.environment, self.stack, self.environment
            )));
        }
        Ok(state)
    }

    /// Reads every recorded resource and folds the answers into `state`.
    ///
    /// With `persist`, changed entries are written back to the store.
    async fn refresh(&self, state: &mut StackState, persist: bool) -> RefreshSummary {
        let handles: Vec<ResourceHandle> = state
            .resources
            .values()
            .filter(|r| r.status != ResourceStatus::Deleted)
            .map(ResourceHandle::from_observed)
            .collect();
        debug!(resources = handles.len(), "Refreshing recorded state");

        let reads: Vec<_> = stream::iter(handles)
            .map(|handle| async move {
                let read = self.provider.read(&handle).await;
                (handle.node_id, read)
            })
            .buffer_unordered(self.execution.max_parallel.max(1))
            .collect()
            .await;

        let mut summary = RefreshSummary::default();
        for (node_id, read) in reads {
            let Some(resource) = state.resources.get_mut(&node_id) else {
                continue;
            };
            match read {
                Ok(None) => {
                    warn!(node = %node_id, id = %resource.provider_id, "Resource no longer exists");
                    resource.status = ResourceStatus::Deleted;
                    summary.missing.push(node_id.clone());
                }
                Ok(Some(computed)) => {
                    let changed = computed
                        .iter()
                        .any(|(k, v)| resource.attributes.get(k) != Some(v));
                    if changed {
                        warn!(node = %node_id, "Provider-computed attributes changed");
                        summary.changed.push(node_id.clone());
                    }
                    resource.attributes.extend(computed);
                }
                Err(e) => {
                    warn!(node = %node_id, error = %e, "Could not read resource, keeping recorded entry");
                    summary.unreadable.push(node_id);
                    continue;
                }
            }
            resource.last_synced_at = Utc::now();

            if persist {
                if let Err(e) = self.store.save(resource).await {
                    warn!(node = %resource.node_id, error = %e, "Failed to record refreshed resource");
                    summary.unrecorded.push(node_id);
                }
            }
        }

        summary.missing.sort();
        summary.changed.sort();
        summary.unreadable.sort();
        summary.unrecorded.sort();
        summary
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected - state is converged");
        }
        writeln!(f, "Drift detected:")?;
        for node in &self.refresh.missing {
            writeln!(f, "  - {node}: deleted outside of this tool")?;
        }
        for node in &self.refresh.changed {
            writeln!(f, "  - {node}: provider attributes changed")?;
        }
        write!(f, "Plan to restore: {}", self.plan.summary())
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_converged() { "converged" } else { "incomplete" };
        writeln!(f, "Reconciliation {status}: {}", self.result.summary())?;
        for (node, error) in &self.result.failed {
            writeln!(f, "  failed  {node}: {error}")?;
        }
        for node in &self.result.skipped {
            writeln!(f, "  skipped {node}")?;
        }
        for node in &self.refresh.unrecorded {
            writeln!(f, "  refresh of {node} not recorded")?;
        }
        if let Some(error) = &self.output_error {
            writeln!(f, "  outputs unavailable: {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::tests::sample_config;
    use crate::error::StateError;
    use crate::graph::{Attributes, ResourceKind, SecretValue};
    use crate::planner::ActionKind;
    use crate::provider::{ProviderOperation, ResourceRequest, SimulatedCloud};
    use crate::state::{MemoryStateStore, ObservedResource};
    use crate::topology::{TwoTierTopology, ids};
    use serde_json::json;

    fn fast(mut config: DeployConfig) -> DeployConfig {
        config.execution.base_delay_ms = 1;
        config.execution.max_delay_ms = 4;
        config.execution.max_attempts = 3;
        config
    }

    fn graph_for(config: &DeployConfig) -> Graph {
        TwoTierTopology::new(config, SecretValue::new("correct-horse"))
            .build()
            .expect("graph")
    }

    #[tokio::test]
    async fn test_apply_converges_and_resolves_outputs() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);

        let report = reconciler.apply().await.expect("apply");
        report.ensure_converged().expect("converged");
        assert_eq!(report.plan.count(ActionKind::Create), 21);

        let outputs = report.outputs.expect("outputs");
        assert_eq!(outputs.len(), 5);
        assert!(outputs["load_balancer_dns_name"].as_str().is_some_and(|d| d.ends_with("elb.amazonaws.com")));
        assert!(outputs["vpc_id"].as_str().is_some_and(|id| id.starts_with("vpc-")));

        assert!(!store.is_locked().await.expect("lock state"));
        let state = store.snapshot().await.expect("state");
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].succeeded, 21);
        assert!(reconciler.plan_only().await.expect("plan").is_empty());
    }

    #[tokio::test]
    async fn test_second_apply_makes_no_calls() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);
        reconciler.apply().await.expect("first apply");
        let calls = cloud.calls().len();

        let report = reconciler.apply().await.expect("second apply");
        assert!(report.plan.is_empty());
        assert_eq!(report.plan.noop_count, 21);
        let mutations = cloud.calls()[calls..]
            .iter()
            .filter(|c| c.operation != ProviderOperation::Read)
            .count();
        assert_eq!(mutations, 0);
    }

    #[tokio::test]
    async fn test_unrecorded_refresh_is_reported() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);
        reconciler.apply().await.expect("first apply");

        store.fail_writes_for(ids::VPC).await;
        let report = reconciler.apply().await.expect("second apply");

        let vpc = NodeId::from(ids::VPC);
        assert!(report.plan.is_empty());
        assert_eq!(report.refresh.unrecorded, vec![vpc.clone()]);
        assert!(report.refresh.unreadable.is_empty());
        assert!(report.to_string().contains(&format!("refresh of {vpc} not recorded")));
    }

    #[tokio::test]
    async fn test_out_of_band_deletion_is_recovered() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);
        reconciler.apply().await.expect("apply");

        let web_1 = NodeId::from(ids::WEB_1);
        assert!(cloud.remove_out_of_band(&web_1));

        let drift = reconciler.check_drift().await.expect("drift");
        assert!(drift.has_drift());
        assert_eq!(drift.refresh.missing, vec![web_1.clone()]);
        assert!(drift.plan.actions_for(&web_1).iter().any(|a| a.kind == ActionKind::Create));

        let report = reconciler.apply().await.expect("repair");
        report.ensure_converged().expect("converged");
        assert!(cloud.has_node(&web_1));
        assert!(reconciler.check_drift().await.expect("drift").is_converged());
    }

    #[tokio::test]
    async fn test_computed_attribute_drift_updates_outputs() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);
        reconciler.apply().await.expect("apply");

        cloud.tamper(&NodeId::from(ids::WEB_2), "public_ip", json!("54.9.9.9"));
        let report = reconciler.apply().await.expect("refresh");

        assert_eq!(report.refresh.changed, vec![NodeId::from(ids::WEB_2)]);
        let outputs = report.outputs.expect("outputs");
        assert_eq!(outputs["web_2_public_ip"], json!("54.9.9.9"));
    }

    #[tokio::test]
    async fn test_immutable_change_replaces_dependents() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        Reconciler::new(&config, &graph, &cloud, &store)
            .apply()
            .await
            .expect("apply");
        let before = store.snapshot().await.expect("state");

        let mut changed = config.clone();
        changed.network.public_subnets[0].cidr = String::from("10.0.3.0/24");
        let changed_graph = graph_for(&changed);
        let reconciler = Reconciler::new(&changed, &changed_graph, &cloud, &store);

        let report = reconciler.apply().await.expect("replace");
        report.ensure_converged().expect("converged");

        let after = store.snapshot().await.expect("state");
        // The load balancer lists the subnet, so it cannot outlive it.
        for id in [
            ids::PUBLIC_SUBNET_A,
            ids::ROUTE_ASSOC_A,
            ids::WEB_1,
            ids::ATTACH_WEB_1,
            ids::LOAD_BALANCER,
            ids::LISTENER,
        ] {
            let node = NodeId::from(id);
            assert_ne!(
                before.get(&node).map(|r| &r.provider_id),
                after.get(&node).map(|r| &r.provider_id),
                "{id} should have been replaced"
            );
        }
        for id in [ids::PUBLIC_SUBNET_B, ids::WEB_2, ids::TARGET_GROUP, ids::DB_INSTANCE] {
            let node = NodeId::from(id);
            assert_eq!(before.get(&node).map(|r| &r.provider_id), after.get(&node).map(|r| &r.provider_id));
        }
        assert_eq!(report.plan.count(ActionKind::Update), 0);
        assert_eq!(report.result.failed.len(), 0);
        assert_eq!(cloud.resource_count(), 21);
        assert!(reconciler.plan_only().await.expect("plan").is_empty());
    }

    #[tokio::test]
    async fn test_orphan_is_deleted() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);
        reconciler.apply().await.expect("apply");

        let vpc_id = store
            .snapshot()
            .await
            .and_then(|s| s.get(&NodeId::from(ids::VPC)).map(|r| r.provider_id.clone()))
            .expect("vpc id");
        let legacy = NodeId::from("security_group.legacy");
        let attributes: Attributes = [
            (String::from("group_name"), json!("shop-prod-legacy")),
            (String::from("group_description"), json!("old rules")),
            (String::from("vpc_id"), json!(vpc_id)),
        ]
        .into_iter()
        .collect();
        let created = cloud
            .create(&ResourceRequest {
                node_id: legacy.clone(),
                kind: ResourceKind::SecurityGroup,
                attributes: attributes.clone(),
                client_token: String::from("legacy"),
            })
            .await
            .expect("create legacy");
        store
            .save(
                &ObservedResource::created(legacy.clone(), ResourceKind::SecurityGroup, created.provider_id, attributes)
                    .with_depends_on([NodeId::from(ids::VPC)].into_iter().collect()),
            )
            .await
            .expect("record legacy");

        let report = reconciler.apply().await.expect("apply");
        report.ensure_converged().expect("converged");
        assert_eq!(report.plan.len(), 1);
        assert!(!cloud.has_node(&legacy));
        assert!(store.snapshot().await.expect("state").get(&legacy).is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_and_lock_released() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        cloud.fail_fatal(ids::DB_INSTANCE, ProviderOperation::Create);
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);

        let report = reconciler.apply().await.expect("apply");
        let err = report.ensure_converged().expect_err("db failed");
        assert!(matches!(
            err,
            TieredError::Reconcile(ReconcileError::PartialFailure { failed: 1, skipped: 0 })
        ));
        assert!(report.outputs.is_none());
        assert!(!store.is_locked().await.expect("lock state"));

        let state = store.snapshot().await.expect("state");
        assert_eq!(state.history[0].failed, vec![NodeId::from(ids::DB_INSTANCE)]);
        assert_eq!(state.resources.len(), 20);
    }

    #[tokio::test]
    async fn test_locked_stack_is_not_touched() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        store.acquire_lock("someone-else", "apply").await.expect("lock");

        let err = Reconciler::new(&config, &graph, &cloud, &store)
            .apply()
            .await
            .expect_err("locked");
        assert!(matches!(err, TieredError::State(StateError::LockedByOther { .. })));
        assert!(cloud.calls().is_empty());
        assert!(store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_cancelled_apply_is_reported() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let token = CancellationToken::new();
        token.cancel();

        let report = Reconciler::new(&config, &graph, &cloud, &store)
            .with_cancellation(token)
            .apply()
            .await
            .expect("apply");

        let err = report.ensure_converged().expect_err("cancelled");
        assert!(matches!(err, TieredError::Reconcile(ReconcileError::Cancelled { completed: 0 })));
        assert_eq!(report.result.cancelled.len(), 21);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let config = fast(sample_config());
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let reconciler = Reconciler::new(&config, &graph, &cloud, &store);
        reconciler.apply().await.expect("apply");

        assert_eq!(reconciler.plan_destroy().await.expect("plan").len(), 21);
        let report = reconciler.destroy().await.expect("destroy");
        report.ensure_converged().expect("destroyed");

        assert_eq!(cloud.resource_count(), 0);
        let state = store.snapshot().await.expect("state");
        assert!(state.is_empty());
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].operation, RunOperation::Destroy);
        assert!(matches!(
            reconciler.outputs().await,
            Err(TieredError::Output(crate::error::OutputError::NodeNotReconciled { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unknown_output_node_is_rejected_before_locking() {
        let mut config = fast(sample_config());
        config.outputs[0].node = String::from("cache_cluster.main");
        let graph = graph_for(&config);
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");

        let err = Reconciler::new(&config, &graph, &cloud, &store)
            .apply()
            .await
            .expect_err("unknown node");
        assert!(matches!(err, TieredError::Output(crate::error::OutputError::UnknownNode { .. })));
        assert!(cloud.calls().is_empty());
    }
}
