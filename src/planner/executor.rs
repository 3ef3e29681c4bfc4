//! Plan executor.
//!
//! Runs the actions of a plan on a bounded pool. An action is dispatched once
//! every action it depends on has succeeded; if any of them failed, was
//! skipped or was cancelled, the action is skipped without a provider call.
//! Every success is written to the state store before its dependents become
//! eligible, and references are resolved against a snapshot that only
//! reflects confirmed writes.

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ExecutionConfig};
use crate::error::{ActionError, ProviderError, Result};
use crate::graph::{Attributes, NodeId, Reference, Resolution, ResourceKind};
use crate::provider::{DeleteOutcome, ProviderAdapter, ProviderOperation, ResourceHandle, ResourceRequest};
use crate::state::{ObservedResource, ResourceStatus, StateStore};

use super::plan::{Action, ActionId, ActionKind, Plan};

/// Lifecycle of a node during one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// No resource exists.
    Absent,
    /// A create call is in progress.
    Creating,
    /// The resource exists.
    Created,
    /// An update call is in progress.
    Updating,
    /// A delete call is in progress.
    Deleting,
    /// The last action failed.
    Failed,
    /// An action was not attempted because a dependency did not succeed.
    Skipped,
    /// An action was not attempted because the run was cancelled.
    Cancelled,
}

impl NodeState {
    /// Returns true if `next` is a legal successor.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use NodeState::{Absent, Cancelled, Created, Creating, Deleting, Failed, Skipped, Updating};
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating | Updating, Created)
                | (Created, Updating | Deleting)
                | (Deleting, Absent)
                | (Creating | Updating | Deleting, Failed | Cancelled)
                | (Absent | Created, Skipped | Cancelled)
        )
    }

    /// Returns true if no call is in progress.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per action, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound of the computed delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Builds the policy from executor settings.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    ///
    /// A provider hint longer than the computed delay wins.
    #[must_use]
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        hint.map_or(backoff, |h| h.max(backoff))
    }
}

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Provider call and state write succeeded.
    Succeeded,
    /// The action failed.
    Failed,
    /// A dependency did not succeed.
    Skipped,
    /// The run was cancelled first.
    Cancelled,
}

/// Log entry for one action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Action id in the plan.
    pub action_id: ActionId,
    /// Node.
    pub node_id: NodeId,
    /// Action kind.
    pub kind: ActionKind,
    /// Result.
    pub status: OutcomeStatus,
    /// Provider attempts made.
    pub attempts: u32,
    /// Provider identifier after the action.
    pub provider_id: Option<String>,
    /// Error message for failures.
    pub error: Option<String>,
    /// Wall time spent, in milliseconds.
    pub duration_ms: u64,
}

/// Per-node report of one run.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    /// Nodes whose actions all succeeded.
    pub succeeded: BTreeSet<NodeId>,
    /// Nodes with a failed action.
    pub failed: BTreeMap<NodeId, ActionError>,
    /// Nodes not attempted because a dependency did not succeed.
    pub skipped: BTreeSet<NodeId>,
    /// Nodes not attempted because the run was cancelled.
    pub cancelled: BTreeSet<NodeId>,
    /// Final lifecycle state of every touched node.
    pub node_states: BTreeMap<NodeId, NodeState>,
    /// Action log in completion order.
    pub outcomes: Vec<ActionOutcome>,
}

impl ReconciliationResult {
    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
    }

    /// Returns true if the run was cut short by cancellation.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }

    /// Returns the number of actions that reached a terminal state.
    #[must_use]
    pub fn completed_actions(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Succeeded | OutcomeStatus::Failed))
            .count()
    }

    /// Returns the outcome log of one node.
    #[must_use]
    pub fn outcomes_for(&self, node: &NodeId) -> Vec<&ActionOutcome> {
        self.outcomes.iter().filter(|o| &o.node_id == node).collect()
    }

    /// Returns a one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped, {} cancelled",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.cancelled.len()
        )
    }

    fn finish(&mut self) {
        let mut by_node: BTreeMap<&NodeId, Vec<&ActionOutcome>> = BTreeMap::new();
        for outcome in &self.outcomes {
            by_node.entry(&outcome.node_id).or_default().push(outcome);
        }
        for (node, outcomes) in by_node {
            let has = |status: OutcomeStatus| outcomes.iter().any(|o| o.status == status);
            if self.failed.contains_key(node) {
                continue;
            }
            if has(OutcomeStatus::Cancelled) {
                self.cancelled.insert(node.clone());
            } else if has(OutcomeStatus::Skipped) {
                self.skipped.insert(node.clone());
            } else {
                self.succeeded.insert(node.clone());
            }
        }
    }
}

/// Owned inputs of one dispatched action.
struct Task {
    action_id: ActionId,
    node_id: NodeId,
    kind: ActionKind,
    resource_kind: ResourceKind,
    request: Option<ResourceRequest>,
    handle: Option<ResourceHandle>,
    record: Attributes,
    depends_on: BTreeSet<NodeId>,
    desired_hash: String,
    client_token: String,
}

/// What a finished task reports back.
struct TaskResult {
    action_id: ActionId,
    attempts: u32,
    elapsed: Duration,
    result: std::result::Result<Option<ObservedResource>, ActionError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting,
    Running,
    Done(OutcomeStatus),
}

/// Executor for reconciliation plans.
pub struct PlanExecutor<'a, P: ?Sized, S: ?Sized> {
    /// Provider adapter.
    provider: &'a P,
    /// State store.
    store: &'a S,
    /// Stack identity, part of every client token.
    stack: String,
    /// Run identifier, part of every client token.
    run_id: String,
    /// Maximum number of actions in flight.
    max_parallel: usize,
    /// Retry policy for transient failures.
    retry: RetryPolicy,
    /// Stops dispatch when triggered.
    cancel: CancellationToken,
    hasher: ConfigHasher,
}

impl<P: ?Sized, S: ?Sized> fmt::Debug for PlanExecutor<'_, P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("stack", &self.stack)
            .field("run_id", &self.run_id)
            .field("max_parallel", &self.max_parallel)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<'a, P, S> PlanExecutor<'a, P, S>
where
    P: ProviderAdapter + ?Sized,
    S: StateStore + ?Sized,
{
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: &'a P, store: &'a S, config: &ExecutionConfig) -> Self {
        Self {
            provider,
            store,
            stack: String::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
            max_parallel: config.max_parallel.max(1),
            retry: RetryPolicy::from_config(config),
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the stack identity used in client tokens.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Sets the run identifier.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the pool size.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Returns the run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Executes a plan.
    ///
    /// Per-node failures are reported in the result; the call itself only
    /// fails if the initial state snapshot cannot be loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store cannot be read.
    pub async fn execute(&self, plan: &Plan) -> Result<ReconciliationResult> {
        let mut result = ReconciliationResult::default();
        if plan.is_empty() {
            return Ok(result);
        }

        info!(
            run_id = %self.run_id,
            actions = plan.len(),
            max_parallel = self.max_parallel,
            "Executing plan"
        );

        let mut snapshot: BTreeMap<NodeId, ObservedResource> = self
            .store
            .load()
            .await?
            .map(|s| s.resources)
            .unwrap_or_default();

        // A node's first action tells whether a record exists for it.
        let mut states: HashMap<NodeId, NodeState> = HashMap::new();
        for action in &plan.actions {
            states.entry(action.node_id.clone()).or_insert(match action.kind {
                ActionKind::Create => NodeState::Absent,
                _ => NodeState::Created,
            });
        }

        let mut slots = vec![Slot::Waiting; plan.actions.len()];
        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            if !cancelled {
                for action in &plan.actions {
                    if slots[action.id] != Slot::Waiting {
                        continue;
                    }
                    let deps: Vec<Slot> = action.depends_on.iter().map(|&d| slots[d]).collect();
                    if deps.iter().any(|s| matches!(s, Slot::Done(st) if *st != OutcomeStatus::Succeeded)) {
                        warn!(node = %action.node_id, action = %action.kind, "Skipping, a dependency did not succeed");
                        slots[action.id] = Slot::Done(OutcomeStatus::Skipped);
                        settle(&mut states, &action.node_id, NodeState::Skipped);
                        result.outcomes.push(idle_outcome(action, OutcomeStatus::Skipped));
                        continue;
                    }
                    let ready = deps.iter().all(|s| *s == Slot::Done(OutcomeStatus::Succeeded));
                    let busy = states.get(&action.node_id).is_some_and(|s| !s.is_settled());
                    if !ready || busy || in_flight.len() >= self.max_parallel {
                        continue;
                    }

                    match self.prepare(action, &snapshot, &mut states) {
                        Ok(task) => {
                            debug!(node = %action.node_id, action = %action.kind, "Dispatching");
                            slots[action.id] = Slot::Running;
                            in_flight.push(self.run(task));
                        }
                        Err(err) => {
                            error!(node = %action.node_id, error = %err, "Action could not start");
                            slots[action.id] = Slot::Done(OutcomeStatus::Failed);
                            settle(&mut states, &action.node_id, NodeState::Failed);
                            let mut outcome = idle_outcome(action, OutcomeStatus::Failed);
                            outcome.error = Some(err.to_string());
                            result.outcomes.push(outcome);
                            result.failed.insert(action.node_id.clone(), err);
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                let waiting = slots.iter().any(|s| *s == Slot::Waiting);
                if cancelled || !waiting {
                    break;
                }
                // Skips recorded in this pass may unblock further skips.
                continue;
            }

            tokio::select! {
                Some(done) = in_flight.next() => {
                    let action = &plan.actions[done.action_id];
                    let status = self.complete(action, done, &mut snapshot, &mut states, &mut result);
                    slots[action.id] = Slot::Done(status);
                }
                () = self.cancel.cancelled(), if !cancelled => {
                    warn!(in_flight = in_flight.len(), "Cancellation requested, letting in-flight actions finish");
                    cancelled = true;
                }
                else => break,
            }
        }

        for action in &plan.actions {
            if slots[action.id] == Slot::Waiting {
                settle(&mut states, &action.node_id, NodeState::Cancelled);
                result.outcomes.push(idle_outcome(action, OutcomeStatus::Cancelled));
            }
        }

        result.node_states = states.into_iter().collect();
        result.finish();
        info!(run_id = %self.run_id, "{}", result.summary());
        Ok(result)
    }

    /// Resolves an action against the snapshot and moves its node in progress.
    fn prepare(
        &self,
        action: &Action,
        snapshot: &BTreeMap<NodeId, ObservedResource>,
        states: &mut HashMap<NodeId, NodeState>,
    ) -> std::result::Result<Task, ActionError> {
        let target = match action.kind {
            ActionKind::Create => NodeState::Creating,
            ActionKind::Update => NodeState::Updating,
            ActionKind::Delete | ActionKind::Noop => NodeState::Deleting,
        };
        let current = states.get(&action.node_id).copied().unwrap_or(NodeState::Absent);
        if !current.can_transition_to(target) {
            return Err(ActionError::IllegalTransition {
                node: action.node_id.clone(),
                from: current.to_string(),
                to: target.to_string(),
            });
        }

        let recorded = snapshot.get(&action.node_id);
        let handle = recorded.map(ResourceHandle::from_observed).or_else(|| {
            action.provider_id.as_ref().map(|id| ResourceHandle {
                node_id: action.node_id.clone(),
                kind: action.resource_kind,
                provider_id: id.clone(),
                attributes: Attributes::new(),
            })
        });

        let mut task = Task {
            action_id: action.id,
            node_id: action.node_id.clone(),
            kind: action.kind,
            resource_kind: action.resource_kind,
            request: None,
            handle,
            record: Attributes::new(),
            depends_on: BTreeSet::new(),
            desired_hash: String::new(),
            client_token: String::new(),
        };

        if let Some(node) = &action.node {
            let lookup = |reference: &Reference| {
                snapshot
                    .get(&reference.node)
                    .filter(|r| r.is_live())
                    .and_then(|r| r.attribute(&reference.attribute))
            };
            let unresolved = |e: crate::graph::Unresolved| ActionError::UnresolvedReference {
                reference: e.0.to_string(),
            };
            let attributes = node
                .resolve_attributes(&lookup, Resolution::ForProvider)
                .map_err(unresolved)?;
            task.record = node
                .resolve_attributes(&lookup, Resolution::ForState)
                .map_err(unresolved)?;
            task.desired_hash = self.hasher.hash_attributes(&task.record);
            task.depends_on = node.edges();
            task.client_token = self.token(action, &task.desired_hash);
            task.request = Some(ResourceRequest {
                node_id: action.node_id.clone(),
                kind: action.resource_kind,
                attributes,
                client_token: task.client_token.clone(),
            });
        } else {
            let provider_id = task.handle.as_ref().map(|h| h.provider_id.clone()).unwrap_or_default();
            task.client_token = self.token(action, &provider_id);
        }

        if action.kind != ActionKind::Create && task.handle.is_none() {
            return Err(ActionError::Provider {
                source: ProviderError::NotFound {
                    provider_id: String::new(),
                },
                attempts: 0,
            });
        }

        states.insert(action.node_id.clone(), target);
        Ok(task)
    }

    fn token(&self, action: &Action, discriminator: &str) -> String {
        let op = match action.kind {
            ActionKind::Create => ProviderOperation::Create,
            ActionKind::Update => ProviderOperation::Update,
            ActionKind::Delete | ActionKind::Noop => ProviderOperation::Delete,
        };
        self.hasher.client_token(&[
            &self.stack,
            &self.run_id,
            action.node_id.as_str(),
            op.as_str(),
            discriminator,
        ])
    }

    /// Calls the provider with retries, then records the result.
    async fn run(&self, task: Task) -> TaskResult {
        let started = Instant::now();
        let (attempts, result) = match task.kind {
            ActionKind::Create => self.run_create(&task).await,
            ActionKind::Update => self.run_update(&task).await,
            ActionKind::Delete | ActionKind::Noop => self.run_delete(&task).await,
        };
        TaskResult {
            action_id: task.action_id,
            attempts,
            elapsed: started.elapsed(),
            result,
        }
    }

    async fn run_create(&self, task: &Task) -> (u32, std::result::Result<Option<ObservedResource>, ActionError>) {
        let Some(request) = &task.request else {
            return (0, Err(missing_request(task)));
        };
        let (attempts, created) = self
            .with_retry(&task.node_id, ProviderOperation::Create, || self.provider.create(request))
            .await;
        let created = match created {
            Ok(created) => created,
            Err(err) => return (attempts, Err(self.record_unfinished(task, err).await)),
        };

        let mut attributes = task.record.clone();
        attributes.extend(created.attributes);
        let resource = ObservedResource::created(
            task.node_id.clone(),
            task.resource_kind,
            created.provider_id,
            attributes,
        )
        .with_depends_on(task.depends_on.clone())
        .with_desired_hash(task.desired_hash.clone());

        (attempts, self.save(resource).await.map(Some))
    }

    /// Records a resource the provider created but could not finish as
    /// `Pending`, so the next plan replaces it instead of leaking it.
    async fn record_unfinished(&self, task: &Task, err: ActionError) -> ActionError {
        let ActionError::Provider { source, .. } = &err else {
            return err;
        };
        let Some(provider_id) = source.orphaned_id() else {
            return err;
        };

        let resource = ObservedResource::created(
            task.node_id.clone(),
            task.resource_kind,
            provider_id,
            task.record.clone(),
        )
        .with_depends_on(task.depends_on.clone())
        .with_desired_hash(task.desired_hash.clone())
        .with_status(ResourceStatus::Pending);

        match self.save(resource).await {
            Ok(_) => {
                warn!(node = %task.node_id, id = %provider_id, "Recorded unfinished resource as pending");
                err
            }
            Err(write) => {
                error!(node = %task.node_id, id = %provider_id, error = %write, "Unfinished resource is unrecorded");
                write
            }
        }
    }

    async fn run_update(&self, task: &Task) -> (u32, std::result::Result<Option<ObservedResource>, ActionError>) {
        let (Some(request), Some(handle)) = (&task.request, &task.handle) else {
            return (0, Err(missing_request(task)));
        };
        let (attempts, computed) = self
            .with_retry(&task.node_id, ProviderOperation::Update, || {
                self.provider.update(handle, request)
            })
            .await;
        let computed = match computed {
            Ok(computed) => computed,
            Err(err) => return (attempts, Err(err)),
        };

        let mut attributes = task.record.clone();
        attributes.extend(computed);
        let resource = ObservedResource::created(
            task.node_id.clone(),
            task.resource_kind,
            handle.provider_id.clone(),
            attributes,
        )
        .with_depends_on(task.depends_on.clone())
        .with_desired_hash(task.desired_hash.clone());

        (attempts, self.save(resource).await.map(Some))
    }

    async fn run_delete(&self, task: &Task) -> (u32, std::result::Result<Option<ObservedResource>, ActionError>) {
        let Some(handle) = &task.handle else {
            return (0, Err(missing_request(task)));
        };
        let (attempts, outcome) = self
            .with_retry(&task.node_id, ProviderOperation::Delete, || {
                self.provider.delete(handle, &task.client_token)
            })
            .await;
        match outcome {
            Ok(DeleteOutcome::NotFound) => {
                debug!(node = %task.node_id, id = %handle.provider_id, "Already gone");
            }
            Ok(DeleteOutcome::Deleted) => {}
            Err(err) => return (attempts, Err(err)),
        }

        let removed = self
            .store
            .remove(&task.node_id)
            .await
            .map(|()| None)
            .map_err(|e| ActionError::StateWrite {
                message: e.to_string(),
            });
        (attempts, removed)
    }

    async fn save(&self, resource: ObservedResource) -> std::result::Result<ObservedResource, ActionError> {
        self.store
            .save(&resource)
            .await
            .map_err(|e| ActionError::StateWrite {
                message: e.to_string(),
            })?;
        Ok(resource)
    }

    /// Retries transient failures with capped exponential backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        node: &NodeId,
        operation: ProviderOperation,
        mut call: F,
    ) -> (u32, std::result::Result<T, ActionError>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return (attempt, Ok(value)),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, err.retry_after());
                    warn!(
                        node = %node,
                        operation = %operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {
                            return (attempt, Err(ActionError::Abandoned { attempts: attempt }));
                        }
                    }
                }
                Err(err) => {
                    return (
                        attempt,
                        Err(ActionError::Provider {
                            source: err,
                            attempts: attempt,
                        }),
                    );
                }
            }
        }
    }

    /// Applies a finished task to the snapshot and the report.
    fn complete(
        &self,
        action: &Action,
        done: TaskResult,
        snapshot: &mut BTreeMap<NodeId, ObservedResource>,
        states: &mut HashMap<NodeId, NodeState>,
        result: &mut ReconciliationResult,
    ) -> OutcomeStatus {
        let mut outcome = ActionOutcome {
            action_id: action.id,
            node_id: action.node_id.clone(),
            kind: action.kind,
            status: OutcomeStatus::Succeeded,
            attempts: done.attempts,
            provider_id: None,
            error: None,
            duration_ms: u64::try_from(done.elapsed.as_millis()).unwrap_or(u64::MAX),
        };

        match done.result {
            Ok(Some(resource)) => {
                info!(node = %action.node_id, action = %action.kind, id = %resource.provider_id, "Action succeeded");
                outcome.provider_id = Some(resource.provider_id.clone());
                snapshot.insert(action.node_id.clone(), resource);
                settle(states, &action.node_id, NodeState::Created);
            }
            Ok(None) => {
                info!(node = %action.node_id, action = %action.kind, "Action succeeded");
                snapshot.remove(&action.node_id);
                settle(states, &action.node_id, NodeState::Absent);
            }
            Err(ActionError::Abandoned { attempts }) => {
                warn!(node = %action.node_id, attempts, "Retry abandoned by cancellation");
                outcome.status = OutcomeStatus::Cancelled;
                outcome.error = Some(ActionError::Abandoned { attempts }.to_string());
                settle(states, &action.node_id, NodeState::Cancelled);
            }
            Err(err) => {
                error!(node = %action.node_id, action = %action.kind, attempts = done.attempts, error = %err, "Action failed");
                outcome.status = OutcomeStatus::Failed;
                outcome.error = Some(err.to_string());
                settle(states, &action.node_id, NodeState::Failed);
                result.failed.insert(action.node_id.clone(), err);
            }
        }

        let status = outcome.status;
        result.outcomes.push(outcome);
        status
    }
}

/// Moves a node to `next` if its lifecycle allows it.
fn settle(states: &mut HashMap<NodeId, NodeState>, node: &NodeId, next: NodeState) {
    let current = states.get(node).copied().unwrap_or(NodeState::Absent);
    if current.can_transition_to(next) {
        states.insert(node.clone(), next);
    }
}

fn idle_outcome(action: &Action, status: OutcomeStatus) -> ActionOutcome {
    ActionOutcome {
        action_id: action.id,
        node_id: action.node_id.clone(),
        kind: action.kind,
        status,
        attempts: 0,
        provider_id: None,
        error: None,
        duration_ms: 0,
    }
}

fn missing_request(task: &Task) -> ActionError {
    ActionError::Provider {
        source: ProviderError::fatal(format!("{} action for {} has no target", task.kind, task.node_id)),
        attempts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Planner;
    use crate::provider::SimulatedCloud;
    use crate::state::{MemoryStateStore, StackState};
    use crate::topology::ids;
    use crate::topology::two_tier::tests::sample_graph;
    use std::sync::Arc;

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            max_parallel: 4,
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            ..ExecutionConfig::default()
        }
    }

    async fn plan_for(store: &MemoryStateStore) -> Plan {
        let state = store
            .load()
            .await
            .expect("load")
            .unwrap_or_else(|| StackState::new("shop", "prod"));
        Planner::new().plan(&sample_graph(), &state, "h").expect("plan")
    }

    #[test]
    fn test_node_state_transitions() {
        assert!(NodeState::Absent.can_transition_to(NodeState::Creating));
        assert!(NodeState::Creating.can_transition_to(NodeState::Created));
        assert!(NodeState::Created.can_transition_to(NodeState::Deleting));
        assert!(NodeState::Deleting.can_transition_to(NodeState::Absent));
        assert!(NodeState::Updating.can_transition_to(NodeState::Failed));
        assert!(!NodeState::Absent.can_transition_to(NodeState::Updating));
        assert!(!NodeState::Absent.can_transition_to(NodeState::Deleting));
        assert!(!NodeState::Created.can_transition_to(NodeState::Creating));
        assert!(!NodeState::Failed.can_transition_to(NodeState::Skipped));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay(3, None), Duration::from_millis(350));
        assert_eq!(policy.delay(30, None), Duration::from_millis(350));
        assert_eq!(policy.delay(1, Some(Duration::from_secs(2))), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_apply_converges() {
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .with_stack("shop-prod")
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(result.succeeded.len(), 21);
        assert_eq!(cloud.resource_count(), 21);
        assert_eq!(store.write_count(), 21);
        assert!(plan_for(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_dependents_skipped() {
        let cloud = SimulatedCloud::new();
        cloud.fail_fatal(ids::DB_SUBNET_GROUP, ProviderOperation::Create);
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&plan)
            .await
            .expect("execute");

        let db_subnets = NodeId::from(ids::DB_SUBNET_GROUP);
        let db = NodeId::from(ids::DB_INSTANCE);
        assert!(result.failed.contains_key(&db_subnets));
        assert_eq!(result.failed[&db_subnets].attempts(), 1);
        assert!(result.skipped.contains(&db));
        assert!(cloud.calls_for(&db).is_empty());
        assert!(result.succeeded.contains(&NodeId::from(ids::WEB_1)));
        assert!(result.succeeded.contains(&NodeId::from(ids::LISTENER)));
        assert_eq!(result.succeeded.len(), 19);
        assert_eq!(result.node_states[&db], NodeState::Skipped);
    }

    #[tokio::test]
    async fn test_unfinished_create_is_recorded_and_replaced() {
        let cloud = SimulatedCloud::new();
        cloud.leave_unfinished(ids::WEB_1);
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&plan)
            .await
            .expect("execute");

        let web = NodeId::from(ids::WEB_1);
        assert!(matches!(
            &result.failed[&web],
            ActionError::Provider {
                source: ProviderError::Incomplete { .. },
                attempts: 1,
            }
        ));
        assert!(result.skipped.contains(&NodeId::from(ids::ATTACH_WEB_1)));
        assert_eq!(cloud.resource_count(), 20);

        let state = store.snapshot().await.expect("state");
        let recorded = state.get(&web).expect("unfinished resource recorded");
        assert_eq!(recorded.status, ResourceStatus::Pending);
        let unfinished = recorded.provider_id.clone();

        let retry = plan_for(&store).await;
        let actions = retry.actions_for(&web);
        assert!(actions.iter().any(|a| {
            a.kind == ActionKind::Delete && a.provider_id.as_deref() == Some(unfinished.as_str())
        }));
        assert!(actions.iter().any(|a| a.kind == ActionKind::Create && a.replacement));

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .with_run_id("second")
            .execute(&retry)
            .await
            .expect("execute");

        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(cloud.resource_count(), 21);
        let state = store.snapshot().await.expect("state");
        assert_ne!(state.get(&web).expect("recorded").provider_id, unfinished);
        assert!(plan_for(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let cloud = SimulatedCloud::new();
        cloud.fail_transient(ids::VPC, ProviderOperation::Create, 2);
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.is_success());
        let vpc = NodeId::from(ids::VPC);
        assert_eq!(cloud.calls_for(&vpc).len(), 3);
        assert_eq!(result.outcomes_for(&vpc)[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let cloud = SimulatedCloud::new();
        cloud.fail_transient(ids::VPC, ProviderOperation::Create, 10);
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&plan)
            .await
            .expect("execute");

        let vpc = NodeId::from(ids::VPC);
        assert_eq!(result.failed[&vpc].attempts(), 3);
        assert_eq!(result.skipped.len(), 20);
        assert_eq!(cloud.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        for limit in [1, 3] {
            let cloud = SimulatedCloud::new().with_latency(Duration::from_millis(5));
            let store = MemoryStateStore::new("shop", "prod");
            let plan = plan_for(&store).await;

            let result = PlanExecutor::new(&cloud, &store, &fast_config())
                .with_max_parallel(limit)
                .execute(&plan)
                .await
                .expect("execute");

            assert!(result.is_success());
            assert!(cloud.peak_concurrency() <= limit);
        }
    }

    #[tokio::test]
    async fn test_independent_subtrees_run_concurrently() {
        let cloud = SimulatedCloud::new().with_latency(Duration::from_millis(10));
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;

        PlanExecutor::new(&cloud, &store, &fast_config())
            .with_max_parallel(8)
            .execute(&plan)
            .await
            .expect("execute");

        assert!(cloud.peak_concurrency() > 1);
    }

    #[tokio::test]
    async fn test_failed_state_write_blocks_dependents() {
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        store.fail_writes_for(ids::VPC).await;
        let plan = plan_for(&store).await;

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&plan)
            .await
            .expect("execute");

        let vpc = NodeId::from(ids::VPC);
        assert!(matches!(result.failed[&vpc], ActionError::StateWrite { .. }));
        assert!(cloud.calls_for(&NodeId::from(ids::PUBLIC_SUBNET_A)).is_empty());
        assert_eq!(result.skipped.len(), 20);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_dispatches_nothing() {
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;
        let token = CancellationToken::new();
        token.cancel();

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .with_cancellation(token)
            .execute(&plan)
            .await
            .expect("execute");

        assert_eq!(result.cancelled.len(), 21);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_finish() {
        let cloud = Arc::new(SimulatedCloud::new().with_latency(Duration::from_millis(40)));
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;
        let token = CancellationToken::new();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .with_max_parallel(1)
            .with_cancellation(token)
            .execute(&plan)
            .await
            .expect("execute");

        assert!(result.succeeded.contains(&NodeId::from(ids::VPC)));
        assert!(result.failed.is_empty());
        assert!(result.was_cancelled());
        assert_eq!(result.succeeded.len() + result.cancelled.len(), 21);
        let recorded = store.snapshot().await.map_or(0, |s| s.resources.len());
        assert_eq!(recorded, result.succeeded.len());
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let cloud = SimulatedCloud::new();
        let store = MemoryStateStore::new("shop", "prod");
        let plan = plan_for(&store).await;
        PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&plan)
            .await
            .expect("apply");

        cloud.remove_out_of_band(&NodeId::from(ids::ATTACH_WEB_1));
        let state = store.snapshot().await.expect("state");
        let destroy = Planner::new()
            .plan(&crate::graph::Graph::empty(), &state, "h")
            .expect("plan");
        let result = PlanExecutor::new(&cloud, &store, &fast_config())
            .execute(&destroy)
            .await
            .expect("destroy");

        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(cloud.resource_count(), 0);
        assert!(store.snapshot().await.is_some_and(|s| s.is_empty()));
    }
}
