//! Deterministic in-memory cloud.
//!
//! Assigns sequential identifiers, computes the attributes a real provider
//! would (ARNs, DNS names, addresses), deduplicates creates by client token,
//! and rejects requests that reference deleted resources or delete resources
//! still referenced by others. A resource references the live resources
//! whose identifiers appear in its attributes when they were last written. Faults and latency can be injected per node
//! and operation.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::graph::{Attributes, NodeId, ResourceKind};
use crate::state::ObservedResource;

use super::adapter::{
    DeleteOutcome, ProviderAdapter, ProviderOperation, ProvisionedResource, ResourceHandle,
    ResourceRequest,
};

/// A fault armed for one node and operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail transiently this many more times, then succeed.
    Transient {
        /// Remaining failures.
        remaining: u32,
        /// Retry hint returned with each failure.
        retry_after: Option<Duration>,
    },
    /// Fail fatally on every call.
    Fatal {
        /// Error message.
        message: String,
    },
    /// Create the resource, then fail once before returning it.
    Unfinished {
        /// Error message.
        message: String,
    },
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Node addressed by the call.
    pub node_id: NodeId,
    /// Operation.
    pub operation: ProviderOperation,
}

#[derive(Debug, Clone)]
struct SimResource {
    node_id: NodeId,
    kind: ResourceKind,
    attributes: Attributes,
    computed: Attributes,
    references: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, SimResource>,
    issued: HashSet<String>,
    tokens: HashMap<String, String>,
    sequence: u64,
    faults: HashMap<(NodeId, ProviderOperation), Fault>,
    calls: Vec<CallRecord>,
}

/// Deterministic in-memory cloud provider.
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latency of every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Creates a cloud that already contains the resources recorded in state.
    #[must_use]
    pub fn seeded_from<'a>(resources: impl IntoIterator<Item = &'a ObservedResource>) -> Self {
        let cloud = Self::new();
        {
            let mut inner = cloud.lock();
            for resource in resources {
                inner.issued.insert(resource.provider_id.clone());
                inner.resources.insert(
                    resource.provider_id.clone(),
                    SimResource {
                        node_id: resource.node_id.clone(),
                        kind: resource.kind,
                        attributes: resource.attributes.clone(),
                        computed: Attributes::new(),
                        references: BTreeSet::new(),
                    },
                );
            }
            let pins: Vec<(String, BTreeSet<String>)> = inner
                .resources
                .iter()
                .map(|(id, r)| (id.clone(), inner.live_references(&r.attributes, id)))
                .collect();
            for (id, references) in pins {
                if let Some(resource) = inner.resources.get_mut(&id) {
                    resource.references = references;
                }
            }
        }
        cloud
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms a fault for a node and operation.
    pub fn inject(&self, node: impl Into<NodeId>, operation: ProviderOperation, fault: Fault) {
        self.lock().faults.insert((node.into(), operation), fault);
    }

    /// Makes the next `times` calls fail transiently.
    pub fn fail_transient(&self, node: impl Into<NodeId>, operation: ProviderOperation, times: u32) {
        self.inject(
            node,
            operation,
            Fault::Transient {
                remaining: times,
                retry_after: None,
            },
        );
    }

    /// Makes every call fail fatally.
    pub fn fail_fatal(&self, node: impl Into<NodeId>, operation: ProviderOperation) {
        self.inject(
            node,
            operation,
            Fault::Fatal {
                message: String::from("InvalidParameterValue: injected failure"),
            },
        );
    }

    /// Makes the next create of a node leave its resource unfinished.
    pub fn leave_unfinished(&self, node: impl Into<NodeId>) {
        self.inject(
            node,
            ProviderOperation::Create,
            Fault::Unfinished {
                message: String::from("Companion resource failed to stabilize"),
            },
        );
    }

    /// Deletes the resource of a node behind the reconciler's back.
    pub fn remove_out_of_band(&self, node: &NodeId) -> bool {
        let mut inner = self.lock();
        let id = inner
            .resources
            .iter()
            .find(|(_, r)| &r.node_id == node)
            .map(|(id, _)| id.clone());
        id.is_some_and(|id| inner.resources.remove(&id).is_some())
    }

    /// Overwrites a computed attribute, as a provider-side change would.
    pub fn tamper(&self, node: &NodeId, key: &str, value: Value) {
        let mut inner = self.lock();
        if let Some(resource) = inner.resources.values_mut().find(|r| &r.node_id == node) {
            resource.computed.insert(key.to_string(), value);
        }
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Returns the operations performed for one node.
    #[must_use]
    pub fn calls_for(&self, node: &NodeId) -> Vec<ProviderOperation> {
        self.lock()
            .calls
            .iter()
            .filter(|c| &c.node_id == node)
            .map(|c| c.operation)
            .collect()
    }

    /// Returns the number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns true if a live resource realizes the node.
    #[must_use]
    pub fn has_node(&self, node: &NodeId) -> bool {
        self.lock().resources.values().any(|r| &r.node_id == node)
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Records the call, applies latency and consults armed faults.
    async fn enter(&self, node: &NodeId, operation: ProviderOperation) -> Result<InFlight<'_>, ProviderError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        {
            let mut inner = self.lock();
            inner.calls.push(CallRecord {
                node_id: node.clone(),
                operation,
            });
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut inner = self.lock();
        let key = (node.clone(), operation);
        match inner.faults.get_mut(&key) {
            Some(Fault::Transient {
                remaining,
                retry_after,
            }) if *remaining > 0 => {
                *remaining -= 1;
                Err(ProviderError::Transient {
                    message: format!("Throttling: rate exceeded for {operation} {node}"),
                    retry_after: *retry_after,
                })
            }
            Some(Fault::Fatal { message }) => Err(ProviderError::fatal(message.clone())),
            _ => Ok(guard),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Fails if any string in the request names a resource that was deleted.
    ///
    /// `own_id` is skipped: name-derived identifiers reappear on replacement.
    fn check_references(&self, attributes: &Attributes, own_id: &str) -> Result<(), ProviderError> {
        fn walk(value: &Value, inner: &Inner, own_id: &str) -> Option<String> {
            match value {
                Value::String(s)
                    if s != own_id
                        && inner.issued.contains(s)
                        && !inner.resources.contains_key(s) =>
                {
                    Some(s.clone())
                }
                Value::Array(items) => items.iter().find_map(|v| walk(v, inner, own_id)),
                Value::Object(map) => map.values().find_map(|v| walk(v, inner, own_id)),
                _ => None,
            }
        }

        attributes.values().find_map(|v| walk(v, self, own_id)).map_or(Ok(()), |id| {
            Err(ProviderError::fatal(format!(
                "InvalidParameterValue: referenced resource {id} does not exist"
            )))
        })
    }

    /// Live resource identifiers named anywhere in `attributes`.
    fn live_references(&self, attributes: &Attributes, own_id: &str) -> BTreeSet<String> {
        fn walk(value: &Value, inner: &Inner, own_id: &str, out: &mut BTreeSet<String>) {
            match value {
                Value::String(s) if s != own_id && inner.resources.contains_key(s) => {
                    out.insert(s.clone());
                }
                Value::Array(items) => items.iter().for_each(|v| walk(v, inner, own_id, out)),
                Value::Object(map) => map.values().for_each(|v| walk(v, inner, own_id, out)),
                _ => {}
            }
        }

        let mut out = BTreeSet::new();
        for value in attributes.values() {
            walk(value, self, own_id, &mut out);
        }
        out
    }

    /// Fails if another live resource still references `id`.
    fn check_unreferenced(&self, id: &str) -> Result<(), ProviderError> {
        let dependent = self
            .resources
            .iter()
            .filter(|(other, _)| other.as_str() != id)
            .find(|(_, r)| r.references.contains(id));

        match dependent {
            Some((_, r)) => Err(ProviderError::fatal(format!(
                "DependencyViolation: {id} is still used by {}",
                r.node_id
            ))),
            None => Ok(()),
        }
    }
}

fn string_attr<'a>(attributes: &'a Attributes, key: &str) -> &'a str {
    attributes.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Builds the identifier and computed attributes a real provider would return.
fn provision(kind: ResourceKind, seq: u64, attributes: &Attributes) -> (String, Attributes) {
    const ACCOUNT: &str = "000000000000";
    const REGION: &str = "sim-1";
    let mut computed = Attributes::new();
    let octet_hi = (seq / 250) % 250;
    let octet_lo = seq % 250 + 1;

    let id = match kind {
        ResourceKind::Vpc => format!("vpc-{seq:08x}"),
        ResourceKind::Subnet => format!("subnet-{seq:08x}"),
        ResourceKind::InternetGateway => format!("igw-{seq:08x}"),
        ResourceKind::RouteTable => format!("rtb-{seq:08x}"),
        ResourceKind::RouteTableAssociation => format!("rtbassoc-{seq:08x}"),
        ResourceKind::SecurityGroup => {
            let id = format!("sg-{seq:08x}");
            computed.insert(String::from("group_id"), json!(id));
            id
        }
        ResourceKind::LoadBalancer => {
            let name = string_attr(attributes, "name");
            computed.insert(
                String::from("dns_name"),
                json!(format!("{name}-{seq}.{REGION}.elb.amazonaws.com")),
            );
            format!("arn:aws:elasticloadbalancing:{REGION}:{ACCOUNT}:loadbalancer/app/{name}/{seq:016x}")
        }
        ResourceKind::TargetGroup => {
            let name = string_attr(attributes, "name");
            format!("arn:aws:elasticloadbalancing:{REGION}:{ACCOUNT}:targetgroup/{name}/{seq:016x}")
        }
        ResourceKind::Listener => {
            format!("arn:aws:elasticloadbalancing:{REGION}:{ACCOUNT}:listener/app/{seq:016x}")
        }
        ResourceKind::TargetGroupAttachment => format!(
            "{}|{}",
            string_attr(attributes, "target_group_arn"),
            string_attr(attributes, "target_id")
        ),
        ResourceKind::Instance => {
            computed.insert(
                String::from("public_ip"),
                json!(format!("54.0.{octet_hi}.{octet_lo}")),
            );
            computed.insert(
                String::from("private_ip"),
                json!(format!("10.0.{octet_hi}.{octet_lo}")),
            );
            format!("i-{seq:017x}")
        }
        ResourceKind::DbSubnetGroup => string_attr(attributes, "db_subnet_group_name").to_lowercase(),
        ResourceKind::DbInstance => {
            let ident = string_attr(attributes, "db_instance_identifier").to_lowercase();
            computed.insert(
                String::from("address"),
                json!(format!("{ident}.c{seq:08x}.{REGION}.rds.amazonaws.com")),
            );
            ident
        }
    };

    if matches!(
        kind,
        ResourceKind::LoadBalancer | ResourceKind::TargetGroup | ResourceKind::Listener
    ) {
        computed.insert(String::from("arn"), json!(id));
    }
    (id, computed)
}

#[async_trait]
impl ProviderAdapter for SimulatedCloud {
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource, ProviderError> {
        let _call = self.enter(&request.node_id, ProviderOperation::Create).await?;
        let mut inner = self.lock();

        if let Some(existing) = inner.tokens.get(&request.client_token) {
            if let Some(resource) = inner.resources.get(existing) {
                debug!(node = %request.node_id, "Client token replayed, returning existing resource");
                return Ok(ProvisionedResource {
                    provider_id: existing.clone(),
                    attributes: resource.computed.clone(),
                });
            }
        }

        let seq = inner.next_id();
        let (id, computed) = provision(request.kind, seq, &request.attributes);
        inner.check_references(&request.attributes, &id)?;
        if inner.resources.contains_key(&id) {
            return Err(ProviderError::fatal(format!(
                "AlreadyExists: a resource named {id} already exists"
            )));
        }

        let references = inner.live_references(&request.attributes, &id);
        inner.issued.insert(id.clone());
        inner.tokens.insert(request.client_token.clone(), id.clone());
        inner.resources.insert(
            id.clone(),
            SimResource {
                node_id: request.node_id.clone(),
                kind: request.kind,
                attributes: request.attributes.clone(),
                computed: computed.clone(),
                references,
            },
        );

        let key = (request.node_id.clone(), ProviderOperation::Create);
        if let Some(Fault::Unfinished { message }) = inner.faults.get(&key).cloned() {
            inner.faults.remove(&key);
            return Err(ProviderError::Incomplete {
                provider_id: id,
                message,
            });
        }

        Ok(ProvisionedResource {
            provider_id: id,
            attributes: computed,
        })
    }

    async fn read(&self, handle: &ResourceHandle) -> Result<Option<Attributes>, ProviderError> {
        let _call = self.enter(&handle.node_id, ProviderOperation::Read).await?;
        let inner = self.lock();
        Ok(inner
            .resources
            .get(&handle.provider_id)
            .map(|r| r.computed.clone()))
    }

    async fn update(
        &self,
        handle: &ResourceHandle,
        request: &ResourceRequest,
    ) -> Result<Attributes, ProviderError> {
        let _call = self.enter(&handle.node_id, ProviderOperation::Update).await?;
        let mut inner = self.lock();
        inner.check_references(&request.attributes, &handle.provider_id)?;
        let references = inner.live_references(&request.attributes, &handle.provider_id);

        let Some(resource) = inner.resources.get_mut(&handle.provider_id) else {
            return Err(ProviderError::NotFound {
                provider_id: handle.provider_id.clone(),
            });
        };

        for key in resource.kind.immutable_attributes() {
            if resource.attributes.get(*key) != request.attributes.get(*key) {
                return Err(ProviderError::fatal(format!(
                    "NotUpdatable: property {key} of {} cannot be updated",
                    resource.kind
                )));
            }
        }

        resource.attributes.clone_from(&request.attributes);
        resource.references = references;
        Ok(resource.computed.clone())
    }

    async fn delete(
        &self,
        handle: &ResourceHandle,
        _client_token: &str,
    ) -> Result<DeleteOutcome, ProviderError> {
        let _call = self.enter(&handle.node_id, ProviderOperation::Delete).await?;
        let mut inner = self.lock();
        if !inner.resources.contains_key(&handle.provider_id) {
            return Ok(DeleteOutcome::NotFound);
        }
        inner.check_unreferenced(&handle.provider_id)?;
        inner.resources.remove(&handle.provider_id);
        Ok(DeleteOutcome::Deleted)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
