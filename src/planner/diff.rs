//! Per-node comparison of declared and observed attributes.
//!
//! Desired attributes are resolved against observed state the same way they
//! are recorded (sensitive values as digests), so an unchanged node compares
//! equal. A reference to a node that is about to be created or replaced has
//! no known value yet and always counts as changed. A resource that still
//! references a node being replaced is replaced with it, since the old
//! resource cannot be deleted while something points at it.

use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

use crate::graph::{Node, NodeId, Reference, Resolution};
use crate::state::{ObservedResource, ResourceStatus, StackState};

use super::policy::ReplacePolicy;

/// Engine for computing per-node diffs.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Replace triggers.
    policy: ReplacePolicy,
}

/// Change required for one declared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// No resource exists.
    Create,
    /// Mutable attributes differ.
    Update,
    /// Immutable attributes differ or the resource is unhealthy.
    Replace,
    /// Nothing differs.
    NoChange,
}

/// One differing attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Attribute key.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<Value>,
    /// Desired value, `None` when it depends on a node not yet created.
    pub new_value: Option<Value>,
    /// Whether this change forces replacement.
    pub forces_replacement: bool,
}

/// Difference for a single node.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Node id.
    pub node_id: NodeId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Differing attributes.
    pub details: Vec<FieldChange>,
    /// Why the change is needed.
    pub reason: String,
}

impl DiffEngine {
    /// Creates a diff engine with the default replace policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a diff engine with a custom replace policy.
    #[must_use]
    pub const fn with_policy(policy: ReplacePolicy) -> Self {
        Self { policy }
    }

    /// Compares one declared node with its recorded resource.
    ///
    /// `pending` holds the nodes that are created or replaced earlier in the
    /// same plan; references to them are unknown. A pending node that still
    /// has a recorded resource is being replaced, and any reference to it
    /// forces this node to be replaced as well.
    #[must_use]
    pub fn diff_node(
        &self,
        node: &Node,
        state: &StackState,
        pending: &HashSet<NodeId>,
    ) -> ResourceDiff {
        let Some(observed) = state.get(&node.id) else {
            return ResourceDiff::new(node, DiffType::Create, Vec::new(), "not yet created");
        };

        match observed.status {
            ResourceStatus::Deleted => {
                return ResourceDiff::new(
                    node,
                    DiffType::Create,
                    Vec::new(),
                    format!("{} no longer exists at the provider", observed.provider_id),
                );
            }
            ResourceStatus::Pending | ResourceStatus::Degraded => {
                return ResourceDiff::new(
                    node,
                    DiffType::Replace,
                    Vec::new(),
                    format!("resource is {:?}", observed.status).to_lowercase(),
                );
            }
            ResourceStatus::Created => {}
        }

        let lookup = |reference: &Reference| -> Option<Value> {
            if pending.contains(&reference.node) {
                return None;
            }
            state
                .get(&reference.node)
                .filter(|r| r.is_live())
                .and_then(|r| r.attribute(&reference.attribute))
        };

        let replaced: BTreeSet<&NodeId> = node
            .references()
            .into_iter()
            .map(|r| &r.node)
            .filter(|n| pending.contains(*n) && is_recorded(state, n))
            .collect();

        let mut details = Vec::new();
        for (key, value) in &node.attributes {
            let old_value = observed.attributes.get(key).cloned();
            match value.resolve(&lookup, Resolution::ForState) {
                Ok(new_value) if old_value.as_ref() == Some(&new_value) => {}
                Ok(new_value) => details.push(self.change(observed, key, old_value, Some(new_value))),
                Err(unresolved) => {
                    debug!(node = %node.id, field = %key, reference = %unresolved.0, "Attribute depends on a pending node");
                    details.push(self.change(observed, key, old_value, None));
                }
            }
        }

        for key in removed_keys(node, observed) {
            let old_value = observed.attributes.get(&key).cloned();
            details.push(self.change(observed, &key, old_value, None));
        }

        if !replaced.is_empty() {
            let names: Vec<&str> = replaced.iter().map(|n| n.as_str()).collect();
            let reason = format!("references {}, which is replaced", names.join(", "));
            return ResourceDiff::new(node, DiffType::Replace, details, reason);
        }

        if details.is_empty() {
            return ResourceDiff::new(node, DiffType::NoChange, details, "up to date");
        }

        let replacing: Vec<&str> = details
            .iter()
            .filter(|d| d.forces_replacement)
            .map(|d| d.field.as_str())
            .collect();
        if replacing.is_empty() {
            ResourceDiff::new(node, DiffType::Update, details, "mutable attributes changed")
        } else {
            let reason = format!("{} cannot change in place", replacing.join(", "));
            ResourceDiff::new(node, DiffType::Replace, details, reason)
        }
    }

    fn change(
        &self,
        observed: &ObservedResource,
        field: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> FieldChange {
        FieldChange {
            field: field.to_string(),
            old_value,
            new_value,
            forces_replacement: self.policy.forces_replacement(observed.kind, field),
        }
    }
}

/// True while a resource for `node` still exists at the provider.
fn is_recorded(state: &StackState, node: &NodeId) -> bool {
    state.get(node).is_some_and(|r| r.status != ResourceStatus::Deleted)
}

/// Recorded desired keys the node no longer declares.
fn removed_keys(node: &Node, observed: &ObservedResource) -> BTreeSet<String> {
    let computed = observed.kind.computed_attributes();
    observed
        .attributes
        .keys()
        .filter(|key| !node.attributes.contains_key(*key) && !computed.contains(&key.as_str()))
        .cloned()
        .collect()
}

impl ResourceDiff {
    fn new(node: &Node, diff_type: DiffType, details: Vec<FieldChange>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node.id.clone(),
            diff_type,
            details,
            reason: reason.into(),
        }
    }

    /// Returns the names of the differing attributes.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<String> {
        self.details.iter().map(|d| d.field.clone()).collect()
    }

    /// Returns true if the node is created or replaced.
    #[must_use]
    pub const fn creates_resource(&self) -> bool {
        matches!(self.diff_type, DiffType::Create | DiffType::Replace)
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node_id, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.changed_fields().join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrValue, Attributes, ResourceKind, SecretValue};
    use serde_json::json;

    fn state_with(resources: Vec<ObservedResource>) -> StackState {
        let mut state = StackState::new("shop", "dev");
        for r in resources {
            state.upsert(r);
        }
        state
    }

    fn observed(id: &str, kind: ResourceKind, provider_id: &str, attrs: Value) -> ObservedResource {
        let attributes: Attributes = attrs
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        ObservedResource::created(NodeId::from(id), kind, provider_id, attributes)
    }

    fn subnet(cidr: &str) -> Node {
        Node::new("subnet.a", ResourceKind::Subnet)
            .with_ref("vpc_id", "vpc.main", "id")
            .with_attr("cidr_block", cidr)
            .with_attr("map_public_ip_on_launch", true)
    }

    #[test]
    fn test_missing_resource_is_created() {
        let diff = DiffEngine::new().diff_node(&subnet("10.0.1.0/24"), &StackState::new("s", "e"), &HashSet::new());
        assert_eq!(diff.diff_type, DiffType::Create);
    }

    #[test]
    fn test_matching_resource_is_unchanged() {
        let state = state_with(vec![
            observed("vpc.main", ResourceKind::Vpc, "vpc-1", json!({})),
            observed(
                "subnet.a",
                ResourceKind::Subnet,
                "subnet-1",
                json!({"vpc_id": "vpc-1", "cidr_block": "10.0.1.0/24", "map_public_ip_on_launch": true}),
            ),
        ]);
        let diff = DiffEngine::new().diff_node(&subnet("10.0.1.0/24"), &state, &HashSet::new());
        assert_eq!(diff.diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_immutable_change_forces_replace() {
        let state = state_with(vec![
            observed("vpc.main", ResourceKind::Vpc, "vpc-1", json!({})),
            observed(
                "subnet.a",
                ResourceKind::Subnet,
                "subnet-1",
                json!({"vpc_id": "vpc-1", "cidr_block": "10.0.1.0/24", "map_public_ip_on_launch": true}),
            ),
        ]);
        let diff = DiffEngine::new().diff_node(&subnet("10.0.9.0/24"), &state, &HashSet::new());
        assert_eq!(diff.diff_type, DiffType::Replace);
        assert_eq!(diff.changed_fields(), vec!["cidr_block"]);
    }

    #[test]
    fn test_mutable_change_updates() {
        let state = state_with(vec![
            observed("vpc.main", ResourceKind::Vpc, "vpc-1", json!({})),
            observed(
                "subnet.a",
                ResourceKind::Subnet,
                "subnet-1",
                json!({"vpc_id": "vpc-1", "cidr_block": "10.0.1.0/24", "map_public_ip_on_launch": false}),
            ),
        ]);
        let diff = DiffEngine::new().diff_node(&subnet("10.0.1.0/24"), &state, &HashSet::new());
        assert_eq!(diff.diff_type, DiffType::Update);
    }

    #[test]
    fn test_pending_reference_is_unknown() {
        let state = state_with(vec![
            observed("vpc.main", ResourceKind::Vpc, "vpc-1", json!({})),
            observed(
                "subnet.a",
                ResourceKind::Subnet,
                "subnet-1",
                json!({"vpc_id": "vpc-1", "cidr_block": "10.0.1.0/24", "map_public_ip_on_launch": true}),
            ),
        ]);
        let pending = HashSet::from([NodeId::from("vpc.main")]);
        let diff = DiffEngine::new().diff_node(&subnet("10.0.1.0/24"), &state, &pending);
        assert_eq!(diff.diff_type, DiffType::Replace);
        assert_eq!(diff.details[0].new_value, None);
    }

    #[test]
    fn test_mutable_reference_to_replaced_node_replaces() {
        let node = Node::new("load_balancer.web", ResourceKind::LoadBalancer)
            .with_attr("name", "shop-lb")
            .with_attr("security_groups", AttrValue::list([AttrValue::reference("security_group.lb", "id")]));
        let state = state_with(vec![
            observed("security_group.lb", ResourceKind::SecurityGroup, "sg-1", json!({})),
            observed(
                "load_balancer.web",
                ResourceKind::LoadBalancer,
                "arn:lb",
                json!({"name": "shop-lb", "security_groups": ["sg-1"]}),
            ),
        ]);
        let pending = HashSet::from([NodeId::from("security_group.lb")]);

        let diff = DiffEngine::new().diff_node(&node, &state, &pending);
        assert_eq!(diff.diff_type, DiffType::Replace);
        assert!(diff.reason.contains("security_group.lb"), "{}", diff.reason);
        assert!(diff.details.iter().all(|d| !d.forces_replacement));
    }

    #[test]
    fn test_mutable_reference_to_recreated_node_updates() {
        let node = Node::new("load_balancer.web", ResourceKind::LoadBalancer)
            .with_attr("name", "shop-lb")
            .with_attr("security_groups", AttrValue::list([AttrValue::reference("security_group.lb", "id")]));
        let mut gone = observed("security_group.lb", ResourceKind::SecurityGroup, "sg-1", json!({}));
        gone.status = ResourceStatus::Deleted;
        let state = state_with(vec![
            gone,
            observed(
                "load_balancer.web",
                ResourceKind::LoadBalancer,
                "arn:lb",
                json!({"name": "shop-lb", "security_groups": ["sg-1"]}),
            ),
        ]);
        let pending = HashSet::from([NodeId::from("security_group.lb")]);

        let diff = DiffEngine::new().diff_node(&node, &state, &pending);
        assert_eq!(diff.diff_type, DiffType::Update);
        assert_eq!(diff.changed_fields(), vec!["security_groups"]);
    }

    #[test]
    fn test_secret_compares_by_digest() {
        let secret = SecretValue::new("hunter2");
        let node = Node::new("db_instance.main", ResourceKind::DbInstance)
            .with_attr("master_user_password", secret.clone());
        let state = state_with(vec![observed(
            "db_instance.main",
            ResourceKind::DbInstance,
            "shop-db",
            json!({"master_user_password": secret.digest(), "address": "shop-db.rds"}),
        )]);
        let diff = DiffEngine::new().diff_node(&node, &state, &HashSet::new());
        assert_eq!(diff.diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_removed_attribute_is_a_change() {
        let node = Node::new("instance.web_1", ResourceKind::Instance).with_attr("instance_type", "t3.micro");
        let state = state_with(vec![observed(
            "instance.web_1",
            ResourceKind::Instance,
            "i-1",
            json!({"instance_type": "t3.micro", "key_name": "ops", "public_ip": "54.0.0.1"}),
        )]);
        let diff = DiffEngine::new().diff_node(&node, &state, &HashSet::new());
        assert_eq!(diff.diff_type, DiffType::Replace);
        assert_eq!(diff.changed_fields(), vec!["key_name"]);
    }

    #[test]
    fn test_degraded_resource_is_replaced() {
        let mut degraded = observed("vpc.main", ResourceKind::Vpc, "vpc-1", json!({}));
        degraded.status = ResourceStatus::Degraded;
        let diff = DiffEngine::new().diff_node(
            &Node::new("vpc.main", ResourceKind::Vpc),
            &state_with(vec![degraded]),
            &HashSet::new(),
        );
        assert_eq!(diff.diff_type, DiffType::Replace);
    }
}
