//! Node identity and resource kinds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::value::{AttrValue, Attributes, Reference, Resolution, Unresolved};

/// Stable logical name of a node, e.g. `vpc.main`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Self> for NodeId {
    fn from(value: &Self) -> Self {
        value.clone()
    }
}

/// Kinds of resources the reconciler knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual private cloud.
    Vpc,
    /// Subnet inside a VPC.
    Subnet,
    /// Internet gateway attached to a VPC.
    InternetGateway,
    /// Route table with its routes.
    RouteTable,
    /// Association of a subnet with a route table.
    RouteTableAssociation,
    /// Security group with ingress and egress rules.
    SecurityGroup,
    /// Application load balancer.
    LoadBalancer,
    /// Load balancer target group.
    TargetGroup,
    /// Load balancer listener.
    Listener,
    /// Registration of a target in a target group.
    TargetGroupAttachment,
    /// Compute instance.
    Instance,
    /// Database subnet group.
    DbSubnetGroup,
    /// Managed database instance.
    DbInstance,
}

impl ResourceKind {
    /// All resource kinds, in the order they appear in a topology.
    pub const ALL: [Self; 13] = [
        Self::Vpc,
        Self::Subnet,
        Self::InternetGateway,
        Self::RouteTable,
        Self::RouteTableAssociation,
        Self::SecurityGroup,
        Self::LoadBalancer,
        Self::TargetGroup,
        Self::Listener,
        Self::TargetGroupAttachment,
        Self::Instance,
        Self::DbSubnetGroup,
        Self::DbInstance,
    ];

    /// Returns the snake_case name used in node ids and state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::InternetGateway => "internet_gateway",
            Self::RouteTable => "route_table",
            Self::RouteTableAssociation => "route_table_association",
            Self::SecurityGroup => "security_group",
            Self::LoadBalancer => "load_balancer",
            Self::TargetGroup => "target_group",
            Self::Listener => "listener",
            Self::TargetGroupAttachment => "target_group_attachment",
            Self::Instance => "instance",
            Self::DbSubnetGroup => "db_subnet_group",
            Self::DbInstance => "db_instance",
        }
    }

    /// Builds the conventional node id `<kind>.<name>`.
    #[must_use]
    pub fn node_id(self, name: &str) -> NodeId {
        NodeId::new(format!("{}.{name}", self.as_str()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single declared infrastructure resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    /// Stable logical identifier.
    pub id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired attributes, possibly referencing other nodes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit ordering hints in addition to attribute references.
    pub depends_on: BTreeSet<NodeId>,
}

impl Node {
    /// Creates a node without attributes.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Sets a desired attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Sets an attribute that references another node's attribute.
    #[must_use]
    pub fn with_ref(
        self,
        key: impl Into<String>,
        node: impl Into<NodeId>,
        attribute: impl Into<String>,
    ) -> Self {
        self.with_attr(key, AttrValue::Ref(Reference::new(node, attribute)))
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, node: impl Into<NodeId>) -> Self {
        self.depends_on.insert(node.into());
        self
    }

    /// Returns every reference held in the node's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Returns the nodes this node depends on: referenced nodes plus explicit hints.
    #[must_use]
    pub fn edges(&self) -> BTreeSet<NodeId> {
        let mut edges: BTreeSet<NodeId> =
            self.references().into_iter().map(|r| r.node.clone()).collect();
        edges.extend(self.depends_on.iter().cloned());
        edges
    }

    /// Resolves every attribute to a concrete value.
    ///
    /// # Errors
    ///
    /// Returns the first reference the lookup could not satisfy.
    pub fn resolve_attributes<F>(&self, lookup: &F, mode: Resolution) -> Result<Attributes, Unresolved>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        self.attributes
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.resolve(lookup, mode)?)))
            .collect()
    }
}
