//! Replace policy.
//!
//! Each resource kind declares the attributes the provider cannot change in
//! place. A difference on any of them forces delete-then-create; every other
//! attribute is updated in place.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::ResourceKind;

impl ResourceKind {
    /// Attributes whose change forces replacement.
    #[must_use]
    pub const fn immutable_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Vpc => &["cidr_block"],
            Self::Subnet => &["vpc_id", "cidr_block", "availability_zone"],
            Self::InternetGateway => &["vpc_id"],
            Self::RouteTable => &["vpc_id"],
            Self::RouteTableAssociation => &["subnet_id", "route_table_id"],
            Self::SecurityGroup => &["group_name", "group_description", "vpc_id"],
            Self::LoadBalancer => &["name", "scheme", "type"],
            Self::TargetGroup => &["name", "port", "protocol", "vpc_id", "target_type"],
            Self::Listener => &["load_balancer_arn"],
            Self::TargetGroupAttachment => &["target_group_arn", "target_id", "port"],
            Self::Instance => &["image_id", "subnet_id", "key_name", "user_data"],
            Self::DbSubnetGroup => &["db_subnet_group_name"],
            Self::DbInstance => &[
                "db_instance_identifier",
                "engine",
                "db_name",
                "master_username",
                "db_subnet_group_name",
            ],
        }
    }

    /// Attributes reported by the provider rather than declared.
    #[must_use]
    pub const fn computed_attributes(self) -> &'static [&'static str] {
        match self {
            Self::SecurityGroup => &["group_id"],
            Self::LoadBalancer => &["dns_name", "arn"],
            Self::TargetGroup | Self::Listener => &["arn"],
            Self::Instance => &["public_ip", "private_ip", "public_dns_name"],
            Self::DbInstance => &["address"],
            _ => &[],
        }
    }
}

/// Per-kind replace triggers, overridable for tests and special stacks.
#[derive(Debug, Clone, Default)]
pub struct ReplacePolicy {
    overrides: BTreeMap<ResourceKind, BTreeSet<String>>,
}

impl ReplacePolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an additional attribute of a kind as immutable.
    #[must_use]
    pub fn with_immutable(mut self, kind: ResourceKind, attribute: impl Into<String>) -> Self {
        self.overrides
            .entry(kind)
            .or_default()
            .insert(attribute.into());
        self
    }

    /// Returns true if changing `attribute` on `kind` forces replacement.
    #[must_use]
    pub fn forces_replacement(&self, kind: ResourceKind, attribute: &str) -> bool {
        kind.immutable_attributes().contains(&attribute)
            || self
                .overrides
                .get(&kind)
                .is_some_and(|attrs| attrs.contains(attribute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpc_cidr_is_immutable() {
        let policy = ReplacePolicy::new();
        assert!(policy.forces_replacement(ResourceKind::Vpc, "cidr_block"));
        assert!(!policy.forces_replacement(ResourceKind::Vpc, "tags"));
    }

    #[test]
    fn test_security_group_rules_are_mutable() {
        let policy = ReplacePolicy::new();
        assert!(!policy.forces_replacement(ResourceKind::SecurityGroup, "ingress"));
        assert!(policy.forces_replacement(ResourceKind::SecurityGroup, "vpc_id"));
    }

    #[test]
    fn test_override_adds_trigger() {
        let policy = ReplacePolicy::new().with_immutable(ResourceKind::Instance, "instance_type");
        assert!(policy.forces_replacement(ResourceKind::Instance, "instance_type"));
        assert!(!policy.forces_replacement(ResourceKind::Subnet, "instance_type"));
    }
}
