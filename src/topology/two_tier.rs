//! The fixed two-tier topology.
//!
//! One VPC with two public and two private subnets, an internet gateway and a
//! public route table, three security groups, an application load balancer in
//! front of two web instances, and a database instance in the private subnets.

use std::collections::BTreeMap;

use crate::config::DeployConfig;
use crate::error::GraphError;
use crate::graph::{AttrValue, Graph, Node, ResourceKind, SecretValue};

use super::bootstrap::{BootstrapContext, render_user_data};

/// Node ids of the two-tier topology.
pub mod ids {
    /// The VPC.
    pub const VPC: &str = "vpc.main";
    /// First public subnet.
    pub const PUBLIC_SUBNET_A: &str = "subnet.public_a";
    /// Second public subnet.
    pub const PUBLIC_SUBNET_B: &str = "subnet.public_b";
    /// First private subnet.
    pub const PRIVATE_SUBNET_A: &str = "subnet.private_a";
    /// Second private subnet.
    pub const PRIVATE_SUBNET_B: &str = "subnet.private_b";
    /// Internet gateway.
    pub const INTERNET_GATEWAY: &str = "internet_gateway.main";
    /// Public route table.
    pub const PUBLIC_ROUTE_TABLE: &str = "route_table.public";
    /// Association of the first public subnet.
    pub const ROUTE_ASSOC_A: &str = "route_table_association.public_a";
    /// Association of the second public subnet.
    pub const ROUTE_ASSOC_B: &str = "route_table_association.public_b";
    /// Load balancer security group.
    pub const LB_SECURITY_GROUP: &str = "security_group.lb";
    /// Web tier security group.
    pub const PUBLIC_SECURITY_GROUP: &str = "security_group.public";
    /// Database tier security group.
    pub const PRIVATE_SECURITY_GROUP: &str = "security_group.private";
    /// Application load balancer.
    pub const LOAD_BALANCER: &str = "load_balancer.web";
    /// Target group.
    pub const TARGET_GROUP: &str = "target_group.web";
    /// HTTP listener.
    pub const LISTENER: &str = "listener.http";
    /// First web instance.
    pub const WEB_1: &str = "instance.web_1";
    /// Second web instance.
    pub const WEB_2: &str = "instance.web_2";
    /// Target group registration of the first instance.
    pub const ATTACH_WEB_1: &str = "target_group_attachment.web_1";
    /// Target group registration of the second instance.
    pub const ATTACH_WEB_2: &str = "target_group_attachment.web_2";
    /// Database subnet group.
    pub const DB_SUBNET_GROUP: &str = "db_subnet_group.main";
    /// Database instance.
    pub const DB_INSTANCE: &str = "db_instance.main";
}

/// Builder for the two-tier node set.
#[derive(Debug)]
pub struct TwoTierTopology<'a> {
    config: &'a DeployConfig,
    db_password: SecretValue,
}

impl<'a> TwoTierTopology<'a> {
    /// Creates a builder for the given configuration.
    #[must_use]
    pub const fn new(config: &'a DeployConfig, db_password: SecretValue) -> Self {
        Self {
            config,
            db_password,
        }
    }

    /// Builds and validates the resource graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the node set is not a valid graph.
    pub fn build(&self) -> Result<Graph, GraphError> {
        Graph::build(self.nodes())
    }

    /// Returns the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(21);
        nodes.push(self.vpc());
        nodes.extend(self.subnets());
        nodes.push(self.internet_gateway());
        nodes.push(self.route_table());
        nodes.push(route_association(ids::ROUTE_ASSOC_A, ids::PUBLIC_SUBNET_A));
        nodes.push(route_association(ids::ROUTE_ASSOC_B, ids::PUBLIC_SUBNET_B));
        nodes.extend(self.security_groups());
        nodes.push(self.load_balancer());
        nodes.push(self.target_group());
        nodes.push(self.listener());
        nodes.push(self.instance(ids::WEB_1, "web-1", ids::PUBLIC_SUBNET_A));
        nodes.push(self.instance(ids::WEB_2, "web-2", ids::PUBLIC_SUBNET_B));
        nodes.push(self.attachment(ids::ATTACH_WEB_1, ids::WEB_1));
        nodes.push(self.attachment(ids::ATTACH_WEB_2, ids::WEB_2));
        nodes.push(self.db_subnet_group());
        nodes.push(self.db_instance());
        nodes
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.config.qualified_name())
    }

    fn tags(&self, suffix: &str) -> AttrValue {
        let mut tags = self.config.resource_tags();
        tags.insert(String::from("Name"), self.name(suffix));
        AttrValue::map(tags)
    }

    fn vpc(&self) -> Node {
        Node::new(ids::VPC, ResourceKind::Vpc)
            .with_attr("cidr_block", self.config.network.vpc_cidr.as_str())
            .with_attr("enable_dns_support", true)
            .with_attr("enable_dns_hostnames", true)
            .with_attr("tags", self.tags("vpc"))
    }

    fn subnets(&self) -> Vec<Node> {
        let network = &self.config.network;
        let public = [ids::PUBLIC_SUBNET_A, ids::PUBLIC_SUBNET_B];
        let private = [ids::PRIVATE_SUBNET_A, ids::PRIVATE_SUBNET_B];

        let mut nodes = Vec::with_capacity(4);
        for (tier, node_ids, subnets, public_ip) in [
            ("public", public, &network.public_subnets, true),
            ("private", private, &network.private_subnets, false),
        ] {
            for (i, (id, subnet)) in node_ids.iter().zip(subnets.iter()).enumerate() {
                nodes.push(
                    Node::new(*id, ResourceKind::Subnet)
                        .with_ref("vpc_id", ids::VPC, "id")
                        .with_attr("cidr_block", subnet.cidr.as_str())
                        .with_attr("availability_zone", subnet.availability_zone.as_str())
                        .with_attr("map_public_ip_on_launch", public_ip)
                        .with_attr("tags", self.tags(&format!("{tier}-{}", i + 1))),
                );
            }
        }
        nodes
    }

    fn internet_gateway(&self) -> Node {
        Node::new(ids::INTERNET_GATEWAY, ResourceKind::InternetGateway)
            .with_ref("vpc_id", ids::VPC, "id")
            .with_attr("tags", self.tags("igw"))
    }

    fn route_table(&self) -> Node {
        let default_route = AttrValue::map([
            ("destination_cidr_block", AttrValue::from("0.0.0.0/0")),
            (
                "gateway_id",
                AttrValue::reference(ids::INTERNET_GATEWAY, "id"),
            ),
        ]);
        Node::new(ids::PUBLIC_ROUTE_TABLE, ResourceKind::RouteTable)
            .with_ref("vpc_id", ids::VPC, "id")
            .with_attr("routes", AttrValue::list([default_route]))
            .with_attr("tags", self.tags("public-rt"))
    }

    fn security_groups(&self) -> Vec<Node> {
        let network = &self.config.network;
        let web_port = self.config.web.port;

        let lb = self
            .security_group(ids::LB_SECURITY_GROUP, "lb", "Load balancer ingress")
            .with_attr(
                "ingress",
                AttrValue::list([cidr_rule(web_port, &network.ingress_cidr)]),
            );

        let mut web_rules = vec![source_rule(web_port, ids::LB_SECURITY_GROUP)];
        if let Some(ssh) = &network.ssh_cidr {
            web_rules.push(cidr_rule(22, ssh));
        }
        let public = self
            .security_group(ids::PUBLIC_SECURITY_GROUP, "web", "Web tier")
            .with_attr("ingress", AttrValue::List(web_rules));

        let private = self
            .security_group(ids::PRIVATE_SECURITY_GROUP, "db-sg", "Database tier")
            .with_attr(
                "ingress",
                AttrValue::list([source_rule(
                    self.config.database.port,
                    ids::PUBLIC_SECURITY_GROUP,
                )]),
            );

        vec![lb, public, private]
    }

    fn security_group(&self, id: &str, suffix: &str, description: &str) -> Node {
        let egress = AttrValue::map([
            ("ip_protocol", AttrValue::from("-1")),
            ("cidr_ip", AttrValue::from("0.0.0.0/0")),
        ]);
        Node::new(id, ResourceKind::SecurityGroup)
            .with_attr("group_name", self.name(suffix))
            .with_attr("group_description", description)
            .with_ref("vpc_id", ids::VPC, "id")
            .with_attr("egress", AttrValue::list([egress]))
            .with_attr("tags", self.tags(suffix))
    }

    fn load_balancer(&self) -> Node {
        Node::new(ids::LOAD_BALANCER, ResourceKind::LoadBalancer)
            .with_attr("name", self.name("alb"))
            .with_attr("type", "application")
            .with_attr("scheme", "internet-facing")
            .with_attr(
                "subnets",
                AttrValue::list([
                    AttrValue::reference(ids::PUBLIC_SUBNET_A, "id"),
                    AttrValue::reference(ids::PUBLIC_SUBNET_B, "id"),
                ]),
            )
            .with_attr(
                "security_groups",
                AttrValue::list([AttrValue::reference(ids::LB_SECURITY_GROUP, "id")]),
            )
            .with_attr("tags", self.tags("alb"))
    }

    fn target_group(&self) -> Node {
        let web = &self.config.web;
        Node::new(ids::TARGET_GROUP, ResourceKind::TargetGroup)
            .with_attr("name", self.name("tg"))
            .with_attr("port", web.port)
            .with_attr("protocol", "HTTP")
            .with_attr("target_type", "instance")
            .with_ref("vpc_id", ids::VPC, "id")
            .with_attr("health_check_path", web.health_check_path.as_str())
            .with_attr("tags", self.tags("tg"))
    }

    fn listener(&self) -> Node {
        let forward = AttrValue::map([
            ("type", AttrValue::from("forward")),
            (
                "target_group_arn",
                AttrValue::reference(ids::TARGET_GROUP, "id"),
            ),
        ]);
        Node::new(ids::LISTENER, ResourceKind::Listener)
            .with_ref("load_balancer_arn", ids::LOAD_BALANCER, "id")
            .with_attr("port", self.config.web.port)
            .with_attr("protocol", "HTTP")
            .with_attr("default_actions", AttrValue::list([forward]))
    }

    fn instance(&self, id: &str, label: &str, subnet: &str) -> Node {
        let web = &self.config.web;
        let stack = self.config.qualified_name();
        let user_data = render_user_data(&BootstrapContext {
            stack: &stack,
            instance: label,
            title: &web.page_title,
            port: web.port,
        });

        let mut node = Node::new(id, ResourceKind::Instance)
            .with_attr("image_id", web.image_id.as_str())
            .with_attr("instance_type", web.instance_type.as_str())
            .with_ref("subnet_id", subnet, "id")
            .with_attr(
                "security_group_ids",
                AttrValue::list([AttrValue::reference(ids::PUBLIC_SECURITY_GROUP, "id")]),
            )
            .with_attr("user_data", user_data)
            .with_attr("tags", self.tags(label));
        if let Some(key) = &web.key_name {
            node = node.with_attr("key_name", key.as_str());
        }
        node
    }

    fn attachment(&self, id: &str, instance: &str) -> Node {
        Node::new(id, ResourceKind::TargetGroupAttachment)
            .with_ref("target_group_arn", ids::TARGET_GROUP, "id")
            .with_ref("target_id", instance, "id")
            .with_attr("port", self.config.web.port)
    }

    fn db_subnet_group(&self) -> Node {
        Node::new(ids::DB_SUBNET_GROUP, ResourceKind::DbSubnetGroup)
            .with_attr("db_subnet_group_name", self.name("db-subnets"))
            .with_attr("db_subnet_group_description", "Private subnets for the database")
            .with_attr(
                "subnet_ids",
                AttrValue::list([
                    AttrValue::reference(ids::PRIVATE_SUBNET_A, "id"),
                    AttrValue::reference(ids::PRIVATE_SUBNET_B, "id"),
                ]),
            )
            .with_attr("tags", self.tags("db-subnets"))
    }

    fn db_instance(&self) -> Node {
        let db = &self.config.database;
        let mut node = Node::new(ids::DB_INSTANCE, ResourceKind::DbInstance)
            .with_attr("db_instance_identifier", self.name("db"))
            .with_attr("engine", db.engine.as_str())
            .with_attr("db_instance_class", db.instance_class.as_str())
            .with_attr("allocated_storage", db.allocated_storage)
            .with_attr("db_name", db.db_name.as_str())
            .with_attr("master_username", db.username.as_str())
            .with_attr("master_user_password", self.db_password.clone())
            .with_ref("db_subnet_group_name", ids::DB_SUBNET_GROUP, "id")
            .with_attr(
                "vpc_security_groups",
                AttrValue::list([AttrValue::reference(ids::PRIVATE_SECURITY_GROUP, "id")]),
            )
            .with_attr("port", db.port)
            .with_attr("multi_az", db.multi_az)
            .with_attr("publicly_accessible", false)
            .with_attr("tags", self.tags("db"));
        if let Some(version) = &db.engine_version {
            node = node.with_attr("engine_version", version.as_str());
        }
        node
    }
}

fn route_association(id: &str, subnet: &str) -> Node {
    Node::new(id, ResourceKind::RouteTableAssociation)
        .with_ref("subnet_id", subnet, "id")
        .with_ref("route_table_id", ids::PUBLIC_ROUTE_TABLE, "id")
}

fn cidr_rule(port: u16, cidr: &str) -> AttrValue {
    AttrValue::Map(BTreeMap::from([
        (String::from("ip_protocol"), AttrValue::from("tcp")),
        (String::from("from_port"), AttrValue::from(port)),
        (String::from("to_port"), AttrValue::from(port)),
        (String::from("cidr_ip"), AttrValue::from(cidr)),
    ]))
}

fn source_rule(port: u16, source: &str) -> AttrValue {
    AttrValue::Map(BTreeMap::from([
        (String::from("ip_protocol"), AttrValue::from("tcp")),
        (String::from("from_port"), AttrValue::from(port)),
        (String::from("to_port"), AttrValue::from(port)),
        (
            String::from("source_security_group_id"),
            AttrValue::reference(source, "id"),
        ),
    ]))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::parser::tests::sample_config;
    use crate::graph::NodeId;

    /// The sample two-tier graph shared by tests across modules.
    pub(crate) fn sample_graph() -> Graph {
        let config = sample_config();
        TwoTierTopology::new(&config, SecretValue::new("correct-horse"))
            .build()
            .expect("two-tier graph builds")
    }

    #[test]
    fn test_topology_has_21_nodes() {
        let graph = sample_graph();
        assert_eq!(graph.len(), 21);
        for kind in ResourceKind::ALL {
            assert!(
                graph.nodes().iter().any(|n| n.kind == kind),
                "missing kind {kind}"
            );
        }
    }

    #[test]
    fn test_database_depends_only_on_subnet_group_and_private_sg() {
        let graph = sample_graph();
        let deps: Vec<_> = graph
            .dependencies(&NodeId::from(ids::DB_INSTANCE))
            .into_iter()
            .map(NodeId::to_string)
            .collect();
        assert_eq!(deps, vec![ids::PRIVATE_SECURITY_GROUP, ids::DB_SUBNET_GROUP]);
    }

    #[test]
    fn test_security_group_chain() {
        let graph = sample_graph();
        let private_deps = graph.dependencies(&NodeId::from(ids::PRIVATE_SECURITY_GROUP));
        assert!(private_deps.contains(&&NodeId::from(ids::PUBLIC_SECURITY_GROUP)));
        let public_deps = graph.dependencies(&NodeId::from(ids::PUBLIC_SECURITY_GROUP));
        assert!(public_deps.contains(&&NodeId::from(ids::LB_SECURITY_GROUP)));
    }

    #[test]
    fn test_ssh_rule_is_optional() {
        let mut config = sample_config();
        config.network.ssh_cidr = Some(String::from("203.0.113.0/24"));
        let nodes = TwoTierTopology::new(&config, SecretValue::new("pw")).nodes();
        let web_sg = nodes
            .iter()
            .find(|n| n.id.as_str() == ids::PUBLIC_SECURITY_GROUP)
            .expect("web sg");
        let Some(AttrValue::List(rules)) = web_sg.attributes.get("ingress") else {
            panic!("ingress must be a list");
        };
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_names_are_prefixed_by_stack() {
        let graph = sample_graph();
        let lb = graph.node(&NodeId::from(ids::LOAD_BALANCER)).expect("lb");
        assert_eq!(lb.attributes.get("name"), Some(&AttrValue::from("shop-prod-alb")));
    }
}
