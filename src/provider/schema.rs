//! Mapping between node attributes and CloudFormation resource properties.
//!
//! Attribute keys are snake_case; properties are PascalCase with a few
//! acronym overrides. Tags maps become `[{Key, Value}]` lists and user data is
//! base64 encoded. Properties computed by the provider are read back under
//! snake_case names that never collide with desired attributes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::graph::{Attributes, ResourceKind, SecretValue};

/// A resource created alongside a node, e.g. a gateway attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Companion {
    /// CloudFormation type name.
    pub type_name: &'static str,
    /// Desired state document.
    pub desired_state: Value,
    /// Primary identifier used to read or delete it.
    pub identifier: String,
}

/// Keys whose acronyms do not survive naive PascalCase conversion.
const PROPERTY_OVERRIDES: &[(&str, &str)] = &[
    ("db_instance_identifier", "DBInstanceIdentifier"),
    ("db_subnet_group_name", "DBSubnetGroupName"),
    ("db_subnet_group_description", "DBSubnetGroupDescription"),
    ("db_instance_class", "DBInstanceClass"),
    ("db_name", "DBName"),
    ("vpc_security_groups", "VPCSecurityGroups"),
    ("multi_az", "MultiAZ"),
    ("ingress", "SecurityGroupIngress"),
    ("egress", "SecurityGroupEgress"),
];

/// Returns the CloudFormation type of a node kind.
///
/// Target-group attachments have no resource type of their own; they edit
/// the target group's `Targets` property.
#[must_use]
pub const fn type_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Vpc => "AWS::EC2::VPC",
        ResourceKind::Subnet => "AWS::EC2::Subnet",
        ResourceKind::InternetGateway => "AWS::EC2::InternetGateway",
        ResourceKind::RouteTable => "AWS::EC2::RouteTable",
        ResourceKind::RouteTableAssociation => "AWS::EC2::SubnetRouteTableAssociation",
        ResourceKind::SecurityGroup => "AWS::EC2::SecurityGroup",
        ResourceKind::LoadBalancer => "AWS::ElasticLoadBalancingV2::LoadBalancer",
        ResourceKind::TargetGroup | ResourceKind::TargetGroupAttachment => {
            "AWS::ElasticLoadBalancingV2::TargetGroup"
        }
        ResourceKind::Listener => "AWS::ElasticLoadBalancingV2::Listener",
        ResourceKind::Instance => "AWS::EC2::Instance",
        ResourceKind::DbSubnetGroup => "AWS::RDS::DBSubnetGroup",
        ResourceKind::DbInstance => "AWS::RDS::DBInstance",
    }
}

/// Computed properties read back per kind, as `(property path, attribute)`.
const fn computed_properties(kind: ResourceKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ResourceKind::SecurityGroup => &[("GroupId", "group_id")],
        ResourceKind::LoadBalancer => &[("DNSName", "dns_name"), ("LoadBalancerArn", "arn")],
        ResourceKind::TargetGroup => &[("TargetGroupArn", "arn")],
        ResourceKind::Listener => &[("ListenerArn", "arn")],
        ResourceKind::Instance => &[
            ("PublicIp", "public_ip"),
            ("PrivateIp", "private_ip"),
            ("PublicDnsName", "public_dns_name"),
        ],
        ResourceKind::DbInstance => &[("Endpoint.Address", "address")],
        _ => &[],
    }
}

/// Attributes handled by companion resources rather than the main document.
const fn companion_keys(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::InternetGateway => &["vpc_id"],
        ResourceKind::RouteTable => &["routes"],
        _ => &[],
    }
}

/// Converts a snake_case attribute key to a property name.
#[must_use]
pub fn property_name(key: &str) -> String {
    if let Some((_, name)) = PROPERTY_OVERRIDES.iter().find(|(k, _)| *k == key) {
        return (*name).to_string();
    }
    key.split('_')
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect()
}

fn convert_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (property_name(k), convert_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(convert_value).collect()),
        other => other.clone(),
    }
}

fn tag_list(tags: &Value) -> Value {
    let Some(map) = tags.as_object() else {
        return Value::Array(Vec::new());
    };
    Value::Array(
        map.iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect(),
    )
}

fn stringify(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        other => other.clone(),
    }
}

fn convert_property(kind: ResourceKind, key: &str, value: &Value) -> Value {
    match (kind, key) {
        (_, "tags") => tag_list(value),
        (ResourceKind::Instance, "user_data") => {
            Value::String(BASE64.encode(value.as_str().unwrap_or_default()))
        }
        (ResourceKind::DbInstance, "allocated_storage" | "port") => stringify(value),
        _ => convert_value(value),
    }
}

fn is_managed_key(kind: ResourceKind, key: &str) -> bool {
    !companion_keys(kind).contains(&key) && !computed_properties(kind).iter().any(|(_, a)| *a == key)
}

/// Builds the desired-state document of a node.
#[must_use]
pub fn desired_state(kind: ResourceKind, attributes: &Attributes) -> Value {
    let properties: Map<String, Value> = attributes
        .iter()
        .filter(|(key, _)| is_managed_key(kind, key))
        .map(|(key, value)| (property_name(key), convert_property(kind, key, value)))
        .collect();
    Value::Object(properties)
}

/// Extracts computed attributes from a resource's properties.
#[must_use]
pub fn computed_attributes(kind: ResourceKind, properties: &Value) -> Attributes {
    computed_properties(kind)
        .iter()
        .filter_map(|(path, attribute)| {
            let value = path
                .split('.')
                .try_fold(properties, |current, segment| current.get(segment))?;
            Some(((*attribute).to_string(), value.clone()))
        })
        .collect()
}

fn same_value(old: &Value, new: &Value) -> bool {
    if old == new {
        return true;
    }
    // Secrets are recorded as digests only.
    match (old.as_str(), new.as_str()) {
        (Some(digest), Some(plain)) if digest.starts_with("sha256:") => {
            SecretValue::new(plain).digest() == digest
        }
        _ => false,
    }
}

/// Builds the JSON Patch turning the recorded attributes into the desired ones.
#[must_use]
pub fn patch_document(kind: ResourceKind, recorded: &Attributes, desired: &Attributes) -> Value {
    let mut operations = Vec::new();

    for (key, value) in desired {
        if !is_managed_key(kind, key) {
            continue;
        }
        let path = format!("/{}", property_name(key));
        match recorded.get(key) {
            Some(old) if same_value(old, value) => {}
            Some(_) => operations.push(json!({
                "op": "replace",
                "path": path,
                "value": convert_property(kind, key, value),
            })),
            None => operations.push(json!({
                "op": "add",
                "path": path,
                "value": convert_property(kind, key, value),
            })),
        }
    }

    for key in recorded.keys() {
        if is_managed_key(kind, key) && !desired.contains_key(key) {
            operations.push(json!({ "op": "remove", "path": format!("/{}", property_name(key)) }));
        }
    }

    Value::Array(operations)
}

/// Returns the companion resources of a node.
#[must_use]
pub fn companions(kind: ResourceKind, provider_id: &str, attributes: &Attributes) -> Vec<Companion> {
    match kind {
        ResourceKind::InternetGateway => attributes
            .get("vpc_id")
            .and_then(Value::as_str)
            .map(|vpc| Companion {
                type_name: "AWS::EC2::VPCGatewayAttachment",
                desired_state: json!({ "VpcId": vpc, "InternetGatewayId": provider_id }),
                identifier: format!("IGW|{vpc}"),
            })
            .into_iter()
            .collect(),
        ResourceKind::RouteTable => attributes
            .get("routes")
            .and_then(Value::as_array)
            .map(|routes| routes.iter().filter_map(|r| route(provider_id, r)).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn route(route_table_id: &str, route: &Value) -> Option<Companion> {
    let destination = route.get("destination_cidr_block")?.as_str()?;
    let mut state = Map::new();
    state.insert(String::from("RouteTableId"), json!(route_table_id));
    if let Some(fields) = route.as_object() {
        for (key, value) in fields {
            state.insert(property_name(key), value.clone());
        }
    }
    Some(Companion {
        type_name: "AWS::EC2::Route",
        desired_state: Value::Object(state),
        identifier: format!("{route_table_id}|{destination}"),
    })
}

/// A target registered with a target group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRegistration {
    /// Target group ARN.
    pub target_group_arn: String,
    /// Instance id.
    pub target_id: String,
    /// Target port.
    pub port: u64,
}

impl TargetRegistration {
    /// Reads a registration from attachment attributes.
    #[must_use]
    pub fn from_attributes(attributes: &Attributes) -> Option<Self> {
        Some(Self {
            target_group_arn: attributes.get("target_group_arn")?.as_str()?.to_string(),
            target_id: attributes.get("target_id")?.as_str()?.to_string(),
            port: attributes.get("port").and_then(Value::as_u64).unwrap_or(80),
        })
    }

    /// Parses the identifier produced by [`Self::identifier`].
    #[must_use]
    pub fn parse(identifier: &str) -> Option<Self> {
        let mut parts = identifier.rsplitn(3, '|');
        let port = parts.next()?.parse().ok()?;
        let target_id = parts.next()?.to_string();
        let target_group_arn = parts.next()?.to_string();
        Some(Self {
            target_group_arn,
            target_id,
            port,
        })
    }

    /// Returns the attachment identifier.
    #[must_use]
    pub fn identifier(&self) -> String {
        format!("{}|{}|{}", self.target_group_arn, self.target_id, self.port)
    }

    fn matches(&self, target: &Value) -> bool {
        target.get("Id").and_then(Value::as_str) == Some(self.target_id.as_str())
            && target
                .get("Port")
                .and_then(Value::as_u64)
                .is_none_or(|port| port == self.port)
    }

    /// Returns true if the target group properties list this target.
    #[must_use]
    pub fn is_registered(&self, properties: &Value) -> bool {
        targets(properties).iter().any(|t| self.matches(t))
    }

    /// Builds the patch registering this target, or `None` if already present.
    #[must_use]
    pub fn register_patch(&self, properties: &Value) -> Option<Value> {
        let mut list = targets(properties);
        if list.iter().any(|t| self.matches(t)) {
            return None;
        }
        list.push(json!({ "Id": self.target_id, "Port": self.port }));
        Some(json!([{ "op": "add", "path": "/Targets", "value": list }]))
    }

    /// Builds the patch deregistering this target, or `None` if absent.
    #[must_use]
    pub fn deregister_patch(&self, properties: &Value) -> Option<Value> {
        let list = targets(properties);
        let remaining: Vec<Value> = list.iter().filter(|t| !self.matches(t)).cloned().collect();
        (remaining.len() != list.len())
            .then(|| json!([{ "op": "replace", "path": "/Targets", "value": remaining }]))
    }
}

fn targets(properties: &Value) -> Vec<Value> {
    properties
        .get("Targets")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
