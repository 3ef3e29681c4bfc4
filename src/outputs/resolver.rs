//! Output bindings and their resolution against recorded state.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::OutputConfig;
use crate::error::OutputError;
use crate::graph::{Graph, NodeId};
use crate::state::StackState;
use crate::topology::ids;

/// Names of the outputs every two-tier stack exposes.
pub const DEFAULT_OUTPUT_NAMES: [&str; 4] = [
    "load_balancer_dns_name",
    "web_1_public_ip",
    "web_2_public_ip",
    "database_endpoint",
];

/// A named value bound to one node attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSpec {
    /// Output name.
    pub name: String,
    /// Node the value is read from.
    pub node: NodeId,
    /// Attribute path on the node.
    pub attribute: String,
}

impl OutputSpec {
    /// Creates a binding.
    #[must_use]
    pub fn new(name: impl Into<String>, node: impl Into<NodeId>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            attribute: attribute.into(),
        }
    }
}

impl From<&OutputConfig> for OutputSpec {
    fn from(config: &OutputConfig) -> Self {
        Self::new(config.name.as_str(), config.node.as_str(), config.attribute.as_str())
    }
}

/// Returns the default bindings followed by the configured extras.
#[must_use]
pub fn default_outputs(extra: &[OutputConfig]) -> Vec<OutputSpec> {
    let [lb_dns, web_1, web_2, database] = DEFAULT_OUTPUT_NAMES;
    let mut specs = vec![
        OutputSpec::new(lb_dns, ids::LOAD_BALANCER, "dns_name"),
        OutputSpec::new(web_1, ids::WEB_1, "public_ip"),
        OutputSpec::new(web_2, ids::WEB_2, "public_ip"),
        OutputSpec::new(database, ids::DB_INSTANCE, "address"),
    ];
    specs.extend(extra.iter().map(OutputSpec::from));
    specs
}

/// Checks that every binding names a declared node.
///
/// # Errors
///
/// Returns [`OutputError::UnknownNode`] for the first binding whose node the
/// graph does not declare.
pub fn validate_outputs(graph: &Graph, specs: &[OutputSpec]) -> Result<(), OutputError> {
    for spec in specs {
        if !graph.contains(&spec.node) {
            return Err(OutputError::UnknownNode {
                output: spec.name.clone(),
                node: spec.node.clone(),
            });
        }
    }
    Ok(())
}

/// Reads every binding from recorded state.
///
/// # Errors
///
/// Returns [`OutputError::NodeNotReconciled`] if a bound node has no created
/// resource, or [`OutputError::AttributeMissing`] if the attribute is absent.
pub fn resolve_outputs(
    state: &StackState,
    specs: &[OutputSpec],
) -> Result<BTreeMap<String, Value>, OutputError> {
    specs
        .iter()
        .map(|spec| {
            let resource = state
                .get(&spec.node)
                .filter(|r| r.is_live())
                .ok_or_else(|| OutputError::NodeNotReconciled {
                    output: spec.name.clone(),
                    node: spec.node.clone(),
                })?;
            let value = resource
                .attribute(&spec.attribute)
                .ok_or_else(|| OutputError::AttributeMissing {
                    output: spec.name.clone(),
                    node: spec.node.clone(),
                    attribute: spec.attribute.clone(),
                })?;
            Ok((spec.name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};
    use crate::state::{ObservedResource, ResourceStatus};
    use crate::topology::two_tier::tests::sample_graph;
    use serde_json::json;

    fn recorded(node: &str, kind: ResourceKind, attrs: &[(&str, Value)]) -> ObservedResource {
        let attributes: Attributes = attrs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        ObservedResource::created(NodeId::from(node), kind, format!("p-{node}"), attributes)
    }

    fn converged() -> StackState {
        let mut state = StackState::new("shop", "prod");
        state.upsert(recorded(
            ids::LOAD_BALANCER,
            ResourceKind::LoadBalancer,
            &[("dns_name", json!("shop-alb-1.elb.amazonaws.com"))],
        ));
        state.upsert(recorded(ids::WEB_1, ResourceKind::Instance, &[("public_ip", json!("54.0.0.1"))]));
        state.upsert(recorded(ids::WEB_2, ResourceKind::Instance, &[("public_ip", json!("54.0.0.2"))]));
        state.upsert(recorded(
            ids::DB_INSTANCE,
            ResourceKind::DbInstance,
            &[("address", json!("shop-db.rds.amazonaws.com"))],
        ));
        state
    }

    #[test]
    fn test_resolves_default_outputs() {
        let outputs = resolve_outputs(&converged(), &default_outputs(&[])).expect("resolve");
        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs["web_2_public_ip"], json!("54.0.0.2"));
        assert_eq!(outputs["database_endpoint"], json!("shop-db.rds.amazonaws.com"));
    }

    #[test]
    fn test_unreconciled_node() {
        let mut state = converged();
        state.remove(&NodeId::from(ids::DB_INSTANCE));
        let err = resolve_outputs(&state, &default_outputs(&[])).expect_err("missing db");
        assert!(matches!(err, OutputError::NodeNotReconciled { ref output, .. } if output == "database_endpoint"));
    }

    #[test]
    fn test_deleted_node_is_not_reconciled() {
        let mut state = converged();
        let mut gone = recorded(ids::WEB_1, ResourceKind::Instance, &[("public_ip", json!("54.0.0.1"))]);
        gone.status = ResourceStatus::Deleted;
        state.upsert(gone);
        let err = resolve_outputs(&state, &default_outputs(&[])).expect_err("deleted web");
        assert!(matches!(err, OutputError::NodeNotReconciled { .. }));
    }

    #[test]
    fn test_missing_attribute() {
        let specs = [OutputSpec::new("lb_zone", ids::LOAD_BALANCER, "canonical_hosted_zone_id")];
        let err = resolve_outputs(&converged(), &specs).expect_err("missing attribute");
        assert!(matches!(err, OutputError::AttributeMissing { ref attribute, .. } if attribute == "canonical_hosted_zone_id"));
    }

    #[test]
    fn test_provider_id_output() {
        let specs = [OutputSpec::new("alb", ids::LOAD_BALANCER, "id")];
        let outputs = resolve_outputs(&converged(), &specs).expect("resolve");
        assert_eq!(outputs["alb"], json!("p-load_balancer.web"));
    }

    #[test]
    fn test_validate_rejects_unknown_node() {
        let graph = sample_graph();
        assert!(validate_outputs(&graph, &default_outputs(&[])).is_ok());

        let specs = [OutputSpec::new("cache", "cache_cluster.main", "address")];
        let err = validate_outputs(&graph, &specs).expect_err("unknown node");
        assert!(matches!(err, OutputError::UnknownNode { .. }));
    }
}
