//! Plan types and construction.
//!
//! A plan is an ordered list of actions whose dependencies always precede
//! them. Deletes run child before parent, creates and updates parent before
//! child. Unchanged nodes are only counted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

use crate::error::PlanError;
use crate::graph::{Graph, Node, NodeId, ResourceKind};
use crate::state::StackState;

use super::diff::{DiffEngine, DiffType};
use super::policy::ReplacePolicy;

/// Index of an action within its plan.
pub type ActionId = usize;

/// A complete reconciliation plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Actions in execution order.
    pub actions: Vec<Action>,
    /// Number of declared nodes that need no change.
    pub noop_count: usize,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    /// Position in the plan.
    pub id: ActionId,
    /// Node the action applies to.
    pub node_id: NodeId,
    /// Resource kind of the node.
    pub resource_kind: ResourceKind,
    /// What to do.
    pub kind: ActionKind,
    /// Actions that must reach a terminal state first.
    pub depends_on: BTreeSet<ActionId>,
    /// Desired node, for creates and updates.
    #[serde(skip)]
    pub node: Option<Node>,
    /// Provider identifier, for updates and deletes.
    pub provider_id: Option<String>,
    /// Attributes that differ.
    pub changed_fields: Vec<String>,
    /// Whether this action is half of a replacement.
    pub replacement: bool,
    /// Why the action is needed.
    pub reason: String,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// No operation; counted but never emitted.
    Noop,
}

/// Builds plans from a graph and recorded state.
#[derive(Debug, Default)]
pub struct Planner {
    diff: DiffEngine,
}

/// An action before ids are assigned.
struct Draft {
    action: Action,
    /// Sort phase: deletes before creates and updates.
    phase: u8,
    /// Tie-break within a phase.
    rank: usize,
    depends_on: BTreeSet<usize>,
}

impl Planner {
    /// Creates a planner with the default replace policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a planner with a custom replace policy.
    #[must_use]
    pub const fn with_policy(policy: ReplacePolicy) -> Self {
        Self {
            diff: DiffEngine::with_policy(policy),
        }
    }

    /// Computes the actions that drive `state` toward `graph`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyResolutionFailed`] when the recorded
    /// dependencies of state entries form a cycle.
    pub fn plan(&self, graph: &Graph, state: &StackState, config_hash: &str) -> Result<Plan, PlanError> {
        let mut drafts: Vec<Draft> = Vec::new();
        let mut by_key: HashMap<(NodeId, ActionKind), usize> = HashMap::new();
        let mut pending: HashSet<NodeId> = HashSet::new();
        let mut noop_count = 0;

        for id in graph.declaration_order() {
            let Some(node) = graph.node(&id) else {
                continue;
            };
            let rank = graph.declaration_index(&id).unwrap_or_default();
            let diff = self.diff.diff_node(node, state, &pending);
            debug!(node = %id, change = %diff.diff_type, "Compared node");

            let fields = diff.changed_fields();
            let provider_id = state.get(&id).map(|r| r.provider_id.clone());
            let mut push = |kind: ActionKind, replacement: bool, with_node: bool| {
                by_key.insert((id.clone(), kind), drafts.len());
                drafts.push(Draft {
                    action: Action {
                        id: 0,
                        node_id: id.clone(),
                        resource_kind: node.kind,
                        kind,
                        depends_on: BTreeSet::new(),
                        node: with_node.then(|| node.clone()),
                        provider_id: if kind == ActionKind::Create {
                            None
                        } else {
                            provider_id.clone()
                        },
                        changed_fields: fields.clone(),
                        replacement,
                        reason: diff.reason.clone(),
                    },
                    phase: u8::from(kind != ActionKind::Delete),
                    rank,
                    depends_on: BTreeSet::new(),
                });
            };

            match diff.diff_type {
                DiffType::Create => push(ActionKind::Create, false, true),
                DiffType::Update => push(ActionKind::Update, false, true),
                DiffType::Replace => {
                    push(ActionKind::Delete, true, false);
                    push(ActionKind::Create, true, true);
                }
                DiffType::NoChange => noop_count += 1,
            }
            if diff.creates_resource() {
                pending.insert(id);
            }
        }

        let orphans: Vec<_> = state
            .resources
            .values()
            .filter(|r| !graph.contains(&r.node_id))
            .collect();
        for (i, orphan) in orphans.iter().enumerate() {
            by_key.insert((orphan.node_id.clone(), ActionKind::Delete), drafts.len());
            drafts.push(Draft {
                action: Action {
                    id: 0,
                    node_id: orphan.node_id.clone(),
                    resource_kind: orphan.kind,
                    kind: ActionKind::Delete,
                    depends_on: BTreeSet::new(),
                    node: None,
                    provider_id: Some(orphan.provider_id.clone()),
                    changed_fields: Vec::new(),
                    replacement: false,
                    reason: String::from("no longer declared"),
                },
                phase: 0,
                rank: graph.len() + i,
                depends_on: BTreeSet::new(),
            });
        }

        link_dependencies(graph, state, &mut drafts, &by_key);
        let actions = order(drafts)?;

        let plan = Plan {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions,
            noop_count,
        };
        info!(
            creates = plan.count(ActionKind::Create),
            updates = plan.count(ActionKind::Update),
            deletes = plan.count(ActionKind::Delete),
            unchanged = noop_count,
            "Computed plan"
        );
        Ok(plan)
    }
}

/// Nodes a recorded or declared resource depended on.
fn former_dependencies(graph: &Graph, state: &StackState, node: &NodeId) -> BTreeSet<NodeId> {
    let mut deps: BTreeSet<NodeId> = state
        .get(node)
        .map(|r| r.depends_on.clone())
        .unwrap_or_default();
    deps.extend(graph.dependencies(node).into_iter().cloned());
    deps
}

fn link_dependencies(
    graph: &Graph,
    state: &StackState,
    drafts: &mut [Draft],
    by_key: &HashMap<(NodeId, ActionKind), usize>,
) {
    let lookup = |node: &NodeId, kind: ActionKind| by_key.get(&(node.clone(), kind)).copied();
    let mut edges: Vec<(usize, usize)> = Vec::new();

    for (i, draft) in drafts.iter().enumerate() {
        let node = &draft.action.node_id;
        match draft.action.kind {
            ActionKind::Create | ActionKind::Update => {
                for dep in graph.dependencies(node) {
                    if let Some(j) = lookup(dep, ActionKind::Create).or_else(|| lookup(dep, ActionKind::Update)) {
                        edges.push((i, j));
                    }
                }
                if draft.action.kind == ActionKind::Create {
                    if let Some(j) = lookup(node, ActionKind::Delete) {
                        edges.push((i, j));
                    }
                }
            }
            ActionKind::Delete => {
                // Whatever used to depend on this node goes first.
                for dependent in by_key
                    .iter()
                    .filter(|((_, kind), _)| *kind == ActionKind::Delete)
                    .filter(|((other, _), _)| former_dependencies(graph, state, other).contains(node))
                    .map(|(_, &j)| j)
                {
                    edges.push((i, dependent));
                }
                // A survivor that drops its reference detaches before the delete.
                for survivor in state.resources.values().filter(|r| {
                    r.depends_on.contains(node)
                        && graph.contains(&r.node_id)
                        && !graph.dependencies(&r.node_id).contains(&node)
                }) {
                    if let Some(j) = lookup(&survivor.node_id, ActionKind::Update) {
                        edges.push((i, j));
                    }
                }
            }
            ActionKind::Noop => {}
        }
    }

    for (from, to) in edges {
        if from != to {
            drafts[from].depends_on.insert(to);
        }
    }
}

/// Orders drafts so dependencies come first, assigning action ids.
fn order(drafts: Vec<Draft>) -> Result<Vec<Action>, PlanError> {
    let mut indegree: Vec<usize> = drafts.iter().map(|d| d.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); drafts.len()];
    for (i, draft) in drafts.iter().enumerate() {
        for &dep in &draft.depends_on {
            dependents[dep].push(i);
        }
    }

    let key = |i: usize| (drafts[i].phase, drafts[i].rank, i);
    let mut ready: BTreeSet<(u8, usize, usize)> = (0..drafts.len())
        .filter(|&i| indegree[i] == 0)
        .map(key)
        .collect();

    let mut sequence = Vec::with_capacity(drafts.len());
    while let Some((_, _, next)) = ready.pop_first() {
        sequence.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(key(dependent));
            }
        }
    }

    if sequence.len() != drafts.len() {
        let placed: HashSet<usize> = sequence.iter().copied().collect();
        let stuck: Vec<String> = (0..drafts.len())
            .filter(|i| !placed.contains(i))
            .map(|i| drafts[i].action.node_id.to_string())
            .collect();
        return Err(PlanError::DependencyResolutionFailed {
            message: format!("recorded dependencies form a cycle among {}", stuck.join(", ")),
        });
    }

    let position: HashMap<usize, ActionId> = sequence
        .iter()
        .enumerate()
        .map(|(pos, &draft)| (draft, pos))
        .collect();

    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    let actions = sequence
        .iter()
        .enumerate()
        .filter_map(|(pos, &i)| {
            let draft = slots[i].take()?;
            let mut action = draft.action;
            action.id = pos;
            action.depends_on = draft.depends_on.iter().map(|d| position[d]).collect();
            Some(action)
        })
        .collect();
    Ok(actions)
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: Vec::new(),
            noop_count: 0,
        }
    }

    /// Returns true if the plan has no actions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of a kind.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Returns the number of nodes being replaced.
    #[must_use]
    pub fn replacement_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.replacement && a.kind == ActionKind::Create)
            .count()
    }

    /// Gets an action by id.
    #[must_use]
    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(id)
    }

    /// Returns the actions of one node.
    #[must_use]
    pub fn actions_for(&self, node: &NodeId) -> Vec<&Action> {
        self.actions.iter().filter(|a| &a.node_id == node).collect()
    }

    /// Returns the distinct nodes touched by the plan.
    #[must_use]
    pub fn nodes(&self) -> BTreeSet<&NodeId> {
        self.actions.iter().map(|a| &a.node_id).collect()
    }

    /// Returns a one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to delete ({} replaced), {} unchanged",
            self.count(ActionKind::Create),
            self.count(ActionKind::Update),
            self.count(ActionKind::Delete),
            self.replacement_count(),
            self.noop_count
        )
    }
}

impl Action {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        let verb = match (self.kind, self.replacement) {
            (ActionKind::Create, true) => "Recreate",
            (ActionKind::Create, false) => "Create",
            (ActionKind::Update, _) => "Update",
            (ActionKind::Delete, true) => "Delete (replace)",
            (ActionKind::Delete, false) => "Delete",
            (ActionKind::Noop, _) => "Keep",
        };
        format!("{verb} {} '{}'", self.resource_kind, self.node_id)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.node_id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} actions):", self.actions.len())?;
        for action in &self.actions {
            writeln!(f, "  {}. {action}", action.id)?;
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::graph::{Reference, Resolution};
    use crate::state::ObservedResource;
    use crate::topology::ids;
    use crate::topology::two_tier::tests::sample_graph;

    /// Builds the state a successful apply of `graph` would record.
    pub(crate) fn converged_state(graph: &Graph) -> StackState {
        let mut state = StackState::new("shop", "prod");
        for id in graph.declaration_order() {
            let Some(node) = graph.node(&id) else { continue };
            let lookup = |r: &Reference| state.get(&r.node).and_then(|o| o.attribute(&r.attribute));
            let attributes = node
                .resolve_attributes(&lookup, Resolution::ForState)
                .expect("dependencies recorded first");
            let resource = ObservedResource::created(id.clone(), node.kind, format!("p-{id}"), attributes)
                .with_depends_on(node.edges());
            state.upsert(resource);
        }
        state
    }

    fn position(plan: &Plan, node: &str, kind: ActionKind) -> usize {
        plan.actions
            .iter()
            .position(|a| a.node_id.as_str() == node && a.kind == kind)
            .unwrap_or_else(|| panic!("no {kind} action for {node}"))
    }

    fn shape(plan: &Plan) -> Vec<(String, ActionKind, Vec<usize>)> {
        plan.actions
            .iter()
            .map(|a| (a.node_id.to_string(), a.kind, a.depends_on.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn test_first_apply_creates_everything_in_order() {
        let graph = sample_graph();
        let plan = Planner::new()
            .plan(&graph, &StackState::new("shop", "prod"), "h")
            .expect("plan");

        assert_eq!(plan.len(), 21);
        assert_eq!(plan.count(ActionKind::Create), 21);

        let vpc = position(&plan, ids::VPC, ActionKind::Create);
        for subnet in [
            ids::PUBLIC_SUBNET_A,
            ids::PUBLIC_SUBNET_B,
            ids::PRIVATE_SUBNET_A,
            ids::PRIVATE_SUBNET_B,
        ] {
            assert!(vpc < position(&plan, subnet, ActionKind::Create));
        }
        for (subnet, assoc, instance) in [
            (ids::PUBLIC_SUBNET_A, ids::ROUTE_ASSOC_A, ids::WEB_1),
            (ids::PUBLIC_SUBNET_B, ids::ROUTE_ASSOC_B, ids::WEB_2),
        ] {
            let s = position(&plan, subnet, ActionKind::Create);
            assert!(s < position(&plan, assoc, ActionKind::Create));
            assert!(s < position(&plan, instance, ActionKind::Create));
        }
        for instance in [ids::WEB_1, ids::WEB_2] {
            let i = position(&plan, instance, ActionKind::Create);
            assert!(i < position(&plan, ids::ATTACH_WEB_1, ActionKind::Create));
            assert!(i < position(&plan, ids::ATTACH_WEB_2, ActionKind::Create));
        }

        let db = &plan.actions[position(&plan, ids::DB_INSTANCE, ActionKind::Create)];
        let deps: BTreeSet<&str> = db
            .depends_on
            .iter()
            .map(|&d| plan.actions[d].node_id.as_str())
            .collect();
        assert_eq!(deps, BTreeSet::from([ids::DB_SUBNET_GROUP, ids::PRIVATE_SECURITY_GROUP]));
    }

    #[test]
    fn test_dependencies_precede_actions() {
        let plan = Planner::new()
            .plan(&sample_graph(), &StackState::new("shop", "prod"), "h")
            .expect("plan");
        for action in &plan.actions {
            assert!(action.depends_on.iter().all(|&d| d < action.id));
        }
    }

    #[test]
    fn test_planning_is_idempotent() {
        let graph = sample_graph();
        let mut state = converged_state(&graph);
        state.remove(&NodeId::from(ids::WEB_2));
        state.resources.retain(|id, _| id.as_str() != ids::ATTACH_WEB_2);

        let planner = Planner::new();
        let first = planner.plan(&graph, &state, "h").expect("plan");
        let second = planner.plan(&graph, &state, "h").expect("plan");
        assert_eq!(shape(&first), shape(&second));
        assert_eq!(first.count(ActionKind::Create), 2);
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let graph = sample_graph();
        let plan = Planner::new()
            .plan(&graph, &converged_state(&graph), "h")
            .expect("plan");
        assert!(plan.is_empty(), "{plan}");
        assert_eq!(plan.noop_count, 21);
    }

    #[test]
    fn test_destroy_deletes_dependents_first() {
        let graph = sample_graph();
        let plan = Planner::new()
            .plan(&Graph::empty(), &converged_state(&graph), "h")
            .expect("plan");
        assert_eq!(plan.count(ActionKind::Delete), 21);

        let vpc = position(&plan, ids::VPC, ActionKind::Delete);
        for sg in [ids::LB_SECURITY_GROUP, ids::PUBLIC_SECURITY_GROUP, ids::PRIVATE_SECURITY_GROUP] {
            let s = position(&plan, sg, ActionKind::Delete);
            assert!(s < vpc);
            for dependent in [ids::WEB_1, ids::WEB_2, ids::LOAD_BALANCER, ids::DB_INSTANCE] {
                if graph
                    .dependencies(&NodeId::from(dependent))
                    .iter()
                    .any(|d| d.as_str() == sg)
                {
                    assert!(position(&plan, dependent, ActionKind::Delete) < s);
                }
            }
        }
        for (attach, instance) in [(ids::ATTACH_WEB_1, ids::WEB_1), (ids::ATTACH_WEB_2, ids::WEB_2)] {
            assert!(position(&plan, attach, ActionKind::Delete) < position(&plan, instance, ActionKind::Delete));
        }
    }

    #[test]
    fn test_immutable_change_cascades_replacement() {
        let graph = sample_graph();
        let mut state = converged_state(&graph);
        if let Some(vpc) = state.resources.get_mut(&NodeId::from(ids::VPC)) {
            vpc.attributes.insert(String::from("cidr_block"), serde_json::json!("10.9.0.0/16"));
        }

        let plan = Planner::new().plan(&graph, &state, "h").expect("plan");
        let vpc_delete = position(&plan, ids::VPC, ActionKind::Delete);
        let vpc_create = position(&plan, ids::VPC, ActionKind::Create);
        let subnet_delete = position(&plan, ids::PUBLIC_SUBNET_A, ActionKind::Delete);
        let subnet_create = position(&plan, ids::PUBLIC_SUBNET_A, ActionKind::Create);

        assert!(subnet_delete < vpc_delete);
        assert!(vpc_delete < vpc_create);
        assert!(vpc_create < subnet_create);
        assert!(plan.actions[subnet_create].replacement);
        assert!(plan.actions[subnet_create].depends_on.contains(&vpc_create));
    }

    #[test]
    fn test_replacement_cascades_through_mutable_references() {
        let graph = sample_graph();
        let mut state = converged_state(&graph);
        if let Some(lb_sg) = state.resources.get_mut(&NodeId::from(ids::LB_SECURITY_GROUP)) {
            lb_sg.attributes.insert(String::from("group_name"), serde_json::json!("renamed"));
        }

        let plan = Planner::new().plan(&graph, &state, "h").expect("plan");
        assert_eq!(plan.count(ActionKind::Update), 0, "{plan}");

        // Everything still pointing at the old group goes before it.
        let sg_delete = position(&plan, ids::LB_SECURITY_GROUP, ActionKind::Delete);
        for holder in [ids::LOAD_BALANCER, ids::PUBLIC_SECURITY_GROUP] {
            let delete = position(&plan, holder, ActionKind::Delete);
            assert!(delete < sg_delete);
            assert!(plan.actions[sg_delete].depends_on.contains(&delete));
        }
        assert!(
            position(&plan, ids::LISTENER, ActionKind::Delete)
                < position(&plan, ids::LOAD_BALANCER, ActionKind::Delete)
        );

        let sg_create = position(&plan, ids::LB_SECURITY_GROUP, ActionKind::Create);
        let lb_create = &plan.actions[position(&plan, ids::LOAD_BALANCER, ActionKind::Create)];
        assert!(lb_create.replacement);
        assert!(lb_create.depends_on.contains(&sg_create));
        assert!(lb_create.reason.contains(ids::LB_SECURITY_GROUP), "{}", lb_create.reason);
    }

    #[test]
    fn test_recreated_parent_updates_mutable_holders() {
        let graph = sample_graph();
        let mut state = converged_state(&graph);
        if let Some(lb_sg) = state.resources.get_mut(&NodeId::from(ids::LB_SECURITY_GROUP)) {
            lb_sg.status = crate::state::ResourceStatus::Deleted;
        }

        let plan = Planner::new().plan(&graph, &state, "h").expect("plan");
        assert_eq!(plan.count(ActionKind::Delete), 0, "{plan}");
        let sg_create = position(&plan, ids::LB_SECURITY_GROUP, ActionKind::Create);
        let lb = &plan.actions[position(&plan, ids::LOAD_BALANCER, ActionKind::Update)];
        assert!(lb.depends_on.contains(&sg_create));
        assert_eq!(lb.changed_fields, vec!["security_groups"]);
    }

    #[test]
    fn test_replaced_node_waits_for_detaching_update() {
        let graph = Graph::build(vec![
            Node::new("security_group.a", ResourceKind::SecurityGroup).with_attr("group_name", "a"),
            Node::new("security_group.b", ResourceKind::SecurityGroup).with_attr("group_name", "b"),
        ])
        .expect("graph");
        let mut state = converged_state(&graph);
        if let Some(a) = state.resources.get_mut(&NodeId::from("security_group.a")) {
            a.attributes.insert(String::from("group_name"), serde_json::json!("old"));
        }
        if let Some(b) = state.resources.get_mut(&NodeId::from("security_group.b")) {
            b.depends_on.insert(NodeId::from("security_group.a"));
            b.attributes.insert(String::from("ingress"), serde_json::json!(["p-security_group.a"]));
        }

        let plan = Planner::new().plan(&graph, &state, "h").expect("plan");
        let update = position(&plan, "security_group.b", ActionKind::Update);
        let delete = position(&plan, "security_group.a", ActionKind::Delete);
        assert!(plan.actions[delete].depends_on.contains(&update), "{plan}");
    }

    #[test]
    fn test_orphan_is_deleted_after_survivor_update() {
        let graph = Graph::build(vec![
            Node::new("vpc.main", ResourceKind::Vpc).with_attr("cidr_block", "10.0.0.0/16"),
        ])
        .expect("graph");
        let mut state = converged_state(&graph);
        state.upsert(
            ObservedResource::created(NodeId::from("subnet.old"), ResourceKind::Subnet, "subnet-9", Default::default())
                .with_depends_on(BTreeSet::from([NodeId::from("vpc.main")])),
        );
        if let Some(vpc) = state.resources.get_mut(&NodeId::from("vpc.main")) {
            vpc.depends_on.insert(NodeId::from("subnet.old"));
            vpc.attributes.insert(String::from("flow_log"), serde_json::json!("subnet-9"));
        }

        let plan = Planner::new().plan(&graph, &state, "h").expect("plan");
        let update = position(&plan, "vpc.main", ActionKind::Update);
        let delete = position(&plan, "subnet.old", ActionKind::Delete);
        assert!(update < delete);
        assert!(plan.actions[delete].depends_on.contains(&update));
    }

    #[test]
    fn test_orphan_cycle_is_rejected() {
        let mut state = StackState::new("shop", "prod");
        for (id, other) in [("subnet.a", "subnet.b"), ("subnet.b", "subnet.a")] {
            state.upsert(
                ObservedResource::created(NodeId::from(id), ResourceKind::Subnet, id, Default::default())
                    .with_depends_on(BTreeSet::from([NodeId::from(other)])),
            );
        }

        let result = Planner::new().plan(&Graph::empty(), &state, "h");
        assert!(matches!(result, Err(PlanError::DependencyResolutionFailed { .. })));
    }

    #[test]
    fn test_orphans_are_deleted() {
        let graph = sample_graph();
        let mut state = converged_state(&graph);
        state.upsert(
            ObservedResource::created(NodeId::from("instance.web_3"), ResourceKind::Instance, "i-3", Default::default())
                .with_depends_on(BTreeSet::from([
                    NodeId::from(ids::PUBLIC_SUBNET_A),
                    NodeId::from(ids::PUBLIC_SECURITY_GROUP),
                ])),
        );

        let plan = Planner::new().plan(&graph, &state, "h").expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::Delete);
        assert_eq!(plan.actions[0].provider_id.as_deref(), Some("i-3"));
        assert_eq!(plan.noop_count, 21);
    }
}
