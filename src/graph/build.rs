//! Graph construction and deterministic ordering.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::GraphError;

use super::node::{Node, NodeId};

/// Validated, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Nodes in declaration order.
    nodes: Vec<Node>,
    /// Node id to declaration index.
    index: HashMap<NodeId, usize>,
    /// Indices each node depends on.
    dependencies: Vec<BTreeSet<usize>>,
    /// Indices depending on each node.
    dependents: Vec<BTreeSet<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl Graph {
    /// Builds a graph from nodes in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] for repeated ids,
    /// [`GraphError::DanglingReference`] for references to undeclared nodes,
    /// and [`GraphError::Cycle`] when the edges are not acyclic.
    pub fn build(nodes: Vec<Node>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode {
                    node: node.id.clone(),
                });
            }
        }

        let mut dependencies = vec![BTreeSet::new(); nodes.len()];
        let mut dependents = vec![BTreeSet::new(); nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            for target in node.edges() {
                let Some(&j) = index.get(&target) else {
                    return Err(GraphError::DanglingReference {
                        node: node.id.clone(),
                        reference: target,
                    });
                };
                dependencies[i].insert(j);
                dependents[j].insert(i);
            }
        }

        let graph = Self {
            nodes,
            index,
            dependencies,
            dependents,
        };

        let order = graph.kahn(|i| i);
        if order.len() != graph.nodes.len() {
            let sorted: BTreeSet<usize> = order.into_iter().collect();
            let remaining: BTreeSet<usize> = (0..graph.nodes.len())
                .filter(|i| !sorted.contains(i))
                .collect();
            return Err(GraphError::Cycle {
                path: graph.find_cycle(&remaining),
            });
        }

        debug!("Built resource graph with {} nodes", graph.nodes.len());
        Ok(graph)
    }

    /// Returns an empty graph, used to plan the destruction of everything in state.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns true if the graph declares the node.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the declaration index of a node.
    #[must_use]
    pub fn declaration_index(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns the direct dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, id: &NodeId) -> Vec<&NodeId> {
        self.index.get(id).map_or_else(Vec::new, |&i| {
            self.dependencies[i].iter().map(|&j| &self.nodes[j].id).collect()
        })
    }

    /// Returns the direct dependents of a node.
    #[must_use]
    pub fn dependents(&self, id: &NodeId) -> Vec<&NodeId> {
        self.index.get(id).map_or_else(Vec::new, |&i| {
            self.dependents[i].iter().map(|&j| &self.nodes[j].id).collect()
        })
    }

    /// Returns a dependency-respecting order, ties broken lexicographically on node id.
    #[must_use]
    pub fn topological_order(&self) -> Vec<NodeId> {
        self.kahn(|i| self.nodes[i].id.clone())
            .into_iter()
            .map(|i| self.nodes[i].id.clone())
            .collect()
    }

    /// Returns a dependency-respecting order, ties broken by declaration order.
    #[must_use]
    pub fn declaration_order(&self) -> Vec<NodeId> {
        self.kahn(|i| i)
            .into_iter()
            .map(|i| self.nodes[i].id.clone())
            .collect()
    }

    /// Kahn's algorithm with an ordered ready set.
    fn kahn<K: Ord>(&self, key: impl Fn(usize) -> K) -> Vec<usize> {
        let mut indegree: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<(K, usize)> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| (key(i), i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, next)) = ready.pop_first() {
            order.push(next);
            for &dependent in &self.dependents[next] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert((key(dependent), dependent));
                }
            }
        }
        order
    }

    /// Finds one cycle among nodes Kahn's algorithm could not order.
    fn find_cycle(&self, remaining: &BTreeSet<usize>) -> Vec<NodeId> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        for &start in remaining {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                return cycle;
            }
        }
        remaining.iter().map(|&i| self.nodes[i].id.clone()).collect()
    }

    fn visit(&self, at: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<NodeId>> {
        marks[at] = Mark::InProgress;
        stack.push(at);

        for &next in &self.dependencies[at] {
            match marks[next] {
                Mark::InProgress => {
                    let start = stack.iter().position(|&i| i == next)?;
                    let mut path: Vec<NodeId> = stack[start..]
                        .iter()
                        .map(|&i| self.nodes[i].id.clone())
                        .collect();
                    path.push(self.nodes[next].id.clone());
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[at] = Mark::Done;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;

    fn node(id: &str, deps: &[&str]) -> Node {
        deps.iter().fold(Node::new(id, ResourceKind::Subnet), |n, d| {
            n.with_ref(format!("ref_{d}"), *d, "id")
        })
    }

    /// Deterministic pseudo-random acyclic graphs: edges only point to earlier nodes.
    fn random_dag(seed: u64, size: usize) -> Vec<Node> {
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            state >> 33
        };
        let mut nodes: Vec<Node> = Vec::with_capacity(size);
        for i in 0..size {
            let mut n = Node::new(format!("n{:02}", (i * 7 + 3) % size), ResourceKind::Instance);
            for j in 0..i {
                if next() % 3 == 0 {
                    n = n.with_dependency(nodes[j].id.clone());
                }
            }
            nodes.push(n);
        }
        nodes.reverse();
        nodes
    }

    fn assert_respects_edges(graph: &Graph, order: &[NodeId]) {
        let position: HashMap<&NodeId, usize> = order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for n in graph.nodes() {
            for dep in n.edges() {
                assert!(position[&dep] < position[&n.id], "{dep} must precede {}", n.id);
            }
        }
    }

    #[test]
    fn test_orders_by_dependency_edges() {
        let graph = Graph::build(vec![node("b", &["a"]), node("a", &[])]).expect("acyclic");
        assert_eq!(graph.topological_order(), vec![NodeId::from("a"), NodeId::from("b")]);
    }

    #[test]
    fn test_lexicographic_tie_break() {
        let graph = Graph::build(vec![node("zeta", &[]), node("alpha", &[]), node("mid", &[])])
            .expect("acyclic");
        let order: Vec<_> = graph.topological_order().into_iter().map(|n| n.to_string()).collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_declaration_tie_break() {
        let graph = Graph::build(vec![node("zeta", &[]), node("alpha", &[]), node("mid", &["zeta"])])
            .expect("acyclic");
        let order: Vec<_> = graph.declaration_order().into_iter().map(|n| n.to_string()).collect();
        assert_eq!(order, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_random_acyclic_graphs_build_and_respect_edges() {
        for seed in 0..50 {
            let graph = Graph::build(random_dag(seed, 12)).expect("acyclic graphs build");
            let lexical = graph.topological_order();
            let declared = graph.declaration_order();
            assert_eq!(lexical.len(), graph.len());
            assert_respects_edges(&graph, &lexical);
            assert_respects_edges(&graph, &declared);
            assert_eq!(lexical, graph.topological_order(), "order is stable");
        }
    }

    #[test]
    fn test_detects_cycle() {
        let err = Graph::build(vec![node("a", &["c"]), node("b", &["a"]), node("c", &["b"]), node("d", &["a"])])
            .expect_err("must fail");
        let GraphError::Cycle { path } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
        assert!(!path.contains(&NodeId::from("d")));
    }

    #[test]
    fn test_random_graphs_with_back_edge_fail_with_cycle() {
        for seed in 0..20 {
            let mut nodes = random_dag(seed, 8);
            let last = nodes.len() - 1;
            let first_id = nodes[0].id.clone();
            let last_id = nodes[last].id.clone();
            nodes[0].depends_on.insert(last_id);
            nodes[last].depends_on.insert(first_id);
            let err = Graph::build(nodes).expect_err("cycle");
            assert!(matches!(err, GraphError::Cycle { .. }));
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = Graph::build(vec![node("a", &["a"])]).expect_err("must fail");
        assert_eq!(
            err,
            GraphError::Cycle {
                path: vec![NodeId::from("a"), NodeId::from("a")]
            }
        );
    }

    #[test]
    fn test_dangling_reference() {
        let err = Graph::build(vec![node("a", &["ghost"])]).expect_err("must fail");
        assert_eq!(
            err,
            GraphError::DanglingReference {
                node: NodeId::from("a"),
                reference: NodeId::from("ghost"),
            }
        );
    }

    #[test]
    fn test_duplicate_node() {
        let err = Graph::build(vec![node("a", &[]), node("a", &[])]).expect_err("must fail");
        assert!(matches!(err, GraphError::DuplicateNode { .. }));
    }

    #[test]
    fn test_dependents_and_dependencies() {
        let graph = Graph::build(vec![node("vpc", &[]), node("a", &["vpc"]), node("b", &["vpc"])])
            .expect("acyclic");
        assert_eq!(graph.dependents(&NodeId::from("vpc")).len(), 2);
        assert_eq!(graph.dependencies(&NodeId::from("a")), vec![&NodeId::from("vpc")]);
        assert!(graph.dependencies(&NodeId::from("missing")).is_empty());
    }
}
