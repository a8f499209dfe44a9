use std::collections::HashMap;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::blueprint::TaskMap;
use crate::core::TaskKey;
use crate::engine::{EdgeKind, Node};
use crate::error::BuildError;

/// The resolved dependency graph of a [`TaskMap`].
///
/// Edges point from a dependency to its dependant, the direction work flows
/// in. Soft references are kept aside: they never order two tasks and never
/// count as a cycle.
pub struct TaskGraph<C> {
    pub(crate) graph: Graph<Node<C>, ()>,
    index: HashMap<TaskKey, NodeIndex>,
    order: Vec<NodeIndex>,
    /// `(dependant, dependency)` pairs.
    soft: Vec<(NodeIndex, NodeIndex)>,
}

impl<C> TaskGraph<C> {
    /// Resolves every reference in the map into an edge.
    ///
    /// Fails on references to tasks that are not in the map, including
    /// resources that are only there to be deleted, and on dependency cycles.
    pub fn build(map: TaskMap<C>) -> Result<Self, BuildError> {
        let mut graph = Graph::with_capacity(map.nodes.len(), map.nodes.len());
        let mut index = HashMap::with_capacity(map.nodes.len());

        for (key, node) in map.nodes {
            index.insert(key, graph.add_node(node));
        }

        let mut soft = Vec::new();
        for dependant in graph.node_indices() {
            let from = graph[dependant].key();
            let is_deletion = matches!(graph[dependant], Node::Delete(_));

            for (to, kind) in graph[dependant].dependencies() {
                let dependency = match index.get(&to) {
                    Some(&dependency) => dependency,
                    None => return Err(BuildError::UnresolvedReference { from, to }),
                };

                // Only other deletions may wait for a deletion.
                if !is_deletion && matches!(graph[dependency], Node::Delete(_)) {
                    return Err(BuildError::UnresolvedReference { from, to });
                }

                match kind {
                    EdgeKind::Hard => {
                        graph.update_edge(dependency, dependant, ());
                    }
                    EdgeKind::Soft => soft.push((dependant, dependency)),
                }
            }
        }

        if let Some(members) = find_cycle(&graph) {
            return Err(BuildError::Cycle { members });
        }

        let order = toposort(&graph, None).map_err(|cycle| BuildError::Cycle {
            members: vec![graph[cycle.node_id()].key()],
        })?;

        soft.sort();
        soft.dedup();

        debug!(
            tasks = graph.node_count(),
            edges = graph.edge_count(),
            soft = soft.len(),
            "task graph resolved"
        );

        Ok(Self {
            graph,
            index,
            order,
            soft,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.index.contains_key(key)
    }

    /// Tasks `key` waits for, through hard edges.
    pub fn dependencies(&self, key: &TaskKey) -> Vec<TaskKey> {
        self.neighbors(key, Direction::Incoming)
    }

    /// Tasks that wait for `key`, through hard edges.
    pub fn dependants(&self, key: &TaskKey) -> Vec<TaskKey> {
        self.neighbors(key, Direction::Outgoing)
    }

    /// Every key, dependencies before dependants.
    pub fn topological_order(&self) -> Vec<TaskKey> {
        self.order.iter().map(|&i| self.graph[i].key()).collect()
    }

    /// Soft references as `(dependant, dependency)` pairs.
    pub fn soft_edges(&self) -> Vec<(TaskKey, TaskKey)> {
        self.soft
            .iter()
            .map(|&(from, to)| (self.graph[from].key(), self.graph[to].key()))
            .collect()
    }

    pub(crate) fn node(&self, key: &TaskKey) -> Option<&Node<C>> {
        self.index.get(key).map(|&i| &self.graph[i])
    }

    pub(crate) fn order(&self) -> &[NodeIndex] {
        &self.order
    }

    pub(crate) fn soft_indices(&self) -> &[(NodeIndex, NodeIndex)] {
        &self.soft
    }

    fn neighbors(&self, key: &TaskKey, direction: Direction) -> Vec<TaskKey> {
        let Some(&index) = self.index.get(key) else {
            return Vec::new();
        };
        let mut keys: Vec<_> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|i| self.graph[i].key())
            .collect();
        keys.sort();
        keys
    }
}

/// Members of one dependency cycle, if there is any. A task that hard
/// references itself is a cycle of one.
fn find_cycle<C>(graph: &Graph<Node<C>, ()>) -> Option<Vec<TaskKey>> {
    tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut members: Vec<_> = scc.into_iter().map(|i| graph[i].key()).collect();
            members.sort();
            members
        })
}
