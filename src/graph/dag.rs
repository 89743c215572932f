//! Validated directed acyclic graph of task nodes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::GraphError;

use super::node::TaskNode;

/// Task nodes keyed by name.
///
/// Nodes are kept in a `BTreeMap` so iteration, topological order and
/// equality are independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskGraph {
    nodes: BTreeMap<String, TaskNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and validates a graph from a list of nodes.
    pub fn from_nodes(nodes: impl IntoIterator<Item = TaskNode>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add(node)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Inserts a node. Dependencies are checked by [`TaskGraph::validate`].
    pub fn add(&mut self, node: TaskNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.name) {
            return Err(GraphError::DuplicateTask(node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    /// Checks every dependency exists and the graph has no cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if !self.nodes.contains_key(&dep.upstream) {
                    return Err(GraphError::UnknownDependency {
                        task: node.name.clone(),
                        upstream: dep.upstream.clone(),
                    });
                }
            }
        }
        let order = self.topological_order();
        if order.len() != self.nodes.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let stuck: Vec<&str> = self
                .nodes
                .keys()
                .map(String::as_str)
                .filter(|name| !placed.contains(name))
                .collect();
            return Err(GraphError::Cycle(stuck.join(", ")));
        }
        Ok(())
    }

    /// Kahn's algorithm, ties broken by name. Nodes on a cycle are omitted.
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| {
                let known = n
                    .dependencies
                    .iter()
                    .map(|d| d.upstream.as_str())
                    .filter(|upstream| self.nodes.contains_key(*upstream))
                    .collect::<BTreeSet<_>>()
                    .len();
                (n.name.as_str(), known)
            })
            .collect();

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&name, _)| name)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for dependent in self.dependents(name) {
                if let Some(d) = indegree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }

    /// Nodes with a direct edge from `name`.
    pub fn dependents<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.dependencies.iter().any(|d| d.upstream == name))
            .map(|n| n.name.as_str())
    }

    /// Every node reachable downstream of `name`, excluding `name`.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.to_string()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen.remove(name);
        seen
    }

    /// `(upstream, downstream)` pairs, sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .nodes
            .values()
            .flat_map(|n| {
                n.dependencies
                    .iter()
                    .map(move |d| (d.upstream.clone(), n.name.clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
