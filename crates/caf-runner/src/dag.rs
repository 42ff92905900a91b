//! Dependency graph between calibrations.

use crate::error::{CafError, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// DAG over calibration names. An edge `a -> b` means `a` must be done
/// before `b` starts collecting.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph from `(name, dependencies)` pairs.
    pub fn from_dependencies<'a, I>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])> + Clone,
    {
        let mut graph = Self::new();
        for (name, _) in items.clone() {
            graph.add_node(name);
        }
        for (name, deps) in items {
            for dep in deps {
                graph.add_edge(dep, name)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// `dependency` must finish before `dependent`.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) -> Result<()> {
        let to = *self.index.get(dependent).ok_or_else(|| CafError::InvalidConfig(format!(
            "unknown calibration '{}'",
            dependent
        )))?;
        let from = *self
            .index
            .get(dependency)
            .ok_or_else(|| CafError::UnknownDependency {
                calibration: dependent.to_string(),
                dependency: dependency.to_string(),
            })?;
        if dependency == dependent {
            return Err(CafError::SelfDependency(dependent.to_string()));
        }
        if !self.graph.contains_edge(from, to) {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Deterministic topological order: among ready nodes the one added
    /// first goes first. Errors with the offending cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = ready.pop_first() {
            order.push(self.graph[node].clone());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(d) = in_degree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(next);
                    }
                }
            }
        }
        if order.len() != self.graph.node_count() {
            return Err(CafError::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }
        Ok(order)
    }

    /// Direct dependencies of `name`.
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.neighbours(name, Direction::Incoming)
    }

    /// Calibrations depending directly on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.neighbours(name, Direction::Outgoing)
    }

    fn neighbours(&self, name: &str, dir: Direction) -> Vec<String> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// One cycle as a closed path, e.g. `[a, b, a]`.
    fn find_cycle(&self) -> Vec<String> {
        for scc in petgraph::algo::tarjan_scc(&self.graph) {
            let cyclic = scc.len() > 1 || scc.iter().any(|&n| self.graph.contains_edge(n, n));
            if !cyclic {
                continue;
            }
            let members: HashSet<NodeIndex> = scc.iter().copied().collect();
            let Some(&start) = scc.iter().min() else {
                continue;
            };
            let mut path = vec![start];
            let mut seen = HashSet::from([start]);
            let mut current = start;
            loop {
                let Some(next) = self
                    .graph
                    .neighbors_directed(current, Direction::Outgoing)
                    .filter(|n| members.contains(n))
                    .min()
                else {
                    break;
                };
                path.push(next);
                if !seen.insert(next) {
                    let begin = path.iter().position(|&n| n == next).unwrap_or(0);
                    return path[begin..].iter().map(|&n| self.graph[n].clone()).collect();
                }
                current = next;
            }
        }
        Vec::new()
    }
}
