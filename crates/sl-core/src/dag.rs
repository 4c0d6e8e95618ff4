//! Table dependency graph and load ordering

use crate::error::{CoreError, CoreResult};
use crate::names::TableName;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// A directed acyclic graph of table load dependencies.
///
/// Edges run from a dependency to its dependent, so a topological sort
/// yields referenced tables first.
#[derive(Debug, Default)]
pub struct TableDag {
    graph: DiGraph<TableName, ()>,
    node_map: HashMap<TableName, NodeIndex>,
}

impl TableDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, returning its existing node if already present
    pub fn add_table(&mut self, name: &TableName) -> NodeIndex {
        if let Some(&idx) = self.node_map.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.clone());
        self.node_map.insert(name.clone(), idx);
        idx
    }

    /// Record that `table` must be loaded after `depends_on`
    pub fn add_dependency(&mut self, table: &TableName, depends_on: &TableName) {
        let from = self.add_table(table);
        let to = self.add_table(depends_on);
        self.graph.update_edge(to, from, ());
    }

    /// Fail with `DependencyCycle` if the graph is not acyclic
    pub fn validate(&self) -> CoreResult<()> {
        self.sorted_indices().map(|_| ())
    }

    fn sorted_indices(&self) -> CoreResult<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| CoreError::DependencyCycle {
            cycle: self.find_cycle_path(cycle.node_id()),
        })
    }

    /// Walk outgoing edges from `start` until a node repeats, for error reporting
    fn find_cycle_path(&self, start: NodeIndex) -> String {
        let mut path: Vec<String> = vec![self.graph[start].to_string()];
        let mut current = start;
        let mut visited = HashSet::new();
        visited.insert(current);

        while let Some(edge) = self.graph.edges(current).next() {
            let target = edge.target();
            path.push(self.graph[target].to_string());

            if target == start || !visited.insert(target) {
                break;
            }
            current = target;
        }

        path.join(" -> ")
    }

    /// Group tables into levels: a table's level is one more than the
    /// deepest table it depends on. Tables within a level are independent
    /// of each other and keep insertion order.
    pub fn levels(&self) -> CoreResult<Vec<Vec<TableName>>> {
        let sorted = self.sorted_indices()?;
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for &idx in &sorted {
            let d = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| depth.get(&e.source()).map_or(0, |d| d + 1))
                .max()
                .unwrap_or(0);
            depth.insert(idx, d);
        }

        let max_depth = depth.values().copied().max();
        let mut levels: Vec<Vec<NodeIndex>> = match max_depth {
            Some(m) => vec![Vec::new(); m + 1],
            None => return Ok(Vec::new()),
        };
        for (idx, d) in depth {
            levels[d].push(idx);
        }

        Ok(levels
            .into_iter()
            .map(|mut level| {
                level.sort_by_key(|idx| idx.index());
                level.into_iter().map(|idx| self.graph[idx].clone()).collect()
            })
            .collect())
    }

    /// Tables in load order (dependencies first), deterministic for a given
    /// insertion order
    pub fn topological_order(&self) -> CoreResult<Vec<TableName>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Direct dependencies of a table
    pub fn dependencies(&self, table: &str) -> Vec<TableName> {
        self.neighbors(table, Direction::Incoming)
    }

    /// Direct dependents of a table
    pub fn dependents(&self, table: &str) -> Vec<TableName> {
        self.neighbors(table, Direction::Outgoing)
    }

    fn neighbors(&self, table: &str, direction: Direction) -> Vec<TableName> {
        let Some(&idx) = self.node_map.get(table) else {
            return Vec::new();
        };
        let mut names: Vec<TableName> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, table: &str) -> bool {
        self.node_map.contains_key(table)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
#[path = "dag_test.rs"]
mod tests;
