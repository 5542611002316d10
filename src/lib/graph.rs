//! The package dependency graph: cycle detection, topological ordering, and the "last eligible"
//! selection rule the scheduler uses to pick the next package to build.
//!
//! An edge `a -> b` means "`a` depends on `b`". A node is *eligible* once all of its outgoing
//! edges are gone, i.e. every dependency has finished building and been removed from the graph.

use crate::util::{error::Result, graph::Graph};
use petgraph::{graph::NodeIndex, Direction};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct DependencyGraph<T: Eq> {
    inner: Graph<T>,
}

impl<T: Eq> Default for DependencyGraph<T> {
    fn default() -> Self {
        DependencyGraph {
            inner: Graph::default(),
        }
    }
}

impl<T: Eq> DependencyGraph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&mut self, value: T) -> NodeIndex {
        self.inner.inner.add_node(value)
    }

    pub fn find(&self, value: &T) -> Option<NodeIndex> {
        self.inner.find_id(value)
    }

    /// Record that `from` depends on `to`.
    pub fn add_dependency(&mut self, from: NodeIndex, to: NodeIndex) {
        if self.inner.inner.find_edge(from, to).is_none() {
            self.inner.inner.add_edge(from, to, ());
        }
    }

    pub fn get(&self, idx: NodeIndex) -> &T {
        &self.inner[idx]
    }

    pub fn len(&self) -> usize {
        self.inner.inner.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.inner.inner.node_indices().collect()
    }

    /// Depth-first search collecting every node that participates in a cycle. An empty result
    /// means the graph is acyclic.
    pub fn cycled_nodes(&self) -> HashSet<NodeIndex> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut cycled = HashSet::new();

        for start in self.inner.inner.node_indices() {
            if !visited.contains(&start) {
                let mut stack = vec![(start, false)];
                let mut path = Vec::new();
                while let Some((node, finishing)) = stack.pop() {
                    if finishing {
                        path.pop();
                        on_stack.remove(&node);
                        continue;
                    }
                    if on_stack.contains(&node) {
                        // back edge: everything currently on the path from `node` onward is
                        // part of a cycle.
                        if let Some(pos) = path.iter().position(|n| *n == node) {
                            for n in &path[pos..] {
                                cycled.insert(*n);
                            }
                        }
                        continue;
                    }
                    if visited.contains(&node) {
                        continue;
                    }
                    visited.insert(node);
                    on_stack.insert(node);
                    path.push(node);
                    stack.push((node, true));
                    for (child, _) in self.inner.children(node) {
                        stack.push((child, false));
                    }
                }
            }
        }

        cycled
    }

    pub fn check_acyclic(&self) -> Result<()> {
        let cycled = self.cycled_nodes();
        if cycled.is_empty() {
            Ok(())
        } else {
            Err(crate::util::error::ErrorKind::Cycle.into())
        }
    }

    /// A full topological order (dependencies before dependents), via repeated removal of
    /// eligible nodes. Panics-free: an empty vec longer than the graph indicates a cycle, which
    /// callers should have ruled out with `check_acyclic` first.
    pub fn topo_order(&self) -> Vec<NodeIndex>
    where
        T: Clone,
    {
        let mut remaining: HashSet<NodeIndex> = self.inner.inner.node_indices().collect();
        let mut order = Vec::new();

        while !remaining.is_empty() {
            let eligible: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|n| {
                    self.inner
                        .inner
                        .neighbors_directed(*n, Direction::Outgoing)
                        .all(|dep| !remaining.contains(&dep))
                })
                .collect();
            if eligible.is_empty() {
                break;
            }
            for n in &eligible {
                remaining.remove(n);
                order.push(*n);
            }
        }

        order
    }

    /// Among the still-present nodes satisfying `ready` (all dependencies already finished),
    /// pick the *last* one in node-index order. Node indices increase with insertion order, so
    /// this consistently prefers packages that were declared later in the recipe tree, which
    /// tends to be leaf/library packages discovered last during a depth-first recipe walk.
    pub fn topo_next<F>(&self, ready: F) -> Option<NodeIndex>
    where
        F: Fn(&T) -> bool,
    {
        self.inner
            .inner
            .node_indices()
            .filter(|idx| {
                self.inner
                    .inner
                    .neighbors_directed(*idx, Direction::Outgoing)
                    .count()
                    == 0
                    && ready(&self.inner[*idx])
            })
            .last()
    }

    /// Remove a finished package and its edges from the graph. Backed by `StableGraph`, so `idx`
    /// stays valid for every other node still in the graph; a plain `petgraph::Graph` would
    /// swap the last node into the freed slot and silently reassign indices the scheduler may
    /// still be holding for an in-flight build on another thread.
    pub fn delete_node(&mut self, idx: NodeIndex) -> T {
        self.inner.inner.remove_node(idx).expect("node present")
    }

    pub fn parents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.inner.parents(idx).map(|(i, _)| i).collect()
    }

    pub fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.inner.children(idx).map(|(i, _)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_graph_has_no_cycled_nodes() {
        let mut g: DependencyGraph<&str> = DependencyGraph::new();
        let a = g.add_package("a");
        let b = g.add_package("b");
        let c = g.add_package("c");
        g.add_dependency(a, b);
        g.add_dependency(b, c);
        assert!(g.cycled_nodes().is_empty());
        assert!(g.check_acyclic().is_ok());
    }

    #[test]
    fn cyclic_graph_is_detected() {
        let mut g: DependencyGraph<&str> = DependencyGraph::new();
        let a = g.add_package("a");
        let b = g.add_package("b");
        g.add_dependency(a, b);
        g.add_dependency(b, a);
        assert!(g.check_acyclic().is_err());
        let cycled = g.cycled_nodes();
        assert!(cycled.contains(&a));
        assert!(cycled.contains(&b));
    }

    #[test]
    fn topo_next_only_returns_leaf_nodes() {
        let mut g: DependencyGraph<&str> = DependencyGraph::new();
        let a = g.add_package("a");
        let b = g.add_package("b");
        g.add_dependency(a, b);
        assert_eq!(g.topo_next(|_| true), Some(b));
        g.delete_node(b);
        assert_eq!(g.topo_next(|_| true), Some(a));
    }

    #[test]
    fn topo_next_picks_last_eligible_by_index() {
        let mut g: DependencyGraph<&str> = DependencyGraph::new();
        let a = g.add_package("a");
        let b = g.add_package("b");
        // both leaves, no edges; "last" by node index is b.
        assert_eq!(g.topo_next(|_| true), Some(b));
        let _ = a;
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let mut g: DependencyGraph<&str> = DependencyGraph::new();
        let a = g.add_package("a");
        let b = g.add_package("b");
        let c = g.add_package("c");
        g.add_dependency(a, b);
        g.add_dependency(b, c);
        let order = g.topo_order();
        let pos = |n: NodeIndex| order.iter().position(|x| *x == n).unwrap();
        assert!(pos(c) < pos(b));
        assert!(pos(b) < pos(a));
    }
}
