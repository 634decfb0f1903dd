//! Dependency graph with forward and reverse edges.
//!
//! - `dependencies`: task -> tasks it waits for
//! - `dependents`: task -> tasks waiting for it
//!
//! Both maps are ordered so that every traversal visits ids in ascending order.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::model::TaskId;

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    dependencies: BTreeMap<TaskId, BTreeSet<TaskId>>,
    dependents: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, task: &str) -> bool {
        self.dependencies.contains_key(task)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Insert a node with its full dependency set, updating reverse edges.
    ///
    /// Callers must have validated acyclicity first.
    pub(crate) fn insert(&mut self, task: TaskId, deps: BTreeSet<TaskId>) {
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.clone());
        }
        self.dependents.entry(task.clone()).or_default();
        self.dependencies.insert(task, deps);
    }

    pub fn dependencies(&self, task: &str) -> impl Iterator<Item = &TaskId> {
        self.dependencies.get(task).into_iter().flatten()
    }

    pub fn dependents(&self, task: &str) -> impl Iterator<Item = &TaskId> {
        self.dependents.get(task).into_iter().flatten()
    }

    /// All transitive dependents of `task`, ascending by id, excluding `task` itself.
    pub fn transitive_dependents(&self, task: &str) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&TaskId> = self.dependents(task).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Depth-first search for a cycle reachable from any of `roots`, treating
    /// `pending` as additional nodes not yet inserted.
    ///
    /// Returns the cycle as a path whose first and last element are equal.
    pub(crate) fn find_cycle(
        &self,
        roots: impl IntoIterator<Item = TaskId>,
        pending: &BTreeMap<TaskId, BTreeSet<TaskId>>,
    ) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let edges_of = |task: &str| -> Vec<TaskId> {
            match pending.get(task) {
                Some(deps) => deps.iter().cloned().collect(),
                None => self.dependencies(task).cloned().collect(),
            }
        };

        let mut marks: BTreeMap<TaskId, Mark> = BTreeMap::new();
        let mut path: Vec<TaskId> = Vec::new();

        for root in roots {
            if marks.contains_key(&root) {
                continue;
            }
            // Iterative DFS: each frame holds a node and its unexplored edges
            let mut frames: Vec<(TaskId, Vec<TaskId>)> = vec![(root.clone(), edges_of(&root))];
            marks.insert(root.clone(), Mark::InProgress);
            path.push(root);

            while let Some((_, remaining)) = frames.last_mut() {
                match remaining.pop() {
                    Some(next) => match marks.get(&next) {
                        Some(Mark::InProgress) => {
                            let start = path.iter().position(|t| *t == next).unwrap_or(0);
                            let mut cycle = path[start..].to_vec();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next.clone(), Mark::InProgress);
                            let edges = edges_of(&next);
                            path.push(next.clone());
                            frames.push((next, edges));
                        }
                    },
                    None => {
                        if let Some((done, _)) = frames.pop() {
                            marks.insert(done, Mark::Done);
                            path.pop();
                        }
                    }
                }
            }
        }
        None
    }

    /// Kahn's algorithm with ascending-id tie-break
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut indegree: BTreeMap<&TaskId, usize> = self
            .dependencies
            .iter()
            .map(|(task, deps)| (task, deps.len()))
            .collect();
        let mut ready: BTreeSet<&TaskId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(task, _)| *task)
            .collect();
        let mut order = Vec::with_capacity(self.dependencies.len());

        while let Some(task) = ready.pop_first() {
            order.push(task.clone());
            for dependent in self.dependents(task) {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<TaskId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reverse_edges_in_sync() {
        let mut graph = DependencyGraph::new();
        graph.insert("a".into(), set(&[]));
        graph.insert("b".into(), set(&["a"]));
        graph.insert("c".into(), set(&["a", "b"]));

        let dependents: Vec<_> = graph.dependents("a").cloned().collect();
        assert_eq!(dependents, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(graph.transitive_dependents("a"), set(&["b", "c"]));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_find_cycle_in_pending_batch() {
        let mut graph = DependencyGraph::new();
        graph.insert("a".into(), set(&[]));

        let mut pending = BTreeMap::new();
        pending.insert("x".to_string(), set(&["a", "y"]));
        pending.insert("y".to_string(), set(&["x"]));

        let cycle = graph
            .find_cycle(["x".to_string(), "y".to_string()], &pending)
            .expect("cycle expected");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"x".to_string()));
        assert!(cycle.contains(&"y".to_string()));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let graph = DependencyGraph::new();
        let mut pending = BTreeMap::new();
        pending.insert("solo".to_string(), set(&["solo"]));
        let cycle = graph.find_cycle(["solo".to_string()], &pending).unwrap();
        assert_eq!(cycle, vec!["solo".to_string(), "solo".to_string()]);
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let graph = DependencyGraph::new();
        let mut pending = BTreeMap::new();
        pending.insert("a".to_string(), set(&[]));
        pending.insert("b".to_string(), set(&["a"]));
        pending.insert("c".to_string(), set(&["a"]));
        pending.insert("d".to_string(), set(&["b", "c"]));
        assert!(graph.find_cycle(pending.keys().cloned(), &pending).is_none());
    }

    #[test]
    fn test_topological_order_ties_by_id() {
        let mut graph = DependencyGraph::new();
        graph.insert("root".into(), set(&[]));
        graph.insert("beta".into(), set(&["root"]));
        graph.insert("alpha".into(), set(&["root"]));
        graph.insert("zeta".into(), set(&[]));

        assert_eq!(
            graph.topological_order(),
            vec!["root", "alpha", "beta", "zeta"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }
}
