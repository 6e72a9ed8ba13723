use std::collections::{HashMap, HashSet};

use crate::types::OwnerId;

pub(crate) struct WaitForGraph {
    // key: owner id, value: the owners that the key owner is waiting for
    graph: HashMap<OwnerId, HashSet<OwnerId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: OwnerId, to: OwnerId) {
        if from == to {
            return;
        }
        self.graph.entry(from).or_insert_with(HashSet::new).insert(to);
    }

    pub(crate) fn remove_waiter(&mut self, owner: OwnerId) {
        self.graph.remove(&owner);
    }

    /// Find a cycle reachable from `start`, if one exists. The returned
    /// path lists the owners along the cycle, `start` first; the last
    /// element is the owner whose edge closes the cycle (the guilty
    /// party holding the lock everyone else is stacked behind).
    pub(crate) fn find_cycle(&self, start: OwnerId) -> Option<Vec<OwnerId>> {
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        let mut visited = HashSet::new();
        if self.dfs(start, start, &mut path, &mut on_path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        current: OwnerId,
        start: OwnerId,
        path: &mut Vec<OwnerId>,
        on_path: &mut HashSet<OwnerId>,
        visited: &mut HashSet<OwnerId>,
    ) -> bool {
        path.push(current);
        on_path.insert(current);
        visited.insert(current);

        if let Some(nexts) = self.graph.get(&current) {
            for &next in nexts {
                if next == start {
                    return true;
                }
                if on_path.contains(&next) {
                    // a cycle not through `start`; still a deadlock the
                    // caller participates in waiting behind
                    return true;
                }
                if !visited.contains(&next)
                    && self.dfs(next, start, path, on_path, visited)
                {
                    return true;
                }
            }
        }

        path.pop();
        on_path.remove(&current);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 3);
        assert!(g.find_cycle(1).is_none());
    }

    #[test]
    fn test_two_party_cycle() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 1);
        let cycle = g.find_cycle(1).unwrap();
        assert_eq!(cycle, vec![1, 2]);
    }

    #[test]
    fn test_cycle_resolved_by_removal() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 3);
        g.add_edge(3, 1);
        assert!(g.find_cycle(1).is_some());
        g.remove_waiter(3);
        assert!(g.find_cycle(1).is_none());
    }

    #[test]
    fn test_self_edges_are_ignored() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 1);
        assert!(g.find_cycle(1).is_none());
    }
}
