//! In-memory dependency graph over tasks.
//!
//! Edges ("A blocks B") come from the tracker, never from the store. The
//! graph answers two questions for the scheduler: may a task dispatch
//! (every blocker done), and how urgent is it really (a low-priority task
//! that blocks an urgent one inherits that urgency).

use std::collections::{HashMap, HashSet};

use tracing::warn;

use orca_db::models::TaskStatus;

/// Typed dependency link as surfaced by the tracker.
#[derive(Debug, Clone)]
pub struct IssueRelation {
    pub kind: String,
    pub other_id: String,
}

/// One issue's forward and inverse relation lists, for a rebuild snapshot.
#[derive(Debug, Clone)]
pub struct IssueLinks {
    pub id: String,
    pub relations: Vec<IssueRelation>,
    pub inverse_relations: Vec<IssueRelation>,
}

const BLOCKS: &str = "blocks";

/// Blocks / blocked-by index with cycle-safe priority propagation.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// task -> the tasks that must complete before it.
    blocked_by: HashMap<String, HashSet<String>>,
    /// blocker -> the tasks it is holding up.
    blocks: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all edges from a tracker snapshot.
    ///
    /// A "blocks" relation may be surfaced from either side (forward on the
    /// blocker, inverse on the blockee); both insert the same directed edge,
    /// so duplicates collapse in the sets.
    pub fn rebuild(&mut self, issues: &[IssueLinks]) {
        self.blocked_by.clear();
        self.blocks.clear();

        for issue in issues {
            for relation in &issue.relations {
                if relation.kind == BLOCKS {
                    self.add_relation(&issue.id, &relation.other_id);
                }
            }
            for relation in &issue.inverse_relations {
                if relation.kind == BLOCKS {
                    self.add_relation(&relation.other_id, &issue.id);
                }
            }
        }
    }

    /// Record that `blocker` blocks `blocked`.
    pub fn add_relation(&mut self, blocker: &str, blocked: &str) {
        self.blocks
            .entry(blocker.to_string())
            .or_default()
            .insert(blocked.to_string());
        self.blocked_by
            .entry(blocked.to_string())
            .or_default()
            .insert(blocker.to_string());
    }

    /// Remove a previously recorded edge.
    pub fn remove_relation(&mut self, blocker: &str, blocked: &str) {
        if let Some(set) = self.blocks.get_mut(blocker) {
            set.remove(blocked);
            if set.is_empty() {
                self.blocks.remove(blocker);
            }
        }
        if let Some(set) = self.blocked_by.get_mut(blocked) {
            set.remove(blocker);
            if set.is_empty() {
                self.blocked_by.remove(blocked);
            }
        }
    }

    /// Blockers of a task, if any.
    pub fn blockers_of(&self, id: &str) -> Option<&HashSet<String>> {
        self.blocked_by.get(id)
    }

    /// A task may dispatch iff every blocker is `done`.
    ///
    /// A blocker the callable cannot resolve counts as not-done: an edge to
    /// an unknown ticket must hold the task back, not wave it through.
    pub fn is_dispatchable(
        &self,
        id: &str,
        status_of: &dyn Fn(&str) -> Option<TaskStatus>,
    ) -> bool {
        let Some(blockers) = self.blocked_by.get(id) else {
            return true;
        };
        blockers
            .iter()
            .all(|blocker| status_of(blocker) == Some(TaskStatus::Done))
    }

    /// Effective priority: the minimum positive priority among the task
    /// itself and everything downstream of it in `blocks`.
    ///
    /// Priority 0 is the "no priority" sentinel and never participates in
    /// the minimization. Cycles are tolerated: the back edge contributes
    /// nothing and is logged once per traversal.
    pub fn effective_priority(&self, id: &str, priority_of: &dyn Fn(&str) -> i64) -> i64 {
        let mut visited = HashSet::new();
        let mut cycle_logged = false;
        self.effective_priority_inner(id, priority_of, &mut visited, &mut cycle_logged)
    }

    fn effective_priority_inner(
        &self,
        id: &str,
        priority_of: &dyn Fn(&str) -> i64,
        visited: &mut HashSet<String>,
        cycle_logged: &mut bool,
    ) -> i64 {
        if !visited.insert(id.to_string()) {
            if !*cycle_logged {
                warn!(task_id = id, "dependency cycle detected, ignoring back edge");
                *cycle_logged = true;
            }
            return 0;
        }

        let own = priority_of(id);
        let mut best = if own > 0 { own } else { 0 };

        if let Some(downstream) = self.blocks.get(id) {
            for blocked in downstream {
                let inherited =
                    self.effective_priority_inner(blocked, priority_of, visited, cycle_logged);
                if inherited > 0 && (best == 0 || inherited < best) {
                    best = inherited;
                }
            }
        }

        best
    }

    #[cfg(test)]
    fn edge_count(&self) -> usize {
        self.blocks.values().map(HashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(id: &str, relations: &[(&str, &str)], inverse: &[(&str, &str)]) -> IssueLinks {
        IssueLinks {
            id: id.to_string(),
            relations: relations
                .iter()
                .map(|(kind, other)| IssueRelation {
                    kind: kind.to_string(),
                    other_id: other.to_string(),
                })
                .collect(),
            inverse_relations: inverse
                .iter()
                .map(|(kind, other)| IssueRelation {
                    kind: kind.to_string(),
                    other_id: other.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn rebuild_deduplicates_edges_surfaced_from_both_sides() {
        let mut graph = DependencyGraph::new();
        graph.rebuild(&[
            links("A", &[("blocks", "B")], &[]),
            links("B", &[], &[("blocks", "A")]),
        ]);

        assert_eq!(graph.edge_count(), 1);
        assert!(graph.blockers_of("B").unwrap().contains("A"));
        assert!(graph.blockers_of("A").is_none());
    }

    #[test]
    fn rebuild_ignores_other_relation_kinds() {
        let mut graph = DependencyGraph::new();
        graph.rebuild(&[links("A", &[("related", "B"), ("duplicate", "C")], &[])]);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn rebuild_clears_previous_state() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("X", "Y");
        graph.rebuild(&[links("A", &[("blocks", "B")], &[])]);

        assert!(graph.blockers_of("Y").is_none());
        assert!(graph.blockers_of("B").is_some());
    }

    #[test]
    fn add_and_remove_relation_maintain_both_maps() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");
        assert!(!graph.is_dispatchable("B", &|_| Some(TaskStatus::Ready)));

        graph.remove_relation("A", "B");
        assert!(graph.is_dispatchable("B", &|_| Some(TaskStatus::Ready)));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn dispatchable_requires_all_blockers_done() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "C");
        graph.add_relation("B", "C");

        let all_done = |_: &str| Some(TaskStatus::Done);
        assert!(graph.is_dispatchable("C", &all_done));

        let one_running = |id: &str| {
            Some(if id == "B" {
                TaskStatus::Running
            } else {
                TaskStatus::Done
            })
        };
        assert!(!graph.is_dispatchable("C", &one_running));
    }

    #[test]
    fn dispatchable_with_unknown_blocker_is_false() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("GHOST", "B");
        assert!(!graph.is_dispatchable("B", &|_| None));
    }

    #[test]
    fn unblocked_task_is_dispatchable() {
        let graph = DependencyGraph::new();
        assert!(graph.is_dispatchable("anything", &|_| None));
    }

    #[test]
    fn effective_priority_inherits_from_downstream() {
        // A (3) blocks B (1): A must dispatch as urgently as B.
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");

        let priorities = |id: &str| match id {
            "A" => 3,
            "B" => 1,
            _ => 0,
        };

        assert_eq!(graph.effective_priority("A", &priorities), 1);
        assert_eq!(graph.effective_priority("B", &priorities), 1);
    }

    #[test]
    fn effective_priority_skips_zero_downstream() {
        // A (3) blocks B (0): the sentinel must not drag A to 0.
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");

        let priorities = |id: &str| match id {
            "A" => 3,
            _ => 0,
        };
        assert_eq!(graph.effective_priority("A", &priorities), 3);
    }

    #[test]
    fn effective_priority_zero_task_with_urgent_downstream() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");

        let priorities = |id: &str| match id {
            "B" => 2,
            _ => 0,
        };
        assert_eq!(graph.effective_priority("A", &priorities), 2);
    }

    #[test]
    fn effective_priority_transitive_chain() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");
        graph.add_relation("B", "C");

        let priorities = |id: &str| match id {
            "A" => 4,
            "B" => 3,
            "C" => 1,
            _ => 0,
        };
        assert_eq!(graph.effective_priority("A", &priorities), 1);
    }

    #[test]
    fn effective_priority_terminates_on_cycles() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "B");
        graph.add_relation("B", "A");

        let priorities = |id: &str| match id {
            "A" => 3,
            "B" => 2,
            _ => 0,
        };
        assert_eq!(graph.effective_priority("A", &priorities), 2);
        assert_eq!(graph.effective_priority("B", &priorities), 2);
    }

    #[test]
    fn effective_priority_self_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_relation("A", "A");
        assert_eq!(graph.effective_priority("A", &|_| 5), 5);
    }
}
