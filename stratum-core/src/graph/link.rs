//! Dependency Links
//!
//! A link is one producer→consumer edge. Each link sits in two intrusive
//! doubly-linked lists at once:
//!
//! - the consumer's dependency list (`prev_dep` / `next_dep`), kept in the
//!   order the consumer read its producers during its last evaluation;
//! - the producer's subscriber list (`prev_sub` / `next_sub`), kept in
//!   attachment order.
//!
//! A link is owned by neither endpoint. Detaching it from either list frees
//! it from both.
//!
//! # Re-linking during evaluation
//!
//! When a derived node recomputes, its `deps_tail` is reset and then
//! advanced as the computation reads producers. Most computations read the
//! same producers in the same order every time, so `link` first checks
//! whether the edge right after the confirmed tail already points at the
//! producer and, if so, just advances the tail. Whatever is left after the
//! tail once the computation returns was not read this time and is pruned.

use super::arena::arena_key;
use super::node::NodeId;
use super::store::Graph;

arena_key! {
    /// Generation-checked identifier of a dependency edge.
    pub struct LinkId;
}

/// A producer→consumer edge.
#[derive(Debug, Clone)]
pub struct Link {
    /// The producer (signal or derived node).
    pub dep: NodeId,
    /// The consumer (always a derived node).
    pub sub: NodeId,
    pub prev_dep: Option<LinkId>,
    pub next_dep: Option<LinkId>,
    pub prev_sub: Option<LinkId>,
    pub next_sub: Option<LinkId>,
}

impl Graph {
    /// Record that `sub` read `dep` during its current evaluation.
    pub fn link(&mut self, dep: NodeId, sub: NodeId) {
        let (deps, prev_dep) = {
            let derived = self.derived(sub);
            (derived.deps, derived.deps_tail)
        };

        // Same producer read twice in a row.
        if let Some(prev) = prev_dep {
            if self.links[prev].dep == dep {
                return;
            }
        }

        // Same producer as in the same position last time.
        let next_dep = match prev_dep {
            Some(prev) => self.links[prev].next_dep,
            None => deps,
        };
        if let Some(next) = next_dep {
            if self.links[next].dep == dep {
                self.derived_mut(sub).deps_tail = Some(next);
                return;
            }
        }

        // Already read earlier in this evaluation.
        let prev_sub = self.nodes[dep].subs_tail;
        if let Some(candidate) = prev_sub {
            if self.links[candidate].sub == sub && self.is_confirmed(candidate, sub) {
                return;
            }
        }

        let link = self.links.insert(Link {
            dep,
            sub,
            prev_dep,
            next_dep,
            prev_sub,
            next_sub: None,
        });

        self.derived_mut(sub).deps_tail = Some(link);
        self.nodes[dep].subs_tail = Some(link);

        if let Some(next) = next_dep {
            self.links[next].prev_dep = Some(link);
        }
        match prev_dep {
            Some(prev) => self.links[prev].next_dep = Some(link),
            None => self.derived_mut(sub).deps = Some(link),
        }
        match prev_sub {
            Some(prev) => self.links[prev].next_sub = Some(link),
            None => self.nodes[dep].subs = Some(link),
        }
    }

    /// Whether `candidate` lies within the confirmed prefix of `sub`'s
    /// dependency list.
    fn is_confirmed(&self, candidate: LinkId, sub: NodeId) -> bool {
        let derived = self.derived(sub);
        let Some(tail) = derived.deps_tail else {
            return false;
        };
        let mut cursor = derived.deps;
        while let Some(link) = cursor {
            if link == candidate {
                return true;
            }
            if link == tail {
                break;
            }
            cursor = self.links[link].next_dep;
        }
        false
    }

    /// Detach `link` from both lists and free it.
    ///
    /// Returns the next dependency edge of the consumer, and the producer if
    /// it was left without subscribers and needs teardown (a derived node) or
    /// freeing (a released node).
    pub fn unlink(&mut self, link: LinkId) -> (Option<LinkId>, Option<NodeId>) {
        let Some(Link {
            dep,
            sub,
            prev_dep,
            next_dep,
            prev_sub,
            next_sub,
        }) = self.links.remove(link)
        else {
            return (None, None);
        };

        match next_dep {
            Some(next) => self.links[next].prev_dep = prev_dep,
            None => self.derived_mut(sub).deps_tail = prev_dep,
        }
        match prev_dep {
            Some(prev) => self.links[prev].next_dep = next_dep,
            None => self.derived_mut(sub).deps = next_dep,
        }
        match next_sub {
            Some(next) => self.links[next].prev_sub = prev_sub,
            None => self.nodes[dep].subs_tail = prev_sub,
        }
        match prev_sub {
            Some(prev) => self.links[prev].next_sub = next_sub,
            None => self.nodes[dep].subs = next_sub,
        }

        let producer = &self.nodes[dep];
        let orphan = (producer.subs.is_none() && (producer.is_derived() || producer.released))
            .then_some(dep);
        (next_dep, orphan)
    }

    /// Unlink every dependency edge after `sub`'s confirmed tail, pushing
    /// producers that lost their last subscriber onto `orphans`.
    pub fn prune_stale_deps(&mut self, sub: NodeId, orphans: &mut Vec<NodeId>) {
        let derived = self.derived(sub);
        let mut stale = match derived.deps_tail {
            Some(tail) => self.links[tail].next_dep,
            None => derived.deps,
        };
        while let Some(link) = stale {
            let (next, orphan) = self.unlink(link);
            orphans.extend(orphan);
            stale = next;
        }
    }

    /// Unlink every dependency edge of `sub`.
    pub fn sever_deps(&mut self, sub: NodeId, orphans: &mut Vec<NodeId>) {
        if let Some(derived) = self.nodes[sub].as_derived_mut() {
            derived.deps_tail = None;
        } else {
            return;
        }
        self.prune_stale_deps(sub, orphans);
    }

    /// Producers of `sub` in read order.
    pub fn dependencies(&self, sub: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes[sub].as_derived().and_then(|derived| derived.deps);
        while let Some(link) = cursor {
            let link = &self.links[link];
            out.push(link.dep);
            cursor = link.next_dep;
        }
        out
    }

    /// Consumers of `dep` in attachment order.
    pub fn subscribers(&self, dep: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes[dep].subs;
        while let Some(link) = cursor {
            let link = &self.links[link];
            out.push(link.sub);
            cursor = link.next_sub;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::graph::node::{value_eq, ComputeFn, Outcome};

    fn noop() -> ComputeFn {
        Rc::new(|_, _, _| Outcome::Pending)
    }

    fn graph_with(signals: usize, derived: usize) -> (Graph, Vec<NodeId>, Vec<NodeId>) {
        let mut graph = Graph::new(8);
        let s = (0..signals)
            .map(|i| graph.insert_signal(Rc::new(i), value_eq::<usize>, 0))
            .collect();
        let d = (0..derived)
            .map(|_| graph.insert_derived(noop(), None, value_eq::<usize>, 0))
            .collect();
        (graph, s, d)
    }

    /// Simulate one evaluation of `sub` that reads `reads` in order.
    fn evaluate(graph: &mut Graph, sub: NodeId, reads: &[NodeId]) -> Vec<NodeId> {
        graph.derived_mut(sub).deps_tail = None;
        for &dep in reads {
            graph.link(dep, sub);
        }
        let mut orphans = Vec::new();
        graph.prune_stale_deps(sub, &mut orphans);
        orphans
    }

    #[test]
    fn link_records_read_order() {
        let (mut graph, s, d) = graph_with(3, 1);
        evaluate(&mut graph, d[0], &[s[2], s[0], s[1]]);

        assert_eq!(graph.dependencies(d[0]), vec![s[2], s[0], s[1]]);
        for &signal in &s {
            assert_eq!(graph.subscribers(signal), vec![d[0]]);
        }
        assert_eq!(graph.link_count(), 3);
    }

    #[test]
    fn repeated_reads_share_one_edge() {
        let (mut graph, s, d) = graph_with(2, 1);
        evaluate(&mut graph, d[0], &[s[0], s[0], s[1], s[0]]);

        assert_eq!(graph.dependencies(d[0]), vec![s[0], s[1]]);
        assert_eq!(graph.subscribers(s[0]), vec![d[0]]);
        assert_eq!(graph.link_count(), 2);
    }

    #[test]
    fn stable_reevaluation_reuses_links() {
        let (mut graph, s, d) = graph_with(2, 1);
        evaluate(&mut graph, d[0], &[s[0], s[1]]);
        let before = graph.derived(d[0]).deps;

        evaluate(&mut graph, d[0], &[s[0], s[1]]);
        assert_eq!(graph.derived(d[0]).deps, before);
        assert_eq!(graph.link_count(), 2);
    }

    #[test]
    fn dropped_reads_are_pruned() {
        let (mut graph, s, d) = graph_with(3, 1);
        evaluate(&mut graph, d[0], &[s[0], s[1], s[2]]);
        evaluate(&mut graph, d[0], &[s[0]]);

        assert_eq!(graph.dependencies(d[0]), vec![s[0]]);
        assert!(graph.subscribers(s[1]).is_empty());
        assert!(graph.subscribers(s[2]).is_empty());
        assert_eq!(graph.link_count(), 1);
    }

    #[test]
    fn reordered_reads_follow_new_order() {
        let (mut graph, s, d) = graph_with(3, 1);
        evaluate(&mut graph, d[0], &[s[0], s[1], s[2]]);
        evaluate(&mut graph, d[0], &[s[2], s[0]]);

        assert_eq!(graph.dependencies(d[0]), vec![s[2], s[0]]);
        assert!(graph.subscribers(s[1]).is_empty());
        assert_eq!(graph.subscribers(s[0]), vec![d[0]]);
        assert_eq!(graph.subscribers(s[2]), vec![d[0]]);
    }

    #[test]
    fn subscriber_lists_keep_attachment_order() {
        let (mut graph, s, d) = graph_with(1, 3);
        for &sub in &d {
            evaluate(&mut graph, sub, &[s[0]]);
        }
        assert_eq!(graph.subscribers(s[0]), d);

        evaluate(&mut graph, d[1], &[]);
        assert_eq!(graph.subscribers(s[0]), vec![d[0], d[2]]);
    }

    #[test]
    fn unlinking_last_subscriber_reports_derived_orphan() {
        let (mut graph, s, d) = graph_with(1, 2);
        evaluate(&mut graph, d[0], &[s[0]]);
        evaluate(&mut graph, d[1], &[d[0]]);

        let orphans = evaluate(&mut graph, d[1], &[]);
        assert_eq!(orphans, vec![d[0]]);

        // Signals are only reported once released.
        let mut orphans = Vec::new();
        graph.sever_deps(d[0], &mut orphans);
        assert!(orphans.is_empty());
    }
}
