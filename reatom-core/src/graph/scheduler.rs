//! Update Ordering
//!
//! When a transaction writes to an atom, every connected dependent that might
//! observe the change has to be brought up to date before listeners run.
//!
//! # Algorithm
//!
//! 1. Start from the written atoms and walk their `subs` edges breadth-first.
//!    Only connected nodes have `subs`, so the walk never leaves the hot part
//!    of the graph.
//! 2. Sort the reached nodes by depth (sources first). Every dependency of a
//!    node sits at a strictly smaller depth, so this is a topological order.
//! 3. The caller actualizes the nodes in that order. Actualization is
//!    memoized per transaction, so each node recomputes at most once and only
//!    if one of its dependencies really changed.
//!
//! Written atoms are not excluded from the walk: a written atom can also be a
//! dependent of another written atom and must then be re-validated.

use std::collections::{HashSet, VecDeque};

use super::node::SlotArena;
use crate::reactive::AtomId;

/// Connected dependents of `roots`, ordered by depth.
pub(crate) fn update_order(slots: &SlotArena, roots: &[AtomId]) -> Vec<AtomId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    let mut affected = Vec::new();

    for root in roots {
        if let Some(slot) = slots.get(*root) {
            queue.extend(slot.subs.iter().copied());
        }
    }

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(slot) = slots.get(id) {
            affected.push((slot.depth(), id));
            queue.extend(slot.subs.iter().copied());
        }
    }

    // Stable, so equal depths keep discovery order.
    affected.sort_by_key(|&(depth, _)| depth);
    affected.into_iter().map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::graph::node::AtomCache;
    use crate::reactive::{atom, Atom, TxId};

    fn insert(arena: &mut SlotArena, atom: &Atom<i32>, depth: u32, subs: &[&Atom<i32>]) {
        let slot = arena.entry(atom.proto());
        let mut cache = AtomCache::new(atom.proto(), Arc::new(0), TxId::ZERO);
        cache.depth = depth;
        slot.cache = Some(Arc::new(cache));
        slot.subs.extend(subs.iter().map(|s| s.id()));
    }

    #[test]
    fn chain_is_ordered_by_depth() {
        let source = atom(0, "source").unwrap();
        let first = atom(0, "first").unwrap();
        let second = atom(0, "second").unwrap();

        let mut arena = SlotArena::default();
        insert(&mut arena, &source, 0, &[&first]);
        insert(&mut arena, &first, 1, &[&second]);
        insert(&mut arena, &second, 2, &[]);

        let order = update_order(&arena, &[source.id()]);
        assert_eq!(order, vec![first.id(), second.id()]);
    }

    #[test]
    fn diamond_visits_the_join_once_and_last() {
        let a = atom(0, "a").unwrap();
        let b = atom(0, "b").unwrap();
        let c = atom(0, "c").unwrap();
        let d = atom(0, "d").unwrap();

        let mut arena = SlotArena::default();
        insert(&mut arena, &a, 0, &[&b, &c]);
        insert(&mut arena, &b, 1, &[&d]);
        // `c` reads `b` as well, so it sits deeper than `b`.
        insert(&mut arena, &c, 2, &[&d]);
        insert(&mut arena, &d, 3, &[]);

        let order = update_order(&arena, &[a.id()]);
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&d.id()));
        assert_eq!(order.iter().filter(|id| **id == d.id()).count(), 1);
    }

    #[test]
    fn cold_nodes_are_not_reached() {
        let a = atom(0, "a").unwrap();
        let b = atom(0, "b").unwrap();

        let mut arena = SlotArena::default();
        insert(&mut arena, &a, 0, &[]);
        insert(&mut arena, &b, 1, &[]);

        assert!(update_order(&arena, &[a.id()]).is_empty());
    }
}
