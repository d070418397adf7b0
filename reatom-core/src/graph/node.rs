//! Graph Nodes
//!
//! This module defines the per-context node state of the atom graph.
//!
//! - [`AtomCache`] is an immutable snapshot ("patch") of one atom inside one
//!   context. Recomputation produces a new cache; the previous one is kept
//!   for diffing until the transaction commits.
//! - [`Slot`] is the mutable bookkeeping around the committed cache:
//!   dependents, listeners and the connection controller.
//! - [`SlotArena`] is a sparse vector of slots indexed by [`AtomId`].

use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use smallvec::SmallVec;

use crate::reactive::{AbortController, AtomId, AtomProto, TxId, Value};

pub(crate) type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifier of a listener registered on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(pub(crate) u64);

/// A listener together with the last version it was shown.
#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) callback: Listener,
    pub(crate) seen: u64,
}

impl ListenerEntry {
    /// `seen` of a listener still owed its first call. Versions start at 1.
    pub(crate) const UNSEEN: u64 = 0;
}

/// Lifecycle state of an atom inside a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Never computed in this context.
    Cold,

    /// Cached, but nobody listens. Recomputed on read, never notifies.
    Warm,

    /// At least one listener or connected dependent.
    Hot,
}

/// A dependency observed by the last computation of a node.
#[derive(Clone)]
pub(crate) struct PubRef {
    pub(crate) id: AtomId,
    pub(crate) proto: Weak<AtomProto>,
    /// Version of the dependency at the time it was read.
    pub(crate) version: u64,
    pub(crate) state: Value,
}

impl PubRef {
    pub(crate) fn observe(cache: &AtomCache) -> Self {
        Self {
            id: cache.id,
            proto: cache.proto.clone(),
            version: cache.version,
            state: Arc::clone(&cache.state),
        }
    }
}

pub(crate) type Pubs = SmallVec<[PubRef; 4]>;

/// Committed (or pending) state of one atom in one context.
pub(crate) struct AtomCache {
    pub(crate) id: AtomId,
    pub(crate) proto: Weak<AtomProto>,
    pub(crate) state: Value,
    /// Bumped on every state change, never on a no-op recomputation.
    pub(crate) version: u64,
    /// Dependencies in first-read order.
    pub(crate) pubs: Pubs,
    /// `1 + max(depth of pubs)`; sources sit at depth 0.
    pub(crate) depth: u32,
    /// Transaction that produced this cache.
    pub(crate) cause: TxId,
}

impl AtomCache {
    pub(crate) fn new(proto: &Arc<AtomProto>, state: Value, cause: TxId) -> Self {
        Self {
            id: proto.id(),
            proto: Arc::downgrade(proto),
            state,
            version: 1,
            pubs: SmallVec::new(),
            depth: 0,
            cause,
        }
    }

    /// A copy carrying a new state. Dependencies are kept.
    pub(crate) fn with_state(&self, state: Value, version: u64, cause: TxId) -> Self {
        Self {
            id: self.id,
            proto: self.proto.clone(),
            state,
            version,
            pubs: self.pubs.clone(),
            depth: self.depth,
            cause,
        }
    }

    pub(crate) fn pub_ids(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.pubs.iter().map(|p| p.id)
    }
}

/// Mutable bookkeeping for one atom in one context.
pub(crate) struct Slot {
    pub(crate) id: AtomId,
    pub(crate) name: Arc<str>,
    pub(crate) proto: Weak<AtomProto>,
    pub(crate) cache: Option<Arc<AtomCache>>,
    /// Write epoch at which `cache` was last known to be up to date.
    pub(crate) verified_at: u64,
    /// Connected dependents.
    pub(crate) subs: IndexSet<AtomId>,
    pub(crate) listeners: IndexMap<ListenerId, ListenerEntry>,
    /// Present while the node is connected.
    pub(crate) connection: Option<AbortController>,
}

impl Slot {
    pub(crate) fn new(proto: &Arc<AtomProto>) -> Self {
        Self {
            id: proto.id(),
            name: proto.name_arc(),
            proto: Arc::downgrade(proto),
            cache: None,
            verified_at: 0,
            subs: IndexSet::new(),
            listeners: IndexMap::new(),
            connection: None,
        }
    }

    /// Whether the node should be connected.
    pub(crate) fn wants_connection(&self) -> bool {
        !self.listeners.is_empty() || !self.subs.is_empty()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn depth(&self) -> u32 {
        self.cache.as_ref().map_or(0, |c| c.depth)
    }

    pub(crate) fn pub_ids(&self) -> Vec<AtomId> {
        self.cache
            .as_ref()
            .map(|c| c.pub_ids().collect())
            .unwrap_or_default()
    }

    pub(crate) fn state(&self) -> NodeState {
        match (&self.cache, self.is_connected()) {
            (_, true) => NodeState::Hot,
            (Some(_), false) => NodeState::Warm,
            (None, false) => NodeState::Cold,
        }
    }
}

/// Slots of one context, indexed by atom id.
///
/// Atom ids are process-wide, so the vector grows to the highest id this
/// context has touched, not to the number of atoms it holds. Slots are boxed
/// so each unused index costs one pointer.
#[derive(Default)]
pub(crate) struct SlotArena {
    slots: Vec<Option<Box<Slot>>>,
}

impl SlotArena {
    pub(crate) fn get(&self, id: AtomId) -> Option<&Slot> {
        self.slots.get(id.index()).and_then(Option::as_deref)
    }

    pub(crate) fn get_mut(&mut self, id: AtomId) -> Option<&mut Slot> {
        self.slots.get_mut(id.index()).and_then(Option::as_deref_mut)
    }

    /// The slot for `proto`, created on first use.
    pub(crate) fn entry(&mut self, proto: &Arc<AtomProto>) -> &mut Slot {
        let index = proto.id().index();
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index].get_or_insert_with(|| Box::new(Slot::new(proto)))
    }

    pub(crate) fn remove(&mut self, id: AtomId) -> Option<Slot> {
        self.slots.get_mut(id.index()).and_then(Option::take).map(|slot| *slot)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter_map(Option::as_deref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{atom, TxId};

    #[test]
    fn slot_state_transitions() {
        let count = atom(0, "count").unwrap();
        let mut slot = Slot::new(count.proto());
        assert_eq!(slot.state(), NodeState::Cold);

        slot.cache = Some(Arc::new(AtomCache::new(count.proto(), Arc::new(0), TxId::ZERO)));
        assert_eq!(slot.state(), NodeState::Warm);
        assert!(!slot.wants_connection());

        slot.listeners.insert(
            ListenerId(1),
            ListenerEntry {
                callback: Arc::new(|_: &Value| {}),
                seen: 1,
            },
        );
        assert!(slot.wants_connection());
        slot.connection = Some(AbortController::new());
        assert_eq!(slot.state(), NodeState::Hot);
    }

    #[test]
    fn with_state_keeps_dependencies() {
        let count = atom(0, "count").unwrap();
        let mut cache = AtomCache::new(count.proto(), Arc::new(0), TxId::ZERO);
        cache.depth = 2;
        cache.pubs.push(PubRef::observe(&AtomCache::new(
            count.proto(),
            Arc::new(1),
            TxId::ZERO,
        )));

        let next = cache.with_state(Arc::new(5), 7, TxId::ZERO);
        assert_eq!(next.version, 7);
        assert_eq!(next.depth, 2);
        assert_eq!(next.pub_ids().collect::<Vec<_>>(), vec![count.id()]);
        assert_eq!(next.state.downcast_ref::<i32>(), Some(&5));
    }

    #[test]
    fn arena_holds_only_touched_atoms() {
        let a = atom(0, "a").unwrap();
        let untouched: Vec<_> = (0..64).map(|_| atom(0, None).unwrap()).collect();
        let b = atom(0, "b").unwrap();
        let mut arena = SlotArena::default();

        arena.entry(b.proto());
        assert!(arena.get(a.id()).is_none());
        arena.entry(a.proto());
        assert_eq!(arena.iter().count(), 2);
        assert!(untouched.iter().all(|atom| arena.get(atom.id()).is_none()));

        assert!(arena.remove(a.id()).is_some());
        assert!(arena.get(a.id()).is_none());
        assert_eq!(arena.get(b.id()).map(|slot| slot.id), Some(b.id()));
        assert_eq!(arena.iter().count(), 1);
    }
}
