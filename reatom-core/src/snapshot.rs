//! Graph Snapshots
//!
//! A [`GraphSnapshot`] is a serializable, point-in-time view of a context:
//! every node it has touched, with its committed version, depth, edges and
//! connection state, plus the retained causal log. It is meant for
//! debugging and devtools; nothing in the engine reads it back.

use serde::Serialize;

use crate::graph::node::Slot;
use crate::graph::NodeState;
use crate::reactive::{AtomId, AtomKind, Ctx, TxId, TxRecord};

/// One node of a [`GraphSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: AtomId,
    pub name: String,
    /// `None` once the atom's declaration has been dropped.
    pub kind: Option<AtomKind>,
    pub state: NodeState,
    pub version: Option<u64>,
    pub depth: u32,
    /// Names of the dependencies read by the last computation.
    pub pubs: Vec<String>,
    /// Names of connected dependents.
    pub subs: Vec<String>,
    pub listeners: usize,
    pub cause: Option<TxId>,
}

/// Serializable view of a context.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub name: String,
    pub epoch: u64,
    pub pending_effects: usize,
    pub nodes: Vec<NodeSnapshot>,
    pub transactions: Vec<TxRecord>,
}

impl GraphSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl Ctx {
    /// Capture the committed graph of this context.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.with_state(|st| {
            let name_of = |id: AtomId| {
                st.slots
                    .get(id)
                    .map_or_else(|| id.to_string(), |slot: &Slot| slot.name.to_string())
            };

            let nodes = st
                .slots
                .iter()
                .map(|slot| NodeSnapshot {
                    id: slot.id,
                    name: slot.name.to_string(),
                    kind: slot.proto.upgrade().map(|proto| proto.kind()),
                    state: slot.state(),
                    version: slot.cache.as_ref().map(|cache| cache.version),
                    depth: slot.depth(),
                    pubs: slot.pub_ids().into_iter().map(name_of).collect(),
                    subs: slot.subs.iter().copied().map(name_of).collect(),
                    listeners: slot.listeners.len(),
                    cause: slot.cache.as_ref().map(|cache| cache.cause),
                })
                .collect();

            GraphSnapshot {
                name: self.name().to_string(),
                epoch: st.epoch,
                pending_effects: st.queues.len(),
                nodes,
                transactions: st.log.iter().cloned().collect(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::reactive::{atom, computed, Ctx};
    use crate::graph::NodeState;

    #[test]
    fn snapshot_lists_edges_by_name() {
        let ctx = Ctx::new();
        let a = atom(1, "a").unwrap();
        let b = {
            let a = a.clone();
            computed(move |ctx, _| Ok(ctx.spy(&a)? * 2), "b").unwrap()
        };
        let _sub = ctx.subscribe(&b, |_| {}).unwrap();
        a.set(&ctx, 2).unwrap();

        let snapshot = ctx.snapshot();
        let node = snapshot.node("b").unwrap();
        assert_eq!(node.pubs, vec!["a".to_string()]);
        assert_eq!(node.state, NodeState::Hot);
        assert_eq!(node.listeners, 1);
        assert_eq!(snapshot.node("a").unwrap().subs, vec!["b".to_string()]);
        assert_eq!(snapshot.transactions.last().unwrap().label, "a");
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let ctx = Ctx::new();
        let a = atom(1, "a").unwrap();
        a.set(&ctx, 2).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&ctx.snapshot().to_json().unwrap()).unwrap();
        assert_eq!(json["name"], "ctx");
        assert_eq!(json["nodes"][0]["name"], "a");
        assert_eq!(json["nodes"][0]["version"], 2);
        assert_eq!(json["transactions"][0]["status"], "Committed");
    }
}
