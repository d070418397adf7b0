//! Subscriptions and Connection
//!
//! A node is *connected* while it has a listener or a connected dependent.
//! Connection spreads up the graph: connecting a computed atom connects every
//! atom it read, and disconnecting the last dependent of an atom disconnects
//! it in turn.
//!
//! Connected nodes keep their dependents linked, so writes to them are
//! propagated eagerly at the end of each transaction. Connection changes are
//! reconciled when a transaction commits; the matching `on_connect` and
//! `on_disconnect` hooks run as sync effects of that commit.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::graph::node::{Listener, ListenerEntry, ListenerId};

use super::abort::AbortController;
use super::effect::EffectStep;
use super::proto::{AtomId, AtomProto, Value};
use super::runtime::{Ctx, CtxState, WeakCtx};
use super::transaction::{TxId, TxMode};

/// A change in connection state found while committing.
pub(crate) enum ConnectionEvent {
    Connected {
        proto: Arc<AtomProto>,
        controller: AbortController,
    },
    Disconnected {
        proto: Arc<AtomProto>,
        controller: AbortController,
    },
}

/// Handle to a registered listener.
///
/// The listener stays registered until the handle is dropped or
/// [`unsubscribe`](Subscription::unsubscribe)d. Use
/// [`forget`](Subscription::forget) to keep it for the lifetime of the
/// context instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    ctx: WeakCtx,
    atom: AtomId,
    listener: ListenerId,
    active: bool,
}

impl Subscription {
    /// The atom this subscription listens to.
    pub fn atom(&self) -> AtomId {
        self.atom
    }

    pub fn is_active(&self) -> bool {
        self.active && self.ctx.upgrade().is_some()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the listener registered without holding the handle.
    pub fn forget(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(ctx) = self.ctx.upgrade() {
            if let Err(error) = ctx.remove_listener(self.atom, self.listener) {
                warn!(atom = %self.atom, %error, "failed to unsubscribe");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("atom", &self.atom)
            .field("active", &self.active)
            .finish()
    }
}

impl Ctx {
    /// Register `listener` on `proto`. With `immediate` it is first called with
    /// the committed state when the outermost transaction ends.
    pub(crate) fn subscribe_erased(
        &self,
        proto: &Arc<AtomProto>,
        listener: Listener,
        immediate: bool,
    ) -> Result<Subscription> {
        let _lock = self.lock();
        let nested = self.with_state(|st| st.tx.is_some());
        self.run_transaction("subscribe", TxMode::Read, |ctx| {
            let cache = ctx.actualize(proto)?;
            let id = ctx.with_state_mut(|st| {
                let id = ListenerId(st.next_listener);
                st.next_listener += 1;
                let slot = st.slots.entry(proto);
                // The first call is made with committed state once the
                // outermost transaction settles.
                let seen = match (immediate, &slot.cache) {
                    (true, _) => ListenerEntry::UNSEEN,
                    (false, Some(committed)) if nested => committed.version,
                    (false, _) => cache.version,
                };
                slot.listeners.insert(
                    id,
                    ListenerEntry {
                        callback: Arc::clone(&listener),
                        seen,
                    },
                );
                if let Some(tx) = st.tx.as_mut() {
                    tx.touched.insert(proto.id());
                }
                id
            });

            Ok(Subscription {
                ctx: ctx.downgrade(),
                atom: proto.id(),
                listener: id,
                active: true,
            })
        })
    }

    pub(crate) fn remove_listener(&self, atom: AtomId, listener: ListenerId) -> Result<()> {
        self.run_transaction("unsubscribe", TxMode::Read, |ctx| {
            ctx.with_state_mut(|st| {
                if let Some(slot) = st.slots.get_mut(atom) {
                    slot.listeners.shift_remove(&listener);
                }
                if let Some(tx) = st.tx.as_mut() {
                    tx.touched.insert(atom);
                }
            });
            Ok(())
        })
    }

    /// Queue the hooks for connection changes as sync effects.
    pub(crate) fn dispatch_connection_events(&self, events: Vec<ConnectionEvent>, cause: Option<TxId>) {
        for event in events {
            let (controller, hooks) = match event {
                ConnectionEvent::Connected { proto, controller } => {
                    debug!(ctx = %self.name(), atom = proto.name(), "connected");
                    (controller, proto.connect_hooks())
                }
                ConnectionEvent::Disconnected { proto, controller } => {
                    debug!(ctx = %self.name(), atom = proto.name(), "disconnected");
                    controller.abort(format!("`{}` disconnected", proto.name()));
                    (controller, proto.disconnect_hooks())
                }
            };

            for hook in hooks {
                let controller = controller.clone();
                self.push_effect(
                    EffectStep::Sync,
                    Box::new(move |ctx: &Ctx| hook(&ctx.bound(Some(controller)))),
                    cause,
                );
            }
        }
    }
}

impl CtxState {
    /// Collect the first calls owed to listeners of `ids` that have a
    /// committed state to show. Returns the atoms whose listeners are still
    /// waiting because nothing was committed for them.
    pub(crate) fn owed_calls(
        &mut self,
        ids: impl IntoIterator<Item = AtomId>,
        out: &mut Vec<(Listener, Value)>,
    ) -> Vec<Arc<AtomProto>> {
        let mut waiting = Vec::new();
        for id in ids {
            let Some(slot) = self.slots.get_mut(id) else {
                continue;
            };
            let Some(cache) = slot.cache.as_ref() else {
                if slot.listeners.values().any(|entry| entry.seen == ListenerEntry::UNSEEN) {
                    waiting.extend(slot.proto.upgrade());
                }
                continue;
            };
            for entry in slot.listeners.values_mut() {
                if entry.seen == ListenerEntry::UNSEEN {
                    entry.seen = cache.version;
                    out.push((Arc::clone(&entry.callback), Arc::clone(&cache.state)));
                }
            }
        }
        waiting
    }

    /// Connect or disconnect `id` to match its listeners and dependents.
    pub(crate) fn reconcile(&mut self, id: AtomId, root: &AbortController, events: &mut Vec<ConnectionEvent>) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        match (slot.wants_connection(), slot.is_connected()) {
            (true, false) => self.connect(id, root, events),
            (false, true) => self.disconnect(id, root, events),
            _ => {}
        }
    }

    /// Add `sub` as a connected dependent of `pub_id`.
    pub(crate) fn link(
        &mut self,
        pub_id: AtomId,
        sub: AtomId,
        root: &AbortController,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if let Some(slot) = self.slots.get_mut(pub_id) {
            slot.subs.insert(sub);
            self.reconcile(pub_id, root, events);
        }
    }

    pub(crate) fn unlink(
        &mut self,
        pub_id: AtomId,
        sub: AtomId,
        root: &AbortController,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if let Some(slot) = self.slots.get_mut(pub_id) {
            slot.subs.shift_remove(&sub);
            self.reconcile(pub_id, root, events);
        }
    }

    fn connect(&mut self, id: AtomId, root: &AbortController, events: &mut Vec<ConnectionEvent>) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let controller = root.child();
        slot.connection = Some(controller.clone());
        let pubs = slot.pub_ids();
        if let Some(proto) = slot.proto.upgrade() {
            events.push(ConnectionEvent::Connected { proto, controller });
        }

        for pub_id in pubs {
            self.link(pub_id, id, root, events);
        }
    }

    fn disconnect(&mut self, id: AtomId, root: &AbortController, events: &mut Vec<ConnectionEvent>) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let Some(controller) = slot.connection.take() else {
            return;
        };
        let pubs = slot.pub_ids();
        if let Some(proto) = slot.proto.upgrade() {
            events.push(ConnectionEvent::Disconnected { proto, controller });
        } else {
            controller.abort("atom dropped");
        }

        for pub_id in pubs {
            self.unlink(pub_id, id, root, events);
        }
    }
}
