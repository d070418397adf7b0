//! Transactions
//!
//! A transaction is the unit of consistency. Every write inside it lands in a
//! patch that is private to the transaction; other readers keep seeing the
//! committed caches until the outermost transaction ends.
//!
//! # Lifecycle
//!
//! 1. **Open.** Pending near/late effects from earlier transactions are
//!    flushed, then a new [`TxId`] is allocated. Its cause is the transaction
//!    that scheduled the effect currently running, if any.
//!
//! 2. **Run.** The user closure reads and writes through the context. Nested
//!    transactions join the open one.
//!
//! 3. **Propagate.** Connected dependents of every written atom are
//!    actualized in depth order, so each is recomputed at most once and never
//!    observes a half-applied update.
//!
//! 4. **Commit or roll back.** On success the patches become the committed
//!    caches, the dependency edges of connected nodes are re-linked, and hooks,
//!    effects and listeners run. On failure the patches are dropped and only
//!    cleanup effects run.
//!
//! Every transaction that changed state, and every transaction that failed,
//! is appended to a bounded causal log.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::{debug, debug_span};

use crate::error::{ReatomError, Result};
use crate::graph::node::{AtomCache, Listener};
use crate::graph::scheduler::update_order;

use super::abort::AbortController;
use super::effect::{EffectEntry, EffectStep};
use super::proto::{AtomId, UpdateHook, Value};
use super::runtime::{Ctx, CtxState};
use super::subscriber::ConnectionEvent;

/// Identity of a transaction within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TxId(u64);

impl TxId {
    /// Placeholder cause for caches built outside any context.
    pub(crate) const ZERO: TxId = TxId(0);

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Whether a transaction may flush earlier effects before it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxMode {
    Read,
    Write,
}

/// A cache produced inside the open transaction.
pub(crate) struct Patch {
    pub(crate) cache: Arc<AtomCache>,
    /// Write epoch at which the cache was last known to be up to date.
    pub(crate) verified_at: u64,
}

/// The open transaction.
pub(crate) struct Transaction {
    pub(crate) id: TxId,
    cause: Option<TxId>,
    label: Arc<str>,
    pub(crate) patches: IndexMap<AtomId, Patch>,
    /// Atoms written directly, in write order.
    pub(crate) written: IndexSet<AtomId>,
    /// Prefix of `written` that has already been propagated.
    propagated: usize,
    /// Atoms whose listener set changed.
    pub(crate) touched: IndexSet<AtomId>,
    /// Effects scheduled inside the transaction. They are released to the
    /// scheduler on commit and discarded on rollback.
    pub(crate) effects: Vec<(EffectStep, EffectEntry)>,
}

impl Transaction {
    fn new(id: TxId, cause: Option<TxId>, label: &str) -> Self {
        Self {
            id,
            cause,
            label: label.into(),
            patches: IndexMap::new(),
            written: IndexSet::new(),
            propagated: 0,
            touched: IndexSet::new(),
            effects: Vec::new(),
        }
    }

    fn record(&self, status: TxStatus, changes: Vec<AtomChange>, error: Option<String>) -> TxRecord {
        TxRecord {
            id: self.id,
            cause: self.cause,
            label: self.label.to_string(),
            status,
            changes,
            error,
        }
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxStatus {
    Committed,
    Failed,
}

/// One committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtomChange {
    pub atom: AtomId,
    pub name: String,
    pub version: u64,
}

/// Entry of the causal log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxRecord {
    pub id: TxId,
    /// Transaction whose effect opened this one.
    pub cause: Option<TxId>,
    pub label: String,
    pub status: TxStatus,
    pub changes: Vec<AtomChange>,
    pub error: Option<String>,
}

impl TxRecord {
    /// Whether this transaction changed `atom`.
    pub fn changed(&self, atom: AtomId) -> bool {
        self.changes.iter().any(|change| change.atom == atom)
    }
}

/// Bounded history of transactions, oldest first.
pub(crate) struct TxLog {
    records: VecDeque<TxRecord>,
    next: u64,
    limit: usize,
}

impl TxLog {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            next: 0,
            limit,
        }
    }

    fn allocate(&mut self) -> TxId {
        self.next += 1;
        TxId(self.next)
    }

    fn push(&mut self, record: TxRecord) {
        if self.limit == 0 {
            return;
        }
        while self.records.len() >= self.limit {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn get(&self, id: TxId) -> Option<&TxRecord> {
        self.records
            .binary_search_by_key(&id, |record| record.id)
            .ok()
            .map(|index| &self.records[index])
    }

    /// `id` and its causes, newest first, as far as they are retained.
    pub(crate) fn chain(&self, id: TxId) -> Vec<TxRecord> {
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(record) = next.and_then(|id| self.get(id)) {
            chain.push(record.clone());
            next = record.cause.filter(|cause| *cause < record.id);
        }
        chain
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TxRecord> {
        self.records.iter()
    }
}

/// Work left over after the state borrow of a commit is released.
#[derive(Default)]
pub(crate) struct CommitOutcome {
    tx: Option<TxId>,
    record: Option<TxRecord>,
    notifications: Vec<(Listener, Value)>,
    updates: Vec<(UpdateHook, Value)>,
    events: Vec<ConnectionEvent>,
    effects: Vec<(EffectStep, EffectEntry)>,
}

/// Rolls the transaction back if its closure unwinds.
struct TxGuard<'a> {
    ctx: &'a Ctx,
    armed: bool,
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ctx.with_state_mut(|st| {
                st.tx = None;
                st.epoch += 1;
            });
        }
    }
}

impl Ctx {
    /// Run `f` inside a transaction, opening one if none is open.
    pub(crate) fn run_transaction<R>(
        &self,
        label: &str,
        mode: TxMode,
        f: impl FnOnce(&Ctx) -> Result<R>,
    ) -> Result<R> {
        let _lock = self.lock();
        if self.with_state(|st| st.tx.is_some()) {
            return f(self);
        }

        if mode == TxMode::Write {
            self.flush();
        }

        let id = self.with_state_mut(|st| {
            let id = st.log.allocate();
            st.tx = Some(Transaction::new(id, st.current_cause, label));
            id
        });
        let _span = debug_span!("transaction", ctx = %self.name(), tx = id.raw(), label).entered();

        let mut guard = TxGuard {
            ctx: self,
            armed: true,
        };
        let result = f(self).and_then(|value| self.propagate().map(|()| value));
        guard.armed = false;

        match result {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(error) => {
                self.rollback(&error);
                Err(error)
            }
        }
    }

    /// Actualize the connected dependents of everything written so far.
    fn propagate(&self) -> Result<()> {
        loop {
            while let Some(order) = self.next_update_order() {
                for id in order {
                    let proto = self.with_state(|st| st.slots.get(id).and_then(|slot| slot.proto.upgrade()));
                    if let Some(proto) = proto {
                        self.actualize(&proto)?;
                    }
                }
            }

            // Connected nodes whose dependencies changed in this transaction
            // are not linked to the new ones yet.
            let unlinked: Vec<_> = self.with_state(|st| {
                let Some(tx) = st.tx.as_ref() else {
                    return Vec::new();
                };
                let ids: IndexSet<AtomId> = tx.touched.iter().chain(tx.patches.keys()).copied().collect();
                ids.into_iter()
                    .filter_map(|id| st.slots.get(id))
                    .filter(|slot| slot.wants_connection())
                    .filter_map(|slot| slot.proto.upgrade())
                    .collect()
            });
            for proto in unlinked {
                self.actualize(&proto)?;
            }

            let settled = self.with_state(|st| {
                st.tx
                    .as_ref()
                    .map_or(true, |tx| tx.propagated == tx.written.len())
            });
            if settled {
                return Ok(());
            }
        }
    }

    /// Update order for the writes not propagated yet.
    fn next_update_order(&self) -> Option<Vec<AtomId>> {
        self.with_state_mut(|st| {
            let tx = st.tx.as_mut()?;
            if tx.propagated == tx.written.len() {
                return None;
            }
            let roots: Vec<AtomId> = tx.written.iter().skip(tx.propagated).copied().collect();
            tx.propagated = tx.written.len();
            Some(update_order(&st.slots, &roots))
        })
    }

    fn commit(&self) {
        let root = self.inner.root.clone();
        let outcome = self.with_state_mut(|st| st.commit_transaction(&root));
        self.finish_commit(outcome);
    }

    fn finish_commit(&self, outcome: CommitOutcome) {
        let CommitOutcome {
            tx,
            record,
            notifications,
            updates,
            events,
            effects,
        } = outcome;

        if let Some(record) = &record {
            debug!(ctx = %self.name(), tx = record.id.raw(), changes = record.changes.len(), "committed");
        }

        self.with_state_mut(|st| {
            for (step, entry) in effects {
                st.queues.push(step, entry);
            }
        });
        self.dispatch_connection_events(events, tx);
        for (hook, state) in updates {
            self.push_effect(
                EffectStep::Sync,
                Box::new(move |ctx: &Ctx| hook(ctx, &state)),
                tx,
            );
        }
        self.drain_sync();

        for (listener, state) in notifications {
            listener(&state);
        }

        if let Some(record) = record {
            let listeners = self.with_state(|st| st.commit_listeners.clone());
            for listener in listeners {
                listener(self, &record);
            }
        }

        if self.inner.config.auto_flush {
            self.flush();
        }
    }

    fn rollback(&self, error: &ReatomError) {
        let root = self.inner.root.clone();
        let (tx, cleanups, discarded, events, owed, waiting) = self.with_state_mut(|st| {
            let Some(tx) = st.tx.take() else {
                return (None, Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
            };
            st.epoch += 1;

            let mut events = Vec::new();
            for id in &tx.touched {
                st.reconcile(*id, &root, &mut events);
            }
            let mut owed = Vec::new();
            let waiting = st.owed_calls(tx.touched.iter().copied(), &mut owed);
            st.log.push(tx.record(TxStatus::Failed, Vec::new(), Some(error.to_string())));

            let (cleanups, discarded): (Vec<_>, Vec<_>) = tx
                .effects
                .into_iter()
                .partition(|(step, _)| *step == EffectStep::Cleanup);
            (Some(tx.id), cleanups, discarded, events, owed, waiting)
        });

        // Dropping the entries closes their result channels.
        drop(discarded);
        debug!(ctx = %self.name(), %error, "transaction rolled back");

        self.with_state_mut(|st| {
            for (step, entry) in cleanups {
                st.queues.push(step, entry);
            }
        });
        self.dispatch_connection_events(events, tx);
        self.drain_sync();

        for (listener, state) in owed {
            listener(&state);
        }
        // Listeners of atoms with nothing committed get their first call from
        // a read of their committed inputs.
        for proto in waiting {
            let read = self.run_transaction("subscribe", TxMode::Read, |ctx| ctx.actualize(&proto).map(drop));
            if let Err(error) = read {
                debug!(ctx = %self.name(), atom = proto.name(), %error, "first listener call skipped");
            }
        }
    }
}

impl CtxState {
    /// Install the open transaction's patches as committed caches.
    fn commit_transaction(&mut self, root: &AbortController) -> CommitOutcome {
        let Some(tx) = self.tx.take() else {
            return CommitOutcome::default();
        };

        let mut outcome = CommitOutcome {
            tx: Some(tx.id),
            ..CommitOutcome::default()
        };
        let mut changes = Vec::new();
        let mut relinks = Vec::new();

        for (id, patch) in &tx.patches {
            let Some(proto) = patch.cache.proto.upgrade() else {
                continue;
            };
            let slot = self.slots.entry(&proto);
            let previous = slot.cache.clone();
            let version = patch.cache.version;

            // A patch that ends equal to the committed state is not a change.
            // It keeps its version so dependents computed against it stay clean.
            let settled = previous.as_ref().filter(|prev| {
                prev.version != version && proto.equals(&prev.state, &patch.cache.state)
            });
            let installed = match settled {
                Some(prev) => {
                    Arc::new(patch.cache.with_state(Arc::clone(&prev.state), version, prev.cause))
                }
                None => Arc::clone(&patch.cache),
            };
            slot.cache = Some(Arc::clone(&installed));
            slot.verified_at = patch.verified_at;

            let old_pubs = previous.as_ref().map(|c| c.pub_ids().collect()).unwrap_or_else(Vec::new);
            let new_pubs: Vec<AtomId> = installed.pub_ids().collect();
            if old_pubs != new_pubs {
                relinks.push((*id, old_pubs, new_pubs));
            }

            // A first computation is not a change.
            let changed = match &previous {
                None => version > 1,
                Some(prev) => prev.version != version && settled.is_none(),
            };
            if changed {
                changes.push(AtomChange {
                    atom: *id,
                    name: slot.name.to_string(),
                    version,
                });
                for hook in proto.update_hooks() {
                    outcome.updates.push((hook, Arc::clone(&installed.state)));
                }
            }

            let baseline = settled.map(|prev| prev.version);
            for entry in slot.listeners.values_mut() {
                if entry.seen == version {
                    continue;
                }
                let up_to_date = Some(entry.seen) == baseline;
                entry.seen = version;
                if !up_to_date {
                    outcome
                        .notifications
                        .push((Arc::clone(&entry.callback), Arc::clone(&installed.state)));
                }
            }
        }

        for (id, old_pubs, new_pubs) in relinks {
            if !self.slots.get(id).map_or(false, |slot| slot.is_connected()) {
                continue;
            }
            for pub_id in new_pubs.iter().filter(|p| !old_pubs.contains(p)) {
                self.link(*pub_id, id, root, &mut outcome.events);
            }
            for pub_id in old_pubs.iter().filter(|p| !new_pubs.contains(p)) {
                self.unlink(*pub_id, id, root, &mut outcome.events);
            }
        }

        for id in &tx.touched {
            self.reconcile(*id, root, &mut outcome.events);
        }
        self.owed_calls(tx.touched.iter().copied(), &mut outcome.notifications);

        if !changes.is_empty() {
            let record = tx.record(TxStatus::Committed, changes, None);
            self.log.push(record.clone());
            outcome.record = Some(record);
        }
        outcome.effects = tx.effects;
        outcome
    }
}
