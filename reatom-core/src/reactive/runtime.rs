//! Reactive Runtime
//!
//! [`Ctx`] is the store: it owns the per-context caches of every atom it has
//! evaluated and is the entry point for reads, writes, subscriptions and
//! effects.
//!
//! # How It Works
//!
//! 1. Every read or write runs inside a transaction. Writes made directly on
//!    an atom or action open a one-shot transaction; [`Ctx::transaction`]
//!    groups several of them.
//!
//! 2. Reads actualize the atom: reuse its cache when its dependencies are
//!    unchanged, recompute it otherwise.
//!
//! 3. When the outermost transaction ends, connected dependents of written
//!    atoms are actualized, the new caches are committed, and listeners and
//!    effects run.
//!
//! # Thread Safety
//!
//! A context is `Send + Sync`. All of its state sits behind a reentrant lock
//! that a transaction holds from start to finish, so transactions from
//! different threads are serialized while reentrant calls from computers,
//! hooks and effects on the same thread go through.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::config::CtxConfig;
use crate::error::{EffectError, Result};
use crate::graph::node::{Listener, Slot, SlotArena};
use crate::graph::NodeState;

use super::abort::{AbortController, AbortSignal};
use super::atom::Atom;
use super::context::FrameStack;
use super::effect::EffectQueues;
use super::proto::{downcast, AtomId, Value};
use super::subscriber::Subscription;
use super::transaction::{Transaction, TxId, TxLog, TxMode, TxRecord};

pub(crate) type ErrorListener = Arc<dyn Fn(&EffectError) + Send + Sync>;
pub(crate) type CommitListener = Arc<dyn Fn(&Ctx, &TxRecord) + Send + Sync>;

/// Everything a context owns.
pub(crate) struct CtxState {
    pub(crate) slots: SlotArena,
    pub(crate) tx: Option<Transaction>,
    pub(crate) frames: FrameStack,
    pub(crate) log: TxLog,
    pub(crate) queues: EffectQueues,
    /// Bumped on every write and on every rollback.
    pub(crate) epoch: u64,
    /// Transaction that scheduled the effect currently running.
    pub(crate) current_cause: Option<TxId>,
    pub(crate) next_listener: u64,
    pub(crate) error_listeners: Vec<ErrorListener>,
    pub(crate) commit_listeners: Vec<CommitListener>,
}

pub(crate) struct CtxInner {
    state: ReentrantMutex<RefCell<CtxState>>,
    pub(crate) config: CtxConfig,
    pub(crate) root: AbortController,
}

/// A reactive context.
///
/// Cloning is cheap; clones share the same caches. Independent contexts never
/// share anything, which makes them suitable for test isolation and
/// per-request rendering.
///
/// # Example
///
/// ```
/// use reatom_core::{atom, computed, Ctx};
///
/// let ctx = Ctx::new();
/// let count = atom(1, "count").unwrap();
/// let doubled = {
///     let count = count.clone();
///     computed(move |ctx, _| Ok(ctx.spy(&count)? * 2), "doubled").unwrap()
/// };
///
/// assert_eq!(ctx.get(&doubled).unwrap(), 2);
/// count.set(&ctx, 5).unwrap();
/// assert_eq!(ctx.get(&doubled).unwrap(), 10);
/// ```
#[derive(Clone)]
pub struct Ctx {
    pub(crate) inner: Arc<CtxInner>,
    /// Controller of the causal scope this handle runs in. `None` means the
    /// context's root controller.
    pub(crate) controller: Option<AbortController>,
}

impl Ctx {
    pub fn new() -> Self {
        Self::with_config(CtxConfig::default())
    }

    pub fn with_config(config: CtxConfig) -> Self {
        let state = CtxState {
            slots: SlotArena::default(),
            tx: None,
            frames: FrameStack::default(),
            log: TxLog::new(config.history_limit),
            queues: EffectQueues::default(),
            epoch: 0,
            current_cause: None,
            next_listener: 0,
            error_listeners: Vec::new(),
            commit_listeners: Vec::new(),
        };

        Self {
            inner: Arc::new(CtxInner {
                state: ReentrantMutex::new(RefCell::new(state)),
                config,
                root: AbortController::new(),
            }),
            controller: None,
        }
    }

    pub fn config(&self) -> &CtxConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Read the current state of an atom without tracking it.
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cache = self.run_transaction("get", TxMode::Read, |ctx| ctx.actualize(atom.proto()))?;
        downcast(&cache.state, atom.name())
    }

    /// Run `f` as one transaction.
    ///
    /// Writes inside `f` are committed together when it returns; listeners
    /// only ever see the settled result. Nested calls join the outer
    /// transaction. If `f` fails, nothing it wrote is committed.
    pub fn transaction<R>(&self, f: impl FnOnce(&Ctx) -> Result<R>) -> Result<R> {
        self.run_transaction("transaction", TxMode::Write, f)
    }

    /// Subscribe to an atom.
    ///
    /// `listener` is called immediately with the current state, then once per
    /// transaction that changes the committed state. Inside a transaction the
    /// first call waits until it commits, so it never sees uncommitted state.
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<T>(
        &self,
        atom: &Atom<T>,
        listener: impl Fn(&T) + Send + Sync + 'static,
    ) -> Result<Subscription>
    where
        T: Clone + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(move |state: &Value| {
            if let Some(state) = state.downcast_ref::<T>() {
                listener(state);
            }
        });
        self.subscribe_erased(atom.proto(), listener, true)
    }

    /// Controller of this handle's causal scope.
    pub fn controller(&self) -> AbortController {
        self.controller
            .clone()
            .unwrap_or_else(|| self.inner.root.clone())
    }

    pub fn signal(&self) -> AbortSignal {
        self.controller().signal()
    }

    /// A handle to the same context whose effects are bound to `controller`.
    pub fn with_controller(&self, controller: &AbortController) -> Ctx {
        self.bound(Some(controller.clone()))
    }

    /// Register a listener for failed effects.
    pub fn on_error(&self, listener: impl Fn(&EffectError) + Send + Sync + 'static) {
        self.with_state_mut(|st| st.error_listeners.push(Arc::new(listener)));
    }

    /// Register a listener called after every transaction that changed state.
    pub fn on_commit(&self, listener: impl Fn(&Ctx, &TxRecord) + Send + Sync + 'static) {
        self.with_state_mut(|st| st.commit_listeners.push(Arc::new(listener)));
    }

    pub fn node_state(&self, atom: AtomId) -> NodeState {
        self.with_state(|st| st.slots.get(atom).map_or(NodeState::Cold, Slot::state))
    }

    /// Transaction that produced the committed state of `atom`.
    pub fn cause_of(&self, atom: AtomId) -> Option<TxId> {
        self.with_state(|st| st.slots.get(atom)?.cache.as_ref().map(|c| c.cause))
    }

    /// Retained transaction records, oldest first.
    pub fn history(&self) -> Vec<TxRecord> {
        self.with_state(|st| st.log.iter().cloned().collect())
    }

    /// The record of `tx` followed by the records of its causes.
    pub fn cause_chain(&self, tx: TxId) -> Vec<TxRecord> {
        self.with_state(|st| st.log.chain(tx))
    }

    /// Drop cold slots of atoms that no longer exist.
    ///
    /// Returns the number of slots removed.
    pub fn collect_garbage(&self) -> usize {
        let _guard = self.lock();
        let removed: Vec<Slot> = self.with_state_mut(|st| {
            if st.tx.is_some() {
                return Vec::new();
            }
            let dead: Vec<AtomId> = st
                .slots
                .iter()
                .filter(|slot| {
                    slot.proto.strong_count() == 0 && !slot.wants_connection() && !slot.is_connected()
                })
                .map(|slot| slot.id)
                .collect();
            dead.into_iter().filter_map(|id| st.slots.remove(id)).collect()
        });

        let count = removed.len();
        drop(removed);
        if count > 0 {
            tracing::debug!(ctx = %self.name(), count, "collected garbage");
        }
        count
    }

    pub(crate) fn bound(&self, controller: Option<AbortController>) -> Ctx {
        Ctx {
            inner: Arc::clone(&self.inner),
            controller,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCtx {
        WeakCtx {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Hold the context lock. Reentrant on the current thread.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<CtxState>> {
        self.inner.state.lock()
    }

    /// Run `f` with shared access to the state. `f` must not call back into
    /// user code.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&CtxState) -> R) -> R {
        let guard = self.lock();
        let state = guard.borrow();
        f(&state)
    }

    /// Run `f` with exclusive access to the state. `f` must not call back
    /// into user code.
    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut CtxState) -> R) -> R {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("name", &self.name())
            .field("scoped", &self.controller.is_some())
            .finish()
    }
}

/// Non-owning handle used by subscriptions and async effects.
#[derive(Clone)]
pub(crate) struct WeakCtx {
    inner: Weak<CtxInner>,
}

impl WeakCtx {
    pub(crate) fn upgrade(&self) -> Option<Ctx> {
        self.inner.upgrade().map(|inner| Ctx {
            inner,
            controller: None,
        })
    }
}
