//! Memoization
//!
//! Actualization is how the engine decides whether a cached state can be
//! reused.
//!
//! # Algorithm
//!
//! Each cache records the version of every dependency it read. To actualize
//! a computed atom:
//!
//! 1. If the cache was verified at the current write epoch, reuse it.
//! 2. Otherwise actualize each recorded dependency in first-read order. The
//!    first one whose version differs (or whose atom no longer exists) marks
//!    the cache dirty; the rest are not inspected.
//! 3. A clean cache is stamped with the current epoch and reused. A dirty or
//!    missing cache is recomputed.
//!
//! A recomputation that produces a state equal to the previous one keeps the
//! previous state and version, so dependents of an unchanged atom are not
//! recomputed.
//!
//! Primitive atoms are never recomputed. Actions are primitive atoms whose
//! state is the list of calls made in the current transaction; the list is
//! cleared the first time the action is touched in a new transaction.

use std::sync::Arc;

use tracing::trace;

use crate::error::{ReatomError, Result};
use crate::graph::node::{AtomCache, PubRef};

use super::context::{ComputeCtx, FrameGuard};
use super::proto::{AtomProto, Value};
use super::runtime::Ctx;
use super::transaction::{Patch, TxId};

enum Lookup {
    /// Up to date at the current epoch.
    Fresh(Arc<AtomCache>),
    /// Present but possibly outdated.
    Stale(Arc<AtomCache>),
    /// Action calls left over from an earlier transaction.
    Leftover(Arc<AtomCache>),
    Missing,
}

impl Ctx {
    /// Bring `proto`'s cache up to date inside the open transaction.
    pub(crate) fn actualize(&self, proto: &Arc<AtomProto>) -> Result<Arc<AtomCache>> {
        let id = proto.id();
        let primitive = proto.computer().is_none();

        let (lookup, tx) = self.with_state(|st| -> Result<(Lookup, TxId)> {
            if st.frames.contains(id) {
                return Err(ReatomError::CircularDependency {
                    atom: proto.name_arc(),
                });
            }
            let tx = st
                .tx
                .as_ref()
                .ok_or_else(|| ReatomError::message("atoms can only be read inside a transaction"))?;

            let (cache, verified_at) = match tx.patches.get(&id) {
                Some(patch) => (Arc::clone(&patch.cache), patch.verified_at),
                None => match st.slots.get(id).and_then(|slot| slot.cache.clone().map(|c| (c, slot.verified_at))) {
                    Some((cache, _)) if proto.is_action() => return Ok((Lookup::Leftover(cache), tx.id)),
                    Some(found) => found,
                    None => return Ok((Lookup::Missing, tx.id)),
                },
            };

            let lookup = if primitive || verified_at == st.epoch {
                Lookup::Fresh(cache)
            } else {
                Lookup::Stale(cache)
            };
            Ok((lookup, tx.id))
        })?;

        match lookup {
            Lookup::Fresh(cache) => Ok(cache),
            Lookup::Leftover(cache) => {
                let cleared = Arc::new(cache.with_state(self.initial_state(proto)?, cache.version, tx));
                self.insert_patch(&cleared, None);
                Ok(cleared)
            }
            Lookup::Missing if primitive => {
                let cache = Arc::new(AtomCache::new(proto, self.initial_state(proto)?, tx));
                self.insert_patch(&cache, None);
                Ok(cache)
            }
            Lookup::Missing => self.compute(proto, None, tx),
            Lookup::Stale(cache) => {
                let epoch = self.with_state(|st| st.epoch);
                if self.is_dirty(&cache)? {
                    self.compute(proto, Some(cache), tx)
                } else {
                    self.mark_verified(&cache, epoch);
                    Ok(cache)
                }
            }
        }
    }

    /// Replace the state of a primitive atom or action.
    ///
    /// `update` receives the current state. Returns the resulting cache,
    /// which is the current one when the new state is equal.
    pub(crate) fn write(
        &self,
        proto: &Arc<AtomProto>,
        update: impl FnOnce(&Value) -> Result<Value>,
    ) -> Result<Arc<AtomCache>> {
        let current = self.actualize(proto)?;
        let next = update(&current.state)?;
        if proto.equals(&current.state, &next) {
            return Ok(current);
        }

        let cache = self.with_state_mut(|st| -> Result<Arc<AtomCache>> {
            let tx = st
                .tx
                .as_mut()
                .ok_or_else(|| ReatomError::message("atoms can only be written inside a transaction"))?;
            st.epoch += 1;
            let cache = Arc::new(current.with_state(next, current.version + 1, tx.id));
            tx.patches.insert(
                cache.id,
                Patch {
                    cache: Arc::clone(&cache),
                    verified_at: st.epoch,
                },
            );
            tx.written.insert(cache.id);
            Ok(cache)
        })?;

        trace!(atom = proto.name(), version = cache.version, "written");
        Ok(cache)
    }

    /// Record a `spy` read made from compute frame `frame`.
    ///
    /// Returns the dependency's cache and what the previous computation saw.
    pub(crate) fn track(
        &self,
        frame: u64,
        proto: &Arc<AtomProto>,
    ) -> Result<(Arc<AtomCache>, Option<PubRef>)> {
        if !self.with_state(|st| st.frames.is_active(frame)) {
            return Err(ReatomError::OutdatedTrackCall {
                atom: proto.name_arc(),
            });
        }
        let cache = self.actualize(proto)?;
        let previous = self.with_state_mut(|st| st.frames.track(frame, &cache));
        Ok((cache, previous))
    }

    fn compute(
        &self,
        proto: &Arc<AtomProto>,
        previous: Option<Arc<AtomCache>>,
        tx: TxId,
    ) -> Result<Arc<AtomCache>> {
        let Some(computer) = proto.computer().cloned() else {
            return Err(ReatomError::message(format!("`{}` has no computer", proto.name())));
        };
        let epoch = self.with_state(|st| st.epoch);
        let prev_pubs = previous.as_ref().map(|c| c.pubs.clone()).unwrap_or_default();
        let prev_state = match &previous {
            Some(cache) => Some(Arc::clone(&cache.state)),
            None => proto.initial_state(),
        };

        trace!(atom = proto.name(), cold = previous.is_none(), "computing");
        let frame = FrameGuard::enter(self, proto.id(), prev_pubs);
        let compute_ctx = ComputeCtx::new(self.clone(), frame.id(), proto.name_arc());
        let next = computer(&compute_ctx, prev_state.as_ref());
        let frame = frame.finish();

        let next = next?;
        let frame = frame.ok_or_else(|| ReatomError::message("compute frame was lost"))?;
        let state = match next {
            Some(state) => state,
            None => prev_state.ok_or_else(|| ReatomError::UndefinedState {
                atom: proto.name_arc(),
            })?,
        };

        let (state, version) = match &previous {
            Some(prev) if proto.equals(&prev.state, &state) => (Arc::clone(&prev.state), prev.version),
            Some(prev) => (state, prev.version + 1),
            None => (state, 1),
        };
        let cache = Arc::new(AtomCache {
            id: proto.id(),
            proto: Arc::downgrade(proto),
            state,
            version,
            pubs: frame.pubs,
            depth: frame.depth,
            cause: tx,
        });
        self.insert_patch(&cache, Some(epoch));
        Ok(cache)
    }

    /// Whether any dependency of `cache` changed since it was computed.
    fn is_dirty(&self, cache: &AtomCache) -> Result<bool> {
        for dep in &cache.pubs {
            let Some(proto) = dep.proto.upgrade() else {
                return Ok(true);
            };
            if self.actualize(&proto)?.version != dep.version {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn initial_state(&self, proto: &AtomProto) -> Result<Value> {
        proto.initial_state().ok_or_else(|| ReatomError::UndefinedState {
            atom: proto.name_arc(),
        })
    }

    /// Store `cache` as the transaction's patch, verified at `epoch` (the
    /// current epoch when `None`).
    fn insert_patch(&self, cache: &Arc<AtomCache>, epoch: Option<u64>) {
        self.with_state_mut(|st| {
            let verified_at = epoch.unwrap_or(st.epoch);
            if let Some(tx) = st.tx.as_mut() {
                tx.patches.insert(
                    cache.id,
                    Patch {
                        cache: Arc::clone(cache),
                        verified_at,
                    },
                );
            }
        });
    }

    fn mark_verified(&self, cache: &AtomCache, epoch: u64) {
        self.with_state_mut(|st| {
            if let Some(patch) = st.tx.as_mut().and_then(|tx| tx.patches.get_mut(&cache.id)) {
                patch.verified_at = epoch;
            } else if let Some(slot) = st.slots.get_mut(cache.id) {
                slot.verified_at = epoch;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::reactive::{action, atom, computed, computed_opt};

    #[test]
    fn unchanged_dependencies_skip_recomputation() {
        let ctx = Ctx::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let a = atom(1, "a").unwrap();
        let unrelated = atom(0, "unrelated").unwrap();
        let doubled = {
            let (a, runs) = (a.clone(), Arc::clone(&runs));
            computed(
                move |ctx, _| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(ctx.spy(&a)? * 2)
                },
                "doubled",
            )
            .unwrap()
        };

        assert_eq!(ctx.get(&doubled).unwrap(), 2);
        assert_eq!(ctx.get(&doubled).unwrap(), 2);
        unrelated.set(&ctx, 5).unwrap();
        assert_eq!(ctx.get(&doubled).unwrap(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        a.set(&ctx, 2).unwrap();
        assert_eq!(ctx.get(&doubled).unwrap(), 4);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_results_keep_the_version() {
        let ctx = Ctx::new();
        let a = atom(1, "a").unwrap();
        let parity = {
            let a = a.clone();
            computed(move |ctx, _| Ok(ctx.spy(&a)? % 2), "parity").unwrap()
        };

        ctx.get(&parity).unwrap();
        let before = ctx.with_state(|st| st.slots.get(parity.id()).unwrap().cache.clone().unwrap());
        a.set(&ctx, 3).unwrap();
        ctx.get(&parity).unwrap();
        let after = ctx.with_state(|st| st.slots.get(parity.id()).unwrap().cache.clone().unwrap());

        assert_eq!(before.version, after.version);
        assert!(Arc::ptr_eq(&before.state, &after.state));
    }

    #[test]
    fn missing_state_is_undefined() {
        let ctx = Ctx::new();
        let empty = computed_opt(|_, _: Option<&i32>| Ok(None), "empty").unwrap();
        let err = ctx.get(&empty).unwrap_err();
        assert!(matches!(err, ReatomError::UndefinedState { .. }));
    }

    #[test]
    fn self_reads_are_circular() {
        let ctx = Ctx::new();
        let slot: Arc<parking_lot::Mutex<Option<crate::reactive::Atom<i32>>>> = Arc::default();
        let looped = {
            let slot = Arc::clone(&slot);
            computed(
                move |ctx, _| {
                    let me = slot.lock().clone();
                    match me {
                        Some(me) => ctx.spy(&me),
                        None => Ok(0),
                    }
                },
                "looped",
            )
            .unwrap()
        };
        *slot.lock() = Some(looped.clone());

        let err = ctx.get(&looped).unwrap_err();
        assert!(matches!(err, ReatomError::CircularDependency { .. }));
    }

    #[test]
    fn action_calls_are_cleared_per_transaction() {
        let ctx = Ctx::new();
        let clicked = action::<u32>("clicked").unwrap();

        ctx.transaction(|ctx| {
            clicked.call(ctx, 1)?;
            clicked.call(ctx, 2)?;
            assert_eq!(clicked.calls(ctx)?.len(), 2);
            Ok(())
        })
        .unwrap();

        assert!(clicked.calls(&ctx).unwrap().is_empty());
    }
}
