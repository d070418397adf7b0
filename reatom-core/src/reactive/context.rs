//! Compute Context
//!
//! While a computed atom runs, the engine keeps a frame for it on the
//! context's frame stack. Reads made through [`ComputeCtx::spy`] record the
//! dependency in that frame; when the computer returns, the frame's
//! dependency list becomes the new `pubs` of the atom's cache.
//!
//! # Implementation
//!
//! Frames are identified by a per-context counter. A [`ComputeCtx`] remembers
//! the id of the frame it was created for, so a `spy` call made after that
//! frame was popped (for example from a stored closure or a later effect) is
//! detected and rejected with [`ReatomError::OutdatedTrackCall`].
//!
//! The frame is popped by a guard, so the stack stays balanced even when a
//! computer returns early with an error or panics.

use std::sync::Arc;

use crate::error::{EffectError, ReatomError, Result};
use crate::graph::node::{AtomCache, PubRef, Pubs};

use super::action::{Action, Call};
use super::atom::Atom;
use super::effect::{EffectStep, Scheduled};
use super::proto::{downcast, AtomId};
use super::runtime::Ctx;

/// One running computation.
pub(crate) struct Frame {
    id: u64,
    atom: AtomId,
    /// Dependencies read so far, in first-read order.
    pub(crate) pubs: Pubs,
    /// Dependencies of the previous computation, for `spy_with` and
    /// `spy_calls`.
    prev_pubs: Pubs,
    pub(crate) depth: u32,
}

/// Stack of running computations.
#[derive(Default)]
pub(crate) struct FrameStack {
    frames: Vec<Frame>,
    next: u64,
}

impl FrameStack {
    pub(crate) fn push(&mut self, atom: AtomId, prev_pubs: Pubs) -> u64 {
        self.next += 1;
        self.frames.push(Frame {
            id: self.next,
            atom,
            pubs: Pubs::new(),
            prev_pubs,
            depth: 0,
        });
        self.next
    }

    pub(crate) fn pop(&mut self, id: u64) -> Option<Frame> {
        let frame = self.frames.pop()?;
        debug_assert_eq!(frame.id, id, "compute frames popped out of order");
        Some(frame)
    }

    /// Whether `id` is the innermost running frame.
    pub(crate) fn is_active(&self, id: u64) -> bool {
        self.frames.last().map_or(false, |frame| frame.id == id)
    }

    /// Whether `atom` is currently being computed.
    pub(crate) fn contains(&self, atom: AtomId) -> bool {
        self.frames.iter().any(|frame| frame.atom == atom)
    }

    /// Record a read of `cache` in frame `id`.
    ///
    /// Returns what the previous computation of the frame's atom observed for
    /// the same dependency.
    pub(crate) fn track(&mut self, id: u64, cache: &AtomCache) -> Option<PubRef> {
        let frame = self.frames.iter_mut().rev().find(|frame| frame.id == id)?;
        if !frame.pubs.iter().any(|p| p.id == cache.id) {
            frame.pubs.push(PubRef::observe(cache));
            frame.depth = frame.depth.max(cache.depth + 1);
        }
        frame.prev_pubs.iter().find(|p| p.id == cache.id).cloned()
    }
}

/// Pops its frame when dropped.
pub(crate) struct FrameGuard<'a> {
    ctx: &'a Ctx,
    id: u64,
    done: bool,
}

impl<'a> FrameGuard<'a> {
    pub(crate) fn enter(ctx: &'a Ctx, atom: AtomId, prev_pubs: Pubs) -> Self {
        let id = ctx.with_state_mut(|st| st.frames.push(atom, prev_pubs));
        Self {
            ctx,
            id,
            done: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Pop the frame and hand back what it collected.
    pub(crate) fn finish(mut self) -> Option<Frame> {
        self.done = true;
        self.ctx.with_state_mut(|st| st.frames.pop(self.id))
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.ctx.with_state_mut(|st| st.frames.pop(self.id));
        }
    }
}

/// The handle a computer receives.
///
/// `spy` reads are tracked as dependencies of the atom being computed;
/// `get` reads are not. A clone kept past the end of the computation can
/// still `get`, but its `spy` calls fail with
/// [`ReatomError::OutdatedTrackCall`].
#[derive(Clone)]
pub struct ComputeCtx {
    ctx: Ctx,
    frame: u64,
    atom: Arc<str>,
}

impl ComputeCtx {
    pub(crate) fn new(ctx: Ctx, frame: u64, atom: Arc<str>) -> Self {
        Self { ctx, frame, atom }
    }

    /// The context the computation runs in.
    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    /// Name of the atom being computed.
    pub fn atom_name(&self) -> &str {
        &self.atom
    }

    /// Read `atom` and depend on it.
    pub fn spy<T>(&self, atom: &Atom<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (cache, _) = self.ctx.track(self.frame, atom.proto())?;
        downcast(&cache.state, atom.name())
    }

    /// Read `atom`, depend on it, and call `on_change(next, prev)` when its
    /// state differs from what the previous computation saw.
    ///
    /// `prev` is `None` when the previous computation did not read `atom`.
    pub fn spy_with<T>(&self, atom: &Atom<T>, on_change: impl FnOnce(&T, Option<&T>)) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (cache, prev) = self.ctx.track(self.frame, atom.proto())?;
        let next: T = downcast(&cache.state, atom.name())?;
        match prev {
            Some(prev) if prev.version == cache.version => {}
            Some(prev) => on_change(&next, prev.state.downcast_ref::<T>()),
            None => on_change(&next, None),
        }
        Ok(next)
    }

    /// Depend on an action and return the calls made in the current
    /// transaction.
    pub fn spy_action<P, R>(&self, action: &Action<P, R>) -> Result<Vec<Call<P, R>>>
    where
        P: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let (cache, _) = self.ctx.track(self.frame, action.proto())?;
        downcast(&cache.state, action.name())
    }

    /// Depend on an action and feed `on_call` every call this computation
    /// has not seen yet, in call order.
    pub fn spy_calls<P, R>(&self, action: &Action<P, R>, mut on_call: impl FnMut(&Call<P, R>)) -> Result<()>
    where
        P: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let (cache, prev) = self.ctx.track(self.frame, action.proto())?;
        let calls = cache
            .state
            .downcast_ref::<Vec<Call<P, R>>>()
            .ok_or_else(|| {
                ReatomError::message(format!("calls of `{}` have an unexpected type", action.name()))
            })?;

        // Every call bumps the action version by one.
        let unseen = match prev {
            Some(prev) => usize::try_from(cache.version.saturating_sub(prev.version)).unwrap_or(usize::MAX),
            None => calls.len(),
        };
        for call in &calls[calls.len().saturating_sub(unseen)..] {
            on_call(call);
        }
        Ok(())
    }

    /// Read `atom` without depending on it.
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.ctx.get(atom)
    }

    /// Schedule an effect from inside the computation. It runs only if the
    /// surrounding transaction commits.
    pub fn schedule<T, F>(&self, effect: F, step: EffectStep) -> Scheduled<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ctx) -> Result<T, EffectError> + Send + 'static,
    {
        self.ctx.schedule(effect, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{atom, TxId};

    #[test]
    fn frames_track_first_read_and_depth() {
        let a = atom(1, "a").unwrap();
        let b = atom(2, "b").unwrap();
        let mut stack = FrameStack::default();

        let mut deep = AtomCache::new(b.proto(), Arc::new(2), TxId::ZERO);
        deep.depth = 3;
        let shallow = AtomCache::new(a.proto(), Arc::new(1), TxId::ZERO);

        let frame = stack.push(a.id(), Pubs::new());
        assert!(stack.track(frame, &shallow).is_none());
        stack.track(frame, &deep);
        stack.track(frame, &shallow);

        let frame = stack.pop(frame).unwrap();
        let ids: Vec<_> = frame.pubs.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
        assert_eq!(frame.depth, 4);
    }

    #[test]
    fn only_the_top_frame_is_active() {
        let a = atom(1, "a").unwrap();
        let b = atom(2, "b").unwrap();
        let mut stack = FrameStack::default();

        let outer = stack.push(a.id(), Pubs::new());
        let inner = stack.push(b.id(), Pubs::new());
        assert!(!stack.is_active(outer));
        assert!(stack.is_active(inner));
        assert!(stack.contains(a.id()));

        stack.pop(inner);
        assert!(stack.is_active(outer));
        stack.pop(outer);
        assert!(!stack.contains(a.id()));
    }

    #[test]
    fn previous_reads_are_reported() {
        let a = atom(1, "a").unwrap();
        let old = AtomCache::new(a.proto(), Arc::new(1), TxId::ZERO);
        let mut prev = Pubs::new();
        prev.push(PubRef::observe(&old));

        let mut stack = FrameStack::default();
        let frame = stack.push(a.id(), prev);
        let seen = stack.track(frame, &old.with_state(Arc::new(5), 2, TxId::ZERO)).unwrap();
        assert_eq!(seen.version, 1);
    }
}
