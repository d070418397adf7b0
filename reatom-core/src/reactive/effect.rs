//! Effect Scheduling
//!
//! Side effects never run inside a computation. They are queued into one of
//! four lanes and run when the engine reaches that lane.
//!
//! # Lanes
//!
//! | Step        | Runs                                                      |
//! |-------------|-----------------------------------------------------------|
//! | `Cleanup`   | right after commit, and also after a failed transaction   |
//! | `Sync`      | right after commit, before listeners                      |
//! | `Near`      | on flush, before every `Late` effect                      |
//! | `Late`      | on flush, after every `Near` effect                       |
//!
//! A flush drains `Near` completely before taking the next `Late` effect, and
//! re-checks `Near` after every `Late` effect, so effects scheduled by
//! effects still run in step order.
//!
//! Flushing happens after every commit when
//! [`CtxConfig::auto_flush`](crate::CtxConfig) is set, before every external
//! write, and whenever [`Ctx::flush`] is called.
//!
//! # Isolation
//!
//! A failing effect only fails its own [`Scheduled`] handle. The failure is
//! logged, handed to the context's `on_error` listeners, and the remaining
//! effects still run.
//!
//! # Async
//!
//! [`Ctx::schedule_async`] runs the callback in its lane and hands the future
//! it returns to whoever awaits the [`ScheduledAsync`] handle. The future is
//! raced against the abort signal of the scheduling scope.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{self, BoxFuture, Either, FutureExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{EffectError, Result};

use super::runtime::Ctx;
use super::transaction::TxId;

/// Scheduling step of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i8)]
pub enum EffectStep {
    /// Runs on commit and on rollback.
    Cleanup = -1,
    /// Runs on commit.
    Sync = 0,
    /// Runs on flush.
    #[default]
    Near = 1,
    /// Runs on flush, after near effects.
    Late = 2,
}

impl EffectStep {
    fn lane(self) -> usize {
        (self as i8 + 1) as usize
    }
}

pub(crate) type EffectFn = Box<dyn FnOnce(&Ctx) + Send>;

/// A queued effect.
pub(crate) struct EffectEntry {
    pub(crate) run: EffectFn,
    /// Transaction that scheduled it.
    pub(crate) cause: Option<TxId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sync,
    Flush,
}

/// The four lanes plus reentrancy flags.
#[derive(Default)]
pub(crate) struct EffectQueues {
    lanes: [VecDeque<EffectEntry>; 4],
    syncing: bool,
    flushing: bool,
}

impl EffectQueues {
    pub(crate) fn push(&mut self, step: EffectStep, entry: EffectEntry) {
        self.lanes[step.lane()].push_back(entry);
    }

    fn pop_sync(&mut self) -> Option<EffectEntry> {
        let [cleanup, sync, _, _] = &mut self.lanes;
        cleanup.pop_front().or_else(|| sync.pop_front())
    }

    fn pop_flush(&mut self) -> Option<EffectEntry> {
        let [_, _, near, late] = &mut self.lanes;
        near.pop_front().or_else(|| late.pop_front())
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn flag(&mut self, phase: Phase) -> &mut bool {
        match phase {
            Phase::Sync => &mut self.syncing,
            Phase::Flush => &mut self.flushing,
        }
    }

    /// Enter `phase` unless it is already running.
    fn begin(&mut self, phase: Phase) -> bool {
        let flag = self.flag(phase);
        !std::mem::replace(flag, true)
    }
}

/// Leaves a drain phase, even on unwind.
struct PhaseGuard<'a> {
    ctx: &'a Ctx,
    phase: Phase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.ctx.with_state_mut(|st| *st.queues.flag(self.phase) = false);
    }
}

/// Result handle of [`Ctx::schedule`].
///
/// Resolves once the effect has run. Resolves with
/// [`EffectError::Discarded`] if the effect never will, for example because
/// the transaction that scheduled it failed.
pub struct Scheduled<T> {
    receiver: oneshot::Receiver<Result<T, EffectError>>,
}

impl<T> Scheduled<T> {
    /// The result, if the effect has run already.
    pub fn try_result(&mut self) -> Option<Result<T, EffectError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(EffectError::Discarded)),
        }
    }
}

impl<T> Future for Scheduled<T> {
    type Output = Result<T, EffectError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(EffectError::Discarded)))
    }
}

impl<T> fmt::Debug for Scheduled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduled").finish_non_exhaustive()
    }
}

/// Result handle of [`Ctx::schedule_async`].
pub struct ScheduledAsync<T> {
    future: BoxFuture<'static, Result<T, EffectError>>,
}

impl<T> Future for ScheduledAsync<T> {
    type Output = Result<T, EffectError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for ScheduledAsync<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledAsync").finish_non_exhaustive()
    }
}

impl Ctx {
    /// Queue `effect` at `step`.
    ///
    /// Inside a transaction the effect is held back until the transaction
    /// commits. The effect receives a context bound to the abort scope it was
    /// scheduled from; if that scope is aborted before the effect runs, the
    /// effect is skipped and resolves with [`EffectError::Aborted`].
    pub fn schedule<T, F>(&self, effect: F, step: EffectStep) -> Scheduled<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ctx) -> Result<T, EffectError> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let controller = self.controller.clone();
        let signal = self.signal();

        self.enqueue(
            step,
            Box::new(move |ctx: &Ctx| {
                let scoped = ctx.bound(controller);
                let result = match signal.throw_if_aborted() {
                    Ok(()) => effect(&scoped),
                    Err(abort) => Err(EffectError::Aborted(abort)),
                };
                if let Err(error) = &result {
                    scoped.report_effect_error(error);
                }
                // The caller may have dropped the handle.
                let _ = sender.send(result);
            }),
        );

        Scheduled { receiver }
    }

    /// Queue an effect that starts async work.
    ///
    /// `effect` runs in its lane like any other effect; the future it returns
    /// is driven by whoever awaits the returned handle and is cancelled with
    /// [`EffectError::Aborted`] when the scheduling scope is aborted.
    pub fn schedule_async<T, F, Fut>(&self, effect: F, step: EffectStep) -> ScheduledAsync<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EffectError>> + Send + 'static,
    {
        let signal = self.signal();
        let reporter = self.downgrade();
        let started = self.schedule(move |ctx| Ok(effect(ctx).boxed()), step);

        let future = async move {
            let work = started.await?;
            let result = match future::select(work, Box::pin(signal.aborted())).await {
                Either::Left((result, _)) => result,
                Either::Right((abort, _)) => Err(EffectError::Aborted(abort)),
            };
            if let (Err(error), Some(ctx)) = (&result, reporter.upgrade()) {
                ctx.report_effect_error(error);
            }
            result
        };

        ScheduledAsync {
            future: future.boxed(),
        }
    }

    /// Run pending near and late effects.
    ///
    /// Does nothing when called from inside a running flush.
    pub fn flush(&self) {
        let _lock = self.lock();
        if !self.with_state_mut(|st| st.queues.begin(Phase::Flush)) {
            return;
        }
        let _phase = PhaseGuard {
            ctx: self,
            phase: Phase::Flush,
        };

        while let Some(entry) = self.with_state_mut(|st| st.queues.pop_flush()) {
            self.run_effect(entry);
        }
    }

    /// Number of queued effects across all lanes.
    pub fn pending_effects(&self) -> usize {
        self.with_state(|st| st.queues.len())
    }

    /// Run pending cleanup and sync effects.
    pub(crate) fn drain_sync(&self) {
        let _lock = self.lock();
        if !self.with_state_mut(|st| st.queues.begin(Phase::Sync)) {
            return;
        }
        let _phase = PhaseGuard {
            ctx: self,
            phase: Phase::Sync,
        };

        while let Some(entry) = self.with_state_mut(|st| st.queues.pop_sync()) {
            self.run_effect(entry);
        }
    }

    /// Queue an effect without draining.
    pub(crate) fn push_effect(&self, step: EffectStep, run: EffectFn, cause: Option<TxId>) {
        self.with_state_mut(|st| st.queues.push(step, EffectEntry { run, cause }));
    }

    pub(crate) fn report_effect_error(&self, error: &EffectError) {
        if error.is_abort() {
            debug!(ctx = %self.name(), %error, "effect aborted");
            return;
        }
        warn!(ctx = %self.name(), %error, "effect failed");
        let listeners = self.with_state(|st| st.error_listeners.clone());
        for listener in listeners {
            listener(error);
        }
    }

    fn enqueue(&self, step: EffectStep, run: EffectFn) {
        let _lock = self.lock();
        let queued = self.with_state_mut(|st| {
            let cause = st.tx.as_ref().map(|tx| tx.id).or(st.current_cause);
            let entry = EffectEntry { run, cause };
            match st.tx.as_mut() {
                Some(tx) => {
                    tx.effects.push((step, entry));
                    false
                }
                None => {
                    st.queues.push(step, entry);
                    true
                }
            }
        });
        if !queued {
            return;
        }

        match step {
            EffectStep::Cleanup | EffectStep::Sync => self.drain_sync(),
            EffectStep::Near | EffectStep::Late if self.inner.config.auto_flush => self.flush(),
            EffectStep::Near | EffectStep::Late => {}
        }
    }

    fn run_effect(&self, entry: EffectEntry) {
        let previous = self.with_state_mut(|st| std::mem::replace(&mut st.current_cause, entry.cause));
        (entry.run)(self);
        self.with_state_mut(|st| st.current_cause = previous);
    }
}
