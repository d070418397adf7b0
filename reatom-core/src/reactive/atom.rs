//! Atoms
//!
//! An [`Atom`] is a typed handle to an [`AtomProto`]. The handle itself holds
//! no state: every [`Ctx`] keeps its own cache for it, so the same atom can be
//! read in any number of independent contexts.
//!
//! There are two kinds of value atoms:
//!
//! - **Primitive** atoms, declared with [`atom`], hold a value that is only
//!   changed by [`Atom::set`] and [`Atom::update`].
//! - **Computed** atoms, declared with [`computed`] and friends, derive their
//!   value from other atoms read through [`ComputeCtx::spy`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ReatomError, Result};

use super::context::ComputeCtx;
use super::proto::{
    downcast, partial_eq, AtomId, AtomKind, AtomProto, Computer, Equality, HookId, Initial, Value,
};
use super::runtime::Ctx;
use super::subscriber::Subscription;
use super::transaction::TxMode;

/// Typed handle to an atom.
pub struct Atom<T> {
    proto: Arc<AtomProto>,
    _state: PhantomData<fn() -> T>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            proto: Arc::clone(&self.proto),
            _state: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atom").field(&self.proto.name()).finish()
    }
}

/// Declare a primitive atom.
///
/// `name` is optional; anonymous atoms are named `_atom#<id>`. Names must be
/// non-empty and free of whitespace.
pub fn atom<'a, T>(initial: T, name: impl Into<Option<&'a str>>) -> Result<Atom<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let initial: Initial = Arc::new(move || Arc::new(initial.clone()) as Value);
    Atom::declare(name.into(), None, Some(initial), partial_eq::<T>())
}

/// Declare a computed atom.
///
/// `compute` receives the previous state (`None` on the first computation)
/// and must return the next one.
pub fn computed<'a, T, F>(compute: F, name: impl Into<Option<&'a str>>) -> Result<Atom<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&ComputeCtx, Option<&T>) -> Result<T> + Send + Sync + 'static,
{
    computed_opt(move |ctx, prev| compute(ctx, prev).map(Some), name)
}

/// Declare a computed atom that may decline to produce a state.
///
/// Returning `Ok(None)` keeps the previous state. Doing so before any state
/// exists fails with [`ReatomError::UndefinedState`].
pub fn computed_opt<'a, T, F>(compute: F, name: impl Into<Option<&'a str>>) -> Result<Atom<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&ComputeCtx, Option<&T>) -> Result<Option<T>> + Send + Sync + 'static,
{
    Atom::declare(name.into(), Some(erase(compute)), None, partial_eq::<T>())
}

/// Declare a computed atom with a custom equality.
///
/// A recomputation whose result is `eq` to the previous state keeps the
/// previous state and does not notify.
pub fn computed_with_eq<'a, T, F, E>(
    compute: F,
    eq: E,
    name: impl Into<Option<&'a str>>,
) -> Result<Atom<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&ComputeCtx, Option<&T>) -> Result<T> + Send + Sync + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    let is_equal: Equality = Arc::new(move |a: &Value, b: &Value| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => eq(a, b),
            _ => false,
        }
    });
    let computer = erase(move |ctx: &ComputeCtx, prev: Option<&T>| compute(ctx, prev).map(Some));
    Atom::declare(name.into(), Some(computer), None, is_equal)
}

fn erase<T, F>(compute: F) -> Computer
where
    T: Send + Sync + 'static,
    F: Fn(&ComputeCtx, Option<&T>) -> Result<Option<T>> + Send + Sync + 'static,
{
    Arc::new(move |ctx: &ComputeCtx, prev: Option<&Value>| {
        let prev = match prev {
            Some(value) => Some(value.downcast_ref::<T>().ok_or_else(|| {
                ReatomError::message(format!("state of `{}` has an unexpected type", ctx.atom_name()))
            })?),
            None => None,
        };
        Ok(compute(ctx, prev)?.map(|state| Arc::new(state) as Value))
    })
}

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn declare(
        name: Option<&str>,
        computer: Option<Computer>,
        initial: Option<Initial>,
        is_equal: Equality,
    ) -> Result<Self> {
        let proto = AtomProto::new(AtomKind::Atom, name, computer, initial, is_equal)?;
        Ok(Self::from_proto(proto))
    }

    pub(crate) fn from_proto(proto: Arc<AtomProto>) -> Self {
        Self {
            proto,
            _state: PhantomData,
        }
    }

    pub fn id(&self) -> AtomId {
        self.proto.id()
    }

    pub fn name(&self) -> &str {
        self.proto.name()
    }

    pub fn proto(&self) -> &Arc<AtomProto> {
        &self.proto
    }

    /// Whether this atom derives its state from other atoms.
    pub fn is_computed(&self) -> bool {
        self.proto.computer().is_some()
    }

    /// Shorthand for [`Ctx::get`].
    pub fn get(&self, ctx: &Ctx) -> Result<T> {
        ctx.get(self)
    }

    /// Replace the state. Returns the state after the write.
    ///
    /// Writing to a computed atom overrides its state until one of its
    /// dependencies changes.
    pub fn set(&self, ctx: &Ctx, value: T) -> Result<T> {
        let value: Value = Arc::new(value);
        self.write(ctx, move |_| Ok(value))
    }

    /// Replace the state with `f(current)`.
    pub fn update(&self, ctx: &Ctx, f: impl FnOnce(&T) -> T) -> Result<T> {
        let name = self.name();
        self.write(ctx, move |current| {
            let current = current.downcast_ref::<T>().ok_or_else(|| {
                ReatomError::message(format!("state of `{name}` has an unexpected type"))
            })?;
            Ok(Arc::new(f(current)) as Value)
        })
    }

    /// Shorthand for [`Ctx::subscribe`].
    pub fn subscribe(&self, ctx: &Ctx, listener: impl Fn(&T) + Send + Sync + 'static) -> Result<Subscription> {
        ctx.subscribe(self, listener)
    }

    /// Run `hook` whenever this atom becomes connected in a context.
    pub fn on_connect(&self, hook: impl Fn(&Ctx) + Send + Sync + 'static) -> HookId {
        self.proto.on_connect(hook)
    }

    /// Run `hook` whenever this atom stops being connected in a context.
    pub fn on_disconnect(&self, hook: impl Fn(&Ctx) + Send + Sync + 'static) -> HookId {
        self.proto.on_disconnect(hook)
    }

    /// Run `hook` with the new state after every commit that changes it.
    pub fn on_update(&self, hook: impl Fn(&Ctx, &T) + Send + Sync + 'static) -> HookId {
        self.proto.on_update_erased(Arc::new(move |ctx: &Ctx, state: &Value| {
            if let Some(state) = state.downcast_ref::<T>() {
                hook(ctx, state);
            }
        }))
    }

    pub fn off(&self, hook: HookId) -> bool {
        self.proto.off(hook)
    }

    fn write(&self, ctx: &Ctx, update: impl FnOnce(&Value) -> Result<Value>) -> Result<T> {
        ctx.run_transaction(self.name(), TxMode::Write, |ctx| {
            let cache = ctx.write(&self.proto, update)?;
            downcast(&cache.state, self.name())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn set_and_update() {
        let ctx = Ctx::new();
        let count = atom(1, "count").unwrap();

        assert_eq!(count.set(&ctx, 5).unwrap(), 5);
        assert_eq!(count.update(&ctx, |n| n * 2).unwrap(), 10);
        assert_eq!(count.get(&ctx).unwrap(), 10);
    }

    #[test]
    fn equal_writes_do_not_notify() {
        let ctx = Ctx::new();
        let count = atom(1, "count").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let calls = Arc::clone(&calls);
            count
                .subscribe(&ctx, move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        count.set(&ctx, 1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        count.set(&ctx, 2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn computed_receives_previous_state() {
        let ctx = Ctx::new();
        let tick = atom(0u32, "tick").unwrap();
        let total = {
            let tick = tick.clone();
            computed(
                move |ctx, prev: Option<&u32>| Ok(prev.copied().unwrap_or(100) + ctx.spy(&tick)?),
                "total",
            )
            .unwrap()
        };

        assert_eq!(ctx.get(&total).unwrap(), 100);
        tick.set(&ctx, 5).unwrap();
        assert_eq!(ctx.get(&total).unwrap(), 105);
    }

    #[test]
    fn custom_equality_suppresses_updates() {
        let ctx = Ctx::new();
        let raw = atom(10i64, "raw").unwrap();
        let bucket = {
            let raw = raw.clone();
            computed_with_eq(
                move |ctx, _| ctx.spy(&raw),
                |a: &i64, b: &i64| a / 10 == b / 10,
                "bucket",
            )
            .unwrap()
        };

        assert_eq!(ctx.get(&bucket).unwrap(), 10);
        raw.set(&ctx, 15).unwrap();
        assert_eq!(ctx.get(&bucket).unwrap(), 10);
        raw.set(&ctx, 21).unwrap();
        assert_eq!(ctx.get(&bucket).unwrap(), 21);
    }

    #[test]
    fn invalid_names_fail_declaration() {
        assert!(matches!(atom(0, "bad name"), Err(ReatomError::InvalidDeclaration { .. })));
        assert!(atom(0, None).unwrap().name().starts_with("_atom#"));
    }

    #[test]
    fn update_hooks_see_committed_state() {
        let ctx = Ctx::new();
        let count = atom(0, "count").unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            count.on_update(move |_, n| seen.lock().push(*n));
        }

        count.set(&ctx, 1).unwrap();
        ctx.transaction(|ctx| {
            count.set(ctx, 2)?;
            count.set(ctx, 3)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(*seen.lock(), vec![1, 3]);
    }
}
