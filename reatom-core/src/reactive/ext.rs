//! Extensions
//!
//! Small combinators built only from the public atom and action API.

use std::ops::Deref;

use crate::error::Result;

use super::action::{action_with, Action};
use super::atom::{computed, Atom};

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A computed atom holding `f` applied to this atom's state.
    pub fn map<'a, U, F>(&self, f: F, name: impl Into<Option<&'a str>>) -> Result<Atom<U>>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        computed(move |ctx, _| Ok(f(&ctx.spy(&source)?)), name)
    }

    /// Pair this atom with a `reset` action that restores `default`.
    pub fn with_reset(self, default: T) -> Result<WithReset<T>> {
        let name = format!("{}.reset", self.name());
        let target = self.clone();
        let reset = action_with(move |ctx, ()| target.set(ctx, default.clone()), name.as_str())?;
        Ok(WithReset { atom: self, reset })
    }
}

/// An atom with an attached reset action. Derefs to the atom.
#[derive(Debug, Clone)]
pub struct WithReset<T> {
    pub atom: Atom<T>,
    pub reset: Action<(), T>,
}

impl<T> Deref for WithReset<T> {
    type Target = Atom<T>;

    fn deref(&self) -> &Atom<T> {
        &self.atom
    }
}
