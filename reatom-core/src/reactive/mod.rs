//! Reactive Primitives
//!
//! This module implements the core reactive system: atoms, actions, the
//! transaction engine and the effect scheduler.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An atom is a declaration of reactive state. Primitive atoms hold a value;
//! computed atoms derive one from other atoms they `spy` on. Declarations are
//! shared, state is not: each [`Ctx`] keeps its own cache per atom.
//!
//! ## Actions
//!
//! An action is an event node. Its state is the list of calls made in the
//! current transaction, so computed atoms can react to events the same way
//! they react to values.
//!
//! ## Transactions
//!
//! Every read and write happens inside a transaction. Writes stay private to
//! the transaction until it commits; a failing transaction leaves the
//! committed state untouched.
//!
//! ## Effects
//!
//! Side effects are scheduled into ordered lanes and never run inside a
//! computation. Each one can be cancelled through the abort scope it was
//! scheduled from.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: a computer receives a [`ComputeCtx`] and
//! every `spy` call on it records a dependency together with the version it
//! observed. Reusing a cache only requires comparing those versions, so
//! nothing has to be pushed to dependents on write.

mod abort;
mod action;
mod atom;
mod context;
mod effect;
mod ext;
mod memo;
mod proto;
mod runtime;
mod subscriber;
mod transaction;

pub use abort::{AbortController, AbortSignal};
pub use action::{action, action_with, Action, Call};
pub use atom::{atom, computed, computed_opt, computed_with_eq, Atom};
pub use context::ComputeCtx;
pub use effect::{EffectStep, Scheduled, ScheduledAsync};
pub use ext::WithReset;
pub use proto::{AtomId, AtomKind, AtomProto, HookId, Value};
pub use runtime::Ctx;
pub use subscriber::Subscription;
pub use transaction::{AtomChange, TxId, TxRecord, TxStatus};
