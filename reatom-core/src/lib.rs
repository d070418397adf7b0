//! Reatom Core
//!
//! This crate provides a reactive state engine built from atoms and actions.
//! It implements:
//!
//! - Primitive and computed atoms with version-based memoization
//! - Actions: event nodes whose state is the calls of the current transaction
//! - Transactions with glitch-free propagation and rollback on failure
//! - A four-lane effect scheduler with cooperative cancellation
//! - Subscriptions with connect/disconnect lifecycle hooks
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: atoms, actions, contexts, transactions and effects
//! - `graph`: per-context node state and propagation order
//! - `snapshot`: serializable views of a context for debugging
//! - `config` and `error`: context options and error types
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use reatom_core::{action, atom, computed, Ctx};
//!
//! let ctx = Ctx::new();
//! let count = atom(0, "count").unwrap();
//! let clicked = action::<()>("clicked").unwrap();
//!
//! // Count clicks by reacting to the action.
//! let clicks = {
//!     let clicked = clicked.clone();
//!     computed(
//!         move |ctx, prev: Option<&u32>| {
//!             let mut total = prev.copied().unwrap_or(0);
//!             ctx.spy_calls(&clicked, |_| total += 1)?;
//!             Ok(total)
//!         },
//!         "clicks",
//!     )
//!     .unwrap()
//! };
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let _sub = {
//!     let seen = Arc::clone(&seen);
//!     ctx.subscribe(&clicks, move |n| seen.lock().unwrap().push(*n)).unwrap()
//! };
//!
//! ctx.transaction(|ctx| {
//!     clicked.call(ctx, ())?;
//!     clicked.call(ctx, ())?;
//!     count.set(ctx, 2)
//! })
//! .unwrap();
//!
//! assert_eq!(*seen.lock().unwrap(), vec![0, 2]);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod snapshot;

pub use config::CtxConfig;
pub use error::{throw_reatom_error, AbortError, EffectError, ReatomError, Result};
pub use graph::NodeState;
pub use reactive::{
    action, action_with, atom, computed, computed_opt, computed_with_eq, AbortController,
    AbortSignal, Action, Atom, AtomChange, AtomId, AtomKind, AtomProto, Call, ComputeCtx, Ctx,
    EffectStep, HookId, Scheduled, ScheduledAsync, Subscription, TxId, TxRecord, TxStatus, Value,
    WithReset,
};
pub use snapshot::{GraphSnapshot, NodeSnapshot};
