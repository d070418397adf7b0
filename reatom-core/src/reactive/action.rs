//! Actions
//!
//! An [`Action`] is an event node. Calling it runs its function and appends
//! a [`Call`] to the action's state, which is the list of calls made in the
//! current transaction. The list starts empty in every transaction.
//!
//! Computed atoms react to actions with [`ComputeCtx::spy_calls`], which
//! hands them each call exactly once.
//!
//! [`ComputeCtx::spy_calls`]: super::ComputeCtx::spy_calls

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::graph::node::Listener;

use super::proto::{downcast, AtomId, AtomKind, AtomProto, HookId, Initial, Value};
use super::runtime::Ctx;
use super::subscriber::Subscription;
use super::transaction::TxMode;

/// One invocation of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call<P, R> {
    pub params: P,
    pub payload: R,
}

type ActionFn<P, R> = Arc<dyn Fn(&Ctx, P) -> Result<R> + Send + Sync>;

/// Typed handle to an action taking `P` and producing `R`.
pub struct Action<P, R = P> {
    proto: Arc<AtomProto>,
    run: ActionFn<P, R>,
}

impl<P, R> Clone for Action<P, R> {
    fn clone(&self) -> Self {
        Self {
            proto: Arc::clone(&self.proto),
            run: Arc::clone(&self.run),
        }
    }
}

impl<P, R> fmt::Debug for Action<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.proto.name()).finish()
    }
}

/// Declare an action whose payload is its parameter.
pub fn action<'a, P>(name: impl Into<Option<&'a str>>) -> Result<Action<P, P>>
where
    P: Clone + Send + Sync + 'static,
{
    action_with(|_, params: P| Ok(params), name)
}

/// Declare an action that computes its payload with `f`.
///
/// `f` runs inside the caller's transaction and may read and write atoms.
/// If it fails, the call is not recorded and the transaction fails.
pub fn action_with<'a, P, R, F>(f: F, name: impl Into<Option<&'a str>>) -> Result<Action<P, R>>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(&Ctx, P) -> Result<R> + Send + Sync + 'static,
{
    let initial: Initial = Arc::new(|| Arc::new(Vec::<Call<P, R>>::new()) as Value);
    let proto = AtomProto::new(
        AtomKind::Action,
        name.into(),
        None,
        Some(initial),
        Arc::new(|_: &Value, _: &Value| false),
    )?;
    Ok(Action {
        proto,
        run: Arc::new(f),
    })
}

impl<P, R> Action<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn id(&self) -> AtomId {
        self.proto.id()
    }

    pub fn name(&self) -> &str {
        self.proto.name()
    }

    pub fn proto(&self) -> &Arc<AtomProto> {
        &self.proto
    }

    /// Invoke the action and return its payload.
    pub fn call(&self, ctx: &Ctx, params: P) -> Result<R> {
        ctx.run_transaction(self.name(), TxMode::Write, |ctx| {
            let payload = (self.run)(ctx, params.clone())?;
            let call = Call {
                params,
                payload: payload.clone(),
            };
            let name = self.name();
            ctx.write(&self.proto, move |calls| {
                let mut calls: Vec<Call<P, R>> = downcast(calls, name)?;
                calls.push(call);
                Ok(Arc::new(calls) as Value)
            })?;
            debug!(ctx = %ctx.name(), action = name, "called");
            Ok(payload)
        })
    }

    /// Calls made in the current transaction. Outside a transaction this is
    /// always empty.
    pub fn calls(&self, ctx: &Ctx) -> Result<Vec<Call<P, R>>> {
        let cache = ctx.run_transaction("get", TxMode::Read, |ctx| ctx.actualize(&self.proto))?;
        downcast(&cache.state, self.name())
    }

    /// Call `listener` with the calls of every transaction that calls this
    /// action. Unlike atom subscriptions, there is no immediate call.
    pub fn subscribe(
        &self,
        ctx: &Ctx,
        listener: impl Fn(&[Call<P, R>]) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let listener: Listener = Arc::new(move |state: &Value| {
            if let Some(calls) = state.downcast_ref::<Vec<Call<P, R>>>() {
                listener(calls);
            }
        });
        ctx.subscribe_erased(&self.proto, listener, false)
    }

    pub fn on_connect(&self, hook: impl Fn(&Ctx) + Send + Sync + 'static) -> HookId {
        self.proto.on_connect(hook)
    }

    pub fn on_disconnect(&self, hook: impl Fn(&Ctx) + Send + Sync + 'static) -> HookId {
        self.proto.on_disconnect(hook)
    }

    pub fn off(&self, hook: HookId) -> bool {
        self.proto.off(hook)
    }
}
