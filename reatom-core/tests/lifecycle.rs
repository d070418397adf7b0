//! Lifecycle Tests
//!
//! Connection hooks, cancellation and garbage collection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future;
use reatom_core::{
    atom, computed, AbortController, AbortSignal, Ctx, CtxConfig, EffectError, EffectStep,
    NodeState, ScheduledAsync,
};

/// Subscribe then unsubscribe: one connect, then one disconnect whose signal
/// is already aborted.
#[test]
fn connect_and_disconnect_are_symmetric() {
    let ctx = Ctx::new();
    let source = atom(0, "source").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let connected_signal: Arc<Mutex<Option<AbortSignal>>> = Arc::default();

    {
        let (events, connected_signal) = (Arc::clone(&events), Arc::clone(&connected_signal));
        source.on_connect(move |ctx| {
            events.lock().unwrap().push(("connect", ctx.signal().is_aborted()));
            connected_signal.lock().unwrap().replace(ctx.signal());
        });
    }
    {
        let events = Arc::clone(&events);
        source.on_disconnect(move |ctx| {
            events.lock().unwrap().push(("disconnect", ctx.signal().is_aborted()));
        });
    }

    let sub = source.subscribe(&ctx, |_| {}).unwrap();
    assert_eq!(*events.lock().unwrap(), vec![("connect", false)]);

    sub.unsubscribe();
    assert_eq!(
        *events.lock().unwrap(),
        vec![("connect", false), ("disconnect", true)]
    );
    let signal = connected_signal.lock().unwrap().take().unwrap();
    assert!(signal.is_aborted());
}

/// A second subscriber does not reconnect; resubscribing after a disconnect
/// does, with a fresh signal.
#[test]
fn reconnecting_gets_a_fresh_scope() {
    let ctx = Ctx::new();
    let source = atom(0, "source").unwrap();
    let connects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        source.on_connect(move |ctx| {
            assert!(!ctx.signal().is_aborted());
            connects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let first = source.subscribe(&ctx, |_| {}).unwrap();
    let second = source.subscribe(&ctx, |_| {}).unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    drop(first);
    drop(second);
    let _third = source.subscribe(&ctx, |_| {}).unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

/// Connection follows the dependencies a computed atom actually reads.
#[test]
fn connection_follows_dynamic_dependencies() {
    let ctx = Ctx::new();
    let use_left = atom(true, "useLeft").unwrap();
    let left = atom(1, "left").unwrap();
    let right = atom(2, "right").unwrap();
    let view = {
        let (use_left, left, right) = (use_left.clone(), left.clone(), right.clone());
        computed(
            move |ctx, _| {
                if ctx.spy(&use_left)? {
                    ctx.spy(&left)
                } else {
                    ctx.spy(&right)
                }
            },
            "view",
        )
        .unwrap()
    };
    let left_disconnects = Arc::new(AtomicUsize::new(0));
    {
        let left_disconnects = Arc::clone(&left_disconnects);
        left.on_disconnect(move |_| {
            left_disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let _sub = view.subscribe(&ctx, |_| {}).unwrap();
    assert_eq!(ctx.node_state(left.id()), NodeState::Hot);
    assert_eq!(ctx.node_state(right.id()), NodeState::Cold);

    use_left.set(&ctx, false).unwrap();
    assert_eq!(ctx.node_state(left.id()), NodeState::Warm);
    assert_eq!(ctx.node_state(right.id()), NodeState::Hot);
    assert_eq!(left_disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(view.get(&ctx).unwrap(), 2);
}

/// Aborting the connection scope rejects async work started from
/// `on_connect`, without reporting it as an error.
#[tokio::test]
async fn disconnect_aborts_async_work() {
    let ctx = Ctx::new();
    let errors = Arc::new(AtomicUsize::new(0));
    {
        let errors = Arc::clone(&errors);
        ctx.on_error(move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        });
    }

    let source = atom(0, "source").unwrap();
    let work: Arc<Mutex<Option<ScheduledAsync<()>>>> = Arc::default();
    {
        let work = Arc::clone(&work);
        source.on_connect(move |ctx| {
            let pending = ctx.schedule_async(|_| future::pending::<Result<(), EffectError>>(), EffectStep::Near);
            work.lock().unwrap().replace(pending);
        });
    }

    let sub = source.subscribe(&ctx, |_| {}).unwrap();
    let pending = work.lock().unwrap().take().unwrap();
    sub.unsubscribe();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("aborted work should settle");
    assert!(matches!(result, Err(EffectError::Aborted(_))));
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

/// Effects bound to an aborted scope are skipped.
#[test]
fn aborted_scopes_skip_effects() {
    let ctx = Ctx::with_config(CtxConfig::default().manual_flush());
    let controller = AbortController::new();
    let scoped = ctx.with_controller(&controller);
    let ran = Arc::new(AtomicUsize::new(0));

    let mut handle = {
        let ran = Arc::clone(&ran);
        scoped.schedule(
            move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            EffectStep::Near,
        )
    };
    controller.abort("navigated away");
    ctx.flush();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    match handle.try_result() {
        Some(Err(EffectError::Aborted(reason))) => assert_eq!(reason.reason(), "navigated away"),
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Dropped atoms can be collected once nothing listens to them.
#[test]
fn garbage_collection_respects_listeners() {
    let ctx = Ctx::new();
    let temp = atom(0, "temp").unwrap();
    let id = temp.id();
    let sub = temp.subscribe(&ctx, |_| {}).unwrap();
    drop(temp);

    assert_eq!(ctx.collect_garbage(), 0);
    drop(sub);
    assert_eq!(ctx.collect_garbage(), 1);
    assert_eq!(ctx.node_state(id), NodeState::Cold);
    assert!(ctx.snapshot().nodes.iter().all(|node| node.id != id));
}

/// Commit listeners receive every state-changing transaction.
#[test]
fn commit_listeners_see_changes() {
    let ctx = Ctx::new();
    let a = atom(0, "a").unwrap();
    let labels = Arc::new(Mutex::new(Vec::new()));
    {
        let labels = Arc::clone(&labels);
        ctx.on_commit(move |_, record| labels.lock().unwrap().push(record.label.clone()));
    }

    a.get(&ctx).unwrap();
    a.set(&ctx, 1).unwrap();
    a.set(&ctx, 1).unwrap();
    ctx.transaction(|ctx| a.set(ctx, 2)).unwrap();

    assert_eq!(*labels.lock().unwrap(), vec!["a".to_string(), "transaction".to_string()]);
}
