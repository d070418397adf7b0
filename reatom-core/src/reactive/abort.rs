//! Cooperative Cancellation
//!
//! An [`AbortController`] owns an abort flag and a set of child controllers.
//! Aborting a controller aborts every descendant with the same reason.
//! Connected atoms and effects observe the flag through an [`AbortSignal`].
//!
//! Each context has a root controller. A node that connects gets a child of
//! the root, and that child is aborted when the node disconnects, so work
//! started from `on_connect` can stop itself.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::AbortError;

struct AbortInner {
    reason: RwLock<Option<AbortError>>,
    children: Mutex<Vec<Weak<AbortInner>>>,
    notify: watch::Sender<bool>,
}

impl AbortInner {
    fn new() -> Arc<Self> {
        let (notify, _) = watch::channel(false);
        Arc::new(Self {
            reason: RwLock::new(None),
            children: Mutex::new(Vec::new()),
            notify,
        })
    }

    fn abort(&self, error: AbortError) {
        {
            let mut reason = self.reason.write();
            if reason.is_some() {
                return;
            }
            *reason = Some(error.clone());
        }
        self.notify.send_replace(true);

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.abort(error.clone());
        }
    }
}

/// Owner side of a cancellation scope.
#[derive(Clone)]
pub struct AbortController {
    inner: Arc<AbortInner>,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            inner: AbortInner::new(),
        }
    }

    /// A controller that is aborted together with this one.
    ///
    /// If this controller is already aborted, the child starts aborted.
    pub fn child(&self) -> AbortController {
        let child = AbortController::new();
        let mut children = self.inner.children.lock();
        let inherited = self.inner.reason.read().clone();
        match inherited {
            Some(reason) => {
                drop(children);
                child.inner.abort(reason);
            }
            None => {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
            }
        }
        child
    }

    /// Abort this controller and all of its descendants. Idempotent: the
    /// first reason wins.
    pub fn abort(&self, reason: impl Into<Arc<str>>) {
        self.inner.abort(AbortError::new(reason));
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.read().is_some()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Observer side of a cancellation scope.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.reason.read().is_some()
    }

    pub fn reason(&self) -> Option<AbortError> {
        self.inner.reason.read().clone()
    }

    /// `Err` with the abort reason once aborted.
    pub fn throw_if_aborted(&self) -> Result<(), AbortError> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Resolves with the abort reason once the signal is aborted.
    pub fn aborted(&self) -> impl Future<Output = AbortError> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let mut receiver = inner.notify.subscribe();
        async move {
            loop {
                let reason = inner.reason.read().clone();
                if let Some(reason) = reason {
                    return reason;
                }
                // The sender lives in `inner`, so the channel cannot close.
                let _ = receiver.changed().await;
            }
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
