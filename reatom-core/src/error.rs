//! Error Types
//!
//! Every failure the runtime can report is one of three shapes:
//!
//! - [`ReatomError`]: graph-integrity failures. These abort the current
//!   transaction and propagate synchronously to the caller.
//! - [`EffectError`]: failures of scheduled side effects. These are isolated
//!   per effect and only reach code awaiting that effect.
//! - [`AbortError`]: cooperative cancellation, shared by both.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ReatomError> = std::result::Result<T, E>;

/// Cooperative cancellation of a scheduled effect or a computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("aborted: {reason}")]
pub struct AbortError {
    reason: Arc<str>,
}

impl AbortError {
    /// Create an abort error with the given reason.
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason passed to [`AbortController::abort`](crate::AbortController::abort).
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Graph-integrity errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReatomError {
    /// Bad arguments to an atom or action declaration.
    #[error("invalid declaration: {reason}")]
    InvalidDeclaration { reason: String },

    /// A computer produced no state and there was no previous state to keep.
    #[error("atom `{atom}` has no state after computation")]
    UndefinedState { atom: Arc<str> },

    /// `spy` was called after its computation returned.
    #[error("outdated track call: `{atom}` was spied outside of its computation")]
    OutdatedTrackCall { atom: Arc<str> },

    /// A computation (transitively) read itself.
    #[error("circular dependency detected while computing `{atom}`")]
    CircularDependency { atom: Arc<str> },

    /// A computation observed a cancelled controller.
    #[error(transparent)]
    Aborted(#[from] AbortError),

    /// Raised through [`throw_reatom_error`].
    #[error("{message}")]
    Reatom { message: Arc<str> },
}

impl ReatomError {
    /// A plain error carrying only a message.
    pub fn message(message: impl Into<Arc<str>>) -> Self {
        Self::Reatom {
            message: message.into(),
        }
    }

    /// Whether this error came from an aborted signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Failure of a scheduled effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error(transparent)]
    Aborted(#[from] AbortError),

    /// The effect ran and reported a failure.
    #[error("effect failed: {0}")]
    Failed(Arc<str>),

    /// The effect touched the graph and the graph rejected it.
    #[error(transparent)]
    Graph(#[from] ReatomError),

    /// The transaction that scheduled the effect failed before it could run.
    #[error("effect was discarded before it ran")]
    Discarded,
}

impl EffectError {
    /// An effect failure with `message`.
    pub fn failed(message: impl Into<Arc<str>>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether the effect was stopped by an abort, directly or through a
    /// graph error.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::Graph(ReatomError::Aborted(_)))
    }
}

/// Shared assertion helper: fails with [`ReatomError::Reatom`] when
/// `condition` holds.
///
/// Collaborators use this to report errors in the same shape as the core.
///
/// ```
/// use reatom_core::{throw_reatom_error, ReatomError};
///
/// assert!(throw_reatom_error(false, "unreachable").is_ok());
/// let err = throw_reatom_error(true, "bad input").unwrap_err();
/// assert_eq!(err, ReatomError::message("bad input"));
/// ```
pub fn throw_reatom_error(condition: bool, message: &str) -> Result<()> {
    if condition {
        Err(ReatomError::message(message))
    } else {
        Ok(())
    }
}
