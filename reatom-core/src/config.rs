//! Context Configuration
//!
//! A [`CtxConfig`] is handed to [`Ctx::with_config`](crate::Ctx::with_config).
//! It derives serde so hosts can load it from whatever format they already
//! use for settings.

use serde::{Deserialize, Serialize};

/// Tunables of a single context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtxConfig {
    /// Name used in log output and snapshots.
    pub name: String,

    /// Drain near and late effects automatically after every commit.
    ///
    /// When disabled, they wait for an explicit [`Ctx::flush`](crate::Ctx::flush)
    /// or for the next write transaction.
    pub auto_flush: bool,

    /// Number of transaction records kept in the causal log.
    pub history_limit: usize,
}

impl Default for CtxConfig {
    fn default() -> Self {
        Self {
            name: "ctx".to_string(),
            auto_flush: true,
            history_limit: 256,
        }
    }
}

impl CtxConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Disable automatic draining of near and late effects.
    pub fn manual_flush(mut self) -> Self {
        self.auto_flush = false;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
