//! Anomaly mode: attach the path that led to a failing node.
//!
//! When enabled, the engine remembers, for every node it delivers gradients
//! to, which node delivered the first one. On failure the chain from the
//! graph root to the failing node is attached to the error and logged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

static ANOMALY_ENABLED: AtomicBool = AtomicBool::new(false);

/// Process-wide anomaly switch. [`EngineConfig::anomaly_mode`] enables it for
/// a single engine.
///
/// [`EngineConfig::anomaly_mode`]: super::engine::EngineConfig
pub struct AnomalyMode;

impl AnomalyMode {
    pub fn is_enabled() -> bool {
        ANOMALY_ENABLED.load(Ordering::Relaxed)
    }

    pub fn set_enabled(enabled: bool) {
        ANOMALY_ENABLED.store(enabled, Ordering::Relaxed);
    }
}

/// Enables anomaly mode until dropped.
#[must_use = "anomaly mode is restored as soon as the guard is dropped"]
pub struct DetectAnomalyGuard {
    prev: bool,
}

impl DetectAnomalyGuard {
    pub fn new() -> Self {
        let prev = AnomalyMode::is_enabled();
        AnomalyMode::set_enabled(true);
        Self { prev }
    }
}

impl Default for DetectAnomalyGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DetectAnomalyGuard {
    fn drop(&mut self) {
        AnomalyMode::set_enabled(self.prev);
    }
}

/// Parent links recorded during one pass, keyed by node identity.
#[derive(Debug, Default)]
pub(crate) struct AnomalyTracker {
    names: HashMap<usize, String>,
    parents: HashMap<usize, usize>,
}

impl AnomalyTracker {
    pub(crate) fn record_root(&mut self, key: usize, name: String) {
        self.names.insert(key, name);
    }

    /// Note that `parent` delivered a gradient to `child`. Only the first
    /// delivery is kept.
    pub(crate) fn record_edge(
        &mut self,
        parent: usize,
        child: usize,
        child_name: impl FnOnce() -> String,
    ) {
        if self.names.contains_key(&child) {
            return;
        }
        self.names.insert(child, child_name());
        self.parents.insert(child, parent);
    }

    /// Node names from the root down to `key`.
    pub(crate) fn trace(&self, key: usize) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(key);
        while let Some(k) = current {
            if chain.len() > self.names.len() {
                break;
            }
            if let Some(name) = self.names.get(&k) {
                chain.push(name.clone());
            }
            current = self.parents.get(&k).copied();
        }
        chain.reverse();
        chain
    }
}
