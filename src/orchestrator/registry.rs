//! Per-target single-flight locks.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{ReconcileError, Result};
use crate::run::{RunId, TargetId};

/// Active runs by database target.
///
/// Clones share the same table, so reconcilers built over the same registry
/// exclude each other.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<DashMap<TargetId, RunId>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for `run_id`, or fail with `AlreadyRunning`.
    pub fn acquire(&self, target: &TargetId, run_id: RunId) -> Result<TargetLease> {
        match self.active.entry(target.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(
                    target = %target,
                    active_run = %entry.get(),
                    "Target busy"
                );
                Err(ReconcileError::AlreadyRunning(target.clone()))
            }
            Entry::Vacant(entry) => {
                entry.insert(run_id);
                Ok(TargetLease {
                    active: self.active.clone(),
                    target: target.clone(),
                    run_id,
                })
            }
        }
    }

    pub fn active_run(&self, target: &TargetId) -> Option<RunId> {
        self.active.get(target).map(|entry| *entry.value())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Holds a target until dropped.
#[derive(Debug)]
pub struct TargetLease {
    active: Arc<DashMap<TargetId, RunId>>,
    target: TargetId,
    run_id: RunId,
}

impl TargetLease {
    pub fn target(&self) -> &TargetId {
        &self.target
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.target, |_, holder| *holder == self.run_id);
        tracing::debug!(target = %self.target, run_id = %self.run_id, "Target released");
    }
}
