//! Ordered data sources for rate retrieval and the selector that walks them.

use serde::{Deserialize, Serialize};

use crate::error::{FailureClass, ReconcileError};

/// A place encrypted rate scripts can be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// The remote workflow service.
    Primary,
    /// The alternate data service.
    Alternate,
    /// A static demonstration dataset on local disk.
    LocalDemo,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Primary => "primary",
            DataSource::Alternate => "alternate",
            DataSource::LocalDemo => "local_demo",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of consulting the selector after a source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Next(DataSource),
    Exhausted,
}

/// Chooses which source to try after a fetch or decrypt failure.
pub trait FallbackSelector: Send + Sync {
    /// Source the first fetch attempt of every run goes to.
    fn first(&self) -> Option<DataSource>;

    /// Source to try after `failed`, or `Exhausted`.
    fn select(&self, failed: DataSource) -> Selection;

    /// Whether `error` may be recovered by switching source.
    ///
    /// Authorization rejections are excluded: every source is queried with the
    /// same license, so a rejected license must surface to the caller.
    fn qualifies(&self, error: &ReconcileError) -> bool {
        match error {
            ReconcileError::FetchFailed { reason, .. } => {
                reason.class() != FailureClass::Authorization
            }
            ReconcileError::DecryptionFailed(_) => true,
            _ => false,
        }
    }
}

/// Fixed priority order; each source is tried at most once per run.
#[derive(Debug, Clone)]
pub struct PriorityFallback {
    order: Vec<DataSource>,
}

impl PriorityFallback {
    /// Duplicate entries are dropped, keeping the first occurrence.
    pub fn new(order: impl IntoIterator<Item = DataSource>) -> Self {
        let mut deduped = Vec::new();
        for source in order {
            if !deduped.contains(&source) {
                deduped.push(source);
            }
        }
        Self { order: deduped }
    }

    pub fn order(&self) -> &[DataSource] {
        &self.order
    }
}

impl Default for PriorityFallback {
    fn default() -> Self {
        Self::new([DataSource::Primary, DataSource::Alternate, DataSource::LocalDemo])
    }
}

impl FallbackSelector for PriorityFallback {
    fn first(&self) -> Option<DataSource> {
        self.order.first().copied()
    }

    fn select(&self, failed: DataSource) -> Selection {
        match self.order.iter().position(|s| *s == failed) {
            Some(idx) => match self.order.get(idx + 1) {
                Some(next) => Selection::Next(*next),
                None => Selection::Exhausted,
            },
            // A source outside the chain has no successor.
            None => Selection::Exhausted,
        }
    }
}
