//! Progress events delivered from a run's worker to its caller.

use std::collections::HashSet;

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, FailureReason};
use crate::fallback::DataSource;
use crate::remote::RetryNotice;
use crate::run::{RunId, RunOutcome, RunStatus};

/// Intermediate and terminal notifications for one run, in occurrence order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stage finished successfully. Sent at most once per stage.
    StageCompleted { run_id: RunId, stage: RunStatus },

    /// A remote operation failed transiently and will be attempted again.
    RetryScheduled {
        run_id: RunId,
        stage: RunStatus,
        /// The attempt that failed (1-based)
        attempt: u32,
        delay_ms: u64,
        reason: FailureReason,
    },

    /// Rates will be fetched from another source.
    FallbackSwitched {
        run_id: RunId,
        from: DataSource,
        to: DataSource,
        kind: ErrorKind,
    },

    /// The run reached a terminal state and released its target.
    Finished {
        run_id: RunId,
        status: RunStatus,
        statements_applied: Option<usize>,
        failed_stage: Option<RunStatus>,
        kind: Option<ErrorKind>,
    },
}

impl ProgressEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            ProgressEvent::StageCompleted { run_id, .. }
            | ProgressEvent::RetryScheduled { run_id, .. }
            | ProgressEvent::FallbackSwitched { run_id, .. }
            | ProgressEvent::Finished { run_id, .. } => *run_id,
        }
    }
}

/// Sending half used by the worker.
///
/// A dropped receiver is not an error: the run carries on and its outcome is
/// still recorded.
#[derive(Debug)]
pub struct ProgressReporter {
    run_id: RunId,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    completed: Mutex<HashSet<RunStatus>>,
}

impl ProgressReporter {
    pub fn new(run_id: RunId) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            run_id,
            tx,
            completed: Mutex::new(HashSet::new()),
        };
        (reporter, rx)
    }

    fn send(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!(run_id = %self.run_id, "Progress receiver dropped");
        }
    }

    pub fn stage_completed(&self, stage: RunStatus) {
        if !self.completed.lock().insert(stage) {
            return;
        }
        tracing::info!(run_id = %self.run_id, stage = %stage, "Stage completed");
        self.send(ProgressEvent::StageCompleted {
            run_id: self.run_id,
            stage,
        });
    }

    pub fn retry_scheduled(&self, stage: RunStatus, notice: &RetryNotice) {
        counter!("ratesync_retries_total", "stage" => stage.as_str()).increment(1);
        tracing::warn!(
            run_id = %self.run_id,
            stage = %stage,
            attempt = notice.failed_attempt,
            delay_ms = notice.delay.as_millis() as u64,
            error = %notice.reason.to_error_message(),
            "Transient failure, retry scheduled"
        );
        self.send(ProgressEvent::RetryScheduled {
            run_id: self.run_id,
            stage,
            attempt: notice.failed_attempt,
            delay_ms: notice.delay.as_millis() as u64,
            reason: notice.reason.clone(),
        });
    }

    pub fn fallback_switched(&self, from: DataSource, to: DataSource, kind: ErrorKind) {
        counter!(
            "ratesync_fallback_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        tracing::warn!(
            run_id = %self.run_id,
            from = %from,
            to = %to,
            kind = %kind,
            "Falling back to next data source"
        );
        self.send(ProgressEvent::FallbackSwitched {
            run_id: self.run_id,
            from,
            to,
            kind,
        });
    }

    pub fn finished(&self, outcome: &RunOutcome) {
        let failure = outcome.failure();
        self.send(ProgressEvent::Finished {
            run_id: self.run_id,
            status: outcome.status(),
            statements_applied: outcome.statements_applied(),
            failed_stage: failure.map(|f| f.stage),
            kind: failure.map(|f| f.kind),
        });
    }
}
