//! The reconciler: sequences a run's stages on a background task.
//!
//! [`Reconciler::start`] claims the configured target, snapshots the current
//! session and spawns one worker task for the run. The caller gets a
//! [`RunHandle`] to read progress events, cancel, and await the outcome.
//!
//! Cancellation is cooperative. It is checked before every stage, including
//! each re-fetch after a fallback, and never interrupts a stage in flight; a
//! transaction that has begun always commits or rolls back on its own.

mod events;
mod registry;

pub use events::{ProgressEvent, ProgressReporter};
pub use registry::{RunRegistry, TargetLease};

use std::collections::VecDeque;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconcilerConfig;
use crate::envelope::{AesCbcDecryptor, PayloadDecryptor};
use crate::error::{ReconcileError, Result};
use crate::fallback::{DataSource, FallbackSelector, PriorityFallback, Selection};
use crate::http::HttpClient;
use crate::product::{ProductExporter, SqliteProductExporter};
use crate::remote::{HttpRemoteChannel, RemoteChannel, RetryPolicy};
use crate::run::{
    Active, Completed, Decrypting, ExportingProducts, Failed, FetchingRates, Interrupted,
    ReconciliationRun, RunId, RunOutcome, RunStatus, TargetId,
};
use crate::session::SessionContext;
use crate::sql::{SqlExecutor, SqlSanitizer, SqliteExecutor, TriggerSanitizer};
use crate::store::PoolProvider;

/// Published by the license subsystem; `None` while no license is active.
pub type SessionFeed = watch::Receiver<Option<Arc<SessionContext>>>;

/// The collaborators a run is composed of.
#[derive(Clone)]
pub struct Components {
    pub exporter: Arc<dyn ProductExporter>,
    pub channel: Arc<dyn RemoteChannel>,
    pub decryptor: Arc<dyn PayloadDecryptor>,
    pub sanitizer: Arc<dyn SqlSanitizer>,
    pub executor: Arc<dyn SqlExecutor>,
    pub fallback: Arc<dyn FallbackSelector>,
}

impl Components {
    /// SQLite store, HTTP remote, AES envelope and SQLite trigger rules.
    ///
    /// Sources in `fallback_order` without a configured endpoint or file are
    /// left out of the chain, so a failure is never replaced by a hop to a
    /// source that cannot answer.
    pub fn standard<P, H>(pools: P, http: H, config: &ReconcilerConfig) -> Self
    where
        P: PoolProvider,
        H: HttpClient + 'static,
    {
        Self {
            exporter: Arc::new(
                SqliteProductExporter::new(pools.clone())
                    .with_query(config.database.export_query.clone()),
            ),
            channel: Arc::new(HttpRemoteChannel::from_config(http, config)),
            decryptor: Arc::new(AesCbcDecryptor),
            sanitizer: Arc::new(TriggerSanitizer),
            executor: Arc::new(SqliteExecutor::new(pools)),
            fallback: Arc::new(PriorityFallback::new(config.configured_fallback_order())),
        }
    }
}

/// Starts reconciliation runs against one database target.
#[derive(Clone)]
pub struct Reconciler {
    components: Components,
    policy: RetryPolicy,
    target: TargetId,
    registry: RunRegistry,
    sessions: SessionFeed,
    history: Arc<Mutex<VecDeque<RunOutcome>>>,
    history_limit: usize,
}

impl Reconciler {
    pub fn new(components: Components, config: &ReconcilerConfig, sessions: SessionFeed) -> Self {
        Self {
            components,
            policy: config.into(),
            target: TargetId::new(config.target.clone()),
            registry: RunRegistry::new(),
            sessions,
            history: Arc::new(Mutex::new(VecDeque::new())),
            history_limit: config.history_limit,
        }
    }

    /// Share single-flight locks with other reconcilers.
    pub fn with_registry(mut self, registry: RunRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn is_running(&self) -> bool {
        self.registry.active_run(&self.target).is_some()
    }

    /// Terminal runs, oldest first.
    pub fn recent_runs(&self) -> Vec<RunOutcome> {
        self.history.lock().iter().cloned().collect()
    }

    /// Start a run on a new Tokio task.
    ///
    /// # Errors
    /// Returned synchronously, before any stage runs:
    /// - `SessionUnavailable` if no session is published
    /// - `InvalidSession` if the session lacks identity fields
    /// - `Config` if the fallback chain is empty
    /// - `AlreadyRunning` if the target is held by another run
    #[tracing::instrument(skip(self), fields(target = %self.target))]
    pub fn start(&self) -> Result<RunHandle> {
        let session = self
            .sessions
            .borrow()
            .clone()
            .ok_or(ReconcileError::SessionUnavailable)?;
        session.validate()?;
        let first_source = self.components.fallback.first().ok_or_else(|| {
            ReconcileError::Config("fallback chain names no data source".to_string())
        })?;

        let run = ReconciliationRun::new(self.target.clone(), session);
        let run_id = run.data.id;
        let lease = self.registry.acquire(&self.target, run_id)?;
        let run = run.begin();

        let (reporter, events) = ProgressReporter::new(run_id);
        let cancel = CancellationToken::new();
        let worker = Worker {
            components: self.components.clone(),
            policy: self.policy,
            first_source,
            cancel: cancel.clone(),
            reporter,
        };
        let history = self.history.clone();
        let history_limit = self.history_limit;

        gauge!("ratesync_runs_active").increment(1.0);
        let join = tokio::spawn(async move {
            let _active = scopeguard::guard((), |_| {
                gauge!("ratesync_runs_active").decrement(1.0);
            });

            let outcome = match worker.drive(run).await {
                Ok(completed) => RunOutcome::Completed(completed),
                Err(failed) => RunOutcome::Failed(failed),
            };
            drop(lease);

            counter!("ratesync_runs_total", "outcome" => outcome.status().as_str()).increment(1);
            {
                let mut history = history.lock();
                history.push_back(outcome.clone());
                while history.len() > history_limit {
                    history.pop_front();
                }
            }
            worker.reporter.finished(&outcome);
            outcome
        });

        Ok(RunHandle {
            run_id,
            target: self.target.clone(),
            cancel,
            events,
            join,
        })
    }

    /// Start a run and wait for it to finish.
    pub async fn run(&self) -> Result<RunReport> {
        self.start()?.wait().await
    }
}

/// Caller's side of a running reconciliation.
///
/// Dropping the handle does not cancel the run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    target: TargetId,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// Request cancellation at the next stage boundary.
    pub fn cancel(&self) {
        tracing::info!(run_id = %self.run_id, "Cancellation requested");
        self.cancel.cancel();
    }

    /// Next progress event; `None` once the run has finished and all events
    /// were read.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal outcome. Events not yet read are returned with it.
    pub async fn wait(mut self) -> Result<RunReport> {
        let outcome = self
            .join
            .await
            .map_err(|e| ReconcileError::WorkerTerminated(e.to_string()))?;

        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        Ok(RunReport { outcome, events })
    }
}

/// Terminal outcome plus the progress events the caller had not consumed.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub events: Vec<ProgressEvent>,
}

// ============================================================================
// Worker
// ============================================================================

type Drive<T> = std::result::Result<ReconciliationRun<T>, ReconciliationRun<Failed>>;

struct Worker {
    components: Components,
    policy: RetryPolicy,
    first_source: DataSource,
    cancel: CancellationToken,
    reporter: ProgressReporter,
}

impl Worker {
    fn checkpoint<S: Active>(&self, run: ReconciliationRun<S>) -> Drive<S> {
        if self.cancel.is_cancelled() {
            return Err(run.fail(ReconcileError::Cancelled));
        }
        Ok(run)
    }

    /// Reroute an interrupted fetch or decrypt to the next source, if the
    /// error qualifies and the chain is not exhausted.
    fn reroute<S: Active>(
        &self,
        interrupted: Interrupted<S>,
        from: DataSource,
        to_fetch: impl FnOnce(ReconciliationRun<S>, DataSource) -> ReconciliationRun<FetchingRates>,
    ) -> Drive<FetchingRates> {
        let fallback = self.components.fallback.as_ref();
        if !fallback.qualifies(&interrupted.error) {
            return Err(interrupted.into_failed());
        }
        match fallback.select(from) {
            Selection::Next(to) => {
                self.reporter
                    .fallback_switched(from, to, interrupted.error.kind());
                Ok(to_fetch(interrupted.run, to))
            }
            Selection::Exhausted => {
                tracing::warn!(
                    run_id = %interrupted.run.data.id,
                    source = %from,
                    "Fallback chain exhausted"
                );
                Err(interrupted.into_failed())
            }
        }
    }

    async fn drive(&self, run: ReconciliationRun<ExportingProducts>) -> Drive<Completed> {
        let c = &self.components;

        let run = self.checkpoint(run)?;
        let run = run
            .export(c.exporter.as_ref())
            .await
            .map_err(Interrupted::into_failed)?;
        self.reporter.stage_completed(RunStatus::ExportingProducts);

        let run = self.checkpoint(run)?;
        let mut fetching = run
            .submit(c.channel.as_ref(), &self.policy, self.first_source, &self.reporter)
            .await
            .map_err(Interrupted::into_failed)?;
        self.reporter.stage_completed(RunStatus::SubmittingProducts);

        let sanitizing = loop {
            let run = self.checkpoint(fetching)?;
            let source = run.state.source;
            let decrypting = match run.fetch(c.channel.as_ref(), &self.policy, &self.reporter).await
            {
                Ok(run) => run,
                Err(interrupted) => {
                    fetching = self.reroute(
                        interrupted,
                        source,
                        ReconciliationRun::<FetchingRates>::switch_source,
                    )?;
                    continue;
                }
            };
            self.reporter.stage_completed(RunStatus::FetchingRates);

            let run = self.checkpoint(decrypting)?;
            match run.decrypt(c.decryptor.as_ref()) {
                Ok(run) => {
                    self.reporter.stage_completed(RunStatus::Decrypting);
                    break run;
                }
                Err(interrupted) => {
                    fetching = self.reroute(
                        interrupted,
                        source,
                        ReconciliationRun::<Decrypting>::refetch,
                    )?;
                }
            }
        };

        let run = self.checkpoint(sanitizing)?;
        let run = run
            .sanitize(c.sanitizer.as_ref())
            .map_err(Interrupted::into_failed)?;
        self.reporter.stage_completed(RunStatus::Sanitizing);

        let run = self.checkpoint(run)?;
        let run = run
            .apply(c.executor.as_ref())
            .await
            .map_err(Interrupted::into_failed)?;
        self.reporter.stage_completed(RunStatus::ExecutingSql);

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DecryptedScript, EncryptedEnvelope};
    use crate::error::{ErrorKind, FailureReason};
    use crate::product::{ExportBatch, Product};
    use crate::remote::Ack;
    use crate::sql::{ExecutionResult, SanitizedScript};
    use async_trait::async_trait;
    use chrono::Utc;
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Exporter that blocks until released.
    struct GatedExporter {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ProductExporter for GatedExporter {
        async fn export(&self) -> Result<ExportBatch> {
            self.gate.notified().await;
            ExportBatch::new(
                vec![Product {
                    sku: "A".into(),
                    ean: None,
                    taric: "0101".into(),
                    name: None,
                    quantity: None,
                    unit_price_cents: None,
                }],
                Utc::now(),
            )
        }
    }

    /// Acknowledges submissions; fails every fetch with a fixed reason.
    struct FailingFetch {
        reason: FailureReason,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl RemoteChannel for FailingFetch {
        async fn submit_products(
            &self,
            _batch: &ExportBatch,
            _session: &SessionContext,
        ) -> std::result::Result<Ack, FailureReason> {
            Ok(Ack {
                status: 200,
                body: String::new(),
            })
        }

        async fn fetch_encrypted_rates(
            &self,
            _source: DataSource,
            _session: &SessionContext,
        ) -> std::result::Result<EncryptedEnvelope, FailureReason> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Err(self.reason.clone())
        }
    }

    struct NoDecrypt;

    impl PayloadDecryptor for NoDecrypt {
        fn decrypt(
            &self,
            _envelope: &EncryptedEnvelope,
            _session: &SessionContext,
        ) -> Result<DecryptedScript> {
            Err(ReconcileError::DecryptionFailed("unused".into()))
        }
    }

    struct NoExecute;

    #[async_trait]
    impl SqlExecutor for NoExecute {
        async fn execute(&self, _script: &SanitizedScript) -> Result<ExecutionResult> {
            Err(ReconcileError::ConnectionUnavailable("unused".into()))
        }
    }

    fn components(gate: Arc<Notify>, channel: Arc<FailingFetch>) -> Components {
        Components {
            exporter: Arc::new(GatedExporter { gate }),
            channel,
            decryptor: Arc::new(NoDecrypt),
            sanitizer: Arc::new(TriggerSanitizer),
            executor: Arc::new(NoExecute),
            fallback: Arc::new(PriorityFallback::default()),
        }
    }

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            max_attempts: 1,
            ..ReconcilerConfig::default()
        }
    }

    fn session_feed() -> SessionFeed {
        let session = SessionContext::new("LIC-9", "x@y.z").with_secret(SecretString::from("k"));
        let (_tx, rx) = watch::channel(Some(Arc::new(session)));
        rx
    }

    fn failing(reason: FailureReason) -> Arc<FailingFetch> {
        Arc::new(FailingFetch {
            reason,
            fetches: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_start_requires_valid_session() {
        let gate = Arc::new(Notify::new());
        let channel = failing(FailureReason::NetworkError { error: "x".into() });

        let (_tx, none) = watch::channel(None);
        let reconciler = Reconciler::new(components(gate.clone(), channel.clone()), &config(), none);
        assert!(matches!(
            reconciler.start().unwrap_err(),
            ReconcileError::SessionUnavailable
        ));

        let (_tx, blank) = watch::channel(Some(Arc::new(SessionContext::new("", "x@y.z"))));
        let reconciler = Reconciler::new(components(gate, channel), &config(), blank);
        assert!(matches!(
            reconciler.start().unwrap_err(),
            ReconcileError::InvalidSession(_)
        ));
        assert!(!reconciler.is_running());
    }

    #[tokio::test]
    async fn test_single_flight_per_target() {
        let gate = Arc::new(Notify::new());
        let channel = failing(FailureReason::AuthorizationRejected {
            status: 401,
            body: String::new(),
        });
        let registry = RunRegistry::new();
        let reconciler = Reconciler::new(components(gate.clone(), channel.clone()), &config(), session_feed())
            .with_registry(registry.clone());
        let twin = Reconciler::new(components(gate.clone(), channel), &config(), session_feed())
            .with_registry(registry);

        let handle = reconciler.start().unwrap();
        assert!(matches!(
            twin.start().unwrap_err(),
            ReconcileError::AlreadyRunning(ref t) if t.as_str() == "default"
        ));
        assert!(twin.is_running());

        gate.notify_one();
        let report = handle.wait().await.unwrap();
        let failure = report.outcome.failure().unwrap();
        assert_eq!(failure.stage, RunStatus::FetchingRates);
        assert_eq!(failure.kind, ErrorKind::FetchFailed);

        // Lock released on the terminal state
        assert!(!twin.is_running());
        gate.notify_one();
        assert!(twin.start().is_ok());
    }

    #[tokio::test]
    async fn test_authorization_failure_skips_fallback() {
        let gate = Arc::new(Notify::new());
        gate.notify_one();
        let channel = failing(FailureReason::AuthorizationRejected {
            status: 403,
            body: "expired".into(),
        });
        let reconciler = Reconciler::new(components(gate, channel.clone()), &config(), session_feed());

        let report = reconciler.run().await.unwrap();
        assert_eq!(channel.fetches.load(Ordering::SeqCst), 1);
        assert!(
            !report
                .events
                .iter()
                .any(|e| matches!(e, ProgressEvent::FallbackSwitched { .. }))
        );
        assert!(matches!(
            report.events.last(),
            Some(ProgressEvent::Finished {
                status: RunStatus::Failed,
                kind: Some(ErrorKind::FetchFailed),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_validation_failures_walk_whole_chain() {
        let gate = Arc::new(Notify::new());
        gate.notify_one();
        let channel = failing(FailureReason::MalformedResponse {
            error: "not an envelope".into(),
        });
        let reconciler = Reconciler::new(components(gate, channel.clone()), &config(), session_feed());

        let report = reconciler.run().await.unwrap();
        assert_eq!(channel.fetches.load(Ordering::SeqCst), 3);
        let switches: Vec<_> = report
            .events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::FallbackSwitched { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            switches,
            vec![
                (DataSource::Primary, DataSource::Alternate),
                (DataSource::Alternate, DataSource::LocalDemo)
            ]
        );

        let history = reconciler.recent_runs();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id(), report.outcome.id());
    }

    #[tokio::test]
    async fn test_cancel_before_first_stage() {
        let gate = Arc::new(Notify::new());
        let channel = failing(FailureReason::NetworkError { error: "x".into() });
        let reconciler = Reconciler::new(components(gate, channel.clone()), &config(), session_feed());

        let handle = reconciler.start().unwrap();
        handle.cancel();
        let report = handle.wait().await.unwrap();

        let failure = report.outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(failure.stage, RunStatus::ExportingProducts);
        assert_eq!(channel.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let gate = Arc::new(Notify::new());
        let channel = failing(FailureReason::MalformedResponse { error: "x".into() });
        let config = ReconcilerConfig {
            history_limit: 2,
            ..config()
        };
        let reconciler = Reconciler::new(components(gate.clone(), channel), &config, session_feed());

        let mut ids = Vec::new();
        for _ in 0..3 {
            gate.notify_one();
            ids.push(reconciler.run().await.unwrap().outcome.id());
        }
        let kept: Vec<RunId> = reconciler.recent_runs().iter().map(RunOutcome::id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }
}
