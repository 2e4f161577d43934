//! Stage transitions for reconciliation runs.
//!
//! Each transition consumes the run, performs one component call, and returns
//! either the run in its next state or an [`Interrupted`] run still in the
//! stage that failed:
//!
//! ```text
//! Run<Idle> ──begin()──> Run<ExportingProducts> ──export()──> Run<SubmittingProducts>
//!                                                                    │
//!                                                                 submit()
//!                                                                    ▼
//!            ┌──switch_source()── Run<FetchingRates> <──refetch()──┐
//!            └──────────────────>        │                         │
//!                                     fetch()                      │
//!                                        ▼                         │
//!                                  Run<Decrypting> ────────────────┘
//!                                        │
//!                                    decrypt()
//!                                        ▼
//!           Run<Sanitizing> ──sanitize()──> Run<ExecutingSql> ──apply()──> Run<Completed>
//!
//! Run<any active state> ──fail()──> Run<Failed>
//! ```
//!
//! Remote transitions retry transient failures through a [`RetryPolicy`] and
//! report every scheduled retry. Whether an interrupted fetch or decrypt is
//! rerouted to another source is the orchestrator's decision.

use std::sync::Arc;

use chrono::Utc;

use crate::envelope::PayloadDecryptor;
use crate::error::ReconcileError;
use crate::fallback::DataSource;
use crate::orchestrator::ProgressReporter;
use crate::product::ProductExporter;
use crate::remote::{RemoteChannel, RetryPolicy};
use crate::session::SessionContext;
use crate::sql::{SqlExecutor, SqlSanitizer};

use super::state::{
    Active, Completed, Decrypting, ExecutingSql, ExportingProducts, Failed, FetchingRates, Idle,
    Interrupted, ReconciliationRun, RunData, RunId, RunStatus, Sanitizing, Step,
    SubmittingProducts, TargetId,
};

impl<S: Active> ReconciliationRun<S> {
    /// Move to `Failed`, recording the current stage.
    pub fn fail(self, error: ReconcileError) -> ReconciliationRun<Failed> {
        tracing::warn!(
            run_id = %self.data.id,
            stage = %S::STATUS,
            kind = %error.kind(),
            error = %error,
            "Run failed"
        );
        ReconciliationRun {
            state: Failed {
                stage: S::STATUS,
                kind: error.kind(),
                message: error.to_string(),
                failed_at: Utc::now(),
                error: Arc::new(error),
            },
            data: self.data,
        }
    }

    fn interrupt(self, error: ReconcileError) -> Interrupted<S> {
        Interrupted { run: self, error }
    }
}

impl ReconciliationRun<Idle> {
    pub fn new(target: TargetId, session: Arc<SessionContext>) -> Self {
        ReconciliationRun {
            state: Idle,
            data: RunData {
                id: RunId::new(),
                target,
                started_at: Utc::now(),
                session,
            },
        }
    }

    /// Enter the first stage. The caller must already hold the target lock.
    pub fn begin(self) -> ReconciliationRun<ExportingProducts> {
        tracing::info!(run_id = %self.data.id, target = %self.data.target, "Run started");
        ReconciliationRun {
            state: ExportingProducts,
            data: self.data,
        }
    }
}

impl ReconciliationRun<ExportingProducts> {
    pub async fn export(
        self,
        exporter: &dyn ProductExporter,
    ) -> Step<SubmittingProducts, ExportingProducts> {
        match exporter.export().await {
            Ok(batch) => Ok(ReconciliationRun {
                state: SubmittingProducts { batch },
                data: self.data,
            }),
            Err(e) => Err(self.interrupt(e)),
        }
    }
}

impl ReconciliationRun<SubmittingProducts> {
    /// Submit the batch, then target `first_source` for rates.
    ///
    /// Submission is never rerouted to another source.
    pub async fn submit(
        self,
        channel: &dyn RemoteChannel,
        policy: &RetryPolicy,
        first_source: DataSource,
        reporter: &ProgressReporter,
    ) -> Step<FetchingRates, SubmittingProducts> {
        let batch = &self.state.batch;
        let session = self.data.session.as_ref();

        let result = policy
            .run(
                move |_| channel.submit_products(batch, session),
                |notice| reporter.retry_scheduled(RunStatus::SubmittingProducts, notice),
            )
            .await;

        match result {
            Ok(ack) => {
                tracing::debug!(run_id = %self.data.id, status = ack.status, "Submission acknowledged");
                Ok(ReconciliationRun {
                    state: FetchingRates {
                        product_count: self.state.batch.count(),
                        source: first_source,
                    },
                    data: self.data,
                })
            }
            Err(reason) => Err(self.interrupt(ReconcileError::TransmissionFailed(reason))),
        }
    }
}

impl ReconciliationRun<FetchingRates> {
    pub async fn fetch(
        self,
        channel: &dyn RemoteChannel,
        policy: &RetryPolicy,
        reporter: &ProgressReporter,
    ) -> Step<Decrypting, FetchingRates> {
        let source = self.state.source;
        let session = self.data.session.as_ref();
        tracing::debug!(run_id = %self.data.id, source = %source, "Fetching rates");

        let result = policy
            .run(
                move |_| channel.fetch_encrypted_rates(source, session),
                |notice| reporter.retry_scheduled(RunStatus::FetchingRates, notice),
            )
            .await;

        match result {
            Ok(envelope) => Ok(ReconciliationRun {
                state: Decrypting {
                    product_count: self.state.product_count,
                    source,
                    envelope,
                },
                data: self.data,
            }),
            Err(reason) => Err(self.interrupt(ReconcileError::FetchFailed {
                data_source: source,
                reason,
            })),
        }
    }

    /// Retry the fetch against another source.
    pub fn switch_source(self, next: DataSource) -> ReconciliationRun<FetchingRates> {
        ReconciliationRun {
            state: FetchingRates {
                product_count: self.state.product_count,
                source: next,
            },
            data: self.data,
        }
    }
}

impl ReconciliationRun<Decrypting> {
    pub fn decrypt(self, decryptor: &dyn PayloadDecryptor) -> Step<Sanitizing, Decrypting> {
        match decryptor.decrypt(&self.state.envelope, &self.data.session) {
            Ok(script) => Ok(ReconciliationRun {
                state: Sanitizing {
                    product_count: self.state.product_count,
                    source: self.state.source,
                    script,
                },
                data: self.data,
            }),
            Err(e) => Err(self.interrupt(e)),
        }
    }

    /// Discard the envelope and fetch from `next` instead.
    pub fn refetch(self, next: DataSource) -> ReconciliationRun<FetchingRates> {
        ReconciliationRun {
            state: FetchingRates {
                product_count: self.state.product_count,
                source: next,
            },
            data: self.data,
        }
    }
}

impl ReconciliationRun<Sanitizing> {
    /// Sanitize and verify the result is a fixpoint before it may execute.
    pub fn sanitize(self, sanitizer: &dyn SqlSanitizer) -> Step<ExecutingSql, Sanitizing> {
        let script = sanitizer.sanitize(&self.state.script);
        if !sanitizer.is_stable(&script) {
            return Err(self.interrupt(ReconcileError::SanitizationUnstable));
        }
        Ok(ReconciliationRun {
            state: ExecutingSql {
                product_count: self.state.product_count,
                source: self.state.source,
                script,
            },
            data: self.data,
        })
    }
}

impl ReconciliationRun<ExecutingSql> {
    pub async fn apply(self, executor: &dyn SqlExecutor) -> Step<Completed, ExecutingSql> {
        match executor.execute(&self.state.script).await {
            Ok(applied) => {
                tracing::info!(
                    run_id = %self.data.id,
                    statements = applied.statements_applied,
                    source = %self.state.source,
                    "Run completed"
                );
                Ok(ReconciliationRun {
                    state: Completed {
                        product_count: self.state.product_count,
                        source: self.state.source,
                        applied,
                        completed_at: Utc::now(),
                    },
                    data: self.data,
                })
            }
            Err(e) => Err(self.interrupt(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AesCbcDecryptor, DecryptedScript, EncryptedEnvelope, seal};
    use crate::error::ErrorKind;
    use crate::sql::TriggerSanitizer;
    use secrecy::SecretString;

    fn session() -> Arc<SessionContext> {
        Arc::new(SessionContext::new("LIC-1", "a@b.c").with_secret(SecretString::from("s3cret")))
    }

    fn decrypting(script: &str, session: &Arc<SessionContext>) -> ReconciliationRun<Decrypting> {
        let envelope =
            EncryptedEnvelope::from_items(vec![seal(script, session, [3u8; 16]).unwrap()]).unwrap();
        ReconciliationRun {
            state: Decrypting {
                product_count: 2,
                source: DataSource::Primary,
                envelope,
            },
            data: ReconciliationRun::new("db".into(), session.clone()).data,
        }
    }

    #[test]
    fn test_fail_records_stage_and_kind() {
        let run = ReconciliationRun::new("db".into(), session()).begin();
        let failed = run.fail(ReconcileError::Cancelled);
        assert_eq!(failed.state.stage, RunStatus::ExportingProducts);
        assert_eq!(failed.state.kind, ErrorKind::Cancelled);
        assert_eq!(failed.status(), RunStatus::Failed);
    }

    #[test]
    fn test_decrypt_then_sanitize() {
        let session = session();
        let run = decrypting("\u{FEFF}SELECT 1;", &session);
        let run = run.decrypt(&AesCbcDecryptor).unwrap();
        let run = run.sanitize(&TriggerSanitizer).unwrap();
        assert_eq!(run.state.script.as_str(), "SELECT 1;");
        assert_eq!(run.state.product_count, 2);
    }

    #[test]
    fn test_decrypt_failure_keeps_stage_and_can_refetch() {
        let session = session();
        let mut run = decrypting("SELECT 1;", &session);
        run.data.session = Arc::new(SessionContext::new("LIC-1", "a@b.c"));

        let interrupted = run.decrypt(&AesCbcDecryptor).unwrap_err();
        assert!(matches!(interrupted.error, ReconcileError::DecryptionFailed(_)));

        let fetching = interrupted.run.refetch(DataSource::LocalDemo);
        assert_eq!(fetching.state.source, DataSource::LocalDemo);
        assert_eq!(fetching.state.product_count, 2);
    }

    /// Rewrites differently on every pass.
    struct Drifting;

    impl SqlSanitizer for Drifting {
        fn sanitize_text(&self, text: &str) -> String {
            format!("{} ", text)
        }
    }

    #[test]
    fn test_unstable_sanitizer_blocks_execution() {
        let run = ReconciliationRun {
            state: Sanitizing {
                product_count: 1,
                source: DataSource::Alternate,
                script: DecryptedScript::new("SELECT 1;"),
            },
            data: ReconciliationRun::new("db".into(), session()).data,
        };
        let interrupted = run.sanitize(&Drifting).unwrap_err();
        assert!(matches!(interrupted.error, ReconcileError::SanitizationUnstable));
        assert_eq!(interrupted.into_failed().state.stage, RunStatus::Sanitizing);
    }
}
