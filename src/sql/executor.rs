//! Transactional application of sanitized scripts.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::Executor;

use crate::error::{ReconcileError, Result};
use crate::sql::sanitize::SanitizedScript;
use crate::sql::split::{leading_keyword, split_statements};
use crate::store::PoolProvider;

/// Longest statement excerpt carried in an execution error.
const STATEMENT_EXCERPT_CHARS: usize = 200;

/// Statements that would end or nest the transaction the script runs in.
const TRANSACTION_CONTROL: &[&str] = &[
    "BEGIN",
    "COMMIT",
    "END",
    "ROLLBACK",
    "SAVEPOINT",
    "RELEASE",
];

/// Counts from a committed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub statements_applied: usize,
    pub rows_affected: u64,
}

/// Applies a sanitized script to the target database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// All statements commit together or none do.
    ///
    /// # Errors
    /// - `ConnectionUnavailable` if the pre-flight check or `BEGIN` fails
    /// - `SqlExecutionFailed` for a transaction-control statement in the
    ///   script, before anything runs
    /// - `SqlExecutionFailed` with the zero-based statement index otherwise;
    ///   an index equal to the statement count means `COMMIT` failed
    async fn execute(&self, script: &SanitizedScript) -> Result<ExecutionResult>;
}

/// Executor over the write pool of a [`PoolProvider`].
pub struct SqliteExecutor<P: PoolProvider> {
    pools: P,
}

impl<P: PoolProvider> SqliteExecutor<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    async fn check_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pools.write())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Database connectivity check failed");
                ReconcileError::ConnectionUnavailable(e.to_string())
            })?;
        Ok(())
    }
}

/// Reject statements that would commit, roll back or nest the outer
/// transaction. Scripts are applied as one unit.
fn reject_transaction_control(statements: &[String]) -> Result<()> {
    for (index, statement) in statements.iter().enumerate() {
        let Some(keyword) = leading_keyword(statement) else {
            continue;
        };
        if TRANSACTION_CONTROL.contains(&keyword.as_str()) {
            tracing::warn!(index, keyword = %keyword, "Script contains transaction control");
            return Err(ReconcileError::SqlExecutionFailed {
                index,
                statement: excerpt(statement),
                message: format!(
                    "transaction control statement {} is not allowed in a script \
                     applied as one transaction",
                    keyword
                ),
            });
        }
    }
    Ok(())
}

fn excerpt(statement: &str) -> String {
    let mut chars = statement.chars();
    let head: String = chars.by_ref().take(STATEMENT_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[async_trait]
impl<P: PoolProvider> SqlExecutor for SqliteExecutor<P> {
    #[tracing::instrument(skip_all, fields(script_len = script.as_str().len()))]
    async fn execute(&self, script: &SanitizedScript) -> Result<ExecutionResult> {
        self.check_connection().await?;

        let statements = split_statements(script.as_str());
        if statements.is_empty() {
            return Err(ReconcileError::SqlExecutionFailed {
                index: 0,
                statement: String::new(),
                message: "script contains no statements".to_string(),
            });
        }

        reject_transaction_control(&statements)?;

        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(|e| ReconcileError::ConnectionUnavailable(e.to_string()))?;

        let mut rows_affected = 0u64;
        for (index, statement) in statements.iter().enumerate() {
            match (&mut *tx).execute(sqlx::raw_sql(statement)).await {
                Ok(result) => {
                    rows_affected += result.rows_affected();
                    tracing::trace!(index, rows = result.rows_affected(), "Statement applied");
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "Statement failed, rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::error!(error = %rollback_err, "Rollback failed");
                    }
                    return Err(ReconcileError::SqlExecutionFailed {
                        index,
                        statement: excerpt(statement),
                        message: e.to_string(),
                    });
                }
            }
        }

        // A failed commit drops `tx`, which rolls it back
        tx.commit().await.map_err(|e| ReconcileError::SqlExecutionFailed {
            index: statements.len(),
            statement: "COMMIT".to_string(),
            message: e.to_string(),
        })?;

        tracing::info!(
            statements = statements.len(),
            rows_affected,
            "Script applied"
        );

        Ok(ExecutionResult {
            statements_applied: statements.len(),
            rows_affected,
        })
    }
}
