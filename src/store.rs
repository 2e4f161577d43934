//! Pool provider abstraction for read/write routing against the local store.
//!
//! The exporter only reads; the executor only writes. Routing both through a
//! [`PoolProvider`] keeps that split visible, and [`DbPools`] enforces it by
//! opening the read pool with `PRAGMA query_only = ON`, so a write routed
//! through `.read()` fails with "attempt to write a readonly database".
//!
//! Both pools must point at the same file. An in-memory URL would give each
//! pool its own private database.

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::config::DatabaseConfig;
use crate::error::{ReconcileError, Result};

/// Trait for providing database pools with read/write routing.
///
/// Implementations must be `Clone`, `Send`, and `Sync` to be shared between
/// the exporter and the executor of a run.
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for read-only queries (product export).
    fn read(&self) -> &SqlitePool;

    /// Pool for transactional writes and connectivity checks.
    fn write(&self) -> &SqlitePool;
}

/// A single pool serves both roles.
impl PoolProvider for SqlitePool {
    fn read(&self) -> &SqlitePool {
        self
    }

    fn write(&self) -> &SqlitePool {
        self
    }
}

/// Primary pool for writes plus a `query_only` pool for reads.
#[derive(Clone, Debug)]
pub struct DbPools {
    primary: SqlitePool,
    replica: SqlitePool,
}

impl DbPools {
    /// Open both pools over the same database.
    ///
    /// The primary connects first (creating the file if needed), then the
    /// replica connects with every session switched to `query_only`.
    pub async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> std::result::Result<Self, sqlx::Error> {
        let primary = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options.clone().create_if_missing(true))
            .await?;

        let replica = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA query_only = ON")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        Ok(Self { primary, replica })
    }

    /// Open pools from the `[database]` configuration section.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| ReconcileError::Config(format!("invalid database url: {}", e)))?
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        tracing::debug!(url = %config.url, max_connections = config.max_connections, "Opening database pools");

        Self::connect(options, config.max_connections)
            .await
            .map_err(|e| ReconcileError::ConnectionUnavailable(e.to_string()))
    }
}

impl PoolProvider for DbPools {
    fn read(&self) -> &SqlitePool {
        &self.replica
    }

    fn write(&self) -> &SqlitePool {
        &self.primary
    }
}
