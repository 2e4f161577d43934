//! Tax-rate reconciliation between a local SQLite store and a remote
//! workflow service.
//!
//! A run exports product records, submits them under the caller's license
//! identity, fetches an encrypted tax-rate script, decrypts and sanitizes it,
//! and applies it to the local database in a single transaction. At most one
//! run is active per database target; transient remote failures are retried
//! with backoff, and rate retrieval falls back across an ordered chain of
//! data sources.
//!
//! ```ignore
//! let pools = DbPools::from_config(&config.database).await?;
//! let components = Components::standard(pools, ReqwestHttpClient::new(), &config);
//! let reconciler = Reconciler::new(components, &config, sessions);
//!
//! let mut handle = reconciler.start()?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{:?}", event);
//! }
//! let report = handle.wait().await?;
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod fallback;
pub mod http;
pub mod orchestrator;
pub mod product;
pub mod remote;
pub mod run;
pub mod session;
pub mod sql;
pub mod store;

// Re-export commonly used types
pub use config::{DatabaseConfig, EndpointConfig, ReconcilerConfig};
pub use envelope::{AesCbcDecryptor, EncryptedEnvelope, PayloadDecryptor, seal};
pub use error::{ErrorKind, FailureReason, ReconcileError, Result};
pub use fallback::{DataSource, FallbackSelector, PriorityFallback};
pub use http::{HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use orchestrator::{
    Components, ProgressEvent, Reconciler, RunHandle, RunRegistry, RunReport, SessionFeed,
};
pub use product::{ExportBatch, Product, ProductExporter, SqliteProductExporter};
pub use remote::{HttpRemoteChannel, RemoteChannel, RetryPolicy};
pub use run::{RunId, RunOutcome, RunStatus, TargetId};
pub use session::SessionContext;
pub use sql::{SqlExecutor, SqlSanitizer, SqliteExecutor, TriggerSanitizer};
pub use store::{DbPools, PoolProvider};
