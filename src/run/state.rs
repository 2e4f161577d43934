//! Run identity and lifecycle states.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{DecryptedScript, EncryptedEnvelope};
use crate::error::{ErrorKind, ReconcileError};
use crate::fallback::DataSource;
use crate::product::ExportBatch;
use crate::session::SessionContext;
use crate::sql::{ExecutionResult, SanitizedScript};

/// Unique identifier of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Name of the database a run applies scripts to. Single-flight is per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TargetId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Lifecycle position of a run, as reported in events and failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    ExportingProducts,
    SubmittingProducts,
    FetchingRates,
    Decrypting,
    Sanitizing,
    ExecutingSql,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::ExportingProducts => "exporting_products",
            RunStatus::SubmittingProducts => "submitting_products",
            RunStatus::FetchingRates => "fetching_rates",
            RunStatus::Decrypting => "decrypting",
            RunStatus::Sanitizing => "sanitizing",
            RunStatus::ExecutingSql => "executing_sql",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker trait for valid run states.
pub trait RunState: Send + Sync {
    const STATUS: RunStatus;
}

/// States from which a run may still fail or be cancelled.
pub trait Active: RunState {}

/// A reconciliation run.
///
/// Uses the typestate pattern: the parameter `S` is the current stage, and
/// only the operations valid in that stage exist on the type.
#[derive(Debug, Clone)]
pub struct ReconciliationRun<S: RunState> {
    /// The current state of the run.
    pub state: S,
    /// Immutable run metadata.
    pub data: RunData,
}

impl<S: RunState> ReconciliationRun<S> {
    pub fn status(&self) -> RunStatus {
        S::STATUS
    }
}

/// Metadata fixed for the lifetime of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunData {
    pub id: RunId,
    pub target: TargetId,
    pub started_at: DateTime<Utc>,
    /// Session snapshot taken when the run started.
    #[serde(skip)]
    pub session: Arc<SessionContext>,
}

// ============================================================================
// Run States
// ============================================================================

/// Created but not yet holding the target lock.
#[derive(Debug, Clone)]
pub struct Idle;

impl RunState for Idle {
    const STATUS: RunStatus = RunStatus::Idle;
}
impl Active for Idle {}

#[derive(Debug, Clone)]
pub struct ExportingProducts;

impl RunState for ExportingProducts {
    const STATUS: RunStatus = RunStatus::ExportingProducts;
}
impl Active for ExportingProducts {}

#[derive(Debug, Clone)]
pub struct SubmittingProducts {
    pub batch: ExportBatch,
}

impl RunState for SubmittingProducts {
    const STATUS: RunStatus = RunStatus::SubmittingProducts;
}
impl Active for SubmittingProducts {}

/// Products were acknowledged; rates are requested from `source`.
#[derive(Debug, Clone)]
pub struct FetchingRates {
    pub product_count: usize,
    pub source: DataSource,
}

impl RunState for FetchingRates {
    const STATUS: RunStatus = RunStatus::FetchingRates;
}
impl Active for FetchingRates {}

#[derive(Debug, Clone)]
pub struct Decrypting {
    pub product_count: usize,
    pub source: DataSource,
    pub envelope: EncryptedEnvelope,
}

impl RunState for Decrypting {
    const STATUS: RunStatus = RunStatus::Decrypting;
}
impl Active for Decrypting {}

#[derive(Debug, Clone)]
pub struct Sanitizing {
    pub product_count: usize,
    pub source: DataSource,
    pub script: DecryptedScript,
}

impl RunState for Sanitizing {
    const STATUS: RunStatus = RunStatus::Sanitizing;
}
impl Active for Sanitizing {}

#[derive(Debug, Clone)]
pub struct ExecutingSql {
    pub product_count: usize,
    pub source: DataSource,
    pub script: SanitizedScript,
}

impl RunState for ExecutingSql {
    const STATUS: RunStatus = RunStatus::ExecutingSql;
}
impl Active for ExecutingSql {}

/// Script applied and committed (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub product_count: usize,
    /// Source the applied script came from
    pub source: DataSource,
    pub applied: ExecutionResult,
    pub completed_at: DateTime<Utc>,
}

impl RunState for Completed {
    const STATUS: RunStatus = RunStatus::Completed;
}

/// Run stopped without applying anything (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    /// Stage the run was in when it failed
    pub stage: RunStatus,
    pub kind: ErrorKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
    #[serde(skip)]
    pub error: Arc<ReconcileError>,
}

impl RunState for Failed {
    const STATUS: RunStatus = RunStatus::Failed;
}

// ============================================================================
// Outcomes
// ============================================================================

/// A stage that failed, with the run still in that stage.
///
/// Lets the orchestrator decide between fallback and failure.
#[derive(Debug)]
pub struct Interrupted<S: RunState> {
    pub run: ReconciliationRun<S>,
    pub error: ReconcileError,
}

impl<S: Active> Interrupted<S> {
    pub fn into_failed(self) -> ReconciliationRun<Failed> {
        self.run.fail(self.error)
    }
}

/// Result of a stage transition: the next state, or the current one interrupted.
pub type Step<Next, Current> = std::result::Result<ReconciliationRun<Next>, Interrupted<Current>>;

/// Terminal result of a run. There is no partial success.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(ReconciliationRun<Completed>),
    Failed(ReconciliationRun<Failed>),
}

impl RunOutcome {
    pub fn id(&self) -> RunId {
        match self {
            RunOutcome::Completed(run) => run.data.id,
            RunOutcome::Failed(run) => run.data.id,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed(_) => RunStatus::Completed,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    /// Statements applied, if the run completed.
    pub fn statements_applied(&self) -> Option<usize> {
        match self {
            RunOutcome::Completed(run) => Some(run.state.applied.statements_applied),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failed> {
        match self {
            RunOutcome::Completed(_) => None,
            RunOutcome::Failed(run) => Some(&run.state),
        }
    }
}
