//! The reconciliation run and its lifecycle.
//!
//! A run moves through `Idle → ExportingProducts → SubmittingProducts →
//! FetchingRates → Decrypting → Sanitizing → ExecutingSql → Completed`, and
//! can reach `Failed` from any non-terminal state. See [`transitions`] for the
//! operations valid in each state.

pub mod state;
pub mod transitions;

pub use state::{
    Active, Completed, Decrypting, ExecutingSql, ExportingProducts, Failed, FetchingRates, Idle,
    Interrupted, ReconciliationRun, RunData, RunId, RunOutcome, RunState, RunStatus, Sanitizing,
    Step, SubmittingProducts, TargetId,
};
