//! SQL handling: sanitizing decrypted text, splitting it into statements,
//! and applying it transactionally.

pub mod executor;
pub mod sanitize;
pub mod split;

pub use executor::{ExecutionResult, SqlExecutor, SqliteExecutor};
pub use sanitize::{RULES, RewriteRule, SanitizedScript, SqlSanitizer, TriggerSanitizer};
pub use split::split_statements;
