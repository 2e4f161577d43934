//! Textual repair of decrypted SQL before execution.
//!
//! Three passes, in order:
//!
//! 1. every U+FEFF byte-order mark is removed, wherever it appears
//!    (multi-item envelopes can carry one per item);
//! 2. control characters other than `\n`, `\r` and `\t` are removed;
//! 3. the rewrite rules in [`RULES`] are applied in table order, repeatedly,
//!    until the text stops changing.
//!
//! The rules target SQLite trigger syntax. They are deliberately narrow
//! textual substitutions; nothing here parses SQL.
//!
//! | rule | before | after |
//! |------|--------|-------|
//! | `batch_separator` | a line holding only `GO` (optionally `GO;`) | `;` |
//! | `statement_level_trigger` | `FOR EACH STATEMENT` | `FOR EACH ROW` |
//! | `row_clause_before_table` | `AFTER INSERT FOR EACH ROW ON t` | `AFTER INSERT ON t FOR EACH ROW` |
//! | `row_clause_after_begin` | `BEGIN FOR EACH ROW` | `FOR EACH ROW BEGIN` |
//! | `repeated_row_clause` | `FOR EACH ROW FOR EACH ROW` | `FOR EACH ROW` |

use std::sync::LazyLock;

use regex::Regex;

use crate::envelope::DecryptedScript;

/// Upper bound on rule passes. Every rule strictly reduces a misplaced or
/// duplicated clause, so real scripts settle in two or three passes.
const MAX_PASSES: usize = 16;

/// One column name in an `UPDATE OF` list, bare or quoted.
const COLUMN: &str = r#"(?:\w+|"[^"]*"|\[[^\]]*\]|`[^`]*`)"#;

/// A named textual substitution.
pub struct RewriteRule {
    pub name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

fn rule(name: &'static str, pattern: &str, replacement: &'static str) -> RewriteRule {
    RewriteRule {
        name,
        // Patterns are literals in this file and covered by the unit tests.
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("rule {}: {}", name, e)),
        replacement,
    }
}

/// The fixed rule table, applied in this order.
pub static RULES: LazyLock<Vec<RewriteRule>> = LazyLock::new(|| {
    vec![
        rule(
            "batch_separator",
            r"(?im)^[ \t]*GO[ \t]*;?[ \t]*\r?$",
            ";",
        ),
        rule(
            "statement_level_trigger",
            r"(?i)\bFOR\s+EACH\s+STATEMENT\b",
            "FOR EACH ROW",
        ),
        rule(
            "row_clause_before_table",
            &format!(
                r"(?i)\b(BEFORE|AFTER|INSTEAD\s+OF)(\s+)(INSERT|DELETE|UPDATE(?:\s+OF\s+{col}(?:\s*,\s*{col})*)?)(?:\s+FOR\s+EACH\s+ROW)+\s+ON\s+([^\s;]+)",
                col = COLUMN
            ),
            "${1}${2}${3} ON ${4} FOR EACH ROW",
        ),
        rule(
            "row_clause_after_begin",
            r"(?i)\bBEGIN(?:\s+FOR\s+EACH\s+ROW)+\b",
            "FOR EACH ROW BEGIN",
        ),
        rule(
            "repeated_row_clause",
            r"(?i)\bFOR\s+EACH\s+ROW(?:\s+FOR\s+EACH\s+ROW)+\b",
            "FOR EACH ROW",
        ),
    ]
});

/// SQL text that has been through a sanitizer.
#[derive(Clone, PartialEq, Eq)]
pub struct SanitizedScript(String);

impl SanitizedScript {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SanitizedScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SanitizedScript({} bytes)", self.0.len())
    }
}

/// Normalizes decrypted text into executable SQL.
pub trait SqlSanitizer: Send + Sync {
    /// Deterministic, total text transform.
    fn sanitize_text(&self, text: &str) -> String;

    fn sanitize(&self, script: &DecryptedScript) -> SanitizedScript {
        SanitizedScript(self.sanitize_text(script.as_str()))
    }

    /// True if a second pass leaves `script` unchanged.
    fn is_stable(&self, script: &SanitizedScript) -> bool {
        self.sanitize_text(script.as_str()) == script.as_str()
    }
}

/// Sanitizer for the SQLite dialect using [`RULES`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerSanitizer;

fn strip_characters(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\u{FEFF}')
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

fn apply_rules(text: &str) -> String {
    let mut current = text.to_string();
    for pass in 0..MAX_PASSES {
        let mut next = current.clone();
        for rule in RULES.iter() {
            let replaced = rule.pattern.replace_all(&next, rule.replacement);
            if replaced != next {
                tracing::trace!(rule = rule.name, pass, "Rewrite rule applied");
                next = replaced.into_owned();
            }
        }
        if next == current {
            return current;
        }
        current = next;
    }
    tracing::warn!(passes = MAX_PASSES, "Rewrite rules did not settle");
    current
}

impl SqlSanitizer for TriggerSanitizer {
    fn sanitize_text(&self, text: &str) -> String {
        apply_rules(&strip_characters(text))
    }
}
