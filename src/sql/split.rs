//! Splits a script into individually executable statements.
//!
//! A `;` ends a statement unless it sits inside a string literal, a quoted
//! identifier, a comment, or the `BEGIN ... END` body of a `CREATE TRIGGER`.
//! Statements consisting only of whitespace and comments are dropped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Code,
    SingleQuoted,
    DoubleQuoted,
    Bracketed,
    Backticked,
    LineComment,
    BlockComment,
}

/// Tracks the keywords that decide whether `;` terminates.
#[derive(Debug, Default)]
struct StatementShape {
    /// Leading keywords, up to the third, to recognise `CREATE [TEMP] TRIGGER`.
    leading: Vec<String>,
    is_trigger: bool,
    in_body: bool,
    case_depth: usize,
}

impl StatementShape {
    fn word(&mut self, word: &str) {
        let upper = word.to_ascii_uppercase();
        if self.leading.len() < 3 {
            self.leading.push(upper.clone());
            self.is_trigger = matches!(
                self.leading.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["CREATE", "TRIGGER", ..]
                    | ["CREATE", "TEMP", "TRIGGER"]
                    | ["CREATE", "TEMPORARY", "TRIGGER"]
            );
        }
        if !self.is_trigger {
            return;
        }
        match upper.as_str() {
            "BEGIN" if !self.in_body => self.in_body = true,
            "CASE" if self.in_body => self.case_depth += 1,
            "END" if self.in_body => {
                if self.case_depth > 0 {
                    self.case_depth -= 1;
                } else {
                    self.in_body = false;
                }
            }
            _ => {}
        }
    }

    fn terminates_at_semicolon(&self) -> bool {
        !self.in_body
    }
}

/// Split `script` into trimmed statements without their trailing `;`.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut shape = StatementShape::default();
    let mut word = String::new();
    let mut state = Lexical::Code;

    let mut chars = script.chars().peekable();
    while let Some(c) = chars.next() {
        if state == Lexical::Code && (c.is_alphanumeric() || c == '_') {
            word.push(c);
            current.push(c);
            has_code = true;
            continue;
        }
        if !word.is_empty() {
            shape.word(&word);
            word.clear();
        }

        match state {
            Lexical::Code => match c {
                ';' if shape.terminates_at_semicolon() => {
                    if has_code {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_code = false;
                    shape = StatementShape::default();
                    continue;
                }
                '\'' => state = Lexical::SingleQuoted,
                '"' => state = Lexical::DoubleQuoted,
                '[' => state = Lexical::Bracketed,
                '`' => state = Lexical::Backticked,
                '-' if chars.peek() == Some(&'-') => state = Lexical::LineComment,
                '/' if chars.peek() == Some(&'*') => {
                    current.push(c);
                    if let Some(star) = chars.next() {
                        current.push(star);
                    }
                    state = Lexical::BlockComment;
                    continue;
                }
                _ => {}
            },
            // Doubled quotes re-enter the literal on the next character
            Lexical::SingleQuoted if c == '\'' => state = Lexical::Code,
            Lexical::DoubleQuoted if c == '"' => state = Lexical::Code,
            Lexical::Bracketed if c == ']' => state = Lexical::Code,
            Lexical::Backticked if c == '`' => state = Lexical::Code,
            Lexical::LineComment if c == '\n' => state = Lexical::Code,
            Lexical::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                current.push(c);
                if let Some(slash) = chars.next() {
                    current.push(slash);
                }
                state = Lexical::Code;
                continue;
            }
            _ => {}
        }

        if matches!(
            state,
            Lexical::SingleQuoted | Lexical::DoubleQuoted | Lexical::Bracketed | Lexical::Backticked
        ) || (state == Lexical::Code && !c.is_whitespace())
        {
            has_code = true;
        }
        current.push(c);
    }

    if !word.is_empty() {
        shape.word(&word);
    }
    if has_code {
        let tail = current.trim();
        if !tail.is_empty() {
            statements.push(tail.to_string());
        }
    }
    statements
}

/// First keyword of `statement`, uppercased, skipping leading comments.
pub fn leading_keyword(statement: &str) -> Option<String> {
    let mut rest = statement;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }
    let word: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    (!word.is_empty()).then(|| word.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_split() {
        let stmts = split_statements("INSERT INTO t VALUES (1);\nINSERT INTO t VALUES (2);  ");
        assert_eq!(
            stmts,
            vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"]
        );
    }

    #[test]
    fn test_trailing_statement_without_semicolon() {
        assert_eq!(split_statements("SELECT 1; SELECT 2"), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_semicolons_in_literals_and_comments() {
        let script = "INSERT INTO t VALUES ('a;b', \"c;d\", [e;f]); -- trailing; comment\n\
                      /* block; comment */ SELECT 'it''s;fine';";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "INSERT INTO t VALUES ('a;b', \"c;d\", [e;f])");
        assert!(stmts[1].ends_with("SELECT 'it''s;fine'"));
    }

    #[test]
    fn test_trigger_body_kept_whole() {
        let script = "CREATE TRIGGER trg AFTER UPDATE ON t FOR EACH ROW BEGIN\n\
                        UPDATE t SET n = CASE WHEN NEW.a > 0 THEN 1 ELSE 0 END WHERE id = NEW.id;\n\
                        INSERT INTO log VALUES (NEW.id);\n\
                      END;\n\
                      INSERT INTO t VALUES (3);";
        let stmts = split_statements(script);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TRIGGER trg"));
        assert!(stmts[0].ends_with("END"));
        assert_eq!(stmts[1], "INSERT INTO t VALUES (3)");
    }

    #[test]
    fn test_temp_trigger_and_begin_transaction() {
        let stmts = split_statements(
            "CREATE TEMP TRIGGER x AFTER INSERT ON t BEGIN SELECT 1; END; BEGIN; SELECT 2;",
        );
        assert_eq!(
            stmts,
            vec![
                "CREATE TEMP TRIGGER x AFTER INSERT ON t BEGIN SELECT 1; END",
                "BEGIN",
                "SELECT 2"
            ]
        );
    }

    #[test]
    fn test_empty_and_comment_only_statements_dropped() {
        let stmts = split_statements(";\n;\n-- only a comment\n;  /* and another */ ;SELECT 1;");
        assert_eq!(stmts, vec!["SELECT 1"]);
        assert!(split_statements("   \n\t").is_empty());
    }

    #[test]
    fn test_leading_keyword() {
        assert_eq!(leading_keyword("commit"), Some("COMMIT".to_string()));
        assert_eq!(
            leading_keyword("-- note\n/* block */  End Transaction"),
            Some("END".to_string())
        );
        assert_eq!(
            leading_keyword("CREATE TRIGGER t AFTER INSERT ON x BEGIN SELECT 1; END"),
            Some("CREATE".to_string())
        );
        assert_eq!(leading_keyword("-- only a comment"), None);
        assert_eq!(leading_keyword("(SELECT 1)"), None);
    }

    #[test]
    fn test_keywords_inside_strings_ignored() {
        let stmts = split_statements(
            "CREATE TRIGGER t1 AFTER INSERT ON t BEGIN SELECT 'END'; SELECT \"end\"; END; SELECT 1;",
        );
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "SELECT 1");
    }
}
