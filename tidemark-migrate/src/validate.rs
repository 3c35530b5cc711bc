//! Heuristic checks over migration SQL.
//!
//! This is not a parser. The scanner understands just enough lexical
//! structure (quotes, comments, dollar quoting, parentheses) to split a script
//! into statements and to keep string contents out of the pattern rules.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::model::SchemaSnapshot;

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Worth knowing.
    Info,
    /// Likely a mistake or a risky operation.
    Warning,
    /// Will almost certainly fail.
    Error,
}

/// A non-fatal finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// How serious the finding is.
    pub severity: IssueSeverity,
    /// 1-based line in the script.
    pub line: usize,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    fn new(severity: IssueSeverity, line: usize, message: impl Into<String>) -> Self {
        Self {
            severity,
            line,
            message: message.into(),
        }
    }
}

/// One statement of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    /// Line of the first non-comment character.
    pub line: usize,
    /// Statement text without the terminating semicolon.
    pub sql: String,
    /// The same text with string literals and comments blanked out.
    code: String,
}

impl SqlStatement {
    /// Text with string literals and comments replaced by spaces.
    pub fn code(&self) -> &str {
        &self.code
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Code,
    Single,
    Double,
    LineComment,
    BlockComment,
    Dollar,
}

struct Scan {
    statements: Vec<SqlStatement>,
    issues: Vec<ValidationIssue>,
}

fn scan(sql: &str) -> Scan {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut issues = Vec::new();

    let mut state = Lexical::Code;
    let mut state_line = 1;
    let mut dollar_tag = String::new();
    let mut raw = String::new();
    let mut code = String::new();
    let mut start_line: Option<usize> = None;
    let mut depth: i32 = 0;
    let mut line = 1;
    let mut i = 0;

    let mut finish = |raw: &mut String,
                      code: &mut String,
                      start: &mut Option<usize>,
                      depth: &mut i32,
                      issues: &mut Vec<ValidationIssue>| {
        if let Some(at) = start.take() {
            if *depth > 0 {
                issues.push(ValidationIssue::new(
                    IssueSeverity::Error,
                    at,
                    format!("Unbalanced parentheses: {} unclosed", depth),
                ));
            }
            statements.push(SqlStatement {
                line: at,
                sql: raw.trim().to_string(),
                code: code.trim().to_string(),
            });
        }
        raw.clear();
        code.clear();
        *depth = 0;
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match state {
            Lexical::Code => match c {
                ';' => {
                    finish(&mut raw, &mut code, &mut start_line, &mut depth, &mut issues);
                    i += 1;
                    continue;
                }
                '-' if next == Some('-') => {
                    state = Lexical::LineComment;
                }
                '/' if next == Some('*') => {
                    state = Lexical::BlockComment;
                    state_line = line;
                }
                '\'' => {
                    state = Lexical::Single;
                    state_line = line;
                    start_line.get_or_insert(line);
                }
                '"' => {
                    state = Lexical::Double;
                    state_line = line;
                    start_line.get_or_insert(line);
                }
                '$' => {
                    if let Some(tag) = dollar_tag_at(&chars, i) {
                        start_line.get_or_insert(line);
                        state = Lexical::Dollar;
                        state_line = line;
                        raw.push_str(&tag);
                        code.push_str(&" ".repeat(tag.chars().count()));
                        i += tag.chars().count();
                        dollar_tag = tag;
                        continue;
                    }
                    start_line.get_or_insert(line);
                }
                '(' => {
                    start_line.get_or_insert(line);
                    depth += 1;
                }
                ')' => {
                    start_line.get_or_insert(line);
                    depth -= 1;
                    if depth < 0 {
                        issues.push(ValidationIssue::new(
                            IssueSeverity::Error,
                            line,
                            "Unbalanced parentheses: unexpected ')'",
                        ));
                        depth = 0;
                    }
                }
                c if !c.is_whitespace() => {
                    start_line.get_or_insert(line);
                }
                _ => {}
            },
            Lexical::Single if c == '\'' => {
                if next == Some('\'') {
                    raw.push_str("''");
                    code.push_str("  ");
                    i += 2;
                    continue;
                }
                state = Lexical::Code;
            }
            Lexical::Double if c == '"' => {
                if next == Some('"') {
                    raw.push_str("\"\"");
                    code.push_str("\"\"");
                    i += 2;
                    continue;
                }
                state = Lexical::Code;
            }
            Lexical::LineComment if c == '\n' => {
                state = Lexical::Code;
            }
            Lexical::BlockComment if c == '*' && next == Some('/') => {
                raw.push_str("*/");
                code.push_str("  ");
                state = Lexical::Code;
                i += 2;
                continue;
            }
            Lexical::Dollar if c == '$' && starts_with_at(&chars, i, &dollar_tag) => {
                raw.push_str(&dollar_tag);
                code.push_str(&" ".repeat(dollar_tag.chars().count()));
                i += dollar_tag.chars().count();
                state = Lexical::Code;
                continue;
            }
            _ => {}
        }

        raw.push(c);
        let keep = matches!(state, Lexical::Code | Lexical::Double)
            || (state == Lexical::Single && c == '\'');
        code.push(if keep || c == '\n' { c } else { ' ' });
        if c == '\n' {
            line += 1;
        }
        i += 1;
    }

    let unterminated = match state {
        Lexical::Single => Some("Unterminated string literal"),
        Lexical::Double => Some("Unterminated quoted identifier"),
        Lexical::BlockComment => Some("Unterminated block comment"),
        Lexical::Dollar => Some("Unterminated dollar-quoted string"),
        Lexical::Code | Lexical::LineComment => None,
    };
    if let Some(message) = unterminated {
        issues.push(ValidationIssue::new(IssueSeverity::Error, state_line, message));
    }
    finish(&mut raw, &mut code, &mut start_line, &mut depth, &mut issues);

    Scan { statements, issues }
}

/// `$tag$` opening at `i`, if any.
fn dollar_tag_at(chars: &[char], i: usize) -> Option<String> {
    let mut tag = String::from("$");
    for (offset, &c) in chars[i + 1..].iter().enumerate() {
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        let valid = if offset == 0 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        tag.push(c);
    }
    None
}

fn starts_with_at(chars: &[char], i: usize, needle: &str) -> bool {
    let mut idx = i;
    for n in needle.chars() {
        if chars.get(idx) != Some(&n) {
            return false;
        }
        idx += 1;
    }
    true
}

/// Split a script into statements, dropping comment-only fragments.
pub fn split_statements(sql: &str) -> Vec<SqlStatement> {
    scan(sql).statements
}

struct Patterns {
    drop: Regex,
    if_exists: Regex,
    delete: Regex,
    update: Regex,
    where_clause: Regex,
    truncate: Regex,
    create_index: Regex,
    create_table: Regex,
    alter_table: Regex,
    drop_table: Regex,
    rename_to: Regex,
}

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(|| {
    Some(Patterns {
        drop: Regex::new(
            r"(?i)^\s*DROP\s+(TABLE|INDEX|VIEW|MATERIALIZED\s+VIEW|FUNCTION|SEQUENCE|TYPE|SCHEMA|TRIGGER)\b",
        )
        .ok()?,
        if_exists: Regex::new(r"(?i)\bIF\s+EXISTS\b").ok()?,
        delete: Regex::new(r"(?i)^\s*DELETE\s+FROM\b").ok()?,
        update: Regex::new(r"(?i)^\s*UPDATE\s+\S+(\s+\w+)?\s+SET\b").ok()?,
        where_clause: Regex::new(r"(?i)\bWHERE\b").ok()?,
        truncate: Regex::new(r"(?i)^\s*TRUNCATE\b").ok()?,
        create_index: Regex::new(
            r#"(?i)^\s*CREATE\s+(?:UNIQUE\s+)?INDEX\s+(CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?(?:[\w"]+\s+)?ON\s+(?:ONLY\s+)?([\w."]+)"#,
        )
        .ok()?,
        create_table: Regex::new(
            r#"(?i)^\s*CREATE\s+(?:(?:GLOBAL\s+|LOCAL\s+)?(?:TEMP|TEMPORARY|UNLOGGED)\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([\w."]+)"#,
        )
        .ok()?,
        alter_table: Regex::new(r#"(?i)^\s*ALTER\s+TABLE\s+(IF\s+EXISTS\s+)?(?:ONLY\s+)?([\w."]+)"#)
            .ok()?,
        drop_table: Regex::new(r#"(?i)^\s*DROP\s+TABLE\s+(IF\s+EXISTS\s+)?([\w."\s,]+)"#).ok()?,
        rename_to: Regex::new(r#"(?i)\bRENAME\s+TO\s+([\w"]+)"#).ok()?,
    })
});

/// Run the heuristic checks over a script.
pub fn validate_sql(sql: &str) -> Vec<ValidationIssue> {
    let Scan {
        statements,
        mut issues,
    } = scan(sql);

    let Some(p) = PATTERNS.as_ref() else {
        return issues;
    };

    let mut created: HashSet<String> = HashSet::new();
    for statement in &statements {
        let code = statement.code();
        let line = statement.line;

        if let Some(caps) = p.create_table.captures(code) {
            created.insert(table_key(&caps[1], None));
        }

        if let Some(caps) = p.drop.captures(code)
            && !p.if_exists.is_match(code)
        {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                line,
                format!("DROP {} without IF EXISTS", caps[1].to_uppercase()),
            ));
        }
        if p.delete.is_match(code) && !p.where_clause.is_match(code) {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                line,
                "DELETE without WHERE removes every row",
            ));
        }
        if p.update.is_match(code) && !p.where_clause.is_match(code) {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                line,
                "UPDATE without WHERE modifies every row",
            ));
        }
        if p.truncate.is_match(code) {
            issues.push(ValidationIssue::new(
                IssueSeverity::Warning,
                line,
                "TRUNCATE removes every row",
            ));
        }
        if let Some(caps) = p.create_index.captures(code)
            && caps.get(1).is_none()
            && !created.contains(&table_key(&caps[2], None))
        {
            issues.push(ValidationIssue::new(
                IssueSeverity::Info,
                line,
                format!(
                    "CREATE INDEX on existing table {} without CONCURRENTLY locks writes while it builds",
                    caps[2].trim()
                ),
            ));
        }
    }

    issues.sort_by_key(|i| i.line);
    issues
}

/// Check that `ALTER TABLE` and `DROP TABLE` target tables that exist in the
/// snapshot or are created earlier in the script.
pub fn check_against_snapshot(sql: &str, snapshot: &SchemaSnapshot) -> MigrateResult<()> {
    SnapshotChecker::new(snapshot).check(sql)
}

/// Tracks which tables exist across a sequence of scripts.
///
/// Each checked script's CREATE, RENAME and DROP statements update the set, so
/// a later script may alter a table an earlier one created.
#[derive(Debug, Clone)]
pub struct SnapshotChecker {
    default_schema: String,
    known: HashSet<String>,
}

impl SnapshotChecker {
    /// Start from the tables of a snapshot.
    pub fn new(snapshot: &SchemaSnapshot) -> Self {
        Self {
            default_schema: snapshot.schema_name.clone(),
            known: snapshot
                .tables
                .iter()
                .map(|t| format!("{}.{}", t.schema, t.name))
                .collect(),
        }
    }

    /// Whether `schema.table` is currently known.
    pub fn knows(&self, qualified: &str) -> bool {
        self.known.contains(qualified)
    }

    /// Check one script and fold its table changes into the known set.
    pub fn check(&mut self, sql: &str) -> MigrateResult<()> {
        let Some(p) = PATTERNS.as_ref() else {
            return Ok(());
        };

        let default_schema = self.default_schema.as_str();
        let known = &mut self.known;
        let mut problems = Vec::new();

        for statement in split_statements(sql) {
            let code = statement.code();

            if let Some(caps) = p.create_table.captures(code) {
                known.insert(table_key(&caps[1], Some(default_schema)));
                continue;
            }

            if let Some(caps) = p.alter_table.captures(code) {
                let key = table_key(&caps[2], Some(default_schema));
                if caps.get(1).is_none() && !known.contains(&key) {
                    problems.push(format!(
                        "line {}: ALTER TABLE on unknown table {}",
                        statement.line, key
                    ));
                }
                if let Some(rename) = p.rename_to.captures(code) {
                    let schema = key.split_once('.').map_or(default_schema, |(s, _)| s);
                    let renamed = format!("{}.{}", schema, unquote(&rename[1]));
                    known.remove(&key);
                    known.insert(renamed);
                }
                continue;
            }

            if let Some(caps) = p.drop_table.captures(code) {
                for name in caps[2].split(',').map(str::trim).filter(|n| !n.is_empty()) {
                    let name = name.split_whitespace().next().unwrap_or(name);
                    let key = table_key(name, Some(default_schema));
                    if caps.get(1).is_none() && !known.contains(&key) {
                        problems.push(format!(
                            "line {}: DROP TABLE on unknown table {}",
                            statement.line, key
                        ));
                    }
                    known.remove(&key);
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::schema_conflict(problems.join("; ")))
        }
    }
}

fn unquote(name: &str) -> String {
    name.trim().trim_matches('"').replace("\"\"", "\"")
}

/// `schema.table` key; unqualified names take `default_schema` when given.
fn table_key(raw: &str, default_schema: Option<&str>) -> String {
    let raw = raw.trim();
    match raw.split_once("\".\"").or_else(|| raw.split_once('.')) {
        Some((schema, table)) => format!("{}.{}", unquote(schema), unquote(table)),
        None => match default_schema {
            Some(schema) => format!("{}.{}", schema, unquote(raw)),
            None => unquote(raw),
        },
    }
}
