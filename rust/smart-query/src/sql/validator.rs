//! Static safety validation of candidate SQL.
//!
//! The validator never talks to the database. It tokenizes the text with the
//! sqlparser tokenizer (so string literals and quoted identifiers are opaque),
//! applies lexical policy checks, parses the single remaining statement and
//! resolves every relation and column against the current schema snapshot.
//!
//! Accepted statements are normalized: comments removed, whitespace runs
//! collapsed, trailing semicolons dropped, and a default `LIMIT` appended when
//! the query has none. Literals are copied byte-for-byte. Normalizing an
//! accepted statement again yields the same text.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, SelectItem, SetExpr, TableFactor, Visit, Visitor,
};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::{RejectReason, ValidationVerdict};
use crate::config::ValidatorConfig;
use crate::schema::{SchemaSnapshot, TableSchema};

/// Write, DDL and administrative keywords rejected anywhere outside literals.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "ATTACH", "DETACH", "RENAME", "OPTIMIZE", "KILL", "INTO", "EXEC", "EXECUTE", "CALL", "SET",
    "USE", "BACKUP", "RESTORE",
];

const SET_OPERATIONS: &[&str] = &["UNION", "INTERSECT", "EXCEPT"];

/// Functions that stall the server.
const BLOCKED_FUNCTIONS: &[&str] = &["sleep", "sleepeachrow"];

/// Table and introspection functions that reach outside the database.
const EXTERNAL_FUNCTIONS: &[&str] = &[
    "file", "url", "urlcluster", "remote", "remotesecure", "cluster", "clusterallreplicas",
    "s3", "s3cluster", "hdfs", "hdfscluster", "azureblobstorage", "gcs", "mysql", "postgresql",
    "mongodb", "redis", "sqlite", "jdbc", "odbc", "input", "executable", "currentuser",
    "merge", "version", "hostname", "fqdn", "getsetting", "getmacro", "uptime",
];

const SYSTEM_SCHEMAS: &[&str] = &["system", "information_schema"];

/// A significant token and whether whitespace or a comment preceded it.
#[derive(Debug, Clone)]
struct Lexeme {
    token: Token,
    space_before: bool,
}

impl Lexeme {
    /// Unquoted word text.
    fn bare_word(&self) -> Option<&str> {
        match &self.token {
            Token::Word(w) if w.quote_style.is_none() => Some(&w.value),
            _ => None,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        self.bare_word()
            .is_some_and(|w| w.eq_ignore_ascii_case(keyword))
    }
}

/// Static SQL safety validator.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    config: ValidatorConfig,
    allowed_statements: HashSet<String>,
    system_allowlist: HashSet<String>,
}

impl SqlValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        let allowed_statements = config
            .allowed_statements
            .iter()
            .map(|s| s.to_uppercase())
            .collect();
        let system_allowlist = config
            .system_table_allowlist
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            config,
            allowed_statements,
            system_allowlist,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate `sql` against `snapshot`.
    pub fn validate(&self, sql: &str, snapshot: &SchemaSnapshot) -> ValidationVerdict {
        let verdict = self.check(sql, snapshot);
        if let ValidationVerdict::Rejected {
            reason,
            identifiers,
            ..
        } = &verdict
        {
            tracing::debug!(%reason, ?identifiers, "SQL rejected");
        }
        verdict
    }

    fn check(&self, sql: &str, snapshot: &SchemaSnapshot) -> ValidationVerdict {
        if sql.trim().is_empty() {
            return ValidationVerdict::reject(RejectReason::SyntaxError, "empty SQL statement");
        }
        let length = sql.chars().count();
        if length > self.config.max_query_length {
            return ValidationVerdict::reject(
                RejectReason::DisallowedStatement,
                format!(
                    "query is {length} characters long, the maximum is {}",
                    self.config.max_query_length
                ),
            );
        }

        let dialect = self.config.dialect.parser_dialect();
        let lexemes = match lex(dialect.as_ref(), sql) {
            Ok(lexemes) => lexemes,
            Err(message) => {
                return ValidationVerdict::reject(RejectReason::SyntaxError, message);
            }
        };

        let lexemes = match strip_terminator(lexemes) {
            Ok(lexemes) if lexemes.is_empty() => {
                return ValidationVerdict::reject(RejectReason::SyntaxError, "empty SQL statement");
            }
            Ok(lexemes) => lexemes,
            Err(verdict) => return verdict,
        };

        let verb = match self.check_leading_verb(&lexemes) {
            Ok(verb) => verb,
            Err(verdict) => return verdict,
        };
        if let Err(verdict) = self.check_forbidden_words(&lexemes) {
            return verdict;
        }
        let system_access = match self.check_system_access(&lexemes) {
            Ok(touched) => touched,
            Err(verdict) => return verdict,
        };
        if let Err(verdict) = self.check_complexity(&lexemes) {
            return verdict;
        }

        let normalized = render(&lexemes);
        let statements = match Parser::parse_sql(dialect.as_ref(), &normalized) {
            Ok(statements) => statements,
            Err(e) => {
                return ValidationVerdict::reject(
                    RejectReason::SyntaxError,
                    format!("could not parse SQL: {e}"),
                );
            }
        };
        if statements.len() != 1 {
            return ValidationVerdict::reject(
                RejectReason::MultiStatement,
                format!("expected one statement, found {}", statements.len()),
            );
        }

        let mut names = NameCollector::default();
        let _ = statements[0].visit(&mut names);
        let unknown = names.unresolved(snapshot, system_access);
        if !unknown.is_empty() {
            return ValidationVerdict::Rejected {
                reason: RejectReason::UnknownIdentifier,
                message: format!("unknown identifiers: {}", unknown.join(", ")),
                identifiers: unknown,
            };
        }

        if verb == "SELECT" {
            if let Some(sql) = self.inject_limit(&lexemes) {
                return ValidationVerdict::Accepted {
                    sql,
                    injected_limit: true,
                };
            }
        }
        ValidationVerdict::Accepted {
            sql: normalized,
            injected_limit: false,
        }
    }

    fn check_leading_verb(&self, lexemes: &[Lexeme]) -> Result<String, ValidationVerdict> {
        let first = &lexemes[0];
        let verb = match (&first.token, first.bare_word()) {
            (Token::LParen, _) => "SELECT".to_string(),
            (_, Some(word)) => match word.to_uppercase().as_str() {
                "WITH" => "SELECT".to_string(),
                "DESC" => "DESCRIBE".to_string(),
                other => other.to_string(),
            },
            _ => {
                return Err(ValidationVerdict::reject(
                    RejectReason::DisallowedStatement,
                    "statement does not start with a statement keyword",
                ));
            }
        };

        if self.allowed_statements.contains(&verb) {
            Ok(verb)
        } else {
            let mut allowed: Vec<&str> = self.allowed_statements.iter().map(String::as_str).collect();
            allowed.sort_unstable();
            Err(ValidationVerdict::Rejected {
                reason: RejectReason::DisallowedStatement,
                message: format!(
                    "{verb} statements are not allowed (allowed: {})",
                    allowed.join(", ")
                ),
                identifiers: vec![verb],
            })
        }
    }

    fn check_forbidden_words(&self, lexemes: &[Lexeme]) -> Result<(), ValidationVerdict> {
        for (i, lexeme) in lexemes.iter().enumerate() {
            let Some(word) = lexeme.bare_word() else {
                continue;
            };
            let upper = word.to_uppercase();
            // Qualified names such as `t.delete` are column references, not keywords.
            let after_period = i > 0 && lexemes[i - 1].token == Token::Period;

            if !after_period && FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                return Err(ValidationVerdict::Rejected {
                    reason: RejectReason::DisallowedStatement,
                    message: format!("{upper} is not allowed in read-only queries"),
                    identifiers: vec![upper],
                });
            }
            if !self.config.allow_set_operations && SET_OPERATIONS.contains(&upper.as_str()) {
                return Err(ValidationVerdict::Rejected {
                    reason: RejectReason::DisallowedStatement,
                    message: format!("set operation {upper} is not allowed"),
                    identifiers: vec![upper],
                });
            }

            let is_call = lexemes
                .get(i + 1)
                .is_some_and(|next| next.token == Token::LParen);
            if !is_call {
                continue;
            }
            let lower = word.to_lowercase();
            if BLOCKED_FUNCTIONS.contains(&lower.as_str()) {
                return Err(ValidationVerdict::Rejected {
                    reason: RejectReason::DisallowedStatement,
                    message: format!("function {word} is not allowed"),
                    identifiers: vec![word.to_string()],
                });
            }
            if EXTERNAL_FUNCTIONS.contains(&lower.as_str()) {
                return Err(ValidationVerdict::Rejected {
                    reason: RejectReason::ForbiddenSystemAccess,
                    message: format!("function {word} reaches outside the database"),
                    identifiers: vec![word.to_string()],
                });
            }
        }
        Ok(())
    }

    /// Returns whether an allowlisted system relation is referenced.
    fn check_system_access(&self, lexemes: &[Lexeme]) -> Result<bool, ValidationVerdict> {
        let mut touched = false;
        for (i, lexeme) in lexemes.iter().enumerate() {
            let Token::Word(schema) = &lexeme.token else {
                continue;
            };
            let schema = schema.value.to_lowercase();
            if !SYSTEM_SCHEMAS.contains(&schema.as_str()) {
                continue;
            }
            if i > 0 && lexemes[i - 1].token == Token::Period {
                continue;
            }
            if lexemes.get(i + 1).map(|l| &l.token) != Some(&Token::Period) {
                continue;
            }
            let Some(Token::Word(table)) = lexemes.get(i + 2).map(|l| &l.token) else {
                continue;
            };

            let relation = format!("{schema}.{}", table.value.to_lowercase());
            if !self.system_allowlist.contains(&relation) {
                return Err(ValidationVerdict::Rejected {
                    reason: RejectReason::ForbiddenSystemAccess,
                    message: format!("access to {relation} is not allowed"),
                    identifiers: vec![relation],
                });
            }
            touched = true;
        }
        Ok(touched)
    }

    /// Caps the JOIN count and the number of opening parentheses.
    fn check_complexity(&self, lexemes: &[Lexeme]) -> Result<(), ValidationVerdict> {
        let joins = lexemes.iter().filter(|l| l.is_keyword("JOIN")).count();
        if joins > self.config.max_joins {
            return Err(ValidationVerdict::reject(
                RejectReason::DisallowedStatement,
                format!("query has {joins} JOINs, the maximum is {}", self.config.max_joins),
            ));
        }
        let parens = lexemes.iter().filter(|l| l.token == Token::LParen).count();
        if parens > self.config.max_nesting {
            return Err(ValidationVerdict::reject(
                RejectReason::DisallowedStatement,
                format!(
                    "query has {parens} parenthesized groups, the maximum is {}",
                    self.config.max_nesting
                ),
            ));
        }
        Ok(())
    }

    /// Normalized text with a default LIMIT, or `None` when one is present.
    fn inject_limit(&self, lexemes: &[Lexeme]) -> Option<String> {
        let mut depth = 0usize;
        let mut insert_at = lexemes.len();
        for (i, lexeme) in lexemes.iter().enumerate() {
            match lexeme.token {
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                _ if depth == 0 => {
                    if ["LIMIT", "FETCH", "TOP"].iter().any(|k| lexeme.is_keyword(k)) {
                        return None;
                    }
                    if insert_at == lexemes.len()
                        && (lexeme.is_keyword("FORMAT") || lexeme.is_keyword("SETTINGS"))
                    {
                        insert_at = i;
                    }
                }
                _ => {}
            }
        }

        let mut sql = render(&lexemes[..insert_at]);
        sql.push_str(&format!(" LIMIT {}", self.config.default_limit));
        if insert_at < lexemes.len() {
            sql.push(' ');
            sql.push_str(&render(&lexemes[insert_at..]));
        }
        Some(sql)
    }
}

fn lex(dialect: &dyn sqlparser::dialect::Dialect, sql: &str) -> Result<Vec<Lexeme>, String> {
    let tokens = Tokenizer::new(dialect, sql)
        .with_unescape(false)
        .tokenize()
        .map_err(|e| format!("could not tokenize SQL: {e}"))?;

    let mut lexemes: Vec<Lexeme> = Vec::with_capacity(tokens.len());
    let mut pending_space = false;
    for token in tokens {
        match token {
            Token::Whitespace(_) => pending_space = true,
            Token::EOF => break,
            token => {
                lexemes.push(Lexeme {
                    token,
                    space_before: pending_space && !lexemes.is_empty(),
                });
                pending_space = false;
            }
        }
    }
    Ok(lexemes)
}

/// Drop trailing semicolons; anything significant after one is a second statement.
fn strip_terminator(mut lexemes: Vec<Lexeme>) -> Result<Vec<Lexeme>, ValidationVerdict> {
    let Some(first_semicolon) = lexemes.iter().position(|l| l.token == Token::SemiColon) else {
        return Ok(lexemes);
    };
    if let Some(extra) = lexemes[first_semicolon..]
        .iter()
        .find(|l| l.token != Token::SemiColon)
    {
        return Err(ValidationVerdict::Rejected {
            reason: RejectReason::MultiStatement,
            message: "only a single statement is allowed".to_string(),
            identifiers: extra.bare_word().map(str::to_uppercase).into_iter().collect(),
        });
    }
    lexemes.truncate(first_semicolon);
    Ok(lexemes)
}

/// Join lexemes with single spaces where the source had whitespace.
fn render(lexemes: &[Lexeme]) -> String {
    let mut sql = String::new();
    for (i, lexeme) in lexemes.iter().enumerate() {
        if i > 0 && lexeme.space_before {
            sql.push(' ');
        }
        sql.push_str(&lexeme.token.to_string());
    }
    sql
}

/// Relations, aliases and column references gathered from one statement.
#[derive(Debug, Default)]
struct NameCollector {
    relations: Vec<ObjectName>,
    /// Table alias → aliased relation, `None` for derived tables.
    table_aliases: HashMap<String, Option<String>>,
    /// CTE names and derived-table aliases.
    derived: HashSet<String>,
    /// Projection aliases (`expr AS name`).
    outputs: HashSet<String>,
    columns: Vec<Vec<Ident>>,
}

impl Visitor for NameCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.derived.insert(cte.alias.name.value.clone());
            }
        }
        collect_outputs(&query.body, &mut self.outputs);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(relation.clone());
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table {
                name,
                alias: Some(alias),
                ..
            } => {
                self.table_aliases
                    .insert(alias.name.value.clone(), Some(object_name(name)));
            }
            TableFactor::Derived {
                alias: Some(alias), ..
            } => {
                self.table_aliases.insert(alias.name.value.clone(), None);
                self.derived.insert(alias.name.value.clone());
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(vec![ident.clone()]),
            Expr::CompoundIdentifier(parts) => self.columns.push(parts.clone()),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

impl NameCollector {
    /// Names that resolve to nothing in `snapshot`, deduplicated in order.
    fn unresolved(&self, snapshot: &SchemaSnapshot, system_access: bool) -> Vec<String> {
        let mut unknown = Vec::new();
        let mut referenced: Vec<&TableSchema> = Vec::new();
        let mut opaque = system_access;

        for relation in &self.relations {
            match relation.0.as_slice() {
                [single] => {
                    if let Some(table) = snapshot.table(&single.value) {
                        referenced.push(table);
                    } else if !self.derived.contains(&single.value) {
                        push_unique(&mut unknown, single.value.clone());
                    }
                }
                [schema, _] if SYSTEM_SCHEMAS.contains(&schema.value.to_lowercase().as_str()) => {
                    opaque = true;
                }
                _ => push_unique(&mut unknown, object_name(relation)),
            }
        }

        let in_referenced = |column: &str| referenced.iter().any(|t| t.has_column(column));
        let loosely_known = |column: &str| {
            opaque || in_referenced(column) || self.outputs.contains(column)
        };

        for parts in &self.columns {
            let resolved = match parts.as_slice() {
                [column] => {
                    let name = column.value.as_str();
                    loosely_known(name)
                        || self.table_aliases.contains_key(name)
                        || self.derived.contains(name)
                }
                [.., qualifier, column] => {
                    self.resolve_qualified(snapshot, &referenced, qualifier, column, opaque)
                        .unwrap_or_else(|| loosely_known(&column.value))
                }
                [] => true,
            };
            if !resolved {
                push_unique(&mut unknown, join_idents(parts));
            }
        }
        unknown
    }

    /// `Some(resolved)` when the qualifier names a concrete table, `None` for
    /// qualifiers whose columns are only known loosely.
    fn resolve_qualified(
        &self,
        snapshot: &SchemaSnapshot,
        referenced: &[&TableSchema],
        qualifier: &Ident,
        column: &Ident,
        opaque: bool,
    ) -> Option<bool> {
        let qualifier = qualifier.value.as_str();
        if let Some(target) = self.table_aliases.get(qualifier) {
            return match target.as_deref().and_then(|name| snapshot.table(name)) {
                Some(table) => Some(table.has_column(&column.value)),
                None => None,
            };
        }
        if let Some(table) = referenced.iter().find(|t| t.name == qualifier) {
            return Some(table.has_column(&column.value));
        }
        if self.derived.contains(qualifier) || opaque {
            return None;
        }
        Some(false)
    }
}

fn collect_outputs(body: &SetExpr, outputs: &mut HashSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                if let SelectItem::ExprWithAlias { alias, .. } = item {
                    outputs.insert(alias.value.clone());
                }
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            collect_outputs(left, outputs);
            collect_outputs(right, outputs);
        }
        _ => {}
    }
}

fn object_name(name: &ObjectName) -> String {
    join_idents(&name.0)
}

fn join_idents(parts: &[Ident]) -> String {
    parts
        .iter()
        .map(|p| p.value.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}
