//! Prompt construction and SQL extraction.
//!
//! The synthesizer calls the model once per request. Retrying is the
//! orchestrator's decision; a retry goes through
//! [`SqlSynthesizer::resynthesize`] with feedback that names only the
//! rejection reason and identifiers, never the rejected text.

use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult, ReasonCode};
use crate::llm::{LlmProvider, Prompt};
use crate::retrieval::RetrievalContext;

use super::{CandidateSql, SqlDialect};

/// Verbs that may start an extracted statement. Write verbs are included so
/// that the validator, not extraction, rejects them.
const STATEMENT_KEYWORDS: &[&str] = &[
    "select", "with", "show", "describe", "desc", "explain", "insert", "update", "delete",
    "drop", "alter", "create", "truncate", "grant", "revoke", "attach", "detach", "rename",
    "optimize", "kill", "system", "set", "use",
];

/// Words that can open a continuation line of an unfenced statement.
const CLAUSE_KEYWORDS: &[&str] = &[
    "select", "from", "where", "prewhere", "join", "inner", "left", "right", "full", "cross",
    "array", "group", "order", "having", "limit", "offset", "union", "intersect", "except",
    "and", "or", "with", "window", "settings", "format", "case", "when", "qualify",
];

/// Why a previous candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisFeedback {
    pub reason: ReasonCode,
    pub identifiers: Vec<String>,
}

/// Result of scanning a model response for SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    StatementFound(String),
    NotFound,
}

/// Turns a question plus schema context into candidate SQL.
pub struct SqlSynthesizer {
    llm: Arc<dyn LlmProvider>,
    dialect: SqlDialect,
}

impl std::fmt::Debug for SqlSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSynthesizer")
            .field("provider", &self.llm.provider())
            .field("model", &self.llm.settings().model)
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl SqlSynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>, dialect: SqlDialect) -> Self {
        Self { llm, dialect }
    }

    /// Prompt for a first attempt.
    pub async fn synthesize(
        &self,
        question: &str,
        context: &RetrievalContext,
    ) -> PipelineResult<CandidateSql> {
        let prompt = self.build_prompt(question, context, None);
        self.run(question, context, &prompt).await
    }

    /// Prompt again after a rejection.
    pub async fn resynthesize(
        &self,
        question: &str,
        context: &RetrievalContext,
        feedback: &SynthesisFeedback,
    ) -> PipelineResult<CandidateSql> {
        let prompt = self.build_prompt(question, context, Some(feedback));
        self.run(question, context, &prompt).await
    }

    async fn run(
        &self,
        question: &str,
        context: &RetrievalContext,
        prompt: &Prompt,
    ) -> PipelineResult<CandidateSql> {
        tracing::debug!(
            provider = self.llm.provider().as_str(),
            prompt_chars = prompt.system.len() + prompt.user.len(),
            "Requesting SQL completion"
        );
        let response = self.llm.complete(prompt).await?;

        match extract_statement(&response) {
            Extraction::StatementFound(sql) => Ok(CandidateSql {
                sql,
                question: question.to_string(),
                revision: context.revision(),
            }),
            Extraction::NotFound => {
                tracing::debug!(response_chars = response.len(), "No SQL in model response");
                Err(PipelineError::SynthesisEmpty)
            }
        }
    }

    /// Deterministic prompt for `question` over `context`.
    pub fn build_prompt(
        &self,
        question: &str,
        context: &RetrievalContext,
        feedback: Option<&SynthesisFeedback>,
    ) -> Prompt {
        let dialect = self.dialect.display_name();
        let system = format!(
            "You are a SQL expert specializing in {dialect} queries.\n\
            Given a database schema and a question, write one read-only {dialect} query \
            that answers the question.\n\
            \n\
            Rules:\n\
            1. Only use tables and columns that appear in the schema.\n\
            2. Write exactly one SELECT statement. Never modify data.\n\
            3. Put literal values directly in the query and quote strings with single quotes.\n\
            4. When the question asks for a number of rows, express it with LIMIT.\n\
            \n\
            Respond with JSON of the form {{\"sql\": \"SELECT ...\"}} and nothing else."
        );

        let mut user = format!("Schema:\n{}\n\n", context.render());
        if let Some(feedback) = feedback {
            user.push_str(&format!(
                "Your previous query was rejected ({}).",
                feedback.reason
            ));
            if !feedback.identifiers.is_empty() {
                user.push_str(&format!(
                    " These names do not exist in the schema: {}.",
                    feedback.identifiers.join(", ")
                ));
            }
            user.push_str(" Use only the tables and columns listed above.\n\n");
        }
        user.push_str(&format!("Question: {question}\n\nSQL:"));

        Prompt::new(system, user)
    }
}

/// Pull a single statement out of a model response.
///
/// Accepts a JSON object with a `sql` field, otherwise the first fenced code
/// block, otherwise the first line that starts with a statement keyword. The
/// statement ends at the first `;` outside quotes and comments, or at the end
/// of the text. Unfenced text also ends at a blank line followed by prose.
pub fn extract_statement(response: &str) -> Extraction {
    let response = response.trim();
    if let Some(sql) = json_sql(response) {
        return found(cut_statement(&sql, false));
    }

    let (body, fenced) = match fenced_block(response) {
        Some(block) => (block, true),
        None => (response, false),
    };
    if fenced {
        if let Some(sql) = json_sql(body) {
            return found(cut_statement(&sql, false));
        }
    }

    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if starts_with_statement(line.trim_start(), fenced) {
            let start = offset + (line.len() - line.trim_start().len());
            return found(cut_statement(&body[start..], !fenced));
        }
        offset += line.len();
    }
    Extraction::NotFound
}

fn found(sql: &str) -> Extraction {
    let sql = sql.trim();
    if sql.is_empty() {
        Extraction::NotFound
    } else {
        Extraction::StatementFound(sql.to_string())
    }
}

fn json_sql(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;
    value
        .get("sql")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

/// Contents of the first ``` block, without the info string.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let content_start = after_open.find('\n').map_or(after_open.len(), |i| i + 1);
    let content = &after_open[content_start..];
    let close = content.find("```").unwrap_or(content.len());
    Some(&content[..close])
}

/// Unfenced prose must use an all-caps or all-lowercase keyword, so that
/// sentences such as "With this query..." are not mistaken for SQL.
fn starts_with_statement(line: &str, fenced: bool) -> bool {
    let word_end = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    let word = &line[..word_end];
    if word.is_empty() || !STATEMENT_KEYWORDS.contains(&word.to_lowercase().as_str()) {
        return false;
    }
    let next = line[word_end..].chars().next();
    if !matches!(next, None | Some('(')) && !next.is_some_and(char::is_whitespace) {
        return false;
    }
    fenced || word == word.to_uppercase() || word == word.to_lowercase()
}

/// Text up to the first `;` outside quotes and comments.
///
/// With `prose_ends`, a blank line also ends the statement unless the text
/// before it is unfinished or the next line reads as SQL.
fn cut_statement(text: &str, prose_ends: bool) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut comment = false;
    let mut line_blank = false;
    let mut last = None;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if comment && c != '\n' {
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                line_blank = false;
                last = Some(c);
            }
            '-' if chars.peek().is_some_and(|&(_, next)| next == '-') => {
                comment = true;
                line_blank = false;
            }
            ';' => return &text[..i],
            '\n' => {
                comment = false;
                if line_blank && prose_ends && !continues_statement(last, &text[i + 1..]) {
                    return &text[..i];
                }
                line_blank = true;
            }
            c if c.is_whitespace() => {}
            c => {
                line_blank = false;
                last = Some(c);
            }
        }
    }
    text
}

/// Whether SQL resumes after a blank line: the previous line left an operand
/// pending, or the next non-blank line starts with SQL punctuation or an
/// uppercase or lowercase clause keyword.
fn continues_statement(last: Option<char>, rest: &str) -> bool {
    if last.is_some_and(|c| matches!(c, ',' | '(' | '=' | '<' | '>' | '+' | '*' | '/')) {
        return true;
    }
    let Some(line) = rest.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return false;
    };
    if line.starts_with(['(', ')', ',', '-', '/', '*']) {
        return true;
    }
    let word_end = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    let word = &line[..word_end];
    !word.is_empty()
        && CLAUSE_KEYWORDS.contains(&word.to_lowercase().as_str())
        && (word == word.to_uppercase() || word == word.to_lowercase())
}
