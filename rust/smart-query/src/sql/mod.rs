//! SQL synthesis and static safety validation.

pub mod synthesizer;
pub mod validator;

pub use synthesizer::{extract_statement, Extraction, SqlSynthesizer, SynthesisFeedback};
pub use validator::SqlValidator;

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    ClickHouseDialect, Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect,
};

/// Why the validator refused a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Not a read-only statement, or uses a blocked construct.
    DisallowedStatement,
    /// More than one statement in the text.
    MultiStatement,
    /// A table or column that the schema does not contain.
    UnknownIdentifier,
    /// Reaches system tables or resources outside the database.
    ForbiddenSystemAccess,
    /// Could not be tokenized or parsed.
    SyntaxError,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DisallowedStatement => "DisallowedStatement",
            Self::MultiStatement => "MultiStatement",
            Self::UnknownIdentifier => "UnknownIdentifier",
            Self::ForbiddenSystemAccess => "ForbiddenSystemAccess",
            Self::SyntaxError => "SyntaxError",
        }
    }

    /// Rejections that a second synthesis attempt may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnknownIdentifier | Self::SyntaxError)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`SqlValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Accepted {
        /// Normalized statement, safe to execute.
        sql: String,
        /// Whether a default LIMIT was appended.
        injected_limit: bool,
    },
    Rejected {
        reason: RejectReason,
        message: String,
        /// Offending identifiers, in order of first appearance.
        identifiers: Vec<String>,
    },
}

impl ValidationVerdict {
    pub(crate) fn reject(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
            identifiers: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn accepted_sql(&self) -> Option<&str> {
        match self {
            Self::Accepted { sql, .. } => Some(sql),
            Self::Rejected { .. } => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { reason, .. } => Some(*reason),
        }
    }
}

/// SQL extracted from a model response, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSql {
    pub sql: String,
    pub question: String,
    /// Schema revision of the context the prompt was built from.
    pub revision: u64,
}

/// Dialect used to tokenize and parse candidate SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    ClickHouse,
    Generic,
    PostgreSql,
    MySql,
}

impl SqlDialect {
    /// Human-readable name, used in prompts.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ClickHouse => "ClickHouse",
            Self::Generic => "ANSI SQL",
            Self::PostgreSql => "PostgreSQL",
            Self::MySql => "MySQL",
        }
    }

    pub fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            Self::ClickHouse => Box::new(ClickHouseDialect {}),
            Self::Generic => Box::new(GenericDialect {}),
            Self::PostgreSql => Box::new(PostgreSqlDialect {}),
            Self::MySql => Box::new(MySqlDialect {}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_reasons() {
        assert!(RejectReason::UnknownIdentifier.is_retryable());
        assert!(RejectReason::SyntaxError.is_retryable());
        assert!(!RejectReason::DisallowedStatement.is_retryable());
        assert!(!RejectReason::MultiStatement.is_retryable());
        assert!(!RejectReason::ForbiddenSystemAccess.is_retryable());
    }

    #[test]
    fn test_dialect_deserializes_lowercase() {
        let dialect: SqlDialect = serde_json::from_str("\"postgresql\"").unwrap();
        assert_eq!(dialect, SqlDialect::PostgreSql);
        assert_eq!(SqlDialect::default().display_name(), "ClickHouse");
    }
}
