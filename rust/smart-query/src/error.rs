//! Error taxonomy for the query pipeline.
//!
//! Every failure that reaches a caller carries a [`ReasonCode`] and the
//! [`Stage`] it happened in. Display strings on these types are meant for logs;
//! the caller-facing text comes from [`PipelineError::public_message`], which
//! never includes prompts, raw provider bodies or credentials.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sql::RejectReason;

/// Pipeline stages, in the order a request moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Question accepted, nothing done yet.
    Received,
    /// Embedding the question and assembling schema context.
    Retrieving,
    /// Prompting the language model.
    Synthesizing,
    /// Static safety checks on the candidate SQL.
    Validating,
    /// Running the accepted SQL against the database.
    Executing,
    /// Terminal success.
    Completed,
}

impl Stage {
    /// Stage name as reported to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Retrieving => "retrieving",
            Self::Synthesizing => "synthesizing",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure reason returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    InvalidQuestion,
    SchemaUnavailable,
    IndexNotReady,
    RetrievalEmpty,
    SynthesisEmpty,
    ProviderError,
    DisallowedStatement,
    MultiStatement,
    UnknownIdentifier,
    ForbiddenSystemAccess,
    SyntaxError,
    ExecutionError,
    RequestTimeout,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidQuestion => "InvalidQuestion",
            Self::SchemaUnavailable => "SchemaUnavailable",
            Self::IndexNotReady => "IndexNotReady",
            Self::RetrievalEmpty => "RetrievalEmpty",
            Self::SynthesisEmpty => "SynthesisEmpty",
            Self::ProviderError => "ProviderError",
            Self::DisallowedStatement => "DisallowedStatement",
            Self::MultiStatement => "MultiStatement",
            Self::UnknownIdentifier => "UnknownIdentifier",
            Self::ForbiddenSystemAccess => "ForbiddenSystemAccess",
            Self::SyntaxError => "SyntaxError",
            Self::ExecutionError => "ExecutionError",
            Self::RequestTimeout => "RequestTimeout",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RejectReason> for ReasonCode {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::DisallowedStatement => Self::DisallowedStatement,
            RejectReason::MultiStatement => Self::MultiStatement,
            RejectReason::UnknownIdentifier => Self::UnknownIdentifier,
            RejectReason::ForbiddenSystemAccess => Self::ForbiddenSystemAccess,
            RejectReason::SyntaxError => Self::SyntaxError,
        }
    }
}

/// Failures of an external embedding or language-model provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Provider request failed: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ProviderError {
    /// Short description that is safe to show to API callers.
    pub fn public_message(&self) -> String {
        match self {
            Self::Timeout(after) => {
                format!("provider request timed out after {}s", after.as_secs())
            }
            Self::Http { status, .. } => format!("provider returned HTTP {status}"),
            Self::Network(_) => "provider could not be reached".to_string(),
            Self::Malformed(_) => "provider returned a malformed response".to_string(),
            Self::DimensionMismatch { expected, actual } => {
                format!("embedding dimension mismatch (expected {expected}, got {actual})")
            }
        }
    }

    /// Map a reqwest failure, keeping the configured timeout for reporting.
    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Errors raised by the pipeline components.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Invalid question: {0}")]
    InvalidQuestion(String),

    #[error("Schema unavailable: {0}")]
    SchemaUnavailable(String),

    #[error("Embedding index is not ready")]
    IndexNotReady,

    #[error("Retrieval produced no schema entities")]
    RetrievalEmpty,

    #[error("No SQL statement found in the model response")]
    SynthesisEmpty,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("SQL rejected ({reason}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
        identifiers: Vec<String>,
    },

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Request exceeded its deadline of {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::InvalidQuestion(_) => ReasonCode::InvalidQuestion,
            Self::SchemaUnavailable(_) => ReasonCode::SchemaUnavailable,
            Self::IndexNotReady => ReasonCode::IndexNotReady,
            Self::RetrievalEmpty => ReasonCode::RetrievalEmpty,
            Self::SynthesisEmpty => ReasonCode::SynthesisEmpty,
            Self::Provider(_) => ReasonCode::ProviderError,
            Self::Rejected { reason, .. } => (*reason).into(),
            Self::Execution(_) => ReasonCode::ExecutionError,
            Self::Timeout(_) => ReasonCode::RequestTimeout,
        }
    }

    /// Caller-facing message.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidQuestion(msg) => msg.clone(),
            Self::SchemaUnavailable(_) => "database schema is unavailable".to_string(),
            Self::Provider(err) => err.public_message(),
            // Validation and execution messages only mention identifiers
            // from the caller's own query; execution text is redacted upstream.
            Self::Rejected { message, .. } | Self::Execution(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// A [`PipelineError`] tagged with the stage that produced it.
#[derive(Error, Debug, Clone)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

impl StageError {
    pub fn new(stage: Stage, source: PipelineError) -> Self {
        Self { stage, source }
    }

    pub fn reason_code(&self) -> ReasonCode {
        self.source.reason_code()
    }
}

/// Result alias for pipeline components.
pub type PipelineResult<T> = Result<T, PipelineError>;
