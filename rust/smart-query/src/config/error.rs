//! Configuration error types with actionable user messages.
//!
//! Every variant says what is wrong and how to fix it, so that a failed
//! startup can be corrected from the error text alone.

use std::fmt;

/// Configuration errors with detailed, actionable messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Invalid configuration value.
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// A numeric setting outside its accepted range.
    OutOfRange {
        /// Dotted setting path, e.g. `pipeline.synthesis_retries`.
        setting: String,
        /// The rejected value.
        value: String,
        /// Accepted range in words.
        expected: String,
    },
    /// Two settings that cannot be used together.
    Incompatible {
        setting1: String,
        setting2: String,
        reason: String,
    },
    /// A required configuration is missing.
    MissingRequired {
        /// The missing setting name.
        setting: String,
        /// What feature requires this setting.
        context: String,
        /// Environment variable to set.
        env_var: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { message, fix_hint } => {
                write!(f, "Invalid configuration: {message}\n\nHow to fix: {fix_hint}")
            }
            Self::OutOfRange {
                setting,
                value,
                expected,
            } => {
                write!(
                    f,
                    "Setting out of range: {setting} = {value}\n\n\
                    Expected: {expected}\n\
                    Set via: SMART_QUERY__{}",
                    setting.replace('.', "__").to_uppercase()
                )
            }
            Self::Incompatible {
                setting1,
                setting2,
                reason,
            } => {
                write!(
                    f,
                    "Incompatible settings: {setting1} cannot be used with {setting2}\n\n\
                    Reason: {reason}"
                )
            }
            Self::MissingRequired {
                setting,
                context,
                env_var,
            } => {
                write!(
                    f,
                    "Missing required configuration: {setting}\n\n\
                    Required for: {context}\n\
                    Set via: {env_var}"
                )
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    #[must_use]
    pub fn out_of_range(
        setting: impl Into<String>,
        value: impl fmt::Display,
        expected: impl Into<String>,
    ) -> Self {
        Self::OutOfRange {
            setting: setting.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }

    #[must_use]
    pub fn incompatible(
        setting1: impl Into<String>,
        setting2: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Incompatible {
            setting1: setting1.into(),
            setting2: setting2.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    /// Collapse a list of errors: none → `Ok`, one → that error, more → `Multiple`.
    pub fn collect(mut errors: Vec<ConfigurationError>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Number of individual errors.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;
