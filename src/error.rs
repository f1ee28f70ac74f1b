//! Error types for ratemux.

use std::time::Duration;

use thiserror::Error;

use crate::expr::TemplateError;
use crate::ratelimit::PatternError;

/// Main error type for ratemux operations.
///
/// Variants fall into three families: the disabled signal, configuration
/// errors raised while building a multiplexer, and infrastructure errors
/// raised per request.
#[derive(Error, Debug)]
pub enum RatemuxError {
    /// Rate limiting is switched off in configuration.
    #[error("configuration \"{path}\" disabled")]
    Disabled { path: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the hierarchical configuration source
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    /// A template failed to compile
    #[error("invalid expression: {0}")]
    Template(#[source] TemplateError),

    /// An API pattern failed to parse
    #[error("invalid api pattern: {0}")]
    Pattern(#[from] PatternError),

    /// A rate limit group name was registered twice or is reserved
    #[error("rate limit group \"{0}\" already registered")]
    DuplicateGroup(String),

    /// A match expression references a group that does not exist
    #[error("match expression references unknown rate limit group \"{0}\"")]
    UnknownGroup(String),

    /// An event expression failed at request time
    #[error("failed to evaluate event expression: {0}")]
    Evaluate(#[source] TemplateError),

    /// The shared store rejected or failed a command
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The shared store answered with something unexpected
    #[error("Store error: {0}")]
    Store(String),

    /// A store round trip did not finish within its deadline
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatemuxError {
    /// Rate limiting was intentionally turned off; callers proceed unlimited.
    pub fn is_disabled(&self) -> bool {
        matches!(self, RatemuxError::Disabled { .. })
    }

    /// Errors that must abort setup.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RatemuxError::Config(_)
                | RatemuxError::Source(_)
                | RatemuxError::Template(_)
                | RatemuxError::Pattern(_)
                | RatemuxError::DuplicateGroup(_)
                | RatemuxError::UnknownGroup(_)
        )
    }

    /// Request-time failures of the backing store. The caller decides
    /// whether to fail open or closed.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            RatemuxError::Redis(_)
                | RatemuxError::Store(_)
                | RatemuxError::DeadlineExceeded(_)
                | RatemuxError::Io(_)
        )
    }

    /// A request's event expression could not be evaluated, typically
    /// because it reads identity fields of an anonymous request. Like
    /// infrastructure failures, the caller picks fail-open or fail-closed.
    pub fn is_evaluation(&self) -> bool {
        matches!(self, RatemuxError::Evaluate(_))
    }
}

/// Result type alias for ratemux operations.
pub type Result<T> = std::result::Result<T, RatemuxError>;
