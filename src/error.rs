//! Domain error taxonomy.
//!
//! The parser and dispatcher never surface these to the conversation loop;
//! they are folded into [`crate::command::CommandResult`] values. Application
//! boundaries (config, database, CLI, gateway) use `anyhow` instead.

use serde::Serialize;
use thiserror::Error;

/// Raised (and only logged) when a command token cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed command token at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

/// Argument shape errors, one family per command grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command}: missing argument `{argument}`")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("{command}: invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        command: &'static str,
        argument: &'static str,
        reason: String,
    },

    #[error("{command}: argument contains control characters")]
    ControlCharacters { command: &'static str },

    #[error("{command}: argument contains shell metacharacter {found:?}")]
    ShellMetacharacter { command: &'static str, found: char },

    #[error("unsupported document type: {0}")]
    UnsupportedDocument(String),
}

/// Failures while executing a validated command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("handler timed out after {0}s")]
    Timeout(u64),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("{0}")]
    Unknown(String),
}

/// Session persistence failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {path} is not valid JSON: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid session name: {0}")]
    InvalidName(String),
}

/// Failures of the model runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model runtime unavailable: {0}")]
    Unavailable(String),

    #[error("model runtime timed out")]
    Timeout,

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("unexpected model response: {0}")]
    Protocol(String),
}

impl ModelError {
    /// Whether the user should see the configured fallback message.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Compact, serializable error classification carried in command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownCommand,
    Validation,
    Timeout,
    Unavailable,
    Denied,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCommand => "unknown_command",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Denied => "denied",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ValidationError> for ErrorKind {
    fn from(err: &ValidationError) -> Self {
        match err {
            ValidationError::UnknownCommand(_) => Self::UnknownCommand,
            _ => Self::Validation,
        }
    }
}

impl From<&DispatchError> for ErrorKind {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::Timeout(_) => Self::Timeout,
            DispatchError::Unavailable(_) => Self::Unavailable,
            DispatchError::Denied(_) => Self::Denied,
            DispatchError::Unknown(_) => Self::Unknown,
        }
    }
}
