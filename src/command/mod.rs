//! In-band command protocol.
//!
//! Model output may embed `:::name args:::` tokens. [`parser`] extracts them
//! and produces the cleaned display text, [`Command::validate`] turns each
//! token into a typed command, and [`dispatcher`] executes them in order
//! against the collaborators registered in [`dispatcher::Handlers`].

pub mod dispatcher;
pub mod parser;
pub mod validate;

use serde::Serialize;

use crate::error::{DispatchError, ErrorKind, ValidationError};

pub use dispatcher::{Dispatcher, Handlers, Outcome};
pub use parser::{parse, ParsedResponse};
pub use validate::{Command, CommandName};

/// Byte range `[start, end)` of a token in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One command token as found in the model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    /// Name exactly as written after the opening sentinel.
    pub name: String,
    /// Everything between the name and the closing sentinel, trimmed.
    pub raw_args: String,
    pub span: Span,
}

impl Invocation {
    /// The full token text (sentinels included) inside `source`.
    pub fn source_text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.span.start..self.span.end]
    }
}

/// What one invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command_name: String,
    pub success: bool,
    /// Plain-language notice for the end user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_visible_text: Option<String>,
    /// Text for the model's next turn (search results, failure feedback).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_append_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CommandResult {
    pub fn ok(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            success: true,
            user_visible_text: None,
            context_append_text: None,
            error_kind: None,
        }
    }

    pub fn with_notice(mut self, text: impl Into<String>) -> Self {
        self.user_visible_text = Some(text.into());
        self
    }

    pub fn with_context(mut self, text: impl Into<String>) -> Self {
        self.context_append_text = Some(text.into());
        self
    }

    /// Unknown commands leave no trace anywhere.
    pub fn unknown(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            success: false,
            user_visible_text: None,
            context_append_text: None,
            error_kind: Some(ErrorKind::UnknownCommand),
        }
    }

    pub fn rejected(command_name: impl Into<String>, err: &ValidationError) -> Self {
        let command_name = command_name.into();
        let kind = ErrorKind::from(err);
        if kind == ErrorKind::UnknownCommand {
            return Self::unknown(command_name);
        }
        Self {
            context_append_text: Some(format!(
                "[command {command_name} was not run: {err}. Re-issue it with corrected arguments if it is still needed.]"
            )),
            command_name,
            success: false,
            user_visible_text: None,
            error_kind: Some(kind),
        }
    }

    pub fn failed(command_name: impl Into<String>, err: &DispatchError) -> Self {
        let command_name = command_name.into();
        Self {
            context_append_text: Some(format!("[command {command_name} failed: {err}]")),
            command_name,
            success: false,
            user_visible_text: None,
            error_kind: Some(ErrorKind::from(err)),
        }
    }
}

/// Lifecycle of one invocation. `Succeeded`, `Failed` and `Rejected` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationState {
    Parsed,
    Validating,
    Executing,
    Succeeded,
    Failed(DispatchError),
    Rejected(ValidationError),
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Rejected(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Rejected(_) => "rejected",
        }
    }
}
