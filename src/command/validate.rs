//! Typed commands and per-command argument validation.

use super::Invocation;
use crate::error::ValidationError;
use crate::lights::{LightAction, LightColor};
use crate::schedule::ScheduleSpec;

/// Characters never allowed in a label that ends up inside a crontab line.
pub const SHELL_METACHARACTERS: &[char] = &[
    '`', '$', ';', '|', '&', '<', '>', '\\', '"', '\'', '(', ')', '{', '}', '%', '\n',
];

/// Every command name the dispatcher knows, plus the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandName {
    Memory,
    MemoryDelete,
    Cron,
    CronDelete,
    Search,
    Foto,
    Luz,
    Math,
    Unknown(String),
}

impl CommandName {
    /// Names are matched case-insensitively.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "memory" => Self::Memory,
            "memory_delete" => Self::MemoryDelete,
            "cron" => Self::Cron,
            "cron_delete" => Self::CronDelete,
            "search" => Self::Search,
            "foto" => Self::Foto,
            "luz" => Self::Luz,
            "matematicas" | "math" => Self::Math,
            _ => Self::Unknown(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::MemoryDelete => "memory_delete",
            Self::Cron => "cron",
            Self::CronDelete => "cron_delete",
            Self::Search => "search",
            Self::Foto => "foto",
            Self::Luz => "luz",
            Self::Math => "matematicas",
            Self::Unknown(name) => name,
        }
    }
}

/// A validated command, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Memory { fact: String },
    MemoryDelete { query: String },
    Cron(ScheduleSpec),
    CronDelete { label: String },
    Search { query: String },
    Foto { query: String },
    Luz { target: String, action: LightAction },
    /// Hand the question to the math model. Takes no arguments.
    Math,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::MemoryDelete { .. } => "memory_delete",
            Self::Cron(_) => "cron",
            Self::CronDelete { .. } => "cron_delete",
            Self::Search { .. } => "search",
            Self::Foto { .. } => "foto",
            Self::Luz { .. } => "luz",
            Self::Math => "matematicas",
        }
    }

    pub fn validate(invocation: &Invocation) -> Result<Self, ValidationError> {
        let raw = invocation.raw_args.as_str();
        match CommandName::from_name(&invocation.name) {
            CommandName::Memory => Ok(Self::Memory {
                fact: required(raw, "memory", "fact")?,
            }),
            CommandName::MemoryDelete => Ok(Self::MemoryDelete {
                query: required(raw, "memory_delete", "query")?,
            }),
            CommandName::Cron => validate_cron(raw).map(Self::Cron),
            CommandName::CronDelete => validate_cron_delete(raw),
            CommandName::Search => Ok(Self::Search {
                query: required(raw, "search", "query")?,
            }),
            CommandName::Foto => Ok(Self::Foto {
                query: required(raw, "foto", "query")?,
            }),
            CommandName::Luz => validate_luz(raw),
            CommandName::Math => Ok(Self::Math),
            CommandName::Unknown(name) => Err(ValidationError::UnknownCommand(name)),
        }
    }
}

fn required(
    raw: &str,
    command: &'static str,
    argument: &'static str,
) -> Result<String, ValidationError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ValidationError::MissingArgument { command, argument });
    }
    Ok(value.to_string())
}

/// Split off up to `n` leading whitespace-separated fields; the remainder is
/// returned with leading whitespace removed.
fn split_leading(raw: &str, n: usize) -> (Vec<&str>, &str) {
    let mut rest = raw.trim_start();
    let mut fields = Vec::with_capacity(n);
    while fields.len() < n && !rest.is_empty() {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (fields, rest)
}

fn reject_control(raw: &str, command: &'static str) -> Result<(), ValidationError> {
    if raw.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacters { command });
    }
    Ok(())
}

fn reject_metacharacters(label: &str, command: &'static str) -> Result<(), ValidationError> {
    match label.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        Some(found) => Err(ValidationError::ShellMetacharacter { command, found }),
        None => Ok(()),
    }
}

fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\'', '“'] {
        let close = if quote == '“' { '”' } else { quote };
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(close)) {
            return inner.trim();
        }
    }
    value
}

const CRON_FIELDS: [(&str, u32, u32); 4] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day", 1, 31),
    ("month", 1, 12),
];

/// `<unico|recurrente|once|recurring> <min> <hour> <day> <month> <label>`
fn validate_cron(raw: &str) -> Result<ScheduleSpec, ValidationError> {
    const COMMAND: &str = "cron";
    reject_control(raw, COMMAND)?;

    let (fields, rest) = split_leading(raw, 5);
    let names = ["type", "minute", "hour", "day", "month"];
    if fields.len() < names.len() {
        return Err(ValidationError::MissingArgument {
            command: COMMAND,
            argument: names[fields.len()],
        });
    }

    let recurring = match fields[0].to_lowercase().as_str() {
        "unico" | "único" | "once" => false,
        "recurrente" | "recurring" => true,
        other => {
            return Err(ValidationError::InvalidArgument {
                command: COMMAND,
                argument: "type",
                reason: format!("expected unico or recurrente, got {other:?}"),
            })
        }
    };

    for ((name, min, max), value) in CRON_FIELDS.iter().zip(&fields[1..]) {
        validate_cron_field(value, name, *min, *max)?;
    }

    let label = strip_quotes(rest.trim_end_matches(':'));
    if label.is_empty() {
        return Err(ValidationError::MissingArgument {
            command: COMMAND,
            argument: "label",
        });
    }
    reject_metacharacters(label, COMMAND)?;

    Ok(ScheduleSpec {
        minute: fields[1].to_string(),
        hour: fields[2].to_string(),
        day: fields[3].to_string(),
        month: fields[4].to_string(),
        recurring,
        label: label.to_string(),
    })
}

fn validate_cron_field(
    value: &str,
    argument: &'static str,
    min: u32,
    max: u32,
) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidArgument {
        command: "cron",
        argument,
        reason,
    };

    if !value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '*' | ',' | '-' | '/'))
    {
        return Err(invalid(format!("{value:?} is not a cron field")));
    }
    for number in value
        .split([',', '-', '/'])
        .filter(|part| !part.is_empty() && *part != "*")
    {
        let n: u32 = number
            .parse()
            .map_err(|_| invalid(format!("{value:?} is not a cron field")))?;
        // step values after '/' are not bounded by the field range
        let is_step = value.contains('/') && value.ends_with(number);
        if !is_step && !(min..=max).contains(&n) {
            return Err(invalid(format!("{n} is outside {min}-{max}")));
        }
    }
    Ok(())
}

fn validate_cron_delete(raw: &str) -> Result<Command, ValidationError> {
    const COMMAND: &str = "cron_delete";
    reject_control(raw, COMMAND)?;
    let label = strip_quotes(raw.trim_end_matches(':'));
    if label.is_empty() {
        return Err(ValidationError::MissingArgument {
            command: COMMAND,
            argument: "label",
        });
    }
    reject_metacharacters(label, COMMAND)?;
    Ok(Command::CronDelete {
        label: label.to_string(),
    })
}

/// `<name> <encender|apagar|brillo|color> [value]`
fn validate_luz(raw: &str) -> Result<Command, ValidationError> {
    const COMMAND: &str = "luz";
    let (fields, _) = split_leading(raw, 3);
    let target = fields.first().ok_or(ValidationError::MissingArgument {
        command: COMMAND,
        argument: "name",
    })?;
    let action = fields.get(1).ok_or(ValidationError::MissingArgument {
        command: COMMAND,
        argument: "action",
    })?;
    let value = fields.get(2).copied();

    let invalid = |argument: &'static str, reason: String| ValidationError::InvalidArgument {
        command: COMMAND,
        argument,
        reason,
    };
    let missing_value = ValidationError::MissingArgument {
        command: COMMAND,
        argument: "value",
    };

    let action = match action.to_lowercase().as_str() {
        "encender" | "prender" | "on" => LightAction::On,
        "apagar" | "off" => LightAction::Off,
        "brillo" | "brightness" => {
            let value = value.ok_or(missing_value)?;
            let level: i64 = value
                .trim_end_matches('%')
                .parse()
                .map_err(|_| invalid("value", format!("{value:?} is not a brightness level")))?;
            LightAction::Brightness(level.clamp(0, 100) as u8)
        }
        "color" | "colour" => {
            let value = value.ok_or(missing_value)?;
            let color = LightColor::parse(value)
                .ok_or_else(|| invalid("value", format!("unknown color {value:?}")))?;
            LightAction::Color(color)
        }
        other => return Err(invalid("action", format!("unknown action {other:?}"))),
    };

    Ok(Command::Luz {
        target: target.to_lowercase(),
        action,
    })
}
