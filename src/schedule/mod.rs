//! Reminders backed by the user's crontab.
//!
//! A reminder is a five-field cron expression plus a shell payload that shows
//! a desktop notification and appends the label to the event queue file. Every
//! line written by femtobot carries a trailing `# femtobot:<id>` marker.
//!
//! One-time reminders are guarded by the year they were created in and are
//! removed by [`Scheduler::cleanup_expired`] once their time has passed.

pub mod crontab;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::config::FemtoConfig;
use crate::error::DispatchError;

pub use crontab::CrontabScheduler;

pub const ID_MARKER: &str = "# femtobot:";

static YEAR_GUARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[ "\$\(date \+\\?%Y\)" = "(\d{4})" \]"#).expect("year guard regex")
});

/// Payload patterns refused even after label validation.
static DANGEROUS_PAYLOAD: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r";\s*rm\s",
        r";\s*sudo\s",
        r"\|\s*(ba)?sh(\s|$)",
        r"`[^`]+`",
        r"\$\((?:[^d)]|d[^a)]|da[^t)]|dat[^e)]|date[^ )])[^)]*\)",
        r">\s*/(etc|bin|usr/bin)/",
        r"&&\s*rm\s",
        r"(wget|curl)\s+.*\|",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("payload pattern"))
    .collect()
});

/// When and what to remind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleSpec {
    pub minute: String,
    pub hour: String,
    pub day: String,
    pub month: String,
    pub recurring: bool,
    pub label: String,
}

impl ScheduleSpec {
    /// The five-field cron expression; day-of-week is always `*`.
    pub fn expression(&self) -> String {
        format!("{} {} {} {} *", self.minute, self.hour, self.day, self.month)
    }

    /// The moment this spec fires in `year`, if all four fields are plain numbers.
    pub fn fires_at(&self, year: i32) -> Option<NaiveDateTime> {
        fixed_time(
            year,
            [
                self.minute.as_str(),
                self.hour.as_str(),
                self.day.as_str(),
                self.month.as_str(),
            ],
        )
    }

    /// A one-time reminder whose time has already passed this year.
    pub fn is_past(&self, now: NaiveDateTime) -> bool {
        !self.recurring && self.fires_at(now.year()).is_some_and(|at| at < now)
    }
}

fn fixed_time(year: i32, fields: [&str; 4]) -> Option<NaiveDateTime> {
    let [minute, hour, day, month] = fields.map(|f| f.parse::<u32>().ok());
    NaiveDate::from_ymd_opt(year, month?, day?)?.and_hms_opt(hour?, minute?, 0)
}

/// Renders the shell command a reminder runs.
#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    pub notify_command: String,
    pub events_file: PathBuf,
}

impl PayloadTemplate {
    pub fn from_config(config: &FemtoConfig) -> Self {
        Self {
            notify_command: config.schedule.notify_command.clone(),
            events_file: config.resolved_events_file(),
        }
    }

    pub fn render(&self, spec: &ScheduleSpec, year: i32) -> String {
        let label = &spec.label;
        let body = format!(
            "{} \"{label}\"; echo \"{label}\" >> {}",
            self.notify_command,
            self.events_file.display()
        );
        if spec.recurring {
            body
        } else {
            format!("[ \"$(date +\\%Y)\" = \"{year}\" ] && {body}")
        }
    }
}

/// Reject payloads matching known injection shapes.
pub fn check_payload(payload: &str) -> Result<(), DispatchError> {
    match DANGEROUS_PAYLOAD.iter().find(|re| re.is_match(payload)) {
        Some(re) => Err(DispatchError::Denied(format!(
            "payload matches forbidden pattern {}",
            re.as_str()
        ))),
        None => Ok(()),
    }
}

/// One line of the crontab, as shown to the model and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    /// Present only on lines written by femtobot.
    pub id: Option<String>,
    pub expression: String,
    pub command: String,
}

impl ScheduleEntry {
    /// Parse a crontab line. Comments, blank lines and `@reboot`-style
    /// entries yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let (body, id) = split_marker(trimmed);
        let mut rest = body;
        let mut fields = Vec::with_capacity(5);
        for _ in 0..5 {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace)?;
            fields.push(&rest[..end]);
            rest = &rest[end..];
        }
        let command = rest.trim();
        if command.is_empty() {
            return None;
        }
        Some(Self {
            id: id.map(str::to_string),
            expression: fields.join(" "),
            command: command.to_string(),
        })
    }

    pub fn line(&self) -> String {
        match &self.id {
            Some(id) => format!("{} {} {ID_MARKER}{id}", self.expression, self.command),
            None => format!("{} {}", self.expression, self.command),
        }
    }
}

/// Split a trailing id marker off a crontab line.
pub fn split_marker(line: &str) -> (&str, Option<&str>) {
    match line.rfind(ID_MARKER) {
        Some(at) => (
            line[..at].trim_end(),
            Some(line[at + ID_MARKER.len()..].trim()),
        ),
        None => (line, None),
    }
}

/// Whether a crontab line is a one-time reminder whose time has passed.
///
/// Year-guarded lines are checked against their guard year. Unguarded lines
/// with four fixed fields and a `*` day-of-week are assumed to be for the
/// current year.
pub fn is_expired(line: &str, now: NaiveDateTime) -> bool {
    let fields: Vec<&str> = line.split_whitespace().take(5).collect();
    if fields.len() < 5 {
        return false;
    }
    let time_fields = [fields[0], fields[1], fields[2], fields[3]];

    if let Some(caps) = YEAR_GUARD.captures(line) {
        let Ok(year) = caps[1].parse::<i32>() else {
            return false;
        };
        return fixed_time(year, time_fields).is_some_and(|at| at < now);
    }
    fields[4] == "*" && fixed_time(now.year(), time_fields).is_some_and(|at| at < now)
}

/// Result of [`Scheduler::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: String,
    /// An identical entry already existed; nothing was written.
    pub duplicate: bool,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Add `expression payload` unless an identical line exists.
    async fn create(&self, spec: &ScheduleSpec, payload: &str) -> Result<Created, DispatchError>;

    /// Remove every entry containing `match_token`. Returns how many were removed.
    async fn delete(&self, match_token: &str) -> Result<usize, DispatchError>;

    async fn list(&self) -> Result<Vec<ScheduleEntry>, DispatchError>;

    /// Remove one-time entries whose time has passed.
    async fn cleanup_expired(&self, now: NaiveDateTime) -> Result<usize, DispatchError>;
}
