//! Sequential execution of one turn's invocations.

use chrono::{Datelike, Local, NaiveDateTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Command, CommandResult, Invocation, InvocationState};
use crate::config::FemtoConfig;
use crate::error::DispatchError;
use crate::lights::LightController;
use crate::memory::MemoryStore;
use crate::schedule::{check_payload, PayloadTemplate, Scheduler};
use crate::search::{format_web_results, SearchProvider};

/// Collaborators the commands act on, built once at startup.
#[derive(Clone)]
pub struct Handlers {
    pub memory: Arc<dyn MemoryStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub search: Arc<dyn SearchProvider>,
    pub lights: Arc<dyn LightController>,
}

/// Terminal record of one invocation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub invocation: Invocation,
    pub state: InvocationState,
    pub result: CommandResult,
}

pub struct Dispatcher {
    handlers: Handlers,
    timeout: Duration,
    delete_threshold: f64,
    payload: PayloadTemplate,
}

impl Dispatcher {
    pub fn new(handlers: Handlers, config: &FemtoConfig) -> Self {
        Self {
            handlers,
            timeout: config.handler_timeout(),
            delete_threshold: config.memory.delete_threshold,
            payload: PayloadTemplate::from_config(config),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Run every invocation in order. A failing or slow handler never stops
    /// the ones after it.
    pub async fn dispatch_all(&self, chat_id: &str, invocations: &[Invocation]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            outcomes.push(self.dispatch(chat_id, invocation).await);
        }
        outcomes
    }

    pub async fn dispatch(&self, chat_id: &str, invocation: &Invocation) -> Outcome {
        let name = invocation.name.as_str();
        let mut state = InvocationState::Parsed;
        advance(chat_id, name, &mut state, InvocationState::Validating);

        let command = match Command::validate(invocation) {
            Ok(command) => command,
            Err(err) => {
                let result = CommandResult::rejected(name, &err);
                advance(chat_id, name, &mut state, InvocationState::Rejected(err));
                return Outcome {
                    invocation: invocation.clone(),
                    state,
                    result,
                };
            }
        };

        advance(chat_id, name, &mut state, InvocationState::Executing);
        let executed = match tokio::time::timeout(self.timeout, self.execute(command)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(self.timeout.as_secs())),
        };

        let result = match executed {
            Ok(result) => {
                advance(chat_id, name, &mut state, InvocationState::Succeeded);
                result
            }
            Err(err) => {
                warn!(chat_id = %chat_id, command = %name, error = %err, "command failed");
                let result = CommandResult::failed(name, &err);
                advance(chat_id, name, &mut state, InvocationState::Failed(err));
                result
            }
        };

        Outcome {
            invocation: invocation.clone(),
            state,
            result,
        }
    }

    async fn execute(&self, command: Command) -> Result<CommandResult, DispatchError> {
        let name = command.name();
        match command {
            Command::Memory { fact } => {
                let outcome = self
                    .handlers
                    .memory
                    .add(&fact, Some("chat"))
                    .await
                    .map_err(store_error)?;
                let notice = if outcome.deduplicated {
                    format!("Already in memory: {fact}")
                } else {
                    format!("Saved to memory: {fact}")
                };
                Ok(CommandResult::ok(name).with_notice(notice))
            }

            Command::MemoryDelete { query } => {
                let removed = self
                    .handlers
                    .memory
                    .delete_by_similarity(&query, self.delete_threshold)
                    .await
                    .map_err(store_error)?;
                let notice = match removed {
                    Some(fact) => format!("Memory deleted: {}", fact.content),
                    None => format!("No similar memory found for: {query}"),
                };
                Ok(CommandResult::ok(name).with_notice(notice))
            }

            Command::Cron(spec) => {
                let now = now_local();
                if spec.is_past(now) {
                    return Err(DispatchError::Denied(format!(
                        "one-time reminder {:?} is in the past",
                        spec.label
                    )));
                }
                let payload = self.payload.render(&spec, now.year());
                check_payload(&payload)?;

                let created = self.handlers.scheduler.create(&spec, &payload).await?;
                let kind = if spec.recurring { "recurring" } else { "one-time" };
                let notice = if created.duplicate {
                    format!("Reminder already scheduled: {}", spec.label)
                } else {
                    format!("Reminder scheduled ({kind}, {}): {}", spec.expression(), spec.label)
                };
                Ok(CommandResult::ok(name).with_notice(notice))
            }

            Command::CronDelete { label } => {
                let removed = self.handlers.scheduler.delete(&label).await?;
                let notice = match removed {
                    0 => format!("No reminder found matching: {label}"),
                    1 => format!("Reminder removed: {label}"),
                    n => format!("{n} reminders removed matching: {label}"),
                };
                Ok(CommandResult::ok(name).with_notice(notice))
            }

            Command::Search { query } => {
                let hits = self.handlers.search.web(&query).await?;
                Ok(CommandResult::ok(name)
                    .with_notice(format!("Searching: {query}"))
                    .with_context(format_web_results(&query, &hits)))
            }

            Command::Foto { query } => {
                let urls = self.handlers.search.images(&query).await?;
                let notice = if urls.is_empty() {
                    format!("No images found for: {query}")
                } else {
                    urls.join("\n")
                };
                Ok(CommandResult::ok(name).with_notice(notice))
            }

            Command::Luz { target, action } => {
                let notice = self.handlers.lights.apply(&target, action).await?;
                Ok(CommandResult::ok(name).with_notice(notice))
            }

            // the assistant answers these with the math model before dispatch
            Command::Math => Ok(CommandResult::ok(name)),
        }
    }
}

fn advance(chat_id: &str, command: &str, state: &mut InvocationState, next: InvocationState) {
    debug!(
        chat_id = %chat_id,
        command = %command,
        from = state.label(),
        to = next.label(),
        "invocation state"
    );
    if let InvocationState::Rejected(err) = &next {
        info!(chat_id = %chat_id, command = %command, error = %err, "command rejected");
    }
    *state = next;
}

fn store_error(err: anyhow::Error) -> DispatchError {
    DispatchError::Unavailable(format!("memory store: {err:#}"))
}

fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}
