//! Line-oriented terminal chat.
//!
//! Plain lines are sent to the assistant; lines starting with `/` are slash
//! commands. The conversation is saved to the session directory after every
//! turn when autosave is on.

use anyhow::Result;
use chrono::{Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::assistant::{Assistant, TurnReply};
use crate::session::persist::{write_export, SessionStore, DEFAULT_SESSION};
use crate::session::SessionSnapshot;

/// Chat id used for the single terminal conversation.
pub const TERMINAL_CHAT: &str = "terminal";

const HELP: &str = "Available commands:

/status          token usage and model
/new             new conversation (aliases: /clear, /reset)
/unload          unload the model from RAM
/save [name]     save the session
/load [name]     load a saved session
/sessions        list saved sessions
/export [file]   export the conversation to Markdown
/help            show this help
/exit            leave (also ctrl-d)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Status,
    New,
    Unload,
    Save(Option<String>),
    Load(Option<String>),
    Sessions,
    Export(Option<String>),
    Help,
    Exit,
    Unknown(String),
}

impl SlashCommand {
    /// `None` when `line` is not a slash command.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        let arg = (!args.is_empty()).then(|| args.to_string());
        Some(match name.to_lowercase().as_str() {
            "status" => Self::Status,
            "new" | "clear" | "reset" => Self::New,
            "unload" => Self::Unload,
            "save" => Self::Save(arg),
            "load" => Self::Load(arg),
            "sessions" => Self::Sessions,
            "export" => Self::Export(arg),
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// What one input line produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Output(String),
    Nothing,
    Exit,
}

pub struct Repl {
    assistant: Arc<Assistant>,
    store: SessionStore,
    session: String,
    context_limit: usize,
    autosave: bool,
}

impl Repl {
    /// Start on `session`, restoring it from disk when a saved copy exists.
    pub async fn open(
        assistant: Arc<Assistant>,
        store: SessionStore,
        session: Option<String>,
        context_limit: usize,
        autosave: bool,
    ) -> Result<Self> {
        let mut repl = Self {
            assistant,
            store,
            session: session.unwrap_or_else(|| DEFAULT_SESSION.to_string()),
            context_limit,
            autosave,
        };
        let name = repl.session.clone();
        if let Some(messages) = repl.store.load(&name)? {
            repl.restore(messages).await;
            tracing::info!(session = %name, "session restored");
        }
        repl.assistant
            .sessions()
            .ensure(TERMINAL_CHAT, repl.assistant.system_prompt())
            .await;
        Ok(repl)
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    pub async fn handle_line(&mut self, line: &str) -> Step {
        let line = line.trim();
        if line.is_empty() {
            return Step::Nothing;
        }
        match SlashCommand::parse(line) {
            Some(SlashCommand::Exit) => Step::Exit,
            Some(command) => Step::Output(self.run_command(command).await),
            None => {
                self.resume_if_evicted().await;
                let reply = self.assistant.handle_message(TERMINAL_CHAT, line).await;
                self.autosave().await;
                Step::Output(render_reply(&reply))
            }
        }
    }

    /// Read lines until EOF or `/exit`, writing replies to `output`.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        output
            .write_all(
                format!(
                    "femtobot ({}) session '{}'. Type /help for commands.\n> ",
                    self.assistant.model_name(),
                    self.session
                )
                .as_bytes(),
            )
            .await?;
        output.flush().await?;

        while let Some(line) = lines.next_line().await? {
            match self.handle_line(&line).await {
                Step::Exit => break,
                Step::Nothing => {}
                Step::Output(text) => {
                    output.write_all(text.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                }
            }
            output.write_all(b"> ").await?;
            output.flush().await?;
        }
        output.write_all(b"\n").await?;
        output.flush().await?;
        self.autosave().await;
        Ok(())
    }

    async fn run_command(&mut self, command: SlashCommand) -> String {
        match command {
            SlashCommand::Status => self.status().await,
            SlashCommand::New => {
                self.assistant.reset(TERMINAL_CHAT).await;
                self.autosave().await;
                "New conversation started. History cleared.".to_string()
            }
            SlashCommand::Unload => match self.assistant.unload_model().await {
                Ok(()) => "Model unloaded from RAM.".to_string(),
                Err(e) => format!("Could not unload the model: {e}"),
            },
            SlashCommand::Save(name) => {
                let name = name.unwrap_or_else(|| DEFAULT_SESSION.to_string());
                let history = self.assistant.sessions().history(TERMINAL_CHAT).await;
                match self.store.save(&name, &history) {
                    Ok(_) => {
                        self.session = name.clone();
                        format!("Session saved: {name}")
                    }
                    Err(e) => format!("Error saving session: {e}"),
                }
            }
            SlashCommand::Load(name) => {
                let name = name.unwrap_or_else(|| DEFAULT_SESSION.to_string());
                match self.store.load(&name) {
                    Ok(Some(messages)) => {
                        let count = messages.len();
                        self.restore(messages).await;
                        self.session = name.clone();
                        format!("Session loaded: {name} ({count} messages)")
                    }
                    Ok(None) => format!("Session not found: {name}"),
                    Err(e) => format!("Error loading session: {e}"),
                }
            }
            SlashCommand::Sessions => match self.store.list() {
                Ok(sessions) if sessions.is_empty() => "No saved sessions".to_string(),
                Ok(sessions) => {
                    let mut out = String::from("Saved sessions:");
                    for info in sessions.iter().take(10) {
                        out.push_str(&format!(
                            "\n  {}: {} msgs ({})",
                            info.name,
                            info.message_count,
                            info.last_saved.format("%Y-%m-%d")
                        ));
                    }
                    out
                }
                Err(e) => format!("Error listing sessions: {e}"),
            },
            SlashCommand::Export(file) => {
                let path = export_path(file);
                let history = self.assistant.sessions().history(TERMINAL_CHAT).await;
                match write_export(&path, &history) {
                    Ok(()) => format!("Exported to: {}", path.display()),
                    Err(e) => format!("Error exporting: {e}"),
                }
            }
            SlashCommand::Help => HELP.to_string(),
            SlashCommand::Exit => String::new(),
            SlashCommand::Unknown(name) => {
                format!("Unknown command: /{name}. Type /help for the list.")
            }
        }
    }

    async fn status(&self) -> String {
        let usage = self.assistant.usage(TERMINAL_CHAT).await;
        let limit = self.context_limit.max(1);
        let percent = (usage.tokens as f64 / limit as f64 * 100.0).min(100.0);
        let filled = (percent / 5.0) as usize;
        let bar = format!("{}{}", "█".repeat(filled), "░".repeat(20 - filled));
        format!(
            "Context: {bar} {percent:.1}%\n{} / {} tokens ({} remaining)\n{} messages\nModel: {}\nSession: {}",
            usage.tokens,
            self.context_limit,
            self.context_limit.saturating_sub(usage.tokens),
            usage.messages,
            self.assistant.model_name(),
            self.session,
        )
    }

    async fn restore(&self, messages: Vec<crate::session::Message>) {
        self.assistant
            .sessions()
            .restore(SessionSnapshot {
                chat_id: TERMINAL_CHAT.to_string(),
                messages,
                last_activity: Utc::now(),
            })
            .await;
    }

    /// The hourly sweep may evict the terminal chat; pick the autosaved
    /// copy back up before the next turn overwrites it.
    async fn resume_if_evicted(&self) {
        if !self.autosave || self.assistant.sessions().contains(TERMINAL_CHAT) {
            return;
        }
        match self.store.load(&self.session) {
            Ok(Some(messages)) => {
                self.restore(messages).await;
                tracing::info!(session = %self.session, "evicted session resumed");
            }
            Ok(None) => {}
            Err(e) => warn!(session = %self.session, error = %e, "could not resume session"),
        }
    }

    async fn autosave(&self) {
        if !self.autosave {
            return;
        }
        let history = self.assistant.sessions().history(TERMINAL_CHAT).await;
        if history.is_empty() {
            return;
        }
        if let Err(e) = self.store.save(&self.session, &history) {
            warn!(session = %self.session, error = %e, "autosave failed");
        }
    }
}

fn render_reply(reply: &TurnReply) -> String {
    let mut out = reply.reply.clone();
    for notice in &reply.notices {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("• ");
        out.push_str(notice);
    }
    out
}

fn export_path(file: Option<String>) -> PathBuf {
    let name = file.unwrap_or_else(|| {
        format!("conversation_{}.md", Local::now().format("%Y%m%d_%H%M%S"))
    });
    if name.ends_with(".md") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!("{name}.md"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slash_commands_and_aliases() {
        assert_eq!(SlashCommand::parse("/status"), Some(SlashCommand::Status));
        assert_eq!(SlashCommand::parse("/CLEAR"), Some(SlashCommand::New));
        assert_eq!(SlashCommand::parse("/reset"), Some(SlashCommand::New));
        assert_eq!(
            SlashCommand::parse("/save  work "),
            Some(SlashCommand::Save(Some("work".into())))
        );
        assert_eq!(SlashCommand::parse("/load"), Some(SlashCommand::Load(None)));
        assert_eq!(
            SlashCommand::parse("/frobnicate x"),
            Some(SlashCommand::Unknown("frobnicate".into()))
        );
        assert_eq!(SlashCommand::parse("hello /status"), None);
    }

    #[test]
    fn export_path_adds_extension() {
        assert_eq!(export_path(Some("notes".into())), PathBuf::from("notes.md"));
        assert_eq!(export_path(Some("a.md".into())), PathBuf::from("a.md"));
        let generated = export_path(None);
        let name = generated.to_string_lossy();
        assert!(name.starts_with("conversation_") && name.ends_with(".md"));
    }

    #[test]
    fn notices_follow_the_reply() {
        let reply = TurnReply {
            reply: "Done.".into(),
            notices: vec!["Saved to memory: x".into()],
            transcript: None,
        };
        assert_eq!(render_reply(&reply), "Done.\n• Saved to memory: x");
    }
}
