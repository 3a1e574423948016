use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use femtobot::config::FemtoConfig;
use femtobot::session::persist::SessionStore;
use femtobot::{cli, jobs, repl, server};

#[derive(Parser)]
#[command(name = "femtobot", version, about = "Local personal assistant with command-token actions")]
struct Cli {
    /// Config file (default: ~/.femtobot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway for messaging clients
    Serve,
    /// Chat in the terminal
    Chat {
        /// Saved session to resume and autosave into
        #[arg(long)]
        session: Option<String>,
    },
    /// Inspect and edit long-term memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Inspect scheduled reminders
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Manage saved terminal sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Check the database and collaborators
    Doctor,
    /// Manage the tokenizer used for token counts
    Tokenizer {
        #[command(subcommand)]
        action: TokenizerAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Fact counts and database size
    Stats,
    /// Hybrid search over stored facts
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// List every stored fact
    List,
    /// Delete the fact most similar to QUERY (or with that id, with --id)
    Forget {
        query: String,
        #[arg(long)]
        id: bool,
    },
    /// Export all facts as JSON to stdout
    Export,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List crontab entries
    List,
    /// Remove one-time reminders whose time has passed
    Cleanup,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List saved sessions
    List,
    /// Export a saved session to Markdown
    Export {
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TokenizerAction {
    /// Download tokenizer.json
    Download {
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let config = match &cli.config {
        Some(path) => FemtoConfig::load_from(path)?,
        None => FemtoConfig::load()?,
    };

    // Log to stderr so stdout stays clean for the terminal chat and JSON output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve(config).await?,
        Command::Chat { session } => chat(config, session).await?,
        Command::Memory { action } => match action {
            MemoryAction::Stats => cli::memory::stats(&config).await?,
            MemoryAction::Search { query, limit } => {
                cli::memory::search(&config, &query, limit).await?
            }
            MemoryAction::List => cli::memory::list(&config).await?,
            MemoryAction::Forget { query, id } => cli::memory::forget(&config, &query, id).await?,
            MemoryAction::Export => cli::memory::export(&config).await?,
        },
        Command::Schedule { action } => match action {
            ScheduleAction::List => cli::schedule::list(&config).await?,
            ScheduleAction::Cleanup => cli::schedule::cleanup(&config).await?,
        },
        Command::Sessions { action } => match action {
            SessionsAction::List => cli::sessions::list(&config)?,
            SessionsAction::Export { name, output } => {
                cli::sessions::export(&config, &name, output.as_deref())?
            }
        },
        Command::Doctor => cli::doctor::doctor(&config).await?,
        Command::Tokenizer { action } => match action {
            TokenizerAction::Download { url } => {
                cli::tokenizer_download(&config, url.as_deref()).await?
            }
        },
    }

    Ok(())
}

async fn chat(config: FemtoConfig, session: Option<String>) -> Result<()> {
    let shared = server::setup_shared_state(&config).await?;
    let mut background = jobs::spawn_all(
        &config,
        shared.assistant.clone(),
        shared.scheduler.clone(),
        None,
    );

    let mut terminal = repl::Repl::open(
        shared.assistant.clone(),
        SessionStore::new(config.resolved_session_dir()),
        session,
        config.model.context_limit,
        config.session.persist,
    )
    .await?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    terminal.run(stdin, tokio::io::stdout()).await?;

    background.abort_all();
    Ok(())
}
