//! femtobot: a local personal assistant built around a language model that
//! acts by embedding command tokens in its replies.
//!
//! A reply like `Noted! :::memory Likes green tea:::` is shown to the user as
//! `Noted!` while the `memory` command is validated and dispatched to the fact
//! store. Commands cover long-term memory, crontab reminders, web and image
//! search and smart lights.
//!
//! # Architecture
//!
//! - **Conversation**: per-chat sessions pruned to a token budget, one turn in
//!   flight per chat
//! - **Commands**: `:::name args:::` tokens parsed out of model output and
//!   dispatched through a closed set of validated handlers
//! - **Memory**: SQLite with FTS5 and [sqlite-vec](https://github.com/asg017/sqlite-vec),
//!   hybrid search merged via Reciprocal Rank Fusion
//! - **Model**: an Ollama-compatible runtime for chat and embeddings
//! - **Surfaces**: an HTTP gateway for messaging clients and a terminal chat
//!
//! # Modules
//!
//! - [`assistant`] — turn orchestration, per-chat queues and rate limiting
//! - [`command`] — command token parser, validation and dispatcher
//! - [`session`] — session history, token estimation and persistence
//! - [`memory`] — fact store: add, deduplicate, search and forget
//! - [`schedule`] — reminder scheduling on the user's crontab
//! - [`config`] — configuration from TOML files and environment variables

pub mod assistant;
pub mod cli;
pub mod command;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod ingest;
pub mod jobs;
pub mod lights;
pub mod llm;
pub mod memory;
pub mod repl;
pub mod schedule;
pub mod search;
pub mod server;
pub mod session;
pub mod worker;
