//! Per-chat sequential processing.
//!
//! Each chat gets its own worker task fed by an mpsc channel, so a chat has
//! at most one turn in flight while different chats proceed in parallel.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{Assistant, TurnReply};

const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub enum TurnRequest {
    Message(String),
    Document {
        path: PathBuf,
        file_name: String,
        caption: Option<String>,
    },
    Audio {
        path: PathBuf,
    },
    Image {
        path: PathBuf,
        caption: Option<String>,
    },
    Reset,
}

struct Job {
    request: TurnRequest,
    reply: oneshot::Sender<Result<TurnReply>>,
    _pending: Pending,
}

/// Counts a request from submission until its worker finishes it, or until
/// the submitter gives up before it was queued.
struct Pending(Arc<AtomicUsize>);

impl Pending {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    sender: mpsc::Sender<Job>,
    pending: Arc<AtomicUsize>,
}

pub struct ChatQueue {
    assistant: Arc<Assistant>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl ChatQueue {
    pub fn new(assistant: Arc<Assistant>) -> Self {
        Self {
            assistant,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn assistant(&self) -> &Arc<Assistant> {
        &self.assistant
    }

    /// Enqueue `request` behind any earlier requests for the same chat and
    /// wait for its result.
    pub async fn submit(&self, chat_id: &str, request: TurnRequest) -> Result<TurnReply> {
        let (sender, pending) = self.sender_for(chat_id);
        let (reply, receive) = oneshot::channel();
        sender
            .send(Job {
                request,
                reply,
                _pending: pending,
            })
            .await
            .map_err(|_| anyhow!("chat worker for {chat_id} stopped"))?;
        receive
            .await
            .map_err(|_| anyhow!("chat worker for {chat_id} dropped the request"))?
    }

    /// Stop the chat's worker if it has nothing queued or running. A busy
    /// worker is kept so a later request cannot start a second one for the
    /// same chat. Returns whether the worker was stopped.
    pub fn forget(&self, chat_id: &str) -> bool {
        let mut workers = self.lock();
        let idle = workers
            .get(chat_id)
            .is_some_and(|w| w.pending.load(Ordering::SeqCst) == 0);
        if idle {
            workers.remove(chat_id);
        }
        idle
    }

    pub fn active_chats(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The chat's sender, with the new request already counted as pending
    /// under the map lock.
    fn sender_for(&self, chat_id: &str) -> (mpsc::Sender<Job>, Pending) {
        let mut workers = self.lock();
        if let Some(worker) = workers.get(chat_id).filter(|w| !w.sender.is_closed()) {
            return (worker.sender.clone(), Pending::new(&worker.pending));
        }

        let (sender, mut receiver) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let assistant = Arc::clone(&self.assistant);
        let id = chat_id.to_string();
        tokio::spawn(async move {
            debug!(chat_id = %id, "chat worker started");
            while let Some(job) = receiver.recv().await {
                let Job {
                    request,
                    reply,
                    _pending: pending,
                } = job;
                let result = assistant.process(&id, request).await;
                drop(pending);
                // the caller may have given up waiting
                let _ = reply.send(result);
            }
            debug!(chat_id = %id, "chat worker stopped");
        });
        let pending = Arc::new(AtomicUsize::new(0));
        let counted = Pending::new(&pending);
        workers.insert(
            chat_id.to_string(),
            Worker {
                sender: sender.clone(),
                pending,
            },
        );
        (sender, counted)
    }
}
