//! Per-chat conversation history with token-budget pruning.
//!
//! [`SessionManager`] owns one [`Session`] per chat id. Each session sits
//! behind its own `tokio::sync::Mutex`, so turns for different chats never
//! contend, and the lock is only held while the history itself is touched.

pub mod estimate;
pub mod persist;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

pub use estimate::{CharEstimator, TokenEstimator, TokenizerEstimator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// One entry of a conversation. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    messages: Vec<Message>,
    token_estimate: usize,
    last_activity: DateTime<Utc>,
}

impl Session {
    fn new(messages: Vec<Message>, estimator: &dyn TokenEstimator) -> Self {
        Self {
            token_estimate: estimator.count_messages(&messages),
            messages,
            last_activity: Utc::now(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }
}

/// Serializable copy of one chat's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub chat_id: String,
    pub messages: Vec<Message>,
    pub last_activity: DateTime<Utc>,
}

/// Usage figures for `/status` and the gateway status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub messages: usize,
    pub tokens: usize,
}

/// Largest suffix of `messages` that fits in `budget`, always keeping a
/// leading system message.
pub fn prune_to_budget(
    messages: &[Message],
    budget: usize,
    estimator: &dyn TokenEstimator,
) -> Vec<Message> {
    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.role == Role::System => (Some(first), rest),
        _ => (None, messages),
    };

    let mut remaining = budget.saturating_sub(system.map_or(0, |m| estimator.count_message(m)));
    let mut keep_from = rest.len();
    for (i, message) in rest.iter().enumerate().rev() {
        let cost = estimator.count_message(message);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        keep_from = i;
    }

    system
        .into_iter()
        .chain(rest[keep_from..].iter())
        .cloned()
        .collect()
}

pub struct SessionManager {
    sessions: StdMutex<HashMap<String, Arc<Mutex<Session>>>>,
    estimator: Arc<dyn TokenEstimator>,
}

impl SessionManager {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            estimator,
        }
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, chat_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.map().get(chat_id).cloned()
    }

    fn get_or_create(&self, chat_id: &str, system: Option<&str>) -> Arc<Mutex<Session>> {
        let mut map = self.map();
        Arc::clone(map.entry(chat_id.to_string()).or_insert_with(|| {
            let seed = system.map(|s| vec![Message::system(s)]).unwrap_or_default();
            tracing::debug!(chat_id = %chat_id, "session created");
            Arc::new(Mutex::new(Session::new(seed, self.estimator.as_ref())))
        }))
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.map().contains_key(chat_id)
    }

    pub fn chat_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create the session seeded with `system` unless it already exists.
    pub async fn ensure(&self, chat_id: &str, system: &str) {
        self.get_or_create(chat_id, Some(system));
    }

    /// Append to the end of the chat's history. Unknown chats start empty.
    pub async fn append(&self, chat_id: &str, message: Message) {
        let session = self.get_or_create(chat_id, None);
        let mut session = session.lock().await;
        session.token_estimate += self.estimator.count_message(&message);
        session.last_activity = Utc::now().max(session.last_activity);
        session.messages.push(message);
    }

    /// Context window for the next model call. Pure with respect to the
    /// stored history: pruning never removes anything from the session.
    pub async fn get_context(&self, chat_id: &str, budget_tokens: usize) -> Vec<Message> {
        let Some(session) = self.get(chat_id) else {
            return Vec::new();
        };
        let session = session.lock().await;
        prune_to_budget(&session.messages, budget_tokens, self.estimator.as_ref())
    }

    pub async fn history(&self, chat_id: &str) -> Vec<Message> {
        match self.get(chat_id) {
            Some(session) => session.lock().await.messages.clone(),
            None => Vec::new(),
        }
    }

    pub async fn usage(&self, chat_id: &str) -> TokenUsage {
        match self.get(chat_id) {
            Some(session) => {
                let session = session.lock().await;
                TokenUsage {
                    messages: session.messages.len(),
                    tokens: session.token_estimate,
                }
            }
            None => TokenUsage {
                messages: 0,
                tokens: 0,
            },
        }
    }

    /// Clear the chat's history, leaving only the fresh system message.
    pub async fn reset(&self, chat_id: &str, system: &str) {
        let session = self.get_or_create(chat_id, None);
        let mut session = session.lock().await;
        *session = Session::new(vec![Message::system(system)], self.estimator.as_ref());
        tracing::info!(chat_id = %chat_id, "session reset");
    }

    pub async fn snapshot(&self, chat_id: &str) -> Option<SessionSnapshot> {
        let session = self.get(chat_id)?;
        let session = session.lock().await;
        Some(SessionSnapshot {
            chat_id: chat_id.to_string(),
            messages: session.messages.clone(),
            last_activity: session.last_activity,
        })
    }

    /// Replace the chat's state with `snapshot`. The restored activity time is
    /// never earlier than the snapshot's.
    pub async fn restore(&self, snapshot: SessionSnapshot) {
        let SessionSnapshot {
            chat_id,
            messages,
            last_activity,
        } = snapshot;
        let session = self.get_or_create(&chat_id, None);
        let mut session = session.lock().await;
        *session = Session::new(messages, self.estimator.as_ref());
        session.last_activity = session.last_activity.max(last_activity);
    }

    /// Drop chats idle since before `now - threshold` and return their final
    /// state so the caller can persist them when that mode is enabled.
    pub async fn sweep_inactive(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<SessionSnapshot> {
        let candidates: Vec<(String, Arc<Mutex<Session>>)> = self
            .map()
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();

        let mut evicted = Vec::new();
        for (chat_id, session) in candidates {
            let guard = session.lock().await;
            if now - guard.last_activity <= threshold {
                continue;
            }
            let snapshot = SessionSnapshot {
                chat_id: chat_id.clone(),
                messages: guard.messages.clone(),
                last_activity: guard.last_activity,
            };
            drop(guard);

            let mut map = self.map();
            // Only evict the instance we inspected; a concurrent reset may have
            // replaced the entry in the meantime.
            if map.get(&chat_id).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                map.remove(&chat_id);
                evicted.push(snapshot);
            }
        }

        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted inactive sessions");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(CharEstimator))
    }

    #[tokio::test]
    async fn append_preserves_order_and_tracks_tokens() {
        let sessions = manager();
        sessions.ensure("1", "be nice").await;
        sessions.append("1", Message::user("hola")).await;
        sessions.append("1", Message::assistant("¡hola!")).await;

        let history = sessions.history("1").await;
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);

        let usage = sessions.usage("1").await;
        assert_eq!(usage.messages, 3);
        assert_eq!(usage.tokens, CharEstimator.count_messages(&history));
    }

    #[tokio::test]
    async fn ensure_does_not_reseed_existing_session() {
        let sessions = manager();
        sessions.ensure("1", "first").await;
        sessions.append("1", Message::user("x")).await;
        sessions.ensure("1", "second").await;

        let history = sessions.history("1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
    }

    #[tokio::test]
    async fn reset_keeps_only_new_system_message() {
        let sessions = manager();
        sessions.ensure("1", "old prompt").await;
        sessions.append("1", Message::user("remember this")).await;

        sessions.reset("1", "new prompt").await;
        let history = sessions.history("1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[0].content, "new prompt");
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let sessions = manager();
        sessions.ensure("a", "sys").await;
        sessions.append("a", Message::user("one")).await;
        sessions.append("a", Message::assistant("two")).await;
        let snapshot = sessions.snapshot("a").await.unwrap();

        let other = manager();
        other.restore(snapshot.clone()).await;
        let restored = other.snapshot("a").await.unwrap();

        assert_eq!(restored.messages, snapshot.messages);
        assert!(restored.last_activity >= snapshot.last_activity);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_chats() {
        let sessions = manager();
        sessions.append("fresh", Message::user("hi")).await;
        sessions.map().insert(
            "old".into(),
            Arc::new(Mutex::new(Session {
                messages: vec![Message::user("hi")],
                token_estimate: 0,
                last_activity: Utc::now() - chrono::Duration::hours(30),
            })),
        );

        let evicted = sessions
            .sweep_inactive(chrono::Duration::hours(24), Utc::now())
            .await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].chat_id, "old");
        assert!(!sessions.contains("old"));
        assert!(sessions.contains("fresh"));
    }

    #[test]
    fn prune_keeps_system_even_when_over_budget() {
        let messages = vec![Message::system("x".repeat(400)), Message::user("hello")];
        let pruned = prune_to_budget(&messages, 10, &CharEstimator);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].role, Role::System);
    }

    #[test]
    fn prune_without_system_message_keeps_suffix() {
        let messages = vec![
            Message::user("a".repeat(40)),
            Message::assistant("b".repeat(40)),
            Message::user("c".repeat(40)),
        ];
        // each message costs 10 + 4
        let pruned = prune_to_budget(&messages, 28, &CharEstimator);
        assert_eq!(pruned.len(), 2);
        assert!(pruned[0].content.starts_with('b'));
        assert!(pruned[1].content.starts_with('c'));
    }

    #[test]
    fn role_parses_and_displays() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
        assert_eq!(Role::User.to_string(), "user");
    }
}
