use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window message limit per chat.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a message for `chat_id`, or return how long to wait when the
    /// chat is over its limit. A limit of zero disables limiting.
    pub fn check(&self, chat_id: &str) -> Result<(), Duration> {
        self.check_at(chat_id, Instant::now())
    }

    fn check_at(&self, chat_id: &str, now: Instant) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let history = hits.entry(chat_id.to_string()).or_default();
        while history
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            history.pop_front();
        }

        if history.len() >= self.limit {
            let oldest = history.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .max(Duration::from_secs(1));
            tracing::warn!(chat_id = %chat_id, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
            return Err(retry_after);
        }
        history.push_back(now);
        Ok(())
    }
}
