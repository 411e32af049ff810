use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sliding-window limiter keyed by client identity.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the request is allowed and records it.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());

        // forget every client whose window has emptied
        requests.retain(|_, window| {
            while window.front().is_some_and(|oldest| now.duration_since(*oldest) >= self.window) {
                window.pop_front();
            }
            !window.is_empty()
        });

        let window = requests.entry(key.to_string()).or_default();
        if window.len() >= self.max_requests {
            warn!("Rate limit exceeded for client {}", key);
            return false;
        }

        window.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
