//! Token-bucket limits for outbound bot messages.
//!
//! Telegram allows roughly 30 messages per second per bot and about one per
//! second within a single chat. [`OutboundLimiter`] enforces both: a send
//! waits for a global token and for a token from its chat's bucket.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    /// Burst capacity.
    capacity: u32,
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, per_second: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_consume(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let needed = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }

    fn is_full(&mut self) -> bool {
        self.refill();
        self.tokens >= self.capacity as f64
    }
}

struct Buckets {
    global: RateLimiter,
    per_chat: HashMap<String, RateLimiter>,
}

pub struct OutboundLimiter {
    buckets: Mutex<Buckets>,
    chat_capacity: u32,
    chat_per_second: f64,
}

impl OutboundLimiter {
    pub fn new(global_per_second: f64, chat_capacity: u32, chat_per_second: f64) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                global: RateLimiter::new(global_per_second.ceil() as u32, global_per_second),
                per_chat: HashMap::new(),
            }),
            chat_capacity,
            chat_per_second,
        }
    }

    /// Telegram Bot API limits.
    pub fn telegram() -> Self {
        Self::new(30.0, 3, 1.0)
    }

    /// Wait until a message to `chat_id` may be sent.
    pub async fn acquire(&self, chat_id: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let Buckets { global, per_chat } = &mut *buckets;
                // Idle chats are dropped so the map only holds recent senders.
                per_chat.retain(|_, bucket| !bucket.is_full());
                let chat = per_chat
                    .entry(chat_id.to_string())
                    .or_insert_with(|| RateLimiter::new(self.chat_capacity, self.chat_per_second));
                match chat.try_consume() {
                    Some(wait) => Some(wait),
                    None => match global.try_consume() {
                        Some(wait) => {
                            // Give the chat token back; the global bucket is the bottleneck.
                            chat.tokens += 1.0;
                            Some(wait)
                        }
                        None => None,
                    },
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    #[cfg(test)]
    async fn tracked_chats(&self) -> usize {
        self.buckets.lock().await.per_chat.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_exhausted() {
        let mut rl = RateLimiter::new(2, 1.0);
        assert!(rl.try_consume().is_none());
        assert!(rl.try_consume().is_none());
        let wait = rl.try_consume();
        assert!(wait.unwrap().as_secs_f64() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_chat_limit() {
        let limiter = OutboundLimiter::new(100.0, 1, 1.0);
        let start = Instant::now();
        limiter.acquire("a").await;
        limiter.acquire("b").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire("a").await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit() {
        let limiter = OutboundLimiter::new(2.0, 5, 5.0);
        let start = Instant::now();
        limiter.acquire("a").await;
        limiter.acquire("b").await;
        limiter.acquire("c").await;
        assert!(start.elapsed() >= Duration::from_millis(490));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_chats_are_forgotten() {
        let limiter = OutboundLimiter::new(30.0, 1, 1.0);
        limiter.acquire("a").await;
        limiter.acquire("b").await;
        assert_eq!(limiter.tracked_chats().await, 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        limiter.acquire("c").await;
        assert_eq!(limiter.tracked_chats().await, 1);
    }
}
