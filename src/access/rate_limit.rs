//! Per-caller sliding-window rate limiting.
//!
//! # Memory Management
//!
//! Idle callers are dropped by a periodic cleanup (every `cleanup_interval`
//! checks). The number of tracked callers is capped by `max_tracked`; a new
//! caller arriving at the cap forces a cleanup and is refused if the table
//! is still full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum calls per caller inside the window.
    pub max_requests: u32,
    /// Size of the sliding window.
    pub window: Duration,
    /// Run cleanup every N checks.
    pub cleanup_interval: u64,
    /// Hard cap on distinct callers tracked at once.
    pub max_tracked: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            cleanup_interval: 100,
            max_tracked: 10_000,
        }
    }
}

/// Why a call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimited {
    /// Caller used up its window.
    Exceeded { rate: usize, limit: u32 },
    /// Too many distinct callers tracked.
    TooManyCallers,
}

/// Sliding-window limiter keyed by caller address.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, VecDeque<Instant>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record a call from `caller` if it fits the window.
    ///
    /// Returns the caller's call count inside the window, this call included.
    pub fn check(&self, caller: &str) -> Result<usize, RateLimited> {
        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval.max(1) == 0 {
            tracing::debug!(checks = count, "running periodic rate limiter cleanup");
            self.cleanup();
        }

        if !self.windows.contains_key(caller) && self.windows.len() >= self.config.max_tracked {
            self.cleanup();
            if self.windows.len() >= self.config.max_tracked {
                tracing::warn!(
                    tracked = self.windows.len(),
                    "max tracked callers reached, refusing new caller"
                );
                return Err(RateLimited::TooManyCallers);
            }
        }

        let now = Instant::now();
        let mut window = self.windows.entry(caller.to_string()).or_default();
        Self::evict(&mut window, now, self.config.window);

        if window.len() >= self.config.max_requests as usize {
            return Err(RateLimited::Exceeded {
                rate: window.len(),
                limit: self.config.max_requests,
            });
        }
        window.push_back(now);
        Ok(window.len())
    }

    /// Calls from `caller` inside the current window.
    pub fn current_rate(&self, caller: &str) -> usize {
        let now = Instant::now();
        self.windows
            .get(caller)
            .map(|w| w.iter().filter(|t| now.duration_since(**t) < self.config.window).count())
            .unwrap_or(0)
    }

    /// Drop callers with no calls inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.windows.retain(|_, calls| {
            Self::evict(calls, now, window);
            !calls.is_empty()
        });
    }

    pub fn tracked_callers(&self) -> usize {
        self.windows.len()
    }

    fn evict(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}
