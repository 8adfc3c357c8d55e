//! Keyed request-rate governance.
//!
//! Two independent call shapes, both check-and-consume:
//! a sliding-window limiter guarding login attempts across three scopes,
//! and a fixed-period counter guarding AI endpoint usage.
//!
//! State lives behind the injectable [`RateStore`] so the in-memory default
//! can be swapped for a shared store in a multi-process deployment; the
//! in-memory map is only correct for a single process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Keyed rate state. Mutations assume a single writer per key.
pub trait RateStore: Send + Sync {
    fn attempts(&self, key: &str) -> Vec<DateTime<Utc>>;
    fn set_attempts(&self, key: &str, attempts: Vec<DateTime<Utc>>);
    fn blocked_until(&self, key: &str) -> Option<DateTime<Utc>>;
    fn set_block(&self, key: &str, until: DateTime<Utc>);
    fn clear(&self, key: &str);
    fn counter(&self, key: &str) -> Option<(String, u32)>;
    fn set_counter(&self, key: &str, period_label: &str, count: u32);
}

#[derive(Default)]
struct MemoryInner {
    attempts: HashMap<String, Vec<DateTime<Utc>>>,
    blocks: HashMap<String, DateTime<Utc>>,
    counters: HashMap<String, (String, u32)>,
}

/// Process-local store. Suitable for a single-process deployment only.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateStore for MemoryStore {
    fn attempts(&self, key: &str) -> Vec<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attempts
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn set_attempts(&self, key: &str, attempts: Vec<DateTime<Utc>>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attempts
            .insert(key.to_string(), attempts);
    }

    fn blocked_until(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .blocks
            .get(key)
            .copied()
    }

    fn set_block(&self, key: &str, until: DateTime<Utc>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .blocks
            .insert(key.to_string(), until);
    }

    fn clear(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.attempts.remove(key);
        inner.blocks.remove(key);
    }

    fn counter(&self, key: &str) -> Option<(String, u32)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .get(key)
            .cloned()
    }

    fn set_counter(&self, key: &str, period_label: &str, count: u32) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .insert(key.to_string(), (period_label.to_string(), count));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScopeConfig {
    pub window: Duration,
    pub max_attempts: usize,
    pub block: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct LoginLimiterConfig {
    pub address: ScopeConfig,
    pub identity: ScopeConfig,
    pub pair: ScopeConfig,
}

impl Default for LoginLimiterConfig {
    fn default() -> Self {
        LoginLimiterConfig {
            address: ScopeConfig {
                window: Duration::minutes(10),
                max_attempts: 10,
                block: Duration::minutes(15),
            },
            identity: ScopeConfig {
                window: Duration::minutes(5),
                max_attempts: 5,
                block: Duration::minutes(15),
            },
            pair: ScopeConfig {
                window: Duration::minutes(5),
                max_attempts: 3,
                block: Duration::minutes(30),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("blocked, retry after {retry_after_secs}s")]
pub struct Blocked {
    pub retry_after_secs: i64,
}

/// Sliding-window login attempt limiter over three scopes: source address,
/// identity, and the identity+address pair.
pub struct LoginLimiter {
    store: Arc<dyn RateStore>,
    clock: Arc<dyn Clock>,
    config: LoginLimiterConfig,
}

impl LoginLimiter {
    pub fn new(store: Arc<dyn RateStore>, clock: Arc<dyn Clock>, config: LoginLimiterConfig) -> Self {
        LoginLimiter { store, clock, config }
    }

    fn scopes(&self, address: &str, identity: &str) -> [(String, ScopeConfig); 3] {
        [
            (format!("login:addr:{address}"), self.config.address),
            (format!("login:id:{identity}"), self.config.identity),
            (format!("login:pair:{identity}@{address}"), self.config.pair),
        ]
    }

    /// Check every scope and, when allowed, record one attempt in each.
    /// Denial happens before any attempt is recorded.
    pub fn check_and_consume(&self, address: &str, identity: &str) -> Result<(), Blocked> {
        let now = self.clock.now();
        let scopes = self.scopes(address, identity);

        for (key, _) in &scopes {
            if let Some(until) = self.store.blocked_until(key) {
                if until > now {
                    return Err(Blocked {
                        retry_after_secs: (until - now).num_seconds().max(1),
                    });
                }
            }
        }

        // Prune first so an expired window frees the scope again.
        let mut pruned: Vec<(String, Vec<DateTime<Utc>>)> = Vec::with_capacity(3);
        for (key, cfg) in &scopes {
            let cutoff = now - cfg.window;
            let kept: Vec<_> = self
                .store
                .attempts(key)
                .into_iter()
                .filter(|t| *t > cutoff)
                .collect();
            if kept.len() >= cfg.max_attempts {
                let until = now + cfg.block;
                self.store.set_block(key, until);
                self.store.set_attempts(key, kept);
                tracing::warn!(key = %key, "login attempt limit reached, blocking");
                return Err(Blocked {
                    retry_after_secs: cfg.block.num_seconds(),
                });
            }
            pruned.push((key.clone(), kept));
        }

        for (key, mut kept) in pruned {
            kept.push(now);
            self.store.set_attempts(&key, kept);
        }
        Ok(())
    }

    /// Read-only block state for UX feedback. Never a substitute for
    /// `check_and_consume`.
    pub fn peek(&self, address: &str, identity: &str) -> Option<Blocked> {
        let now = self.clock.now();
        self.scopes(address, identity)
            .iter()
            .filter_map(|(key, _)| self.store.blocked_until(key))
            .filter(|until| *until > now)
            .map(|until| Blocked {
                retry_after_secs: (until - now).num_seconds().max(1),
            })
            .max_by_key(|b| b.retry_after_secs)
    }

    /// A successful login clears the identity-bearing scopes. The pure
    /// address scope is deliberately left intact.
    pub fn clear_on_success(&self, address: &str, identity: &str) {
        self.store.clear(&format!("login:id:{identity}"));
        self.store.clear(&format!("login:pair:{identity}@{address}"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quota of {ceiling} per period exhausted")]
pub struct QuotaExhausted {
    pub ceiling: u32,
}

/// Fixed-period per-identity counter. The counter resets whenever the
/// current period label differs from the stored one.
pub struct PeriodQuota {
    store: Arc<dyn RateStore>,
    name: &'static str,
    ceiling: u32,
}

impl PeriodQuota {
    pub fn new(store: Arc<dyn RateStore>, name: &'static str, ceiling: u32) -> Self {
        PeriodQuota { store, name, ceiling }
    }

    /// Consume one unit; returns the remaining allowance.
    pub fn consume(&self, identity: &str, period_label: &str) -> Result<u32, QuotaExhausted> {
        let key = format!("{}:{identity}", self.name);
        let count = match self.store.counter(&key) {
            Some((label, count)) if label == period_label => count,
            _ => 0,
        };
        if count >= self.ceiling {
            return Err(QuotaExhausted { ceiling: self.ceiling });
        }
        self.store.set_counter(&key, period_label, count + 1);
        Ok(self.ceiling - count - 1)
    }
}
