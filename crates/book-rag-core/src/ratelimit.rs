//! Fixed-window admission control.
//!
//! Two scopes are enforced per query: the session (default 10 requests per
//! 60 s) and the client address (default 1000 per 86 400 s). A query is
//! admitted only when both counters stay within their limits.
//!
//! Windows are aligned to the Unix epoch: a request at time `t` counts
//! against the window starting at `t - t % window`. Each counter bump is a
//! single atomic increment on a key that embeds the window start, so a
//! rollover never needs a read-modify-write reset.
//!
//! Time and counter storage are injected through [`Clock`] and
//! [`CounterStore`], which keeps the limiter deterministic under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Atomic counters keyed by string.
///
/// `increment` must be a single atomic operation returning the new value,
/// like Redis `INCR`. `expires_at` is the end of the key's window as seen
/// by the limiter's [`Clock`]; stores that can expire keys use it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64>;
}

/// In-process counter store.
///
/// Counters live in a map of `AtomicU64`; the map lock is held only to find
/// or insert the entry, never across the increment itself.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, (Arc<AtomicU64>, DateTime<Utc>)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop counters whose expiry has passed.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.retain(|_, (_, expires)| *expires > now);
    }

    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64> {
        let counter = {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters
                .entry(key.to_string())
                .or_insert_with(|| (Arc::new(AtomicU64::new(0)), expires_at))
                .0
                .clone()
        };
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Which counter a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Session,
    Client,
}

impl Scope {
    fn prefix(&self) -> &'static str {
        match self {
            Scope::Session => "session",
            Scope::Client => "client",
        }
    }
}

/// `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub limit: u64,
    pub window: Duration,
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { scope: Scope, retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Fixed-window rate limiter over a [`CounterStore`].
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    counters: Arc<dyn CounterStore>,
    session_rule: Rule,
    client_rule: Rule,
}

impl RateLimiter {
    pub fn new(
        clock: Arc<dyn Clock>,
        counters: Arc<dyn CounterStore>,
        session_rule: Rule,
        client_rule: Rule,
    ) -> Self {
        Self {
            clock,
            counters,
            session_rule,
            client_rule,
        }
    }

    fn rule(&self, scope: Scope) -> Rule {
        match scope {
            Scope::Session => self.session_rule,
            Scope::Client => self.client_rule,
        }
    }

    /// Count one request against `key` in `scope`.
    pub async fn admit(&self, key: &str, scope: Scope) -> Result<Admission> {
        let rule = self.rule(scope);
        let window_secs = rule.window.as_secs().max(1) as i64;
        let now = self.clock.now();
        let ts = now.timestamp();
        let window_start = ts - ts.rem_euclid(window_secs);

        let window_end = DateTime::<Utc>::from_timestamp(window_start + window_secs, 0)
            .unwrap_or(now + chrono::Duration::seconds(window_secs));

        let counter_key = format!("{}:{}:{}", scope.prefix(), key, window_start);
        let count = self.counters.increment(&counter_key, window_end).await?;
        if count <= rule.limit {
            return Ok(Admission::Admitted);
        }

        let remaining = (window_end - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        Ok(Admission::Rejected {
            scope,
            retry_after: remaining,
        })
    }

    /// Check the session scope, then the client scope.
    ///
    /// A session rejection returns before the client counter is touched.
    pub async fn admit_query(&self, session_key: &str, client_key: &str) -> Result<Admission> {
        let session = self.admit(session_key, Scope::Session).await?;
        if !session.is_admitted() {
            return Ok(session);
        }
        self.admit(client_key, Scope::Client).await
    }
}
