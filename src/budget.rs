//! Shared request budget for the data provider
//!
//! The provider grants a fixed number of tokens per minute. The budget refills
//! continuously and lazily: every `acquire` first credits the tokens earned since
//! the previous refill, capped at `capacity`, then either debits the full cost or
//! grants nothing. Check and debit happen under one lock, so concurrent workers
//! can never overdraw it, and a future dropped mid-wait holds no tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Mutable state guarded by the budget lock
#[derive(Debug, Clone, Copy)]
struct BudgetState {
    remaining: f64,
    last_refill: Instant,
}

/// Persistable view of the budget, for carrying it across restarts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBudgetSnapshot {
    pub remaining: f64,
    pub taken_at: DateTime<Utc>,
}

impl RateBudgetSnapshot {
    /// Read a saved snapshot. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// How callers back off when a grant is denied
#[derive(Debug, Clone, Copy)]
pub struct AcquirePolicy {
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(250),
            max_attempts: 8,
        }
    }
}

/// Continuously refilling token counter shared by all scan workers
#[derive(Debug)]
pub struct RateBudget {
    state: Mutex<BudgetState>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateBudget {
    /// Create a full budget
    pub fn new(tokens_per_minute: u32, capacity: u32) -> Self {
        Self::with_remaining(tokens_per_minute, capacity, capacity as f64, Instant::now())
    }

    fn with_remaining(tokens_per_minute: u32, capacity: u32, remaining: f64, now: Instant) -> Self {
        let capacity = capacity as f64;
        Self {
            state: Mutex::new(BudgetState {
                remaining: remaining.clamp(0.0, capacity),
                last_refill: now,
            }),
            capacity,
            refill_per_sec: tokens_per_minute as f64 / 60.0,
        }
    }

    /// Rebuild a budget from a snapshot, crediting the refill earned since it was taken
    pub fn restore(snapshot: RateBudgetSnapshot, tokens_per_minute: u32, capacity: u32) -> Self {
        let elapsed = (Utc::now() - snapshot.taken_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let credited = snapshot.remaining + elapsed.as_secs_f64() * tokens_per_minute as f64 / 60.0;
        Self::with_remaining(tokens_per_minute, capacity, credited, Instant::now())
    }

    /// Restore from `path` when a snapshot is there, otherwise start full.
    /// An unreadable snapshot is logged and ignored.
    pub fn load_or_new(path: Option<&Path>, tokens_per_minute: u32, capacity: u32) -> Self {
        let Some(path) = path else {
            return Self::new(tokens_per_minute, capacity);
        };
        match RateBudgetSnapshot::load(path) {
            Ok(Some(snapshot)) => {
                info!(
                    "Restoring budget from {} ({:.1} tokens at {})",
                    path.display(),
                    snapshot.remaining,
                    snapshot.taken_at
                );
                Self::restore(snapshot, tokens_per_minute, capacity)
            }
            Ok(None) => Self::new(tokens_per_minute, capacity),
            Err(e) => {
                warn!("Ignoring budget snapshot {}: {}", path.display(), e);
                Self::new(tokens_per_minute, capacity)
            }
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        // No code path panics while holding the lock; recover the state if one ever does.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut BudgetState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.remaining =
            (state.remaining + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Try to take `cost` tokens now
    pub fn acquire(&self, cost: u32) -> bool {
        self.acquire_at(cost, Instant::now())
    }

    /// Try to take `cost` tokens at the given instant
    pub fn acquire_at(&self, cost: u32, now: Instant) -> bool {
        let cost = cost as f64;
        let mut state = self.lock();
        self.refill(&mut state, now);
        if state.remaining >= cost {
            state.remaining -= cost;
            true
        } else {
            false
        }
    }

    /// Acquire, sleeping between denied attempts. Returns false once attempts run out.
    pub async fn acquire_with_backoff(&self, cost: u32, policy: &AcquirePolicy) -> bool {
        if cost as f64 > self.capacity {
            warn!(
                "Query cost {} exceeds budget capacity {}, never grantable",
                cost, self.capacity
            );
            return false;
        }

        for attempt in 0..policy.max_attempts {
            if self.acquire(cost) {
                return true;
            }
            debug!(
                "Budget denied {} tokens (attempt {}/{}), remaining {:.1}",
                cost,
                attempt + 1,
                policy.max_attempts,
                self.remaining()
            );
            if attempt + 1 < policy.max_attempts {
                tokio::time::sleep(policy.retry_delay).await;
            }
        }
        false
    }

    /// Tokens available now
    pub fn remaining(&self) -> f64 {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.remaining
    }

    /// Clamp the local counter down to what the provider reports as left.
    /// Never raises it.
    pub fn reconcile(&self, provider_remaining: i64) {
        let reported = provider_remaining.max(0) as f64;
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        if reported < state.remaining {
            debug!(
                "Reconciling budget {:.1} -> {:.1} from provider report",
                state.remaining, reported
            );
            state.remaining = reported;
        }
    }

    pub fn snapshot(&self) -> RateBudgetSnapshot {
        RateBudgetSnapshot {
            remaining: self.remaining(),
            taken_at: Utc::now(),
        }
    }
}
