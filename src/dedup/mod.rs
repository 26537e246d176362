//! Recency deduplication
//!
//! Tracks when each item was last surfaced and excludes items still inside the
//! cooldown window. Storage sits behind [`CooldownStore`] so the same filter
//! runs against memory in tests and Postgres in production.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::{CooldownRecord, ScoredDeal};

pub use postgres::PgCooldownStore;

/// Get/set-by-identifier persistence for cooldown records.
///
/// Implementations must tolerate concurrent writers on distinct identifiers.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<CooldownRecord>>;

    /// Records for any of `ids`; missing identifiers are simply absent
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(id).await? {
                found.insert(record.id, record.last_surfaced);
            }
        }
        Ok(found)
    }

    /// Insert or update. A later timestamp never gets replaced by an earlier one.
    async fn set(&self, record: CooldownRecord) -> Result<()>;

    /// Drop records last surfaced before `cutoff`; returns how many went
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-process store used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryCooldownStore {
    records: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl CooldownStore for MemoryCooldownStore {
    async fn get(&self, id: &str) -> Result<Option<CooldownRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(id)
            .map(|&last_surfaced| CooldownRecord {
                id: id.to_string(),
                last_surfaced,
            }))
    }

    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let records = self.records.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|ts| (id.clone(), *ts)))
            .collect())
    }

    async fn set(&self, record: CooldownRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let entry = records.entry(record.id).or_insert(record.last_surfaced);
        if record.last_surfaced > *entry {
            *entry = record.last_surfaced;
        }
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, ts| *ts >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

/// Cooldown filter over a [`CooldownStore`]
pub struct DedupStore {
    store: Box<dyn CooldownStore>,
    window: ChronoDuration,
}

impl DedupStore {
    pub fn new(store: Box<dyn CooldownStore>, window: ChronoDuration) -> Self {
        Self { store, window }
    }

    pub fn in_memory(window: ChronoDuration) -> Self {
        Self::new(Box::new(MemoryCooldownStore::new()), window)
    }

    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    /// Fresh means never surfaced, or surfaced at least one full window before `now`
    pub fn is_fresh(&self, last_surfaced: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_surfaced {
            None => true,
            Some(ts) => ts + self.window <= now,
        }
    }

    /// Keep the fresh deals, preserving rank order. An identifier that appears
    /// more than once keeps only its first (highest-ranked) occurrence.
    #[instrument(skip(self, ranked), fields(input = ranked.len()))]
    pub async fn filter_fresh(
        &self,
        ranked: Vec<ScoredDeal>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredDeal>> {
        let ids: Vec<String> = ranked.iter().map(|d| d.candidate.id.clone()).collect();
        let surfaced = self.store.get_many(&ids).await?;

        let mut seen = HashSet::with_capacity(ranked.len());
        let mut fresh = Vec::with_capacity(ranked.len());
        let mut cooling = 0usize;
        for deal in ranked {
            if !seen.insert(deal.candidate.id.clone()) {
                continue;
            }
            if self.is_fresh(surfaced.get(&deal.candidate.id).copied(), now) {
                fresh.push(deal);
            } else {
                cooling += 1;
            }
        }

        debug!("{} fresh, {} still cooling down", fresh.len(), cooling);
        Ok(fresh)
    }

    pub async fn mark_surfaced(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.store
            .set(CooldownRecord {
                id: id.to_string(),
                last_surfaced: at,
            })
            .await
    }

    /// Forget records that can no longer exclude anything
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.purge_before(now - self.window).await
    }
}
