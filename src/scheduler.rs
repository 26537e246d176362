//! Scan Scheduler
//!
//! Drives the cycle `Idle -> Scanning -> Merging -> Emitting -> Idle` on a fixed
//! interval. Each phase is its own method so it can be exercised in isolation:
//!
//! - [`ScanScheduler::scan`]: one worker per category on a bounded pool, each
//!   running the filter cascade against the deal source under a timeout
//! - [`ScanScheduler::merge`]: rank everything across categories, drop cooling items
//! - [`ScanScheduler::emit`]: hand the top of the queue to the publisher and
//!   start the cooldown for every accepted deal
//!
//! Dropping a cycle future mid-scan aborts its workers; the budget never
//! holds tokens for requests that were not sent. Once emitting starts the
//! cycle runs to completion, so every accepted deal gets its cooldown.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::budget::RateBudget;
use crate::config::{Catalog, SchedulerConfig};
use crate::dedup::DedupStore;
use crate::error::{Error, Result};
use crate::filter::{CascadeOutcome, FilterCascade, FilterTier, TierUsed};
use crate::metrics::{CycleAnalyzer, CycleMetrics, PerformanceTimer};
use crate::model::{Candidate, CategoryId, CategorySpec, ScoredDeal};
use crate::provider::DealSource;
use crate::publisher::{PublishedId, Publisher};
use crate::scoring::ScoringEngine;

/// Where the scheduler is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Scanning,
    Merging,
    Emitting,
}

/// How a category's worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Completed,
    TimedOut,
    BudgetExhausted,
    /// Provider failed after retries or returned garbage
    Failed,
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category_id: CategoryId,
    pub label: String,
    pub status: ScanStatus,
    pub tier: TierUsed,
    pub survivors: usize,
    pub elapsed_ms: u64,
}

/// One category's contribution to a cycle
#[derive(Debug, Clone)]
pub struct CategoryScan {
    pub report: CategoryReport,
    pub survivors: Vec<Candidate>,
}

impl CategoryScan {
    fn empty(category: &CategorySpec, status: ScanStatus, elapsed: Duration) -> Self {
        Self {
            report: CategoryReport {
                category_id: category.id,
                label: category.label.clone(),
                status,
                tier: TierUsed::Exhausted,
                survivors: 0,
                elapsed_ms: elapsed.as_millis() as u64,
            },
            survivors: Vec::new(),
        }
    }

    fn completed(category: &CategorySpec, outcome: CascadeOutcome, elapsed: Duration) -> Self {
        Self {
            report: CategoryReport {
                category_id: category.id,
                label: category.label.clone(),
                status: ScanStatus::Completed,
                tier: outcome.tier,
                survivors: outcome.survivors.len(),
                elapsed_ms: elapsed.as_millis() as u64,
            },
            survivors: outcome.survivors,
        }
    }
}

/// Ranked, cooldown-filtered queue for one cycle
#[derive(Debug, Clone)]
pub struct Merged {
    /// Deals ranked before the cooldown filter
    pub ranked: usize,
    pub fresh: Vec<ScoredDeal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmittedDeal {
    pub id: String,
    pub published_id: PublishedId,
    pub score: f64,
    pub category_id: CategoryId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmitReport {
    pub submitted: Vec<EmittedDeal>,
    /// Identifiers the publisher rejected; they stay fresh
    pub failed: Vec<String>,
    /// Fresh deals beyond the per-cycle cap; they stay fresh
    pub held_back: usize,
}

/// Everything that happened in one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: Vec<CategoryReport>,
    pub ranked: usize,
    pub fresh: usize,
    pub emitted: EmitReport,
    pub metrics: CycleMetrics,
}

/// Resets the published state to `Idle` however the cycle ends
struct IdleOnDrop<'a>(&'a watch::Sender<CycleState>);

/// A cycle that has scanned and merged and is ready to emit
struct Collected<'a> {
    _idle: IdleOnDrop<'a>,
    cycle_id: Uuid,
    span: Span,
    started_at: DateTime<Utc>,
    total: Instant,
    categories: Vec<CategoryReport>,
    merged: Merged,
    metrics: CycleMetrics,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(CycleState::Idle);
    }
}

pub struct ScanScheduler {
    config: SchedulerConfig,
    /// Dispatch order: priority descending, then id
    categories: Vec<CategorySpec>,
    category_map: HashMap<CategoryId, CategorySpec>,
    source: Arc<dyn DealSource>,
    cascade: Arc<FilterCascade>,
    scoring: ScoringEngine,
    dedup: DedupStore,
    publisher: Arc<dyn Publisher>,
    budget: Option<Arc<RateBudget>>,
    state: watch::Sender<CycleState>,
    last_report: RwLock<Option<CycleReport>>,
}

impl ScanScheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: &Catalog,
        source: Arc<dyn DealSource>,
        scoring: ScoringEngine,
        dedup: DedupStore,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let mut categories = catalog.categories.clone();
        categories.sort_by(|a, b| {
            b.priority_weight()
                .total_cmp(&a.priority_weight())
                .then_with(|| a.id.cmp(&b.id))
        });
        let (state, _) = watch::channel(CycleState::Idle);

        Self {
            config,
            category_map: catalog.category_map(),
            categories,
            source,
            cascade: Arc::new(catalog.cascade()),
            scoring,
            dedup,
            publisher,
            budget: None,
            state,
            last_report: RwLock::new(None),
        }
    }

    /// Report the shared budget's level in cycle metrics
    pub fn with_budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn publisher_name(&self) -> &'static str {
        self.publisher.name()
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub fn cascade(&self) -> &FilterCascade {
        &self.cascade
    }

    pub fn cooldown_window(&self) -> chrono::Duration {
        self.dedup.window()
    }

    /// Categories dispatched this cycle, highest priority first
    pub fn dispatch_order(&self) -> &[CategorySpec] {
        let cap = self
            .config
            .max_categories
            .unwrap_or(self.categories.len())
            .min(self.categories.len());
        &self.categories[..cap]
    }

    fn set_state(&self, state: CycleState) {
        debug!("Cycle state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Run every category through the cascade on the bounded worker pool.
    ///
    /// Timeouts, budget exhaustion and provider failures yield an empty
    /// contribution. A fatal error aborts the remaining workers and is returned.
    pub async fn scan(&self) -> Result<Vec<CategoryScan>> {
        self.set_state(CycleState::Scanning);

        let order = self.dispatch_order();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = JoinSet::new();

        for (index, category) in order.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&self.source);
            let cascade = Arc::clone(&self.cascade);
            let worker_timeout = self.config.worker_timeout;

            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, category, Duration::ZERO, None);
                };
                let started = Instant::now();
                let fetch = |tier: FilterTier| {
                    let source = Arc::clone(&source);
                    let category = category.clone();
                    async move { source.fetch_category(&category, &tier).await }
                };
                let result =
                    tokio::time::timeout(worker_timeout, cascade.select_with(&category, fetch))
                        .await
                        .ok();
                (index, category, started.elapsed(), result)
            });
        }

        let mut scans: Vec<(usize, CategoryScan)> = Vec::with_capacity(order.len());
        while let Some(joined) = workers.join_next().await {
            let (index, category, elapsed, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Scan worker panicked: {}", e);
                    continue;
                }
            };

            let scan = match result {
                None => {
                    warn!(
                        "Category {} ({}) timed out after {:?}",
                        category.id, category.label, self.config.worker_timeout
                    );
                    CategoryScan::empty(&category, ScanStatus::TimedOut, elapsed)
                }
                Some(Ok(outcome)) => {
                    info!(
                        "Category {} ({}): {} survivors via {}",
                        category.id,
                        category.label,
                        outcome.survivors.len(),
                        outcome.tier
                    );
                    CategoryScan::completed(&category, outcome, elapsed)
                }
                Some(Err(e @ Error::BudgetExhausted { .. })) => {
                    warn!("Skipping category {} this cycle: {}", category.id, e);
                    CategoryScan::empty(&category, ScanStatus::BudgetExhausted, elapsed)
                }
                Some(Err(e)) if e.is_fatal() => {
                    error!("Fatal error scanning category {}: {}", category.id, e);
                    workers.abort_all();
                    return Err(e);
                }
                Some(Err(e)) => {
                    warn!(
                        "Category {} ({}) yields nothing this cycle: {}",
                        category.id, category.label, e
                    );
                    CategoryScan::empty(&category, ScanStatus::Failed, elapsed)
                }
            };
            scans.push((index, scan));
        }

        // Workers that panicked never reported; account for them
        if scans.len() < order.len() {
            for (index, category) in order.iter().enumerate() {
                if !scans.iter().any(|(i, _)| *i == index) {
                    scans.push((
                        index,
                        CategoryScan::empty(category, ScanStatus::Panicked, Duration::ZERO),
                    ));
                }
            }
        }

        scans.sort_by_key(|(index, _)| *index);
        Ok(scans.into_iter().map(|(_, scan)| scan).collect())
    }

    /// Rank all survivors across categories and keep the fresh ones
    pub async fn merge(&self, scans: Vec<CategoryScan>, now: DateTime<Utc>) -> Result<Merged> {
        self.set_state(CycleState::Merging);

        let candidates: Vec<Candidate> = scans.into_iter().flat_map(|s| s.survivors).collect();
        let ranked = self.scoring.rank(candidates, &self.category_map);
        let ranked_len = ranked.len();
        let fresh = self.dedup.filter_fresh(ranked, now).await?;

        debug!("Merged {} ranked deals, {} fresh", ranked_len, fresh.len());
        Ok(Merged {
            ranked: ranked_len,
            fresh,
        })
    }

    /// Submit the top of the queue in rank order.
    ///
    /// Only deals the publisher accepted start their cooldown. Publisher
    /// failures are local to the deal and never stop the rest of the queue.
    pub async fn emit(&self, fresh: Vec<ScoredDeal>, now: DateTime<Utc>) -> EmitReport {
        self.set_state(CycleState::Emitting);

        let cap = self.config.max_items_per_cycle;
        let mut report = EmitReport {
            held_back: fresh.len().saturating_sub(cap),
            ..EmitReport::default()
        };

        for deal in fresh.into_iter().take(cap) {
            match self.publisher.submit(&deal).await {
                Ok(published_id) => {
                    if let Err(e) = self.dedup.mark_surfaced(deal.id(), now).await {
                        error!("Failed to record cooldown for {}: {}", deal.id(), e);
                    }
                    report.submitted.push(EmittedDeal {
                        id: deal.candidate.id,
                        published_id,
                        score: deal.score,
                        category_id: deal.candidate.category_id,
                    });
                }
                Err(e) => {
                    warn!("Publisher rejected {}: {}", deal.id(), e);
                    report.failed.push(deal.candidate.id);
                }
            }
        }

        match self.dedup.purge_expired(now).await {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {} expired cooldown records", purged),
            Err(e) => warn!("Failed to purge cooldown records: {}", e),
        }

        report
    }

    /// One full cycle at the current time
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// One full cycle with `now` as the cooldown reference time
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let collected = self.collect(now).await?;
        Ok(self.complete(collected, now).await)
    }

    /// Scan and merge. Safe to drop at any await point.
    async fn collect(&self, now: DateTime<Utc>) -> Result<Collected<'_>> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", id = %cycle_id);
        self.collect_in(cycle_id, span.clone(), now)
            .instrument(span)
            .await
    }

    async fn collect_in(
        &self,
        cycle_id: Uuid,
        span: Span,
        now: DateTime<Utc>,
    ) -> Result<Collected<'_>> {
        let idle = IdleOnDrop(&self.state);
        let started_at = Utc::now();
        let total = Instant::now();
        let mut metrics = CycleMetrics::new(cycle_id.to_string());

        info!("Cycle started ({} categories)", self.dispatch_order().len());

        let scan_timer = PerformanceTimer::new("scan");
        let scans = self.scan().await?;
        metrics.scan_duration_ms = scan_timer.elapsed_ms();
        scan_timer.log_if_slow(self.config.worker_timeout.as_millis() as u64);

        let categories: Vec<CategoryReport> = scans.iter().map(|s| s.report.clone()).collect();
        metrics.categories_scanned = categories.len();
        for report in &categories {
            metrics.record_tier(&report.tier.to_string());
            match (report.status, report.tier) {
                (ScanStatus::Completed, TierUsed::Exhausted) => metrics.categories_exhausted += 1,
                (ScanStatus::Completed, tier) if tier.is_fallback() => {
                    metrics.categories_fallback += 1
                }
                (ScanStatus::Completed, _) => {}
                _ => metrics.categories_failed += 1,
            }
        }

        let phase = Instant::now();
        let merged = self.merge(scans, now).await?;
        metrics.merge_duration_ms = phase.elapsed().as_millis() as u64;
        metrics.candidates_ranked = merged.ranked;
        metrics.fresh_deals = merged.fresh.len();

        Ok(Collected {
            _idle: idle,
            cycle_id,
            span,
            started_at,
            total,
            categories,
            merged,
            metrics,
        })
    }

    /// Emit and record the report. Runs to completion once started.
    async fn complete(&self, collected: Collected<'_>, now: DateTime<Utc>) -> CycleReport {
        let span = collected.span.clone();
        self.complete_in(collected, now).instrument(span).await
    }

    async fn complete_in(&self, collected: Collected<'_>, now: DateTime<Utc>) -> CycleReport {
        let Collected {
            _idle,
            cycle_id,
            started_at,
            total,
            categories,
            merged,
            mut metrics,
            ..
        } = collected;
        let ranked = merged.ranked;
        let fresh = merged.fresh.len();

        let phase = Instant::now();
        let emitted = self.emit(merged.fresh, now).await;
        metrics.emit_duration_ms = phase.elapsed().as_millis() as u64;
        metrics.submitted = emitted.submitted.len();
        metrics.publish_failures = emitted.failed.len();
        if !emitted.submitted.is_empty() {
            metrics.avg_score = emitted.submitted.iter().map(|d| d.score).sum::<f64>()
                / emitted.submitted.len() as f64;
        }
        metrics.budget_remaining = self.budget.as_ref().map(|b| b.remaining()).unwrap_or(0.0);
        metrics.total_duration_ms = total.elapsed().as_millis() as u64;

        info!(
            "Cycle finished in {}ms: {} ranked, {} fresh, {} submitted, {} failed, {} held back",
            metrics.total_duration_ms,
            ranked,
            fresh,
            emitted.submitted.len(),
            emitted.failed.len(),
            emitted.held_back
        );
        for issue in CycleAnalyzer::detect_issues(
            &metrics,
            self.config.worker_timeout.as_millis() as u64,
        ) {
            warn!("Cycle issue: {}", issue);
        }

        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            categories,
            ranked,
            fresh,
            emitted,
            metrics,
        };
        *self.last_report.write().await = Some(report.clone());
        report
    }

    /// Run cycles on the configured interval until shutdown or a fatal error.
    ///
    /// The first cycle starts immediately. Shutdown while scanning or merging
    /// abandons the cycle; shutdown while emitting lets the emit finish first.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Scheduler shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            let collected = tokio::select! {
                result = self.collect(now) => match result {
                    Ok(collected) => collected,
                    Err(e) if e.is_fatal() => {
                        error!("Fatal error, stopping scheduler: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        if e.is_error_level() {
                            error!("Cycle failed: {}", e);
                        } else {
                            warn!("Cycle failed: {}", e);
                        }
                        continue;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutdown during cycle, abandoning in-flight scans");
                    return Ok(());
                }
            };

            self.complete(collected, now).await;
        }
    }
}
