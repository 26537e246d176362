//! End-to-end cycles through the scheduler with in-process sources and publishers

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dealscan::config::{Config, SchedulerConfig};
use dealscan::filter::default_tiers;
use dealscan::publisher::PublishedId;
use dealscan::scheduler::ScanStatus;
use dealscan::{
    Candidate, Catalog, CategorySpec, CycleState, DealSource, DedupStore, Error, FilterTier,
    Publisher, Result, ScanScheduler, ScoredDeal, ScoringEngine, TierUsed,
};

const BEAUTY: u64 = 11055981;
const ELECTRONICS: u64 = 172282;

type Fault = fn(u64) -> Error;

/// Candidates keyed by category and tier name, with optional faults and delays
#[derive(Default)]
struct ScriptedSource {
    responses: HashMap<(u64, String), Vec<Candidate>>,
    faults: HashMap<(u64, String), Fault>,
    delays: HashMap<u64, Duration>,
    calls: Mutex<Vec<(u64, String)>>,
}

impl ScriptedSource {
    fn respond(mut self, category: u64, tier: &str, candidates: Vec<Candidate>) -> Self {
        self.responses.insert((category, tier.to_string()), candidates);
        self
    }

    fn fail(mut self, category: u64, tier: &str, fault: Fault) -> Self {
        self.faults.insert((category, tier.to_string()), fault);
        self
    }

    fn delay(mut self, category: u64, delay: Duration) -> Self {
        self.delays.insert(category, delay);
        self
    }
}

#[async_trait]
impl DealSource for ScriptedSource {
    async fn fetch_category(
        &self,
        category: &CategorySpec,
        tier: &FilterTier,
    ) -> Result<Vec<Candidate>> {
        let key = (category.id, tier.name.clone());
        self.calls.lock().unwrap().push(key.clone());

        if let Some(delay) = self.delays.get(&category.id) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(fault) = self.faults.get(&key) {
            return Err(fault(category.id));
        }
        Ok(self.responses.get(&key).cloned().unwrap_or_default())
    }
}

/// Records accepted submissions; rejects the listed identifiers
#[derive(Default)]
struct RecordingPublisher {
    reject: HashSet<String>,
    submitted: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    fn rejecting(ids: &[&str]) -> Self {
        Self {
            reject: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn submit(&self, deal: &ScoredDeal) -> Result<PublishedId> {
        if self.reject.contains(deal.id()) {
            return Err(Error::publish(deal.id(), "rejected"));
        }
        self.submitted.lock().unwrap().push(deal.id().to_string());
        Ok(format!("post-{}", deal.id()))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Passes the default primary tier
fn candidate(id: &str, category_id: u64, discount: f64) -> Candidate {
    let reference_price = 100.0;
    Candidate {
        id: id.to_string(),
        category_id,
        title: format!("Test product {} with a long enough title", id),
        brand: Some("Acme".to_string()),
        image_url: None,
        current_price: reference_price * (1.0 - discount / 100.0),
        reference_price,
        sales_rank: Some(2_500),
        review_count: Some(150),
        rating: Some(4.3),
        is_prime: true,
        is_fulfilled_by_provider: true,
        recent_drop_percent: Some(discount),
        observed_at: Utc::now(),
    }
}

/// Fails the primary tier on rank and prime, passes the fallback
fn long_tail(id: &str, category_id: u64, discount: f64) -> Candidate {
    Candidate {
        sales_rank: Some(300_000),
        review_count: Some(12),
        is_prime: false,
        ..candidate(id, category_id, discount)
    }
}

fn catalog() -> Catalog {
    Catalog {
        categories: vec![
            CategorySpec::new(BEAUTY, "Beauty", 10.0),
            CategorySpec::new(ELECTRONICS, "Electronics", 3.0),
        ],
        tiers: default_tiers(),
    }
}

fn scheduler_config(catalog: &Catalog) -> SchedulerConfig {
    let mut config = Config::new("test-key", catalog.clone()).scheduler;
    config.concurrency = 2;
    config.worker_timeout = Duration::from_millis(300);
    config
}

fn build(
    source: ScriptedSource,
    publisher: Arc<RecordingPublisher>,
    configure: impl FnOnce(&mut SchedulerConfig),
) -> ScanScheduler {
    let catalog = catalog();
    let mut config = scheduler_config(&catalog);
    configure(&mut config);
    ScanScheduler::new(
        config,
        &catalog,
        Arc::new(source),
        ScoringEngine::new(Some("deals-20".to_string())),
        DedupStore::in_memory(ChronoDuration::hours(24)),
        publisher,
    )
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[tokio::test]
async fn commission_weighted_order_across_categories() {
    let source = ScriptedSource::default()
        .respond(BEAUTY, "primary", vec![candidate("B0BEAUTY01", BEAUTY, 30.0)])
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
        );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(report.ranked, 2);
    let scores: Vec<f64> = report.emitted.submitted.iter().map(|d| d.score).collect();
    assert!(approx(scores[0], 300.0));
    assert!(approx(scores[1], 75.0));
    assert_eq!(publisher.submitted(), vec!["B0BEAUTY01", "B0ELECTR01"]);
    assert!(report
        .categories
        .iter()
        .all(|c| c.tier == TierUsed::Tier(0)));
}

#[tokio::test]
async fn fallback_tier_used_when_primary_is_empty() {
    let long_tail_items = vec![
        long_tail("B0TAIL0001", ELECTRONICS, 20.0),
        long_tail("B0TAIL0002", ELECTRONICS, 15.0),
        long_tail("B0TAIL0003", ELECTRONICS, 12.0),
    ];
    let source = ScriptedSource::default().respond(ELECTRONICS, "fallback", long_tail_items);
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();

    let electronics = report
        .categories
        .iter()
        .find(|c| c.category_id == ELECTRONICS)
        .unwrap();
    assert_eq!(electronics.tier, TierUsed::Tier(1));
    assert_eq!(electronics.survivors, 3);
    assert_eq!(report.ranked, 3);
    assert_eq!(report.metrics.categories_fallback, 1);
    assert_eq!(
        publisher.submitted(),
        vec!["B0TAIL0001", "B0TAIL0002", "B0TAIL0003"]
    );

    // Beauty had nothing anywhere
    let beauty = report
        .categories
        .iter()
        .find(|c| c.category_id == BEAUTY)
        .unwrap();
    assert_eq!(beauty.tier, TierUsed::Exhausted);
    assert_eq!(beauty.status, ScanStatus::Completed);
}

#[tokio::test]
async fn primary_items_from_a_loose_provider_are_refiltered_locally() {
    // The provider ignored the primary bounds and returned a long-tail item
    let source = ScriptedSource::default()
        .respond(ELECTRONICS, "primary", vec![long_tail("B0LOOSE001", ELECTRONICS, 20.0)])
        .respond(ELECTRONICS, "fallback", vec![long_tail("B0LOOSE001", ELECTRONICS, 20.0)]);
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();
    let electronics = report
        .categories
        .iter()
        .find(|c| c.category_id == ELECTRONICS)
        .unwrap();
    assert_eq!(electronics.tier, TierUsed::Tier(1));
}

#[tokio::test]
async fn surfaced_deal_is_held_back_for_the_cooldown_window() {
    let source = ScriptedSource::default()
        .respond(BEAUTY, "primary", vec![candidate("B0BEAUTY01", BEAUTY, 30.0)])
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
        );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |c| c.max_items_per_cycle = 1);
    let start = Utc::now();

    let first = scheduler.run_cycle_at(start).await.unwrap();
    assert_eq!(first.emitted.submitted[0].id, "B0BEAUTY01");
    assert_eq!(first.emitted.held_back, 1);

    // Two hours later the beauty deal still ranks highest but is cooling down
    let second = scheduler
        .run_cycle_at(start + ChronoDuration::hours(2))
        .await
        .unwrap();
    assert_eq!(second.ranked, 2);
    assert_eq!(second.fresh, 1);
    assert_eq!(second.emitted.submitted[0].id, "B0ELECTR01");

    // After a full window it is eligible again
    let third = scheduler
        .run_cycle_at(start + ChronoDuration::hours(24))
        .await
        .unwrap();
    assert_eq!(third.emitted.submitted[0].id, "B0BEAUTY01");
}

#[tokio::test]
async fn per_cycle_cap_submits_the_top_and_keeps_the_rest_fresh() {
    let source = ScriptedSource::default().respond(
        BEAUTY,
        "primary",
        vec![
            candidate("B0RANK0003", BEAUTY, 20.0),
            candidate("B0RANK0001", BEAUTY, 40.0),
            candidate("B0RANK0002", BEAUTY, 30.0),
        ],
    );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |c| c.max_items_per_cycle = 2);
    let now = Utc::now();

    let first = scheduler.run_cycle_at(now).await.unwrap();
    assert_eq!(publisher.submitted(), vec!["B0RANK0001", "B0RANK0002"]);
    assert_eq!(first.emitted.held_back, 1);

    let second = scheduler
        .run_cycle_at(now + ChronoDuration::minutes(15))
        .await
        .unwrap();
    assert_eq!(second.fresh, 1);
    assert_eq!(
        publisher.submitted(),
        vec!["B0RANK0001", "B0RANK0002", "B0RANK0003"]
    );
}

#[tokio::test]
async fn rejected_deal_is_not_marked_surfaced() {
    let source = ScriptedSource::default().respond(
        BEAUTY,
        "primary",
        vec![
            candidate("B0REJECT01", BEAUTY, 40.0),
            candidate("B0ACCEPT01", BEAUTY, 30.0),
        ],
    );
    let publisher = Arc::new(RecordingPublisher::rejecting(&["B0REJECT01"]));
    let scheduler = build(source, publisher.clone(), |_| {});
    let now = Utc::now();

    let first = scheduler.run_cycle_at(now).await.unwrap();
    assert_eq!(first.emitted.failed, vec!["B0REJECT01"]);
    assert_eq!(publisher.submitted(), vec!["B0ACCEPT01"]);
    assert_eq!(first.metrics.publish_failures, 1);

    // Still fresh next cycle; the accepted one is cooling down
    let second = scheduler
        .run_cycle_at(now + ChronoDuration::minutes(15))
        .await
        .unwrap();
    assert_eq!(second.fresh, 1);
    assert_eq!(second.emitted.failed, vec!["B0REJECT01"]);
}

#[tokio::test]
async fn slow_category_times_out_and_contributes_nothing() {
    let source = ScriptedSource::default()
        .respond(BEAUTY, "primary", vec![candidate("B0BEAUTY01", BEAUTY, 30.0)])
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
        )
        .delay(BEAUTY, Duration::from_secs(30));
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();

    let beauty = report
        .categories
        .iter()
        .find(|c| c.category_id == BEAUTY)
        .unwrap();
    assert_eq!(beauty.status, ScanStatus::TimedOut);
    assert_eq!(publisher.submitted(), vec!["B0ELECTR01"]);
}

#[tokio::test]
async fn exhausted_budget_skips_only_that_category() {
    let source = ScriptedSource::default()
        .fail(BEAUTY, "primary", |category_id| Error::BudgetExhausted {
            category_id,
            attempts: 8,
        })
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
        );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();

    let beauty = report
        .categories
        .iter()
        .find(|c| c.category_id == BEAUTY)
        .unwrap();
    assert_eq!(beauty.status, ScanStatus::BudgetExhausted);
    assert_eq!(publisher.submitted(), vec!["B0ELECTR01"]);
}

#[tokio::test]
async fn rejected_query_moves_on_to_the_next_tier() {
    let source = ScriptedSource::default()
        .fail(BEAUTY, "primary", |_| Error::ProviderBadRequest {
            message: "unsupported range".into(),
        })
        .respond(BEAUTY, "fallback", vec![long_tail("B0TAIL0001", BEAUTY, 20.0)]);
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();
    let beauty = report
        .categories
        .iter()
        .find(|c| c.category_id == BEAUTY)
        .unwrap();
    assert_eq!(beauty.tier, TierUsed::Tier(1));
    assert_eq!(publisher.submitted(), vec!["B0TAIL0001"]);
}

#[tokio::test]
async fn provider_failure_after_retries_empties_the_category() {
    let faults: [Fault; 2] = [
        |_| Error::transient("503 after retries", Some(503)),
        |id| Error::malformed(id, "unexpected body"),
    ];
    for fault in faults {
        let source = ScriptedSource::default()
            .fail(BEAUTY, "primary", fault)
            .respond(BEAUTY, "fallback", vec![long_tail("B0TAIL0001", BEAUTY, 20.0)])
            .respond(
                ELECTRONICS,
                "primary",
                vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
            );
        let publisher = Arc::new(RecordingPublisher::default());
        let scheduler = build(source, publisher.clone(), |_| {});

        let report = scheduler.run_cycle().await.unwrap();
        let beauty = report
            .categories
            .iter()
            .find(|c| c.category_id == BEAUTY)
            .unwrap();
        assert_eq!(beauty.status, ScanStatus::Failed);
        assert_eq!(beauty.tier, TierUsed::Exhausted);
        assert_eq!(beauty.survivors, 0);
        assert_eq!(publisher.submitted(), vec!["B0ELECTR01"]);
        assert_eq!(report.metrics.categories_failed, 1);
    }
}

#[tokio::test]
async fn auth_failure_aborts_the_cycle() {
    let source = ScriptedSource::default()
        .fail(BEAUTY, "primary", |_| Error::ProviderAuth {
            message: "invalid key".into(),
        })
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
        );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let err = scheduler.run_cycle().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(publisher.submitted().is_empty());
    assert!(scheduler.last_report().await.is_none());
    assert_eq!(scheduler.state(), CycleState::Idle);
}

#[tokio::test]
async fn repeated_merge_without_emit_is_idempotent() {
    let source = ScriptedSource::default()
        .respond(BEAUTY, "primary", vec![candidate("B0BEAUTY01", BEAUTY, 30.0)])
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0ELECTR01", ELECTRONICS, 25.0)],
        );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher, |_| {});
    let now = Utc::now();

    let first = scheduler.merge(scheduler.scan().await.unwrap(), now).await.unwrap();
    let second = scheduler.merge(scheduler.scan().await.unwrap(), now).await.unwrap();

    let ids = |m: &dealscan::scheduler::Merged| -> Vec<String> {
        m.fresh.iter().map(|d| d.id().to_string()).collect()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(ids(&first), vec!["B0BEAUTY01", "B0ELECTR01"]);
}

#[tokio::test]
async fn same_item_from_two_categories_is_emitted_once() {
    let source = ScriptedSource::default()
        .respond(BEAUTY, "primary", vec![candidate("B0SHARED01", BEAUTY, 30.0)])
        .respond(
            ELECTRONICS,
            "primary",
            vec![candidate("B0SHARED01", ELECTRONICS, 30.0)],
        );
    let publisher = Arc::new(RecordingPublisher::default());
    let scheduler = build(source, publisher.clone(), |_| {});

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.ranked, 2);
    assert_eq!(report.fresh, 1);
    assert_eq!(report.emitted.submitted[0].category_id, BEAUTY);
    assert_eq!(publisher.submitted(), vec!["B0SHARED01"]);
}
