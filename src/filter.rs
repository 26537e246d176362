//! Tiered candidate filtering
//!
//! A tier is a named set of inclusive bounds. Each bound becomes one
//! [`Predicate`]; a candidate survives a tier only if it satisfies all of them.
//! The [`FilterCascade`] tries tiers in order (tier 0 is primary, later tiers are
//! looser fallbacks) and stops at the first tier with survivors, remembering
//! which tier fired.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Candidate, CategorySpec};

/// Slack for comparisons against derived percentages
const EPSILON: f64 = 1e-9;

/// Inclusive bounds for one tier. `None` / `false` means "not constrained".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBounds {
    pub min_discount_percent: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Top-N by popularity rank (lower rank is more popular)
    pub max_sales_rank: Option<u64>,
    pub min_review_count: Option<u32>,
    /// On the 0.0-5.0 scale
    pub min_rating: Option<f64>,
    pub require_prime: bool,
    /// Categories with at least this commission rate skip the prime requirement
    pub prime_exempt_commission: Option<f64>,
    pub require_fulfilled_by_provider: bool,
    pub min_recent_drop_percent: Option<f64>,
    /// Absolute reference-minus-current price
    pub min_savings: Option<f64>,
    pub min_title_length: Option<usize>,
}

fn min_relaxed<T: PartialOrd>(looser: Option<T>, stricter: Option<T>) -> bool {
    match (looser, stricter) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(l), Some(s)) => l <= s,
    }
}

fn max_relaxed<T: PartialOrd>(looser: Option<T>, stricter: Option<T>) -> bool {
    match (looser, stricter) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(l), Some(s)) => l >= s,
    }
}

impl TierBounds {
    /// True when every bound is looser than or equal to the same bound in `stricter`
    pub fn relaxes(&self, stricter: &TierBounds) -> bool {
        let prime_relaxed = if !self.require_prime {
            true
        } else if !stricter.require_prime {
            false
        } else {
            match (self.prime_exempt_commission, stricter.prime_exempt_commission) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(l), Some(s)) => l <= s,
            }
        };

        min_relaxed(self.min_discount_percent, stricter.min_discount_percent)
            && min_relaxed(self.min_price, stricter.min_price)
            && max_relaxed(self.max_price, stricter.max_price)
            && max_relaxed(self.max_sales_rank, stricter.max_sales_rank)
            && min_relaxed(self.min_review_count, stricter.min_review_count)
            && min_relaxed(self.min_rating, stricter.min_rating)
            && prime_relaxed
            && (!self.require_fulfilled_by_provider || stricter.require_fulfilled_by_provider)
            && min_relaxed(self.min_recent_drop_percent, stricter.min_recent_drop_percent)
            && min_relaxed(self.min_savings, stricter.min_savings)
            && min_relaxed(self.min_title_length, stricter.min_title_length)
    }

    /// Expand the bounds into the predicate list evaluated for this tier
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if let Some(v) = self.min_discount_percent {
            predicates.push(Predicate::MinDiscountPercent(v));
        }
        if let Some(v) = self.min_price {
            predicates.push(Predicate::MinPrice(v));
        }
        if let Some(v) = self.max_price {
            predicates.push(Predicate::MaxPrice(v));
        }
        if let Some(v) = self.max_sales_rank {
            predicates.push(Predicate::MaxSalesRank(v));
        }
        if let Some(v) = self.min_review_count {
            predicates.push(Predicate::MinReviewCount(v));
        }
        if let Some(v) = self.min_rating {
            predicates.push(Predicate::MinRating(v));
        }
        if self.require_prime {
            predicates.push(Predicate::RequirePrime {
                exempt_from_commission: self.prime_exempt_commission,
            });
        }
        if self.require_fulfilled_by_provider {
            predicates.push(Predicate::RequireFulfilledByProvider);
        }
        if let Some(v) = self.min_recent_drop_percent {
            predicates.push(Predicate::MinRecentDropPercent(v));
        }
        if let Some(v) = self.min_savings {
            predicates.push(Predicate::MinSavings(v));
        }
        if let Some(v) = self.min_title_length {
            predicates.push(Predicate::MinTitleLength(v));
        }
        predicates
    }
}

/// One independent bound check
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    MinDiscountPercent(f64),
    MinPrice(f64),
    MaxPrice(f64),
    MaxSalesRank(u64),
    MinReviewCount(u32),
    MinRating(f64),
    RequirePrime { exempt_from_commission: Option<f64> },
    RequireFulfilledByProvider,
    MinRecentDropPercent(f64),
    MinSavings(f64),
    MinTitleLength(usize),
}

impl Predicate {
    /// Absent review count or rating passes (the deal feed often omits them);
    /// an absent rank or recent drop fails its bound.
    pub fn matches(&self, candidate: &Candidate, category: &CategorySpec) -> bool {
        match *self {
            Predicate::MinDiscountPercent(min) => candidate.discount_percent() + EPSILON >= min,
            Predicate::MinPrice(min) => candidate.current_price >= min,
            Predicate::MaxPrice(max) => candidate.current_price <= max,
            Predicate::MaxSalesRank(max) => candidate.sales_rank.is_some_and(|r| r <= max),
            Predicate::MinReviewCount(min) => candidate.review_count.map_or(true, |n| n >= min),
            Predicate::MinRating(min) => candidate.rating.map_or(true, |r| r + EPSILON >= min),
            Predicate::RequirePrime {
                exempt_from_commission,
            } => {
                candidate.is_prime
                    || exempt_from_commission.is_some_and(|t| category.commission_rate >= t)
            }
            Predicate::RequireFulfilledByProvider => candidate.is_fulfilled_by_provider,
            Predicate::MinRecentDropPercent(min) => candidate
                .recent_drop_percent
                .is_some_and(|d| d + EPSILON >= min),
            Predicate::MinSavings(min) => candidate.savings() + EPSILON >= min,
            Predicate::MinTitleLength(min) => candidate.title.trim().chars().count() >= min,
        }
    }
}

/// A named tier with its predicate list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTier {
    pub name: String,
    #[serde(flatten)]
    pub bounds: TierBounds,
    #[serde(skip)]
    predicates: Vec<Predicate>,
}

impl FilterTier {
    pub fn new(name: impl Into<String>, bounds: TierBounds) -> Self {
        let predicates = bounds.predicates();
        Self {
            name: name.into(),
            bounds,
            predicates,
        }
    }

    /// Rebuild the predicate list, needed after deserializing
    pub fn compiled(self) -> Self {
        Self::new(self.name, self.bounds)
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn accepts(&self, candidate: &Candidate, category: &CategorySpec) -> bool {
        self.predicates
            .iter()
            .all(|p| p.matches(candidate, category))
    }
}

/// Which tier produced the survivors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum TierUsed {
    Tier(usize),
    Exhausted,
}

impl TierUsed {
    pub fn is_fallback(&self) -> bool {
        matches!(self, TierUsed::Tier(i) if *i > 0)
    }
}

impl fmt::Display for TierUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierUsed::Tier(0) => write!(f, "primary"),
            TierUsed::Tier(i) => write!(f, "fallback#{}", i),
            TierUsed::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Survivors of a cascade run
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeOutcome {
    pub survivors: Vec<Candidate>,
    pub tier: TierUsed,
}

impl CascadeOutcome {
    pub fn exhausted() -> Self {
        Self {
            survivors: Vec::new(),
            tier: TierUsed::Exhausted,
        }
    }
}

/// Ordered tiers, strictest first
#[derive(Debug, Clone, Default)]
pub struct FilterCascade {
    tiers: Vec<FilterTier>,
}

impl FilterCascade {
    pub fn new(tiers: Vec<FilterTier>) -> Self {
        for pair in tiers.windows(2) {
            if !pair[1].bounds.relaxes(&pair[0].bounds) {
                warn!(
                    "Tier '{}' is not a relaxation of '{}'; fallback results may not be a superset",
                    pair[1].name, pair[0].name
                );
            }
        }
        Self { tiers }
    }

    pub fn tiers(&self) -> &[FilterTier] {
        &self.tiers
    }

    /// Survivors of a single tier, in input order
    pub fn apply_tier(
        &self,
        index: usize,
        candidates: &[Candidate],
        category: &CategorySpec,
    ) -> Vec<Candidate> {
        let Some(tier) = self.tiers.get(index) else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|c| tier.accepts(c, category))
            .cloned()
            .collect()
    }

    /// Filter a fixed candidate set, trying tiers in order until one has survivors
    pub fn select(&self, candidates: &[Candidate], category: &CategorySpec) -> CascadeOutcome {
        for index in 0..self.tiers.len() {
            let survivors = self.apply_tier(index, candidates, category);
            if !survivors.is_empty() {
                return CascadeOutcome {
                    survivors,
                    tier: TierUsed::Tier(index),
                };
            }
        }
        CascadeOutcome::exhausted()
    }

    /// Query the provider once per tier, with that tier's bounds, until a tier has survivors.
    ///
    /// The tier's predicates are re-applied locally since the provider may not
    /// honour every bound. A query the provider rejects counts as an empty tier.
    /// Any other error ends the cascade for this category and is returned; retries
    /// have already been spent by the source.
    pub async fn select_with<F, Fut>(
        &self,
        category: &CategorySpec,
        mut fetch: F,
    ) -> Result<CascadeOutcome>
    where
        F: FnMut(FilterTier) -> Fut,
        Fut: Future<Output = Result<Vec<Candidate>>>,
    {
        for (index, tier) in self.tiers.iter().enumerate() {
            let raw = match fetch(tier.clone()).await {
                Ok(raw) => raw,
                Err(e @ Error::ProviderBadRequest { .. }) => {
                    warn!(
                        "Category {} ({}) tier '{}' yielded nothing: {}",
                        category.id, category.label, tier.name, e
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let survivors = self.apply_tier(index, &raw, category);
            debug!(
                "Category {} tier '{}': {} raw, {} survivors",
                category.id,
                tier.name,
                raw.len(),
                survivors.len()
            );
            if !survivors.is_empty() {
                return Ok(CascadeOutcome {
                    survivors,
                    tier: TierUsed::Tier(index),
                });
            }
        }
        Ok(CascadeOutcome::exhausted())
    }
}

/// The primary / fallback pair used when no catalog file is supplied
pub fn default_tiers() -> Vec<FilterTier> {
    vec![
        FilterTier::new(
            "primary",
            TierBounds {
                min_discount_percent: Some(15.0),
                min_price: Some(15.0),
                max_price: Some(300.0),
                max_sales_rank: Some(100_000),
                min_review_count: Some(25),
                min_rating: Some(3.5),
                require_prime: true,
                prime_exempt_commission: Some(8.0),
                require_fulfilled_by_provider: true,
                min_recent_drop_percent: None,
                min_savings: Some(5.0),
                min_title_length: Some(10),
            },
        ),
        FilterTier::new(
            "fallback",
            TierBounds {
                min_discount_percent: Some(10.0),
                min_price: Some(15.0),
                max_price: Some(300.0),
                max_sales_rank: Some(500_000),
                min_review_count: Some(10),
                min_title_length: Some(10),
                ..TierBounds::default()
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::candidate;

    fn beauty() -> CategorySpec {
        CategorySpec::new(11055981, "Luxury Beauty", 10.0)
    }

    fn electronics() -> CategorySpec {
        CategorySpec::new(172282, "Electronics", 3.0)
    }

    #[test]
    fn test_default_tiers_are_monotonic() {
        let tiers = default_tiers();
        assert!(tiers[1].bounds.relaxes(&tiers[0].bounds));
        assert!(!tiers[0].bounds.relaxes(&tiers[1].bounds));
        assert!(tiers[0].bounds.relaxes(&tiers[0].bounds));
    }

    #[test]
    fn test_every_predicate_must_hold() {
        let tier = &default_tiers()[0];
        let good = candidate("B0GOOD0001", 172282, 30.0);
        assert!(tier.accepts(&good, &electronics()));

        let mut unpopular = good.clone();
        unpopular.sales_rank = Some(100_001);
        assert!(!tier.accepts(&unpopular, &electronics()));

        let mut unranked = good.clone();
        unranked.sales_rank = None;
        assert!(!tier.accepts(&unranked, &electronics()));

        let mut pricey = good.clone();
        pricey.current_price = 300.01;
        pricey.reference_price = 500.0;
        assert!(!tier.accepts(&pricey, &electronics()));

        let mut not_fba = good.clone();
        not_fba.is_fulfilled_by_provider = false;
        assert!(!tier.accepts(&not_fba, &electronics()));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let tier = &default_tiers()[0];
        let mut edge = candidate("B0EDGE0001", 172282, 15.0);
        edge.reference_price = 40.0;
        edge.current_price = 34.0; // exactly 15% off, $6 savings
        edge.sales_rank = Some(100_000);
        edge.review_count = Some(25);
        edge.rating = Some(3.5);
        assert!(tier.accepts(&edge, &electronics()));
    }

    #[test]
    fn test_missing_reviews_pass() {
        let tier = &default_tiers()[0];
        let mut c = candidate("B0NOREV001", 172282, 30.0);
        c.review_count = None;
        c.rating = None;
        assert!(tier.accepts(&c, &electronics()));
    }

    #[test]
    fn test_prime_exemption_for_high_commission() {
        let tier = &default_tiers()[0];
        let mut c = candidate("B0NOPRIME1", 11055981, 30.0);
        c.is_prime = false;
        assert!(tier.accepts(&c, &beauty()));
        assert!(!tier.accepts(&c, &electronics()));
    }

    #[test]
    fn test_cascade_primary_wins() {
        let cascade = FilterCascade::new(default_tiers());
        let candidates = vec![candidate("B0PRIMARY1", 172282, 30.0)];
        let outcome = cascade.select(&candidates, &electronics());
        assert_eq!(outcome.tier, TierUsed::Tier(0));
        assert_eq!(outcome.survivors.len(), 1);
    }

    #[test]
    fn test_cascade_falls_back_when_primary_starves() {
        let cascade = FilterCascade::new(default_tiers());
        let candidates: Vec<Candidate> = (0..3)
            .map(|i| {
                let mut c = candidate(&format!("B0FALLBK0{}", i), 172282, 12.0);
                c.sales_rank = Some(250_000);
                c.review_count = Some(12);
                c
            })
            .collect();

        let outcome = cascade.select(&candidates, &electronics());
        assert_eq!(outcome.tier, TierUsed::Tier(1));
        assert!(outcome.tier.is_fallback());
        assert_eq!(outcome.survivors.len(), 3);
    }

    #[test]
    fn test_cascade_exhausted() {
        let cascade = FilterCascade::new(default_tiers());
        let candidates = vec![candidate("B0TINY0001", 172282, 2.0)];
        let outcome = cascade.select(&candidates, &electronics());
        assert_eq!(outcome.tier, TierUsed::Exhausted);
        assert!(outcome.survivors.is_empty());
        assert_eq!(outcome.tier.to_string(), "exhausted");

        let empty = FilterCascade::new(Vec::new());
        assert_eq!(empty.select(&candidates, &electronics()).tier, TierUsed::Exhausted);
    }

    #[test]
    fn test_relaxed_tier_survivors_are_superset() {
        let tiers = default_tiers();
        let cascade = FilterCascade::new(tiers.clone());
        let category = electronics();

        // Deterministic spread over every bounded field
        let candidates: Vec<Candidate> = (0..400u64)
            .map(|i| {
                let mut c = candidate(&format!("B0GRID{:04}", i), category.id, (i % 40) as f64);
                c.reference_price = 20.0 + (i % 17) as f64 * 25.0;
                c.current_price = c.reference_price * (1.0 - (i % 40) as f64 / 100.0);
                c.sales_rank = if i % 13 == 0 { None } else { Some(i * 1_700) };
                c.review_count = Some((i % 60) as u32);
                c.rating = Some(2.5 + (i % 6) as f64 * 0.5);
                c.is_prime = i % 3 != 0;
                c.is_fulfilled_by_provider = i % 5 != 0;
                c
            })
            .collect();

        let strict: Vec<String> = cascade
            .apply_tier(0, &candidates, &category)
            .into_iter()
            .map(|c| c.id)
            .collect();
        let loose: Vec<String> = cascade
            .apply_tier(1, &candidates, &category)
            .into_iter()
            .map(|c| c.id)
            .collect();

        assert!(!strict.is_empty());
        assert!(loose.len() > strict.len());
        assert!(strict.iter().all(|id| loose.contains(id)));
    }

    #[tokio::test]
    async fn test_select_with_requeries_per_tier() {
        let cascade = FilterCascade::new(default_tiers());
        let category = electronics();
        let mut seen_tiers = Vec::new();

        let outcome = cascade
            .select_with(&category, |tier| {
                seen_tiers.push(tier.name.clone());
                let is_primary = tier.name == "primary";
                async move {
                    if is_primary {
                        Ok(Vec::new())
                    } else {
                        let mut c = candidate("B0LOOSE001", 172282, 11.0);
                        c.sales_rank = Some(400_000);
                        Ok(vec![c])
                    }
                }
            })
            .await
            .expect("cascade should not fail");

        assert_eq!(seen_tiers, vec!["primary", "fallback"]);
        assert_eq!(outcome.tier, TierUsed::Tier(1));
        assert_eq!(outcome.survivors.len(), 1);
    }

    #[tokio::test]
    async fn test_select_with_skips_rejected_tier_only() {
        let cascade = FilterCascade::new(default_tiers());
        let category = electronics();

        let outcome = cascade
            .select_with(&category, |tier| async move {
                if tier.name == "primary" {
                    Err(Error::ProviderBadRequest {
                        message: "bad selection".into(),
                    })
                } else {
                    Ok(vec![candidate("B0AFTERERR", 172282, 20.0)])
                }
            })
            .await
            .expect("a rejected query is absorbed");
        assert_eq!(outcome.tier, TierUsed::Tier(1));

        let mut seen_tiers = Vec::new();
        let transient = cascade
            .select_with(&category, |tier| {
                seen_tiers.push(tier.name.clone());
                async move {
                    if tier.name == "primary" {
                        Err(Error::transient("503 after retries", Some(503)))
                    } else {
                        Ok(vec![candidate("B0AFTERERR", 172282, 20.0)])
                    }
                }
            })
            .await;
        assert!(matches!(transient, Err(Error::ProviderTransient { .. })));
        assert_eq!(seen_tiers, vec!["primary"]);

        let fatal = cascade
            .select_with(&category, |_| async {
                Err::<Vec<Candidate>, _>(Error::ProviderAuth {
                    message: "invalid key".into(),
                })
            })
            .await;
        assert!(matches!(fatal, Err(Error::ProviderAuth { .. })));
    }
}
