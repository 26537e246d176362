//! Core data model
//!
//! Candidates are observed once per cycle and never mutated afterwards.
//! Category specs are static configuration shared read-only by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider catalog item key (ASIN for the Amazon marketplace)
pub type ItemId = String;

/// Provider category identifier (browse node)
pub type CategoryId = u64;

/// One provider record observed during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ItemId,
    pub category_id: CategoryId,
    pub title: String,
    pub brand: Option<String>,
    pub image_url: Option<String>,
    /// Current price in currency units
    pub current_price: f64,
    /// Reference ("was") price in currency units
    pub reference_price: f64,
    /// Lower is more popular; `None` when the provider has no rank
    pub sales_rank: Option<u64>,
    pub review_count: Option<u32>,
    /// Normalized to the 0.0-5.0 scale
    pub rating: Option<f64>,
    pub is_prime: bool,
    pub is_fulfilled_by_provider: bool,
    /// Most recent price drop reported by the provider, in percent
    pub recent_drop_percent: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl Candidate {
    /// Discount in percent: `(1 - current / reference) * 100`
    pub fn discount_percent(&self) -> f64 {
        if self.reference_price <= 0.0 {
            return 0.0;
        }
        (1.0 - self.current_price / self.reference_price) * 100.0
    }

    /// Absolute savings against the reference price
    pub fn savings(&self) -> f64 {
        self.reference_price - self.current_price
    }
}

/// Static per-category configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySpec {
    pub id: CategoryId,
    pub label: String,
    /// Commission rate in percent (10.0 = 10%)
    pub commission_rate: f64,
    /// Dispatch priority, higher first. Defaults to the commission rate.
    #[serde(default)]
    pub priority: Option<f64>,
}

impl CategorySpec {
    pub fn new(id: CategoryId, label: impl Into<String>, commission_rate: f64) -> Self {
        Self {
            id,
            label: label.into(),
            commission_rate,
            priority: None,
        }
    }

    pub fn priority_weight(&self) -> f64 {
        self.priority.unwrap_or(self.commission_rate)
    }
}

/// A candidate with its computed score, ready for dedup and publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDeal {
    pub candidate: Candidate,
    pub score: f64,
    pub commission_rate: f64,
    pub category_label: String,
    pub product_url: String,
    pub affiliate_url: String,
}

impl ScoredDeal {
    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    pub fn discount_percent(&self) -> f64 {
        self.candidate.discount_percent()
    }
}

/// Identifier plus the time it was last surfaced to the publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub id: ItemId,
    pub last_surfaced: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A candidate that passes the default primary tier
    pub fn candidate(id: &str, category_id: CategoryId, discount: f64) -> Candidate {
        let reference_price = 100.0;
        Candidate {
            id: id.to_string(),
            category_id,
            title: format!("Fixture product {} with a descriptive title", id),
            brand: None,
            image_url: None,
            current_price: reference_price * (1.0 - discount / 100.0),
            reference_price,
            sales_rank: Some(5_000),
            review_count: Some(200),
            rating: Some(4.4),
            is_prime: true,
            is_fulfilled_by_provider: true,
            recent_drop_percent: Some(discount),
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::candidate;
    use super::*;

    #[test]
    fn test_discount_percent_derived_from_prices() {
        let c = candidate("B000TEST01", 1, 30.0);
        assert!((c.discount_percent() - 30.0).abs() < 1e-9);
        assert!((c.savings() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_discount_zero_without_reference() {
        let mut c = candidate("B000TEST02", 1, 30.0);
        c.reference_price = 0.0;
        assert_eq!(c.discount_percent(), 0.0);
    }

    #[test]
    fn test_priority_defaults_to_commission() {
        let mut spec = CategorySpec::new(11055981, "Luxury Beauty", 10.0);
        assert_eq!(spec.priority_weight(), 10.0);
        spec.priority = Some(2.0);
        assert_eq!(spec.priority_weight(), 2.0);
    }
}
