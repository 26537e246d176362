//! Deal selection sent to the provider
//!
//! Prices travel in cents, ratings on the provider's 0-50 scale.

use serde::Serialize;

use crate::filter::TierBounds;
use crate::model::CategorySpec;

/// Upper bound the provider accepts for percentage ranges
const MAX_PERCENT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealSelection {
    pub page: u32,
    pub domain_id: u32,
    pub include_categories: Vec<u64>,
    /// Price type 0 (marketplace) and 1 (new, third party)
    pub price_types: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_percent_range: Option<[i64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_range: Option<[i64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sales_rank_range: Option<[i64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_rating: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_review_count: Option<u32>,
    pub is_prime: bool,
    #[serde(rename = "isFBA")]
    pub is_fba: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_last_percent_range: Option<[i64; 2]>,
    pub sort_type: u8,
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

impl DealSelection {
    /// Selection for one category under one tier's bounds.
    ///
    /// The prime flag is only sent when the category cannot claim the
    /// commission exemption; otherwise the provider would drop items the local
    /// predicate still accepts.
    pub fn from_tier(category: &CategorySpec, bounds: &TierBounds, domain_id: u32) -> Self {
        let prime_exempt = bounds
            .prime_exempt_commission
            .is_some_and(|t| category.commission_rate >= t);

        let current_range = match (bounds.min_price, bounds.max_price) {
            (None, None) => None,
            (min, max) => Some([
                min.map(to_cents).unwrap_or(0),
                max.map(to_cents).unwrap_or(i64::from(i32::MAX)),
            ]),
        };

        Self {
            page: 0,
            domain_id,
            include_categories: vec![category.id],
            price_types: vec![0, 1],
            delta_percent_range: bounds
                .min_discount_percent
                .map(|min| [min.floor().max(0.0) as i64, MAX_PERCENT]),
            current_range,
            sales_rank_range: bounds
                .max_sales_rank
                .map(|max| [1, i64::try_from(max).unwrap_or(i64::MAX)]),
            min_rating: bounds.min_rating.map(|r| (r * 10.0).round() as i64),
            min_review_count: bounds.min_review_count,
            is_prime: bounds.require_prime && !prime_exempt,
            is_fba: bounds.require_fulfilled_by_provider,
            delta_last_percent_range: bounds
                .min_recent_drop_percent
                .map(|min| [min.floor().max(0.0) as i64, MAX_PERCENT]),
            // Sort by deal percentage
            sort_type: 4,
        }
    }

    /// Whether the provider was asked for prime-eligible items only
    pub fn requires_prime(&self) -> bool {
        self.is_prime
    }

    pub fn requires_fba(&self) -> bool {
        self.is_fba
    }
}
