//! Deal Scoring and Ranking
//!
//! Assigns each surviving candidate a priority score and produces one merged,
//! strictly ordered sequence across all scanned categories.
//!
//! ## Ranking order
//!
//! 1. Score, descending
//! 2. Review count, descending (missing counts as zero)
//! 3. Popularity rank, ascending (missing ranks last)
//! 4. Item identifier, lexical
//! 5. Category identifier (only matters when one item was seen in two categories)

use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::metrics::PerformanceTimer;
use crate::model::{Candidate, CategoryId, CategorySpec, ScoredDeal};
use crate::publisher::{affiliate_url, product_url};

/// Scoring function. The weighting between commission and discount is a
/// business tuning parameter, so the engine takes it as a trait object.
pub trait ScoreFn: Send + Sync {
    fn score(&self, candidate: &Candidate, category: &CategorySpec) -> f64;

    fn name(&self) -> &'static str;
}

/// `commission rate x discount percent`
#[derive(Debug, Clone, Copy, Default)]
pub struct CommissionWeighted;

impl ScoreFn for CommissionWeighted {
    fn score(&self, candidate: &Candidate, category: &CategorySpec) -> f64 {
        category.commission_rate * candidate.discount_percent()
    }

    fn name(&self) -> &'static str {
        "commission_weighted"
    }
}

/// Total order used for ranking; `Less` means `a` ranks ahead of `b`
pub fn rank_order(a: &ScoredDeal, b: &ScoredDeal) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| {
            let ra = a.candidate.review_count.unwrap_or(0);
            let rb = b.candidate.review_count.unwrap_or(0);
            rb.cmp(&ra)
        })
        .then_with(|| {
            let pa = a.candidate.sales_rank.unwrap_or(u64::MAX);
            let pb = b.candidate.sales_rank.unwrap_or(u64::MAX);
            pa.cmp(&pb)
        })
        .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        .then_with(|| a.candidate.category_id.cmp(&b.candidate.category_id))
}

/// Scores and ranks candidates
#[derive(Clone)]
pub struct ScoringEngine {
    score_fn: Arc<dyn ScoreFn>,
    affiliate_tag: Option<String>,
}

impl ScoringEngine {
    pub fn new(affiliate_tag: Option<String>) -> Self {
        Self::with_score_fn(Arc::new(CommissionWeighted), affiliate_tag)
    }

    pub fn with_score_fn(score_fn: Arc<dyn ScoreFn>, affiliate_tag: Option<String>) -> Self {
        Self {
            score_fn,
            affiliate_tag,
        }
    }

    pub fn score_fn_name(&self) -> &'static str {
        self.score_fn.name()
    }

    pub fn score(&self, candidate: &Candidate, category: &CategorySpec) -> f64 {
        self.score_fn.score(candidate, category)
    }

    fn to_scored(&self, candidate: Candidate, category: &CategorySpec) -> ScoredDeal {
        let score = self.score(&candidate, category);
        ScoredDeal {
            product_url: product_url(&candidate.id),
            affiliate_url: affiliate_url(&candidate.id, self.affiliate_tag.as_deref()),
            score,
            commission_rate: category.commission_rate,
            category_label: category.label.clone(),
            candidate,
        }
    }

    /// Score every candidate and return them in rank order.
    ///
    /// Candidates whose category is unknown are dropped. The result depends only
    /// on the candidates' contents, never on their input order.
    pub fn rank(
        &self,
        candidates: Vec<Candidate>,
        categories: &HashMap<CategoryId, CategorySpec>,
    ) -> Vec<ScoredDeal> {
        let _timer = PerformanceTimer::new("rank_candidates");

        let mut scored: Vec<ScoredDeal> = candidates
            .into_par_iter()
            .filter_map(|candidate| {
                let category = categories.get(&candidate.category_id)?;
                Some(self.to_scored(candidate, category))
            })
            .collect();

        scored.par_sort_unstable_by(rank_order);
        scored
    }
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(None)
    }
}
