//! Cycle Metrics and Performance Monitoring
//!
//! Per-cycle counters and timings, plus a small analyzer that flags cycles
//! worth a second look (starved categories, heavy fallback use, slow scans).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Metrics for a single scan cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycle_id: String,
    pub timestamp: i64,

    // Performance metrics
    pub total_duration_ms: u64,
    pub scan_duration_ms: u64,
    pub merge_duration_ms: u64,
    pub emit_duration_ms: u64,

    // Scan metrics
    pub categories_scanned: usize,
    pub categories_fallback: usize,
    pub categories_exhausted: usize,
    /// Timed out, budget-starved or failed workers
    pub categories_failed: usize,
    pub tier_distribution: HashMap<String, usize>, // tier -> categories

    // Output metrics
    pub candidates_ranked: usize,
    pub fresh_deals: usize,
    pub submitted: usize,
    pub publish_failures: usize,
    pub avg_score: f64,

    pub budget_remaining: f64,
}

impl CycleMetrics {
    pub fn new(cycle_id: impl Into<String>) -> Self {
        Self {
            cycle_id: cycle_id.into(),
            ..Self::default()
        }
    }

    /// Count one category's outcome under its tier label
    pub fn record_tier(&mut self, tier: &str) {
        *self.tier_distribution.entry(tier.to_string()).or_insert(0) += 1;
    }
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            total_duration_ms: 0,
            scan_duration_ms: 0,
            merge_duration_ms: 0,
            emit_duration_ms: 0,
            categories_scanned: 0,
            categories_fallback: 0,
            categories_exhausted: 0,
            categories_failed: 0,
            tier_distribution: HashMap::new(),
            candidates_ranked: 0,
            fresh_deals: 0,
            submitted: 0,
            publish_failures: 0,
            avg_score: 0.0,
            budget_remaining: 0.0,
        }
    }
}

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: String,
}

impl PerformanceTimer {
    pub fn new(label: &str) -> Self {
        Self {
            start: Instant::now(),
            label: label.to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        tracing::debug!("{} completed in {}ms", self.label, self.elapsed_ms());
    }
}

/// Cycle health analyzer
pub struct CycleAnalyzer;

impl CycleAnalyzer {
    /// Share of scanned categories that needed a fallback tier (0-1)
    pub fn fallback_ratio(metrics: &CycleMetrics) -> f64 {
        if metrics.categories_scanned == 0 {
            return 0.0;
        }
        metrics.categories_fallback as f64 / metrics.categories_scanned as f64
    }

    /// Share of scanned categories that produced nothing at all (0-1)
    pub fn starvation_ratio(metrics: &CycleMetrics) -> f64 {
        if metrics.categories_scanned == 0 {
            return 0.0;
        }
        (metrics.categories_exhausted + metrics.categories_failed) as f64
            / metrics.categories_scanned as f64
    }

    /// Human-readable warnings about a finished cycle
    pub fn detect_issues(metrics: &CycleMetrics, slow_scan_ms: u64) -> Vec<String> {
        let mut issues = Vec::new();

        let fallback = Self::fallback_ratio(metrics);
        if fallback > 0.5 {
            issues.push(format!("High fallback ratio: {:.0}%", fallback * 100.0));
        }

        let starved = Self::starvation_ratio(metrics);
        if starved > 0.5 {
            issues.push(format!("Most categories starved: {:.0}%", starved * 100.0));
        }

        if metrics.categories_failed > 0 {
            issues.push(format!(
                "{} categories failed or timed out",
                metrics.categories_failed
            ));
        }

        if metrics.scan_duration_ms > slow_scan_ms {
            issues.push(format!("Slow scan: {}ms", metrics.scan_duration_ms));
        }

        if metrics.publish_failures > 0 {
            issues.push(format!("{} publish failures", metrics.publish_failures));
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios() {
        let mut metrics = CycleMetrics::new("c1");
        assert_eq!(CycleAnalyzer::fallback_ratio(&metrics), 0.0);

        metrics.categories_scanned = 10;
        metrics.categories_fallback = 3;
        metrics.categories_exhausted = 1;
        metrics.categories_failed = 1;
        assert!((CycleAnalyzer::fallback_ratio(&metrics) - 0.3).abs() < 1e-9);
        assert!((CycleAnalyzer::starvation_ratio(&metrics) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_detect_issues() {
        let mut metrics = CycleMetrics::new("c2");
        metrics.categories_scanned = 4;
        metrics.categories_fallback = 3;
        metrics.categories_failed = 1;
        metrics.scan_duration_ms = 90_000;
        metrics.publish_failures = 2;

        let issues = CycleAnalyzer::detect_issues(&metrics, 60_000);
        assert!(issues.iter().any(|i| i.contains("High fallback")));
        assert!(issues.iter().any(|i| i.contains("timed out")));
        assert!(issues.iter().any(|i| i.contains("Slow scan")));
        assert!(issues.iter().any(|i| i.contains("publish failures")));

        let quiet = CycleMetrics::new("c3");
        assert!(CycleAnalyzer::detect_issues(&quiet, 60_000).is_empty());
    }

    #[test]
    fn test_record_tier() {
        let mut metrics = CycleMetrics::default();
        metrics.record_tier("primary");
        metrics.record_tier("primary");
        metrics.record_tier("fallback#1");
        assert_eq!(metrics.tier_distribution["primary"], 2);
        assert_eq!(metrics.tier_distribution["fallback#1"], 1);
    }
}
