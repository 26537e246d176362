//! Budgeted, retrying provider client
//!
//! Every attempt (first try or retry) pays the query cost from the shared
//! [`RateBudget`] before the request goes out. Transient and rate-limited
//! failures are retried with exponential backoff up to a fixed attempt cap;
//! everything else is returned to the caller immediately.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::query::DealSelection;
use super::response::{DealResponse, SelectionFlags};
use super::DealSource;
use crate::backoff::ExponentialBackoff;
use crate::budget::{AcquirePolicy, RateBudget};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::filter::FilterTier;
use crate::model::{Candidate, CategorySpec};

const JITTER: f64 = 0.1;

pub struct ProviderClient {
    http: Client,
    base_url: String,
    api_key: String,
    domain_id: u32,
    request_timeout: Duration,
    budget: Arc<RateBudget>,
    acquire_policy: AcquirePolicy,
    query_cost: u32,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    rate_limit_multiplier: u32,
}

impl ProviderClient {
    pub fn new(
        config: &ProviderConfig,
        budget: Arc<RateBudget>,
        acquire_policy: AcquirePolicy,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("dealscan/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            domain_id: config.domain_id,
            request_timeout: config.request_timeout,
            budget,
            acquire_policy,
            query_cost: config.query_cost,
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            rate_limit_multiplier: config.rate_limit_multiplier,
        })
    }

    /// One HTTP round trip, no budget and no retries
    async fn request_once(
        &self,
        category: &CategorySpec,
        selection: &DealSelection,
    ) -> Result<Vec<Candidate>> {
        let selection_json = serde_json::to_string(selection)?;
        let domain = self.domain_id.to_string();
        let send = self
            .http
            .get(format!("{}/deal", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("domain", domain.as_str()),
                ("selection", selection_json.as_str()),
            ])
            .send();

        let response = match tokio::time::timeout(self.request_timeout, send).await {
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return Err(Error::transient(e.to_string(), None))
            }
            Ok(Err(e)) => return Err(Error::Http(e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000));

        let body = response.text().await.map_err(|e| {
            Error::transient(format!("failed to read body: {}", e), Some(status.as_u16()))
        })?;

        let parsed = DealResponse::parse(&body, category.id);
        if let Ok(ref parsed) = parsed {
            if let Some(tokens_left) = parsed.tokens_left {
                self.budget.reconcile(tokens_left);
            }
        }

        match status.as_u16() {
            200..=299 => {}
            429 => {
                return Err(Error::ProviderRateLimited {
                    retry_after_ms: retry_after_ms
                        .or_else(|| parsed.as_ref().ok().and_then(|p| p.refill_in)),
                })
            }
            401 | 402 | 403 => {
                return Err(Error::ProviderAuth {
                    message: format!("provider returned {}", status).into(),
                })
            }
            code if code >= 500 => {
                return Err(Error::transient(
                    format!("provider returned {}", status),
                    Some(code),
                ))
            }
            _ => {
                return Err(Error::ProviderBadRequest {
                    message: format!("provider returned {}: {}", status, truncate(&body, 200))
                        .into(),
                })
            }
        }

        let parsed = parsed?;
        if let Some(err) = parsed.error() {
            return Err(err);
        }

        parsed.candidates(
            category,
            SelectionFlags {
                prime: selection.requires_prime(),
                fba: selection.requires_fba(),
            },
            Utc::now(),
        )
    }
}

#[async_trait]
impl DealSource for ProviderClient {
    #[instrument(skip(self, category, tier), fields(category = category.id, tier = %tier.name))]
    async fn fetch_category(
        &self,
        category: &CategorySpec,
        tier: &FilterTier,
    ) -> Result<Vec<Candidate>> {
        let selection = DealSelection::from_tier(category, &tier.bounds, self.domain_id);
        let mut backoff = ExponentialBackoff::new(self.backoff_base, self.backoff_max, JITTER);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if !self
                .budget
                .acquire_with_backoff(self.query_cost, &self.acquire_policy)
                .await
            {
                return Err(Error::BudgetExhausted {
                    category_id: category.id,
                    attempts: self.acquire_policy.max_attempts,
                });
            }

            match self.request_once(category, &selection).await {
                Ok(candidates) => {
                    debug!(
                        "Fetched {} candidates on attempt {}",
                        candidates.len(),
                        attempt
                    );
                    return Ok(candidates);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let mut delay = backoff
                        .next_delay_scaled(e.retry_multiplier(self.rate_limit_multiplier));
                    if let Error::ProviderRateLimited {
                        retry_after_ms: Some(ms),
                    } = e
                    {
                        delay = delay.max(Duration::from_millis(ms).min(self.backoff_max));
                    }
                    warn!(
                        "Provider request failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
