//! Publisher collaborator boundary
//!
//! The engine hands each emitted deal to a [`Publisher`] in rank order. How the
//! deal becomes a post is the publisher's business; the engine only needs an
//! accepted/failed answer so it knows whether to start the cooldown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::ScoredDeal;

const PRODUCT_BASE_URL: &str = "https://www.amazon.com/dp";

/// Canonical product page
pub fn product_url(id: &str) -> String {
    format!("{}/{}", PRODUCT_BASE_URL, id)
}

/// Product page with the affiliate tag attached; blank tags are ignored
pub fn affiliate_url(id: &str, tag: Option<&str>) -> String {
    match tag.map(str::trim).filter(|t| !t.is_empty()) {
        Some(tag) => format!("{}?tag={}", product_url(id), tag),
        None => product_url(id),
    }
}

/// Identifier the publisher assigned to an accepted deal
pub type PublishedId = String;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn submit(&self, deal: &ScoredDeal) -> Result<PublishedId>;

    fn name(&self) -> &'static str;
}

/// Wire body sent to the webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealPayload {
    pub asin: String,
    pub title: String,
    pub brand: Option<String>,
    pub category: String,
    pub original_price: f64,
    pub deal_price: f64,
    pub discount_percent: f64,
    pub savings_amount: f64,
    pub score: f64,
    pub commission_rate: f64,
    pub image_url: Option<String>,
    pub product_url: String,
    pub affiliate_url: String,
}

impl From<&ScoredDeal> for DealPayload {
    fn from(deal: &ScoredDeal) -> Self {
        let c = &deal.candidate;
        Self {
            asin: c.id.clone(),
            title: c.title.clone(),
            brand: c.brand.clone(),
            category: deal.category_label.clone(),
            original_price: c.reference_price,
            deal_price: c.current_price,
            discount_percent: (c.discount_percent() * 10.0).round() / 10.0,
            savings_amount: (c.savings() * 100.0).round() / 100.0,
            score: deal.score,
            commission_rate: deal.commission_rate,
            image_url: c.image_url.clone(),
            product_url: deal.product_url.clone(),
            affiliate_url: deal.affiliate_url.clone(),
        }
    }
}

/// Logs every deal and accepts it. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct DryRunPublisher;

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn submit(&self, deal: &ScoredDeal) -> Result<PublishedId> {
        info!(
            "[dry-run] {} | {:.0}% off ${:.2} | score {:.1} | {}",
            deal.category_label,
            deal.discount_percent(),
            deal.candidate.current_price,
            deal.score,
            deal.affiliate_url
        );
        Ok(format!("dry-run-{}", uuid::Uuid::new_v4()))
    }

    fn name(&self) -> &'static str {
        "dry_run"
    }
}

#[derive(Debug, Deserialize)]
struct WebhookAck {
    id: Option<String>,
}

/// POSTs each deal as JSON to an external endpoint
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dealscan/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    #[instrument(skip(self, deal), fields(deal_id = %deal.id()))]
    async fn submit(&self, deal: &ScoredDeal) -> Result<PublishedId> {
        let response = self
            .client
            .post(&self.url)
            .json(&DealPayload::from(deal))
            .send()
            .await
            .map_err(|e| Error::publish(deal.id(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::publish(
                deal.id(),
                format!("webhook returned {}: {}", status, body.trim()),
            ));
        }

        // An empty or non-JSON body still counts as accepted
        let body = response.text().await.unwrap_or_default();
        let id = serde_json::from_str::<WebhookAck>(&body)
            .ok()
            .and_then(|ack| ack.id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!("Webhook accepted {} as {}", deal.id(), id);
        Ok(id)
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
