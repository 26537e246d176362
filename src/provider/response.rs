//! Provider deal response parsing
//!
//! Records are loosely typed: numeric arrays indexed by price type, nested
//! per-window averages, and `-1` wherever the provider has no data. Everything
//! is read through `serde_json::Value` and normalised into [`Candidate`]s.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Candidate, CategorySpec};

// Price history indices
const PRICE_MARKETPLACE: usize = 0;
const PRICE_NEW: usize = 1;
const SALES_RANK: usize = 3;
const RATING: usize = 16;
const REVIEW_COUNT: usize = 17;

/// Average windows, most preferred first: 30 days, 90 days, 7 days, 1 day
const AVERAGE_WINDOWS: [usize; 4] = [2, 3, 1, 0];

const IMAGE_BASE_URL: &str = "https://m.media-amazon.com/images/I";

/// Error object the provider may return alongside a 200
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
}

/// Top-level deal response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealResponse {
    #[serde(default)]
    deals: Option<Value>,
    pub tokens_left: Option<i64>,
    /// Milliseconds until the provider refills its own bucket
    pub refill_in: Option<u64>,
    pub error: Option<ProviderErrorBody>,
}

/// What the provider guaranteed through the selection
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionFlags {
    pub prime: bool,
    pub fba: bool,
}

impl DealResponse {
    pub fn parse(body: &str, category_id: u64) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| Error::malformed(category_id, format!("invalid JSON: {}", e)))
    }

    /// Map an in-body error to the provider error taxonomy
    pub fn error(&self) -> Option<Error> {
        let body = self.error.as_ref()?;
        let message = body
            .message
            .clone()
            .or_else(|| body.kind.clone())
            .unwrap_or_else(|| "unspecified provider error".to_string());
        let kind = body.kind.as_deref().unwrap_or_default().to_ascii_lowercase();

        Some(if kind.contains("key") || kind.contains("auth") {
            Error::ProviderAuth {
                message: message.into(),
            }
        } else if kind.contains("token") || kind.contains("limit") {
            Error::ProviderRateLimited {
                retry_after_ms: self.refill_in,
            }
        } else {
            Error::ProviderBadRequest {
                message: message.into(),
            }
        })
    }

    /// Normalise every usable record.
    ///
    /// Records without an identifier or a positive current price are skipped.
    /// Missing prime/FBA flags take the value the selection enforced.
    pub fn candidates(
        &self,
        category: &CategorySpec,
        flags: SelectionFlags,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let records = match &self.deals {
            None | Some(Value::Null) => {
                return Err(Error::malformed(category.id, "response has no deals"))
            }
            Some(Value::Object(deals)) => match deals.get("dr") {
                None | Some(Value::Null) => return Ok(Vec::new()),
                Some(Value::Array(records)) => records,
                Some(_) => return Err(Error::malformed(category.id, "deals.dr is not a list")),
            },
            // Some deployments return the record list directly
            Some(Value::Array(records)) => records,
            Some(_) => return Err(Error::malformed(category.id, "deals is not an object")),
        };

        let mut candidates = Vec::with_capacity(records.len());
        for record in records {
            match parse_record(record, category, flags, observed_at) {
                Some(candidate) => candidates.push(candidate),
                None => debug!("Skipping unusable record in category {}", category.id),
            }
        }
        Ok(candidates)
    }
}

/// A provider integer, treating `-1` and other negatives as missing
fn present(value: &Value) -> Option<i64> {
    value.as_i64().filter(|v| *v >= 0)
}

/// Element `index` of a list, or the value itself for a scalar at index 0
fn at(value: &Value, index: usize) -> Option<i64> {
    match value {
        Value::Array(items) => items.get(index).and_then(present),
        scalar if index == 0 => present(scalar),
        _ => None,
    }
}

/// First positive price across the price types we accept, with its index
fn current_price(record: &Value) -> Option<(usize, i64)> {
    let current = record.get("current")?;
    if !current.is_array() {
        return present(current).filter(|v| *v > 0).map(|v| (PRICE_MARKETPLACE, v));
    }
    [PRICE_MARKETPLACE, PRICE_NEW]
        .into_iter()
        .find_map(|i| at(current, i).filter(|v| *v > 0).map(|v| (i, v)))
}

fn reference_price(record: &Value, price_type: usize) -> Option<i64> {
    let avg = record.get("avg")?;
    match avg {
        Value::Array(windows) if windows.iter().any(Value::is_array) => AVERAGE_WINDOWS
            .iter()
            .filter_map(|w| windows.get(*w))
            .find_map(|window| at(window, price_type).filter(|v| *v > 0)),
        flat => at(flat, price_type).filter(|v| *v > 0),
    }
}

fn sales_rank(record: &Value) -> Option<u64> {
    if let Some(rank) = record
        .get("current")
        .and_then(|c| c.as_array().and_then(|items| items.get(SALES_RANK)))
        .and_then(present)
        .filter(|r| *r > 0)
    {
        return Some(rank as u64);
    }
    // Rank history: the last entry is the latest
    let latest = match record.get("salesRank")? {
        Value::Array(history) => history.last().and_then(present),
        scalar => present(scalar),
    };
    latest.filter(|r| *r > 0).map(|r| r as u64)
}

fn recent_drop_percent(record: &Value, price_type: usize) -> Option<f64> {
    // Price changes are negative when the price fell
    let delta = record.get("deltaPercentLast")?;
    let change = match delta {
        Value::Array(items) => items.get(price_type)?.as_i64()?,
        scalar => scalar.as_i64()?,
    };
    Some(change.saturating_neg().max(0) as f64)
}

fn image_url(record: &Value) -> Option<String> {
    let first = record
        .get("imagesCSV")?
        .as_str()?
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    Some(format!("{}/{}", IMAGE_BASE_URL, first))
}

fn non_empty_str(record: &Value, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_record(
    record: &Value,
    category: &CategorySpec,
    flags: SelectionFlags,
    observed_at: DateTime<Utc>,
) -> Option<Candidate> {
    let id = non_empty_str(record, "asin")?;
    let (price_type, current_cents) = current_price(record)?;
    let current_price = current_cents as f64 / 100.0;
    let reference_price = reference_price(record, price_type)
        .map(|cents| cents as f64 / 100.0)
        .unwrap_or(current_price);

    let current = record.get("current");
    let rating = current
        .and_then(|c| at(c, RATING))
        .filter(|r| *r > 0)
        .map(|r| r as f64 / 10.0);
    let review_count = current
        .and_then(|c| at(c, REVIEW_COUNT))
        .and_then(|n| u32::try_from(n).ok());

    Some(Candidate {
        id,
        category_id: category.id,
        title: non_empty_str(record, "title").unwrap_or_default(),
        brand: non_empty_str(record, "brand"),
        image_url: image_url(record),
        current_price,
        reference_price,
        sales_rank: sales_rank(record),
        review_count,
        rating,
        is_prime: record
            .get("isPrime")
            .and_then(Value::as_bool)
            .unwrap_or(flags.prime),
        is_fulfilled_by_provider: record
            .get("isFBA")
            .and_then(Value::as_bool)
            .unwrap_or(flags.fba),
        recent_drop_percent: recent_drop_percent(record, price_type),
        observed_at,
    })
}
