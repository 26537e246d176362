//! Data provider access
//!
//! - [`query`]: tier bounds to the provider's deal selection
//! - [`response`]: provider JSON to [`Candidate`]s
//! - [`client`]: the budgeted, retrying HTTP client

pub mod client;
pub mod query;
pub mod response;

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::FilterTier;
use crate::model::{Candidate, CategorySpec};

pub use client::ProviderClient;
pub use query::DealSelection;

/// Anything that can list candidate deals for one category under one tier's bounds
#[async_trait]
pub trait DealSource: Send + Sync {
    async fn fetch_category(
        &self,
        category: &CategorySpec,
        tier: &FilterTier,
    ) -> Result<Vec<Candidate>>;
}
