//! DealScan library crate
//!
//! Finds discounted products across a catalog of categories, ranks them by
//! expected commission and hands the best unseen ones to a publisher.
//!
//! - [`budget`]: token-bucket budget shared by every provider call
//! - [`provider`]: the budgeted, retrying deal provider client
//! - [`filter`]: ordered tiers of predicates, primary then fallbacks
//! - [`scoring`]: commission-weighted ranking with a total order
//! - [`dedup`]: cooldown window so an item is surfaced at most once per window
//! - [`scheduler`]: the scan / merge / emit cycle

pub mod api;
pub mod backoff;
pub mod budget;
pub mod config;
pub mod database;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod publisher;
pub mod scheduler;
pub mod scoring;

// Re-export commonly used types
pub use budget::RateBudget;
pub use config::{Catalog, Config};
pub use database::Database;
pub use dedup::{CooldownStore, DedupStore};
pub use error::{Error, Result};
pub use filter::{FilterCascade, FilterTier, TierUsed};
pub use model::{Candidate, CategorySpec, ScoredDeal};
pub use provider::{DealSource, ProviderClient};
pub use publisher::Publisher;
pub use scheduler::{CycleReport, CycleState, ScanScheduler};
pub use scoring::ScoringEngine;
