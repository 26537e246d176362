//! Configuration management for the DealScan engine
//!
//! Strongly-typed configuration loaded once at startup from environment
//! variables (or an `FFOLDER` directory of secret files), plus an optional TOML
//! catalog of categories and filter tiers. Validated, summarised with secrets
//! masked, then shared read-only for the rest of the run.
//!
//! # Example
//! ```no_run
//! use dealscan::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("Scanning {} categories", config.catalog.categories.len());
//! ```

use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::budget::AcquirePolicy;
use crate::error::{Error, Result};
use crate::filter::{FilterCascade, FilterTier, TierBounds};
use crate::model::{CategoryId, CategorySpec};

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data provider client configuration
    pub provider: ProviderConfig,
    /// Shared request budget
    pub budget: BudgetConfig,
    /// Cycle timing and worker pool
    pub scheduler: SchedulerConfig,
    /// Recency dedup
    pub cooldown: CooldownConfig,
    /// Publisher collaborator
    pub publisher: PublisherConfig,
    /// Postgres for cooldown records; `None` keeps them in memory
    pub database: Option<DatabaseConfig>,
    /// Status server
    pub api: ApiConfig,
    /// Categories and filter tiers
    pub catalog: Catalog,
}

/// Data provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    /// Marketplace domain (1 = US)
    pub domain_id: u32,
    /// Per-call timeout
    pub request_timeout: Duration,
    /// Attempts per query for transient and rate-limited failures
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Extra backoff factor when the provider itself rate limits us
    pub rate_limit_multiplier: u32,
    /// Budget tokens consumed by one query
    pub query_cost: u32,
}

/// Request budget configuration
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub tokens_per_minute: u32,
    pub capacity: u32,
    /// Delay between denied acquisitions
    pub retry_delay: Duration,
    /// Denied acquisitions before a category is skipped for the cycle
    pub max_attempts: u32,
    /// Where the budget level is kept across restarts
    pub state_file: Option<PathBuf>,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cycle_interval: Duration,
    /// Concurrent category workers
    pub concurrency: usize,
    /// Upper bound on one category's whole cascade
    pub worker_timeout: Duration,
    /// Scan only the top-N categories by priority; `None` scans all
    pub max_categories: Option<usize>,
    /// Deals handed to the publisher per cycle
    pub max_items_per_cycle: usize,
}

/// Longest accepted cooldown window: one year
pub const MAX_COOLDOWN_HOURS: u64 = 365 * 24;

/// Cooldown configuration
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub window: Duration,
}

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Endpoint receiving deals; `None` selects the dry-run publisher
    pub webhook_url: Option<String>,
    pub affiliate_tag: Option<String>,
    pub timeout: Duration,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections to keep open
    pub min_connections: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle timeout for connections
    pub idle_timeout: Duration,
    /// Maximum lifetime for connections
    pub max_lifetime: Duration,
    /// Enable statement caching
    pub statement_cache_size: usize,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Port to listen on
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Request timeout
    pub request_timeout: Duration,
    /// Enable CORS
    pub cors_enabled: bool,
    /// Allowed origins for CORS
    pub cors_origins: Vec<String>,
}

/// Logging configuration. Read before everything else so startup is logged.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for the daily rotating log file
    pub dir: Option<PathBuf>,
    pub json: bool,
}

/// Categories to scan and the ordered filter tiers
#[derive(Debug, Clone)]
pub struct Catalog {
    pub categories: Vec<CategorySpec>,
    pub tiers: Vec<FilterTier>,
}

/// On-disk catalog layout
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    categories: Vec<CategorySpec>,
    #[serde(default)]
    tiers: Vec<FilterTier>,
}

// ============================================================================
// Built-in catalog
// ============================================================================

/// Category, browse node and commission rate (percent)
static BUILTIN_CATEGORIES: Lazy<Vec<CategorySpec>> = Lazy::new(|| {
    [
        (11055981, "Luxury Beauty", 10.0),
        (3375251, "Beauty Tools", 10.0),
        (1055398, "Home & Kitchen", 4.0),
        (7141123011, "Women's Fashion", 4.0),
        (7147441011, "Men's Fashion", 4.0),
        (16310101, "Amazon Devices", 4.0),
        (2335752011, "Fashion Accessories", 4.0),
        (165796011, "Toys & Games", 3.0),
        (468642, "Video Games", 3.0),
        (172282, "Electronics", 3.0),
    ]
    .into_iter()
    .map(|(id, label, rate)| CategorySpec::new(id, label, rate))
    .collect()
});

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        load_env_sources();

        let config = Self {
            provider: ProviderConfig::from_env()?,
            budget: BudgetConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            cooldown: CooldownConfig::from_env()?,
            publisher: PublisherConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            api: ApiConfig::from_env()?,
            catalog: Catalog::from_env()?,
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Defaults everywhere except the credential and the catalog. No environment reads.
    pub fn new(api_key: impl Into<String>, catalog: Catalog) -> Self {
        Self {
            provider: ProviderConfig {
                api_key: api_key.into(),
                base_url: "https://api.keepa.com".to_string(),
                domain_id: 1,
                request_timeout: Duration::from_millis(15_000),
                max_attempts: 3,
                backoff_base: Duration::from_millis(500),
                backoff_max: Duration::from_millis(30_000),
                rate_limit_multiplier: 4,
                query_cost: 5,
            },
            budget: BudgetConfig {
                tokens_per_minute: 1200,
                capacity: 1200,
                retry_delay: Duration::from_millis(250),
                max_attempts: 8,
                state_file: None,
            },
            scheduler: SchedulerConfig {
                cycle_interval: Duration::from_secs(900),
                concurrency: 3,
                worker_timeout: Duration::from_secs(120),
                max_categories: None,
                max_items_per_cycle: 50,
            },
            cooldown: CooldownConfig {
                window: Duration::from_secs(24 * 3600),
            },
            publisher: PublisherConfig {
                webhook_url: None,
                affiliate_tag: None,
                timeout: Duration::from_secs(10),
            },
            database: None,
            api: ApiConfig {
                enabled: false,
                port: 8080,
                host: "0.0.0.0".to_string(),
                request_timeout: Duration::from_secs(30),
                cors_enabled: true,
                cors_origins: vec!["*".to_string()],
            },
            catalog,
        }
    }

    /// Validate configuration. Every failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.provider.api_key.trim().is_empty() {
            return Err(Error::InvalidConfig {
                key: "PROVIDER_API_KEY",
                message: "API key cannot be empty".into(),
            });
        }

        if self.scheduler.concurrency == 0 {
            return Err(Error::InvalidConfig {
                key: "SCAN_CONCURRENCY",
                message: "at least one worker is required".into(),
            });
        }

        if self.provider.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                key: "PROVIDER_MAX_ATTEMPTS",
                message: "at least one attempt is required".into(),
            });
        }

        if self.budget.tokens_per_minute == 0 {
            return Err(Error::InvalidConfig {
                key: "KEEPA_TOKENS_PER_MINUTE",
                message: "refill rate must be positive".into(),
            });
        }

        if self.provider.query_cost > self.budget.capacity {
            return Err(Error::InvalidConfig {
                key: "PROVIDER_QUERY_COST",
                message: format!(
                    "query cost {} exceeds budget capacity {}",
                    self.provider.query_cost, self.budget.capacity
                )
                .into(),
            });
        }

        if self.cooldown.window > Duration::from_secs(MAX_COOLDOWN_HOURS * 3600) {
            return Err(Error::InvalidConfig {
                key: "COOLDOWN_HOURS",
                message: format!(
                    "cooldown window {:?} exceeds {} hours",
                    self.cooldown.window, MAX_COOLDOWN_HOURS
                )
                .into(),
            });
        }

        if let Some(db) = &self.database {
            if db.max_connections < db.min_connections {
                return Err(Error::InvalidConfig {
                    key: "DB_MAX_CONNECTIONS",
                    message: "max_connections must be >= min_connections".into(),
                });
            }
        }

        self.catalog.validate()
    }

    /// Log configuration summary (without sensitive data)
    fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Provider:");
        info!("    Base URL: {}", self.provider.base_url);
        info!("    API key: {}", mask_secret(&self.provider.api_key));
        info!(
            "    Query cost: {}, attempts: {}",
            self.provider.query_cost, self.provider.max_attempts
        );
        info!("  Budget:");
        info!(
            "    {} tokens/min, capacity {}",
            self.budget.tokens_per_minute, self.budget.capacity
        );
        info!("  Scheduler:");
        info!("    Interval: {:?}", self.scheduler.cycle_interval);
        info!(
            "    Workers: {}, worker timeout: {:?}",
            self.scheduler.concurrency, self.scheduler.worker_timeout
        );
        info!("    Max items per cycle: {}", self.scheduler.max_items_per_cycle);
        info!("  Cooldown: {:?}", self.cooldown.window);
        info!("  Catalog:");
        info!(
            "    {} categories, tiers: {}",
            self.catalog.categories.len(),
            self.catalog
                .tiers
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        info!("  Publisher:");
        match &self.publisher.webhook_url {
            Some(url) => info!("    Webhook: {}", mask_url(url)),
            None => info!("    Dry run (no PUBLISHER_WEBHOOK_URL)"),
        }
        info!("  Database:");
        match &self.database {
            Some(db) => info!(
                "    {} (pool {}-{})",
                mask_url(&db.url),
                db.min_connections,
                db.max_connections
            ),
            None => info!("    In-memory cooldown store (no DATABASE_URL)"),
        }
        info!("  API:");
        if self.api.enabled {
            info!("    Listening on: {}:{}", self.api.host, self.api.port);
        } else {
            info!("    Disabled");
        }
    }
}

/// Populate the process environment from `FFOLDER` or `.env`
fn load_env_sources() {
    // Platforms that mount secrets as files: each file name is the env var name
    // and its contents is the value.
    if let Ok(folder) = std::env::var("FFOLDER") {
        let p = Path::new(&folder);
        if p.is_dir() {
            match std::fs::read_dir(p) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let Ok(fname) = entry.file_name().into_string() else {
                            continue;
                        };
                        let fpath = entry.path();
                        if !fpath.is_file() {
                            continue;
                        }
                        if let Ok(contents) = std::fs::read_to_string(&fpath) {
                            // Only set env var if not already set in the environment
                            if std::env::var(&fname).is_err() {
                                std::env::set_var(&fname, contents.trim());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!("Failed to read FFOLDER {}: {}", folder, err);
                }
            }
            info!("Loaded configuration from FFOLDER={}", folder);
        }
    } else {
        // Try to load .env file (ignore if not found)
        dotenvy::dotenv().ok();
    }
}

impl ProviderConfig {
    fn from_env() -> Result<Self> {
        let api_key = get_env("PROVIDER_API_KEY").or_else(|_| get_env("KEEPA_API_KEY"))?;

        Ok(Self {
            api_key,
            base_url: get_env_or("PROVIDER_BASE_URL", "https://api.keepa.com")
                .trim_end_matches('/')
                .to_string(),
            domain_id: env_or("PROVIDER_DOMAIN_ID", 1),
            request_timeout: Duration::from_millis(env_or("PROVIDER_REQUEST_TIMEOUT_MS", 15_000)),
            max_attempts: env_or("PROVIDER_MAX_ATTEMPTS", 3),
            backoff_base: Duration::from_millis(env_or("PROVIDER_BACKOFF_BASE_MS", 500)),
            backoff_max: Duration::from_millis(env_or("PROVIDER_BACKOFF_MAX_MS", 30_000)),
            rate_limit_multiplier: env_or("PROVIDER_RATE_LIMIT_MULTIPLIER", 4),
            query_cost: env_or("PROVIDER_QUERY_COST", 5),
        })
    }
}

impl BudgetConfig {
    fn from_env() -> Result<Self> {
        let tokens_per_minute = env_or("KEEPA_TOKENS_PER_MINUTE", 1200);

        Ok(Self {
            tokens_per_minute,
            capacity: env_or("BUDGET_CAPACITY", tokens_per_minute),
            retry_delay: Duration::from_millis(env_or("BUDGET_RETRY_DELAY_MS", 250)),
            max_attempts: env_or("BUDGET_MAX_ATTEMPTS", 8),
            state_file: non_empty_env("BUDGET_STATE_FILE").map(PathBuf::from),
        })
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        AcquirePolicy {
            retry_delay: self.retry_delay,
            max_attempts: self.max_attempts.max(1),
        }
    }
}

impl SchedulerConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            cycle_interval: Duration::from_secs(env_or("CYCLE_INTERVAL_SECS", 900)),
            concurrency: env_or("SCAN_CONCURRENCY", 3),
            worker_timeout: Duration::from_secs(env_or("WORKER_TIMEOUT_SECS", 120)),
            max_categories: std::env::var("MAX_CATEGORIES_PER_CYCLE")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            max_items_per_cycle: env_or("DEAL_CHECK_BATCH_SIZE", 50),
        })
    }
}

impl CooldownConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            window: Duration::from_secs(
                env_or::<u64>("COOLDOWN_HOURS", 24).saturating_mul(3600),
            ),
        })
    }

    /// The window as a calendar duration for timestamp arithmetic
    pub fn window_chrono(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.window).map_err(|e| Error::InvalidConfig {
            key: "COOLDOWN_HOURS",
            message: format!("window out of range: {}", e).into(),
        })
    }
}

impl PublisherConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            webhook_url: non_empty_env("PUBLISHER_WEBHOOK_URL"),
            affiliate_tag: non_empty_env("AMAZON_AFFILIATE_TAG"),
            timeout: Duration::from_secs(env_or("PUBLISHER_TIMEOUT_SECS", 10)),
        })
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Option<Self>> {
        let Some(url) = non_empty_env("DATABASE_URL") else {
            return Ok(None);
        };

        Ok(Some(Self {
            url,
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 1),
            connect_timeout: Duration::from_secs(env_or("DB_CONNECT_TIMEOUT_SECS", 30)),
            idle_timeout: Duration::from_secs(env_or("DB_IDLE_TIMEOUT_SECS", 600)),
            max_lifetime: Duration::from_secs(env_or("DB_MAX_LIFETIME_SECS", 3600)),
            statement_cache_size: env_or("DB_STATEMENT_CACHE_SIZE", 100),
        }))
    }
}

impl ApiConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: env_or("API_ENABLED", true),
            port: env_or("API_PORT", 8080),
            host: get_env_or("API_HOST", "0.0.0.0"),
            request_timeout: Duration::from_secs(env_or("API_REQUEST_TIMEOUT_SECS", 30)),
            cors_enabled: env_or("API_CORS_ENABLED", true),
            cors_origins: get_env_or("API_CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        })
    }
}

impl LoggingConfig {
    /// Also loads `.env` and mounted secrets, so call it first
    pub fn from_env() -> Self {
        load_env_sources();
        Self {
            dir: non_empty_env("LOG_DIR").map(PathBuf::from),
            json: get_env_or("LOG_FORMAT", "pretty").eq_ignore_ascii_case("json"),
        }
    }
}

// ============================================================================
// Catalog
// ============================================================================

impl Catalog {
    /// Catalog from `DEALS_CATALOG`, else the built-in categories with env tiers
    pub fn from_env() -> Result<Self> {
        match non_empty_env("DEALS_CATALOG") {
            Some(path) => {
                info!("Loading catalog from {}", path);
                let mut catalog = Self::load(&path)?;
                if catalog.tiers.is_empty() {
                    catalog.tiers = tiers_from_env();
                }
                Ok(catalog)
            }
            None => Ok(Self {
                categories: BUILTIN_CATEGORIES.clone(),
                tiers: tiers_from_env(),
            }),
        }
    }

    /// Built-in categories with the default tiers
    pub fn builtin() -> Self {
        Self {
            categories: BUILTIN_CATEGORIES.clone(),
            tiers: crate::filter::default_tiers(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Cannot read catalog {}", path.display()).into(),
            source: Some(Box::new(e)),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(raw).map_err(|e| Error::Config {
            message: "Invalid catalog TOML".into(),
            source: Some(Box::new(e)),
        })?;

        Ok(Self {
            categories: file.categories,
            tiers: file.tiers.into_iter().map(FilterTier::compiled).collect(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(Error::InvalidConfig {
                key: "DEALS_CATALOG",
                message: "no categories configured".into(),
            });
        }
        if self.tiers.is_empty() {
            return Err(Error::InvalidConfig {
                key: "DEALS_CATALOG",
                message: "no filter tiers configured".into(),
            });
        }

        let mut seen = HashSet::new();
        for category in &self.categories {
            if !seen.insert(category.id) {
                return Err(Error::InvalidConfig {
                    key: "DEALS_CATALOG",
                    message: format!("duplicate category id {}", category.id).into(),
                });
            }
            if !(category.commission_rate >= 0.0) {
                return Err(Error::InvalidConfig {
                    key: "DEALS_CATALOG",
                    message: format!("category {} has a negative commission rate", category.id)
                        .into(),
                });
            }
        }

        for tier in &self.tiers {
            if let (Some(min), Some(max)) = (tier.bounds.min_price, tier.bounds.max_price) {
                if max < min {
                    return Err(Error::InvalidConfig {
                        key: "MAX_PRODUCT_PRICE",
                        message: format!(
                            "tier '{}' max price {} is below min price {}",
                            tier.name, max, min
                        )
                        .into(),
                    });
                }
            }
        }

        for pair in self.tiers.windows(2) {
            if !pair[1].bounds.relaxes(&pair[0].bounds) {
                warn!(
                    "Tier '{}' is not looser than '{}'; it may reject items the earlier tier accepts",
                    pair[1].name, pair[0].name
                );
            }
        }

        Ok(())
    }

    pub fn category_map(&self) -> HashMap<CategoryId, CategorySpec> {
        self.categories.iter().map(|c| (c.id, c.clone())).collect()
    }

    pub fn cascade(&self) -> FilterCascade {
        FilterCascade::new(self.tiers.clone())
    }
}

/// Primary and fallback tiers, each bound overridable from the environment
fn tiers_from_env() -> Vec<FilterTier> {
    let defaults = crate::filter::default_tiers();
    let (primary, fallback) = (&defaults[0].bounds, &defaults[1].bounds);

    let min_price = env_or_opt("MIN_PRODUCT_PRICE", primary.min_price);
    let max_price = env_or_opt("MAX_PRODUCT_PRICE", primary.max_price);

    let primary = TierBounds {
        min_discount_percent: env_or_opt("MIN_DISCOUNT_PERCENT", primary.min_discount_percent),
        min_price,
        max_price,
        max_sales_rank: env_or_opt("MAX_SALES_RANK", primary.max_sales_rank),
        min_review_count: env_or_opt("MIN_REVIEW_COUNT", primary.min_review_count),
        min_rating: env_or_opt("MIN_REVIEW_RATING", primary.min_rating),
        min_savings: env_or_opt("MIN_PRICE_DROP", primary.min_savings),
        ..primary.clone()
    };
    let fallback = TierBounds {
        min_discount_percent: env_or_opt("FALLBACK_MIN_DISCOUNT", fallback.min_discount_percent),
        min_price,
        max_price,
        max_sales_rank: env_or_opt("FALLBACK_MAX_SALES_RANK", fallback.max_sales_rank),
        min_review_count: env_or_opt("FALLBACK_MIN_REVIEW_COUNT", fallback.min_review_count),
        ..fallback.clone()
    };

    vec![
        FilterTier::new("primary", primary),
        FilterTier::new("fallback", fallback),
    ]
}

// ============================================================================
// Helper functions
// ============================================================================

/// Get required environment variable
fn get_env(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::MissingEnvVar { var: key })
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Set and non-blank, trimmed
fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable, falling back to `default` when unset or invalid
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid value '{}' for {}", raw, key);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_or_opt<T: FromStr>(key: &str, default: Option<T>) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid value '{}' for {}", raw, key);
                default
            }
        },
        Err(_) => default,
    }
}

/// Mask sensitive parts of URL
fn mask_url(url: &str) -> String {
    // Mask password if present
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let (before, after) = url.split_at(colon_pos + 1);
            let (_, rest) = after.split_at(at_pos - colon_pos - 1);
            return format!("{}****{}", before, rest);
        }
    }
    url.to_string()
}

/// Keep only the last four characters of a credential
fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"
[[categories]]
id = 11055981
label = "Luxury Beauty"
commission_rate = 10.0

[[categories]]
id = 172282
label = "Electronics"
commission_rate = 3.0
priority = 20.0

[[tiers]]
name = "primary"
min_discount_percent = 20.0
max_sales_rank = 50000
require_prime = true

[[tiers]]
name = "fallback"
min_discount_percent = 10.0
"#;

    #[test]
    fn test_catalog_from_toml() {
        let catalog = Catalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.categories.len(), 2);
        assert_eq!(catalog.categories[1].priority_weight(), 20.0);
        assert_eq!(catalog.tiers.len(), 2);
        assert_eq!(catalog.tiers[0].bounds.max_sales_rank, Some(50_000));
        // Predicates are rebuilt after deserializing
        assert_eq!(catalog.tiers[0].predicates().len(), 3);
        assert_eq!(catalog.tiers[1].predicates().len(), 1);
        catalog.validate().unwrap();
    }

    #[test]
    fn test_catalog_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.category_map().len(), 2);

        assert!(matches!(
            Catalog::load("/nonexistent/catalog.toml"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            Catalog::from_toml_str("[[categories]]\nid = \"not a number\""),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_catalog_validation() {
        let mut catalog = Catalog::builtin();
        catalog.validate().unwrap();
        assert_eq!(catalog.categories.len(), 10);

        catalog.categories.push(CategorySpec::new(172282, "Electronics again", 3.0));
        assert!(matches!(
            catalog.validate(),
            Err(Error::InvalidConfig { .. })
        ));

        let mut inverted = Catalog::builtin();
        inverted.tiers[0].bounds.max_price = Some(5.0);
        assert!(inverted.validate().is_err());

        let empty = Catalog {
            categories: Vec::new(),
            tiers: crate::filter::default_tiers(),
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::new("secret-key", Catalog::builtin());
        config.validate().unwrap();

        config.scheduler.concurrency = 0;
        assert!(config.validate().unwrap_err().is_fatal());

        let mut config = Config::new("secret-key", Catalog::builtin());
        config.provider.query_cost = config.budget.capacity + 1;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig {
                key: "PROVIDER_QUERY_COST",
                ..
            })
        ));

        let config = Config::new("  ", Catalog::builtin());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cooldown_window_upper_bound() {
        let mut config = Config::new("k", Catalog::builtin());
        config.cooldown.window = Duration::from_secs(MAX_COOLDOWN_HOURS * 3600);
        config.validate().unwrap();

        config.cooldown.window = Duration::from_secs(u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig {
                key: "COOLDOWN_HOURS",
                ..
            })
        ));
    }

    #[test]
    fn test_cooldown_window_chrono() {
        let config = Config::new("k", Catalog::builtin());
        assert_eq!(
            config.cooldown.window_chrono().unwrap(),
            chrono::Duration::hours(24)
        );
    }

    #[test]
    fn test_masking() {
        assert_eq!(
            mask_url("postgres://user:hunter2@db:5432/deals"),
            "postgres://user:****@db:5432/deals"
        );
        assert_eq!(mask_secret("abcdef123456"), "****3456");
        assert_eq!(mask_secret("abc"), "****");
    }
}
