//! Database connection pool and utilities
//!
//! The only persistent state is the cooldown table, so the pool is small and
//! optional: without `DATABASE_URL` the engine keeps cooldowns in memory.

use crate::config::DatabaseConfig;
use crate::dedup::PgCooldownStore;
use crate::error::{Error, Result};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and bring the schema up to date
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cooldown store backed by this pool
    pub fn cooldown_store(&self) -> PgCooldownStore {
        PgCooldownStore::new(self.pool.clone())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Health check failed: {}", e).into(),
                source: Some(e),
            })?;
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Close all connections gracefully
    pub async fn close(&self) {
        info!("Closing database connection pool...");
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// Create a connection pool with the given configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!("Creating database connection pool...");
    debug!(
        "Pool config: max={}, min={}, connect_timeout={:?}",
        config.max_connections, config.min_connections, config.connect_timeout
    );

    let connect_options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| Error::Config {
            message: format!("Invalid database URL: {}", e).into(),
            source: None,
        })?
        .statement_cache_capacity(config.statement_cache_size)
        .log_statements(log::LevelFilter::Debug)
        .log_slow_statements(log::LevelFilter::Warn, Duration::from_millis(500));

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .connect_with(connect_options)
        .await
        .map_err(|e| Error::Database {
            message: format!("Failed to create connection pool: {}", e).into(),
            source: Some(e),
        })?;

    info!(
        "Database connection pool created (size: {}, idle: {})",
        pool.size(),
        pool.num_idle()
    );

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Migration(e.to_string()))?;

    info!("Database migrations completed");
    Ok(())
}
