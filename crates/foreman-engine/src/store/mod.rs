//! Durable persistence.
//!
//! Each submodule is a repository of free functions over a
//! [`sqlx::PgExecutor`], so a caller can run any of them against the pool
//! directly or thread several through one transaction. The [`Store`] value
//! owns the pool and the schema migrations.

use std::time::Duration;

use foreman_core::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod alarms;
pub mod audit;
pub mod metrics;
pub mod queues;
pub mod status;
pub mod tasks;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to the database, verifying the connection.
    pub async fn connect(config: &DatabaseConfig) -> sqlx::Result<Self> {
        let pool = Self::pool_options(config).connect(&config.url).await?;
        Ok(Self { pool })
    }

    /// Create a store whose pool connects on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> sqlx::Result<Self> {
        let pool = Self::pool_options(config).connect_lazy(&config.url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(config.pool_size.min(2))
            .max_connections(config.max_connections().max(1))
            .acquire_timeout(config.pool_timeout)
            .max_lifetime(Some(config.pool_recycle.max(Duration::from_secs(60))))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> sqlx::Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await
    }

    /// Apply any pending schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}
