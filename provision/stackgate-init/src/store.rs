//! Store access for the initializer
//!
//! Every operation is idempotent. Migrations run under sqlx's advisory
//! migration lock, settings and the admin account are insert-if-absent, so
//! concurrent initializers converge on the same state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Settings written on first run, never overwritten afterwards
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("enable_deduplication", "false"),
    ("enable_jira", "false"),
    ("enable_product_grade", "true"),
    ("enable_benchmark", "true"),
    ("time_zone", "UTC"),
];

/// Admin row ready for insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
}

#[async_trait]
pub trait InitStore: Send + Sync {
    /// Apply pending schema migrations
    async fn migrate(&self) -> Result<()>;

    /// Insert settings that are not already present. Returns how many were new.
    async fn seed_settings(&self, settings: &[(&str, &str)]) -> Result<u64>;

    /// Insert the superuser unless the username exists. Returns true if inserted.
    async fn create_admin_if_absent(&self, account: &NewAccount) -> Result<bool>;
}

#[async_trait]
impl<T: InitStore + ?Sized> InitStore for Arc<T> {
    async fn migrate(&self) -> Result<()> {
        (**self).migrate().await
    }

    async fn seed_settings(&self, settings: &[(&str, &str)]) -> Result<u64> {
        (**self).seed_settings(settings).await
    }

    async fn create_admin_if_absent(&self, account: &NewAccount) -> Result<bool> {
        (**self).create_admin_if_absent(account).await
    }
}

/// PostgreSQL-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL as '{}' at {}:{}/{}",
            config.user, config.host, config.port, config.name
        );

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(config.connection_timeout)
            .connect_with(config.connect_options())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to database '{}' at {}:{}",
                    config.name, config.host, config.port
                )
            })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl InitStore for PgStore {
    async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("Schema migration failed")?;
        info!("✓ Schema is up to date");
        Ok(())
    }

    async fn seed_settings(&self, settings: &[(&str, &str)]) -> Result<u64> {
        let mut inserted = 0;
        for (key, value) in settings {
            let result = sqlx::query(
                "INSERT INTO system_settings (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
            )
            .bind(*key)
            .bind(*value)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to seed setting '{}'", key))?;

            if result.rows_affected() > 0 {
                debug!("Seeded setting {}={}", key, value);
                inserted += result.rows_affected();
            }
        }
        Ok(inserted)
    }

    async fn create_admin_if_absent(&self, account: &NewAccount) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO accounts (username, email, first_name, last_name, password_hash, is_superuser, is_staff) \
             VALUES ($1, $2, $3, $4, $5, TRUE, TRUE) \
             ON CONFLICT (username) DO NOTHING",
        )
        .bind(&account.username)
        .bind(&account.email)
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(&account.password_hash)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create admin account '{}'", account.username))?;

        Ok(result.rows_affected() == 1)
    }
}
