//! First-run initialization
//!
//! Order is fixed: flag check, admin validation, store readiness gate,
//! migrations, settings seed, admin account. Nothing touches the store before
//! the gate passes, and with `initialize=false` nothing touches it at all.

use anyhow::{Context, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::Argon2;
use stackgate::gate::{Connector, GateTarget, ReadinessGate};
use std::future::Future;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AdminAccount, DatabaseConfig, InitializerConfig};
use crate::store::{InitStore, NewAccount, DEFAULT_SETTINGS};
use crate::validation::validate_admin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `initialize` was false
    Skipped,
    Initialized {
        settings_seeded: u64,
        admin_created: bool,
    },
}

/// Argon2id with a random salt, as a PHC string (`$argon2id$v=19$...`)
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;
    Ok(hash.to_string())
}

fn generate_password() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Gate on the store, open it, then initialize
pub async fn run_with<C, S, F, Fut>(config: &InitializerConfig, connector: &C, open: F) -> Result<Outcome>
where
    C: Connector + ?Sized,
    S: InitStore,
    F: FnOnce(DatabaseConfig) -> Fut,
    Fut: Future<Output = Result<S>>,
{
    if !config.initialize {
        info!("DD_INITIALIZE is false, skipping initialization");
        return Ok(Outcome::Skipped);
    }

    validate_admin(&config.admin).context("Admin account validation failed")?;

    let target = GateTarget::new(config.database.host.clone(), config.database.port);
    info!("Waiting for store at {}...", target);
    let waited = ReadinessGate::new(target, config.readiness_timeout)
        .wait_with(connector)
        .await
        .context("Store never became reachable")?;
    info!("✓ Store reachable after {:?}", waited);

    let store = open(config.database.clone()).await?;
    initialize(&store, &config.admin).await
}

/// Migrate, seed and create the admin. Safe to call any number of times.
pub async fn initialize<S: InitStore + ?Sized>(store: &S, admin: &AdminAccount) -> Result<Outcome> {
    info!("1. Applying schema migrations...");
    store.migrate().await?;

    info!("2. Seeding system settings...");
    let settings_seeded = store.seed_settings(DEFAULT_SETTINGS).await?;
    if settings_seeded > 0 {
        info!("✓ Seeded {} settings", settings_seeded);
    } else {
        info!("✓ System settings already present");
    }

    info!("3. Creating admin account if it doesn't exist...");
    let (password, generated) = match &admin.password {
        Some(password) => (password.clone(), false),
        None => (generate_password(), true),
    };

    let account = NewAccount {
        username: admin.username.clone(),
        email: admin.email.clone(),
        first_name: admin.first_name.clone(),
        last_name: admin.last_name.clone(),
        password_hash: hash_password(&password)?,
    };

    let admin_created = store.create_admin_if_absent(&account).await?;
    if admin_created {
        info!("✓ Admin account '{}' created", admin.username);
        if generated {
            // Only chance to see it
            warn!("Admin password for '{}': {}", admin.username, password);
        }
    } else {
        info!("✓ Admin account '{}' already exists", admin.username);
    }

    Ok(Outcome::Initialized {
        settings_seeded,
        admin_created,
    })
}
