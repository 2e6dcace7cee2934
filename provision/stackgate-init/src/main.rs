//! One-shot stack initializer
//!
//! Waits for the store, applies schema migrations, seeds system settings and
//! creates the admin account. Every step is idempotent, so the binary is safe
//! to run on every deployment. `DD_INITIALIZE=false` turns it into a no-op.

use anyhow::Result;
use clap::Parser;
use stackgate::config::parse_flag;
use stackgate::error::exit_code_for;
use stackgate::gate::TcpConnector;
use std::env;
use std::process::ExitCode;
use std::time::Duration;

mod config;
mod initializer;
mod store;
mod validation;

use config::{AdminAccount, DatabaseConfig, InitializerConfig};
use initializer::Outcome;
use store::PgStore;

#[derive(Parser, Debug)]
#[command(name = "stackgate-init")]
#[command(
    about = "Idempotent first-run initializer",
    long_about = "Waits for the store, migrates the schema, seeds system settings and creates the admin account.\n\n\
    Safe to run multiple times; existing data is never overwritten."
)]
#[command(version)]
struct Args {
    /// Run initialization at all
    #[arg(long, env = "DD_INITIALIZE", default_value = "true", action = clap::ArgAction::Set, value_parser = parse_initialize)]
    initialize: bool,

    #[arg(long, env = "DD_ADMIN_USER", default_value = "admin")]
    admin_user: String,

    #[arg(long, env = "DD_ADMIN_MAIL", default_value = "admin@defectdojo.local")]
    admin_mail: String,

    #[arg(long, env = "DD_ADMIN_FIRST_NAME", default_value = "Admin")]
    admin_first_name: String,

    #[arg(long, env = "DD_ADMIN_LAST_NAME", default_value = "User")]
    admin_last_name: String,

    /// Generated and logged once when unset
    #[arg(long, env = "DD_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    #[arg(long, env = "DD_DATABASE_HOST", default_value = "postgres")]
    database_host: String,

    #[arg(long, env = "DD_DATABASE_PORT", default_value_t = 5432)]
    database_port: u16,

    #[arg(long, env = "DD_DATABASE_NAME", default_value = "defectdojo")]
    database_name: String,

    #[arg(long, env = "DD_DATABASE_USER", default_value = "defectdojo")]
    database_user: String,

    #[arg(long, env = "DD_DATABASE_PASSWORD", hide_env_values = true)]
    database_password: Option<String>,

    /// Seconds to wait for the store to accept connections
    #[arg(long, env = "DD_DATABASE_READINESS_TIMEOUT", default_value_t = 30)]
    database_readiness_timeout: u64,
}

fn parse_initialize(value: &str) -> Result<bool> {
    parse_flag("DD_INITIALIZE", value)
}

impl From<Args> for InitializerConfig {
    fn from(args: Args) -> Self {
        Self {
            initialize: args.initialize,
            admin: AdminAccount {
                username: args.admin_user,
                email: args.admin_mail,
                first_name: args.admin_first_name,
                last_name: args.admin_last_name,
                password: args.admin_password.filter(|p| !p.is_empty()),
            },
            database: DatabaseConfig {
                host: args.database_host,
                port: args.database_port,
                name: args.database_name,
                user: args.database_user,
                password: args.database_password.filter(|p| !p.is_empty()),
                connection_timeout: Duration::from_secs(10),
            },
            readiness_timeout: Duration::from_secs(args.database_readiness_timeout),
        }
    }
}

async fn run(config: InitializerConfig) -> Result<()> {
    let outcome = initializer::run_with(&config, &TcpConnector, |database| async move {
        PgStore::connect(&database).await
    })
    .await?;

    if let Outcome::Initialized { .. } = outcome {
        tracing::info!("=== Initialization Complete ===");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            env::var("RUST_LOG").unwrap_or_else(|_| "stackgate_init=info,sqlx=warn".to_string()),
        )
        .with_target(false)
        .init();

    let config = InitializerConfig::from(Args::parse());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Initialization failed: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
