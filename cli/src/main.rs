use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands};
use stackgate::commands::{check, plan, render, up, wait_for};
use stackgate::config::load_topology;
use stackgate::error::exit_code_for;
use stackgate::ui;

/// Log filter from RUST_LOG, then LOGGING / LOG_LEVEL, then --verbose
fn log_filter(verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
    EnvFilter::new(level)
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::WaitFor {
            targets,
            timeout,
            interval,
            command,
        } => wait_for::execute(targets, timeout, interval, command).await,
        Commands::Plan { json } => {
            let topology = load_topology(cli.topology.as_deref())?;
            plan::execute(&topology, json)
        }
        Commands::Check => {
            let topology = load_topology(cli.topology.as_deref())?;
            check::execute(&topology, cli.profile)
        }
        Commands::Render { output } => {
            let topology = load_topology(cli.topology.as_deref())?;
            render::execute(&topology, cli.profile, output.as_deref())
        }
        Commands::Up { max_restarts, local } => {
            let topology = load_topology(cli.topology.as_deref())?;
            up::execute(topology, cli.profile, max_restarts, local).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so `plan --json` and `render` output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::print_error(&format!("{:#}", e));
            ExitCode::from(exit_code_for(&e))
        }
    }
}
