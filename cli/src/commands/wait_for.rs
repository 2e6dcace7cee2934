//! wait-for command: block until every target accepts TCP connections, then
//! replace this process with the given command.

use anyhow::{Context, Result};
use std::process::Command;
use std::time::Duration;
use tracing::info;

use crate::gate::{wait_all, GateTarget, TcpConnector};

pub fn parse_targets(targets: &[String]) -> Result<Vec<GateTarget>> {
    targets
        .iter()
        .map(|t| t.parse::<GateTarget>().map_err(Into::into))
        .collect()
}

pub async fn execute(targets: Vec<String>, timeout: Duration, interval: Duration, command: Vec<String>) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("No command given after `--`; nothing to run once targets are reachable");
    };
    let targets = parse_targets(&targets)?;
    let waited = wait_all(&targets, timeout, interval, &TcpConnector).await?;
    info!(
        "All {} target(s) reachable after {:.1}s",
        targets.len(),
        waited.as_secs_f64()
    );

    let program = which::which(program).with_context(|| format!("Command not found: {}", program))?;
    exec(Command::new(&program).args(args))
}

#[cfg(unix)]
fn exec(command: &mut Command) -> Result<()> {
    use std::os::unix::process::CommandExt;

    // Only returns on failure
    let err = command.exec();
    Err(err).with_context(|| format!("Failed to exec {:?}", command.get_program()))
}

#[cfg(not(unix))]
fn exec(command: &mut Command) -> Result<()> {
    let status = command
        .status()
        .with_context(|| format!("Failed to run {:?}", command.get_program()))?;
    std::process::exit(status.code().unwrap_or(1));
}
