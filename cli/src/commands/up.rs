//! Up command: resolve secrets and supervise the whole topology until Ctrl-C

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::domain::{Profile, ResolvedSecrets, Topology};
use crate::gate::TcpConnector;
use crate::services::supervisor::service_environment;
use crate::services::{NetworkProber, ProcessRuntime, Supervisor, SupervisorOptions};
use crate::ui;

/// Resolved environment for every service
pub fn environments(
    topology: &Topology,
    secrets: &ResolvedSecrets,
) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    topology
        .services()
        .iter()
        .map(|service| {
            let env = service_environment(service, secrets)
                .with_context(|| format!("Failed to bind secrets for {}", service.name))?;
            Ok((service.name.clone(), env))
        })
        .collect()
}

pub async fn execute(topology: Topology, profile: Profile, max_restarts: u32, local: bool) -> Result<()> {
    let secrets = topology
        .secrets()
        .resolve_from_env(profile)
        .with_context(|| format!("Secrets do not resolve for the {} profile", profile))?;
    let environments = environments(&topology, &secrets)?;

    let options = SupervisorOptions {
        max_restarts,
        host_override: local.then(|| "127.0.0.1".to_string()),
        ..Default::default()
    };

    ui::print_header(&format!("Starting {} ({} profile)", topology.name(), profile));
    info!("{} services, max {} restarts per instance", topology.services().len(), max_restarts);

    let supervisor = Supervisor::new(
        topology,
        environments,
        Arc::new(ProcessRuntime::new()),
        Arc::new(NetworkProber::new().context("Failed to build HTTP probe client")?),
        Arc::new(TcpConnector),
        options,
    );

    supervisor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    ui::print_success("All services stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;

    #[test]
    fn test_environments_include_bound_secrets() {
        let topology = TopologyConfig::reference().unwrap().into_topology().unwrap();
        let secrets = topology.secrets().resolve(Profile::Evaluation, |_| None).unwrap();

        let envs = environments(&topology, &secrets).unwrap();
        assert_eq!(envs.len(), topology.services().len());

        let uwsgi = &envs["uwsgi"];
        assert_eq!(uwsgi["DD_DATABASE_PASSWORD"], "defectdojo");
        assert_eq!(uwsgi["DD_CELERY_BROKER_URL"], "redis://redis:6379/0");
        assert_eq!(envs["postgres"]["POSTGRES_PASSWORD"], uwsgi["DD_DATABASE_PASSWORD"]);
    }
}
