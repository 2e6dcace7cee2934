//! Check command: validate the topology and resolve secrets for a profile.
//!
//! Only fingerprints are printed, never values. The edge proxy's route
//! table is listed so path mapping can be checked before deploying.

use anyhow::{Context, Result};
use colored::Colorize;

use crate::domain::edge::SAMPLE_PATHS;
use crate::domain::secrets::SecretSource;
use crate::domain::{EdgeProxySettings, Profile, ResolvedSecrets, Route, Topology};
use crate::ui;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReport {
    pub name: String,
    pub env: String,
    pub source: SecretSource,
    pub fingerprint: String,
    pub services: Vec<String>,
}

pub fn secret_report(topology: &Topology, secrets: &ResolvedSecrets) -> Vec<SecretReport> {
    topology
        .secrets()
        .iter()
        .filter_map(|spec| {
            let value = secrets.get(&spec.name)?;
            Some(SecretReport {
                name: spec.name.clone(),
                env: spec.env.clone(),
                source: value.source(),
                fingerprint: value.fingerprint(),
                services: topology
                    .services_using_secret(&spec.name)
                    .into_iter()
                    .map(String::from)
                    .collect(),
            })
        })
        .collect()
}

pub fn route_table(edge: &EdgeProxySettings) -> Vec<(&'static str, Route)> {
    SAMPLE_PATHS.iter().map(|path| (*path, edge.route(path))).collect()
}

pub fn execute(topology: &Topology, profile: Profile) -> Result<()> {
    let secrets = topology
        .secrets()
        .resolve_from_env(profile)
        .with_context(|| format!("Secrets do not resolve for the {} profile", profile))?;

    ui::print_header(&format!("Topology check: {} ({})", topology.name(), profile));
    println!(
        "  {} services, {} volumes, {} secrets",
        topology.services().len(),
        topology.volumes().count(),
        topology.secrets().iter().count()
    );

    let (scheme, port) = topology.edge().advertised();
    println!("  Edge proxy advertises {}://:{}", scheme, port);
    for (path, route) in route_table(topology.edge()) {
        println!("    {:<16} -> {}", path, route.to_string().dimmed());
    }
    println!();

    for report in secret_report(topology, &secrets) {
        let source = match report.source {
            SecretSource::Environment => "env".green(),
            SecretSource::InsecureDefault => "insecure default".yellow(),
        };
        println!(
            "  {:<22} {:<28} {}  {}",
            report.name.bold(),
            report.env.dimmed(),
            report.fingerprint.cyan(),
            source
        );
        if !report.services.is_empty() {
            println!("  {:<22} used by {}", "", report.services.join(", "));
        }
    }
    println!();

    ui::print_success("Topology is valid");
    Ok(())
}
