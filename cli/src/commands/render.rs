//! Render command: emit a Docker Compose document for the topology.
//!
//! Secret values are never written. Bound secrets become `${VAR:-default}`
//! interpolations in the evaluation profile and `${VAR:?...}` otherwise, so
//! compose refuses to start without them. Probes become compose
//! healthchecks, and reachable dependencies on a service with one wait for
//! `service_healthy`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::domain::{
    DependencyCondition, ProbeHandler, ProbeKind, ProbeSpec, Profile, Scheme, ServiceDescriptor, ServiceRole,
    Topology,
};
use crate::ui;

#[derive(Debug, Serialize)]
struct ComposeFile {
    name: String,
    services: serde_yaml::Mapping,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, ComposeVolume>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    depends_on: BTreeMap<String, ComposeDependency>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthcheck>,
    restart: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    deploy: Option<ComposeDeploy>,
}

#[derive(Debug, Serialize)]
struct ComposeDependency {
    condition: &'static str,
}

#[derive(Debug, Serialize)]
struct ComposeHealthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_period: Option<String>,
}

#[derive(Debug, Serialize)]
struct ComposeDeploy {
    replicas: u32,
}

#[derive(Debug, Serialize)]
struct ComposeVolume {
    labels: BTreeMap<String, String>,
}

/// Render the topology as a compose YAML document
pub fn render(topology: &Topology, profile: Profile) -> Result<String> {
    let mut services = serde_yaml::Mapping::new();
    for service in topology.start_sequence() {
        let rendered = render_service(topology, service, profile)?;
        services.insert(
            serde_yaml::Value::String(service.name.clone()),
            serde_yaml::to_value(rendered).context("Failed to serialize service")?,
        );
    }

    let volumes = topology
        .volumes()
        .map(|volume| {
            let labels = BTreeMap::from([("stackgate.dataset".to_string(), volume.dataset.clone())]);
            (volume.name.clone(), ComposeVolume { labels })
        })
        .collect();

    let compose = ComposeFile {
        name: topology.name().to_string(),
        services,
        volumes,
    };
    serde_yaml::to_string(&compose).context("Failed to serialize compose document")
}

fn render_service(topology: &Topology, service: &ServiceDescriptor, profile: Profile) -> Result<ComposeService> {
    let gates = topology.gates_for(service);

    // Overriding the entrypoint drops the image's default command
    if !gates.is_empty() && service.command.is_empty() {
        anyhow::bail!(
            "Service '{}' waits for {} but declares no command to run afterwards",
            service.name,
            gates.iter().map(|g| g.dependency.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    let entrypoint = if gates.is_empty() {
        Vec::new()
    } else {
        let mut entrypoint = vec!["stackgate".to_string(), "wait-for".to_string()];
        entrypoint.extend(gates.iter().map(|g| g.gate.target().to_string()));
        let timeout = gates.iter().map(|g| g.gate.timeout()).max().unwrap_or_default();
        entrypoint.push("--timeout".to_string());
        entrypoint.push(humantime::format_duration(timeout).to_string());
        entrypoint.push("--".to_string());
        entrypoint
    };

    let mut environment: BTreeMap<String, String> = service
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), escape(v)))
        .collect();
    for (env_var, secret) in &service.secrets {
        if let Some(spec) = topology.secrets().get(secret) {
            let default = match profile {
                Profile::Evaluation => spec.insecure_default.as_deref(),
                Profile::Production => None,
            };
            let value = match default {
                Some(default) => format!("${{{}:-{}}}", spec.env, escape(default)),
                None => format!("${{{}:?{} must be set}}", spec.env, spec.env),
            };
            environment.insert(env_var.clone(), value);
        }
    }

    let depends_on = service
        .depends_on
        .iter()
        .map(|dep| {
            let checked = topology
                .service(&dep.service)
                .is_some_and(|s| health_probe(s).is_some());
            let condition = match dep.condition {
                DependencyCondition::Reachable if checked => "service_healthy",
                DependencyCondition::Reachable => "service_started",
                DependencyCondition::Completed => "service_completed_successfully",
            };
            (dep.service.clone(), ComposeDependency { condition })
        })
        .collect();

    let ports = if service.role == ServiceRole::EdgeProxy {
        topology
            .edge()
            .published_ports()
            .into_iter()
            .map(|port| format!("{}:{}", port, port))
            .collect()
    } else {
        Vec::new()
    };

    let volumes = service
        .volumes
        .iter()
        .map(|mount| {
            if mount.read_only {
                format!("{}:{}:ro", mount.volume, mount.path)
            } else {
                format!("{}:{}", mount.volume, mount.path)
            }
        })
        .collect();

    Ok(ComposeService {
        image: service.image.clone(),
        entrypoint,
        command: service.command.iter().map(|arg| escape(arg)).collect(),
        environment,
        depends_on,
        ports,
        volumes,
        healthcheck: healthcheck(service),
        restart: if service.role.is_one_shot() { "no" } else { "unless-stopped" },
        deploy: (service.replicas > 1).then_some(ComposeDeploy {
            replicas: service.replicas,
        }),
    })
}

/// Readiness decides traffic, so it wins over liveness
fn health_probe(service: &ServiceDescriptor) -> Option<&ProbeSpec> {
    service
        .probes
        .get(ProbeKind::Readiness)
        .or_else(|| service.probes.get(ProbeKind::Liveness))
}

fn healthcheck(service: &ServiceDescriptor) -> Option<ComposeHealthcheck> {
    let probe = health_probe(service)?;

    let check = match &probe.handler {
        ProbeHandler::HttpGet { path, port, scheme } => {
            let insecure = if *scheme == Scheme::Https { " --no-check-certificate" } else { "" };
            format!(
                "wget -q -O /dev/null{} {}://127.0.0.1:{}{} || exit 1",
                insecure,
                scheme,
                port,
                escape(path)
            )
        }
        ProbeHandler::TcpSocket { port } => format!("nc -z 127.0.0.1 {} || exit 1", port),
    };

    // A startup probe's whole budget becomes the grace period
    let start_period = match service.probes.get(ProbeKind::Startup) {
        Some(startup) => startup.initial_delay + startup.period * startup.failure_threshold,
        None => probe.initial_delay,
    };

    Some(ComposeHealthcheck {
        test: vec!["CMD-SHELL".to_string(), check],
        interval: humantime::format_duration(probe.period).to_string(),
        timeout: humantime::format_duration(probe.timeout).to_string(),
        retries: probe.failure_threshold,
        start_period: (!start_period.is_zero()).then(|| humantime::format_duration(start_period).to_string()),
    })
}

/// Literal `$` must be doubled or compose treats it as interpolation
fn escape(value: &str) -> String {
    value.replace('$', "$$")
}

pub fn execute(topology: &Topology, profile: Profile, output: Option<&Path>) -> Result<()> {
    let document = render(topology, profile)?;

    match output {
        Some(path) => {
            std::fs::write(path, &document).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote compose file for {} to {}", topology.name(), path.display());
            ui::print_success(&format!("Rendered {} ({} profile)", path.display(), profile));
        }
        None => print!("{}", document),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::domain::{Dependency, EdgeProxySettings, SecretRegistry};

    fn rendered(profile: Profile) -> serde_yaml::Value {
        let topology = TopologyConfig::reference().unwrap().into_topology().unwrap();
        serde_yaml::from_str(&render(&topology, profile).unwrap()).unwrap()
    }

    #[test]
    fn test_entrypoints_wrap_reachable_dependencies() {
        let doc = rendered(Profile::Evaluation);
        let uwsgi = &doc["services"]["uwsgi"];

        let entrypoint: Vec<&str> = uwsgi["entrypoint"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            entrypoint,
            vec!["stackgate", "wait-for", "postgres:5432", "redis:6379", "--timeout", "30s", "--"]
        );
        assert_eq!(uwsgi["command"][0], "/entrypoint-uwsgi.sh");
        assert_eq!(
            uwsgi["depends_on"]["initializer"]["condition"],
            "service_completed_successfully"
        );

        // No dependencies, no wrapper
        assert!(doc["services"]["postgres"].get("entrypoint").is_none());
    }

    #[test]
    fn test_secrets_are_interpolated_not_written() {
        let evaluation = rendered(Profile::Evaluation);
        assert_eq!(
            evaluation["services"]["postgres"]["environment"]["POSTGRES_PASSWORD"],
            "${DD_DATABASE_PASSWORD:-defectdojo}"
        );

        let production = rendered(Profile::Production);
        let password = production["services"]["postgres"]["environment"]["POSTGRES_PASSWORD"]
            .as_str()
            .unwrap();
        assert!(password.starts_with("${DD_DATABASE_PASSWORD:?"));
        assert!(!password.contains("defectdojo"));
    }

    #[test]
    fn test_volumes_and_ports() {
        let doc = rendered(Profile::Evaluation);
        let nginx = &doc["services"]["nginx"];

        assert_eq!(nginx["ports"][0], "8080:8080");
        assert_eq!(nginx["volumes"][0], "defectdojo_media:/usr/share/nginx/html/media:ro");
        assert_eq!(doc["services"]["uwsgi"]["volumes"][0], "defectdojo_media:/app/media");
        assert_eq!(doc["volumes"]["defectdojo_postgres"]["labels"]["stackgate.dataset"], "database");
        assert_eq!(doc["services"]["initializer"]["restart"], "no");
    }

    #[test]
    fn test_services_in_start_order() {
        let doc = rendered(Profile::Evaluation);
        let names: Vec<&str> = doc["services"]
            .as_mapping()
            .unwrap()
            .keys()
            .map(|k| k.as_str().unwrap())
            .collect();
        assert_eq!(names.first(), Some(&"postgres"));
        assert_eq!(names.last(), Some(&"nginx"));
    }

    #[test]
    fn test_dollar_signs_escaped() {
        assert_eq!(escape("pa$$word"), "pa$$$$word");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_wrapped_services_keep_a_command() {
        for profile in [Profile::Evaluation, Profile::Production] {
            let doc = rendered(profile);
            for (name, service) in doc["services"].as_mapping().unwrap() {
                if service.get("entrypoint").is_none() {
                    continue;
                }
                let command = service["command"].as_sequence();
                assert!(
                    command.is_some_and(|c| !c.is_empty()),
                    "{:?} waits for dependencies but has nothing to run",
                    name
                );
            }
        }
    }

    #[test]
    fn test_gated_service_without_command_is_rejected() {
        let services = vec![
            ServiceDescriptor::new("uwsgi", ServiceRole::AppServer, "django").with_endpoint("uwsgi", 3031),
            ServiceDescriptor::new("nginx", ServiceRole::EdgeProxy, "nginx")
                .with_endpoint("nginx", 8080)
                .with_dependency(Dependency::reachable("uwsgi")),
        ];
        let topology = Topology::new(
            "bare",
            services,
            Vec::new(),
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
        .unwrap();

        let err = render(&topology, Profile::Evaluation).unwrap_err();
        assert!(err.to_string().contains("nginx"));
    }

    #[test]
    fn test_command_dollar_signs_escaped() {
        let services = vec![ServiceDescriptor::new("worker", ServiceRole::Worker, "django")
            .with_command(["sh", "-c", "echo $HOME"])];
        let topology = Topology::new(
            "dollar",
            services,
            Vec::new(),
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
        .unwrap();

        let doc: serde_yaml::Value = serde_yaml::from_str(&render(&topology, Profile::Evaluation).unwrap()).unwrap();
        assert_eq!(doc["services"]["worker"]["command"][2], "echo $$HOME");
    }

    #[test]
    fn test_health_checks_rendered() {
        let doc = rendered(Profile::Evaluation);

        let postgres = &doc["services"]["postgres"]["healthcheck"];
        assert_eq!(postgres["test"][0], "CMD-SHELL");
        assert_eq!(postgres["test"][1], "nc -z 127.0.0.1 5432 || exit 1");
        assert_eq!(postgres["retries"], 3);

        // Edge readiness check on the advertised scheme and port
        let nginx = &doc["services"]["nginx"]["healthcheck"];
        assert_eq!(
            nginx["test"][1],
            "wget -q -O /dev/null http://127.0.0.1:8080/uwsgi_health || exit 1"
        );
        assert!(nginx.get("start_period").is_some());

        assert_eq!(doc["services"]["uwsgi"]["depends_on"]["postgres"]["condition"], "service_healthy");
        assert_eq!(doc["services"]["nginx"]["depends_on"]["uwsgi"]["condition"], "service_healthy");
        assert!(doc["services"]["initializer"].get("healthcheck").is_none());
    }

    #[test]
    fn test_tls_healthcheck_uses_https() {
        let mut config = TopologyConfig::reference().unwrap();
        config.edge.tls = true;
        let topology = config.into_topology().unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&render(&topology, Profile::Evaluation).unwrap()).unwrap();

        let nginx = &doc["services"]["nginx"];
        assert_eq!(
            nginx["healthcheck"]["test"][1],
            "wget -q -O /dev/null --no-check-certificate https://127.0.0.1:8443/uwsgi_health || exit 1"
        );
        assert_eq!(nginx["ports"][1], "8443:8443");
    }
}
