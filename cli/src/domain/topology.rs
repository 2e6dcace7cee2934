//! Service topology: descriptors, dependency graph and start order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use super::edge::EdgeProxySettings;
use super::probe::ProbeSet;
use super::secrets::SecretRegistry;
use crate::error::TopologyError;
use crate::gate::{GateTarget, ReadinessGate, DEFAULT_TIMEOUT};

/// Part a service plays in the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Store,
    Broker,
    Initializer,
    Worker,
    Scheduler,
    AppServer,
    EdgeProxy,
}

impl ServiceRole {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "store" | "database" => Some(Self::Store),
            "broker" | "cache" => Some(Self::Broker),
            "initializer" => Some(Self::Initializer),
            "worker" => Some(Self::Worker),
            "scheduler" => Some(Self::Scheduler),
            "app_server" | "app" => Some(Self::AppServer),
            "edge_proxy" | "proxy" => Some(Self::EdgeProxy),
            _ => None,
        }
    }

    /// One-shot services run to completion instead of being kept alive
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Initializer)
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Store => "store",
            Self::Broker => "broker",
            Self::Initializer => "initializer",
            Self::Worker => "worker",
            Self::Scheduler => "scheduler",
            Self::AppServer => "app_server",
            Self::EdgeProxy => "edge_proxy",
        };
        f.write_str(name)
    }
}

/// Host and port a service listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn gate_target(&self) -> GateTarget {
        GateTarget::new(self.host.clone(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a dependency must reach before the dependent starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency's endpoint accepts TCP connections
    #[default]
    Reachable,
    /// The one-shot dependency exited successfully
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub service: String,
    pub condition: DependencyCondition,
}

impl Dependency {
    pub fn reachable(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            condition: DependencyCondition::Reachable,
        }
    }

    pub fn completed(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            condition: DependencyCondition::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub volume: String,
    pub path: String,
    pub read_only: bool,
}

/// Named durable storage bound to one logical dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub name: String,
    pub dataset: String,
}

/// Service definition with all deployment metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub role: ServiceRole,
    pub image: String,
    pub command: Vec<String>,
    pub endpoint: Option<Endpoint>,
    pub environment: BTreeMap<String, String>,
    /// Env var name → secret identity
    pub secrets: BTreeMap<String, String>,
    pub depends_on: Vec<Dependency>,
    pub probes: ProbeSet,
    pub volumes: Vec<VolumeMount>,
    pub replicas: u32,
    pub readiness_timeout: Duration,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, role: ServiceRole, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            image: image.into(),
            command: Vec::new(),
            endpoint: None,
            environment: BTreeMap::new(),
            secrets: BTreeMap::new(),
            depends_on: Vec::new(),
            probes: ProbeSet::default(),
            volumes: Vec::new(),
            replicas: 1,
            readiness_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builder: set endpoint
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint = Some(Endpoint::new(host, port));
        self
    }

    /// Builder: add dependency
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.depends_on.push(dependency);
        self
    }

    /// Builder: set entrypoint command
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set probes
    pub fn with_probes(mut self, probes: ProbeSet) -> Self {
        self.probes = probes;
        self
    }

    /// Builder: bind an env var to a secret identity
    pub fn with_secret(mut self, env_var: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(env_var.into(), secret.into());
        self
    }

    /// Builder: mount a volume
    pub fn with_volume(mut self, volume: impl Into<String>, path: impl Into<String>, read_only: bool) -> Self {
        self.volumes.push(VolumeMount {
            volume: volume.into(),
            path: path.into(),
            read_only,
        });
        self
    }
}

/// A gate a service must pass before its entrypoint runs
#[derive(Debug, Clone)]
pub struct DependencyGate {
    pub dependency: String,
    pub gate: ReadinessGate,
}

/// Validated set of services
#[derive(Debug, Clone)]
pub struct Topology {
    name: String,
    services: Vec<ServiceDescriptor>,
    index: HashMap<String, usize>,
    volumes: BTreeMap<String, Volume>,
    secrets: SecretRegistry,
    edge: EdgeProxySettings,
}

impl Topology {
    /// Build and validate a topology
    pub fn new(
        name: impl Into<String>,
        services: Vec<ServiceDescriptor>,
        volumes: Vec<Volume>,
        secrets: SecretRegistry,
        edge: EdgeProxySettings,
    ) -> Result<Self, TopologyError> {
        let mut index = HashMap::new();
        for (i, service) in services.iter().enumerate() {
            if index.insert(service.name.clone(), i).is_some() {
                return Err(TopologyError::DuplicateService {
                    name: service.name.clone(),
                });
            }
        }

        let topology = Self {
            name: name.into(),
            services,
            index,
            volumes: volumes.into_iter().map(|v| (v.name.clone(), v)).collect(),
            secrets,
            edge,
        };
        topology.validate()?;
        Ok(topology)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn secrets(&self) -> &SecretRegistry {
        &self.secrets
    }

    pub fn edge(&self) -> &EdgeProxySettings {
        &self.edge
    }

    /// Services that list `name` as a dependency
    pub fn dependents_of(&self, name: &str) -> Vec<&ServiceDescriptor> {
        self.services
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d.service == name))
            .collect()
    }

    /// Services bound to the given secret identity
    pub fn services_using_secret(&self, secret: &str) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| s.secrets.values().any(|v| v == secret))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Readiness gates for a service's `reachable` dependencies
    pub fn gates_for(&self, service: &ServiceDescriptor) -> Vec<DependencyGate> {
        service
            .depends_on
            .iter()
            .filter(|d| d.condition == DependencyCondition::Reachable)
            .filter_map(|d| {
                let endpoint = self.service(&d.service)?.endpoint.as_ref()?;
                Some(DependencyGate {
                    dependency: d.service.clone(),
                    gate: ReadinessGate::new(endpoint.gate_target(), service.readiness_timeout),
                })
            })
            .collect()
    }

    /// Start order as waves: each service's dependencies all sit in earlier waves.
    /// Within a wave services keep declaration order.
    pub fn start_order(&self) -> Vec<Vec<&ServiceDescriptor>> {
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut waves = Vec::new();

        while placed.len() < self.services.len() {
            let wave: Vec<&ServiceDescriptor> = self
                .services
                .iter()
                .filter(|s| !placed.contains(s.name.as_str()))
                .filter(|s| s.depends_on.iter().all(|d| placed.contains(d.service.as_str())))
                .collect();

            // Validation rejects cycles, so every round places something
            if wave.is_empty() {
                break;
            }
            placed.extend(wave.iter().map(|s| s.name.as_str()));
            waves.push(wave);
        }

        waves
    }

    /// Flattened start order
    pub fn start_sequence(&self) -> Vec<&ServiceDescriptor> {
        self.start_order().into_iter().flatten().collect()
    }

    fn validate(&self) -> Result<(), TopologyError> {
        for service in &self.services {
            for dep in &service.depends_on {
                if dep.service == service.name {
                    return Err(TopologyError::SelfDependency {
                        service: service.name.clone(),
                    });
                }
                let target = self.service(&dep.service).ok_or_else(|| {
                    TopologyError::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dep.service.clone(),
                    }
                })?;
                match dep.condition {
                    DependencyCondition::Reachable if target.endpoint.is_none() => {
                        return Err(TopologyError::UnreachableDependency {
                            service: service.name.clone(),
                            dependency: dep.service.clone(),
                        });
                    }
                    DependencyCondition::Completed if !target.role.is_one_shot() => {
                        return Err(TopologyError::NotOneShot {
                            service: service.name.clone(),
                            dependency: dep.service.clone(),
                        });
                    }
                    _ => {}
                }
            }

            for mount in &service.volumes {
                if !self.volumes.contains_key(&mount.volume) {
                    return Err(TopologyError::UnknownVolume {
                        service: service.name.clone(),
                        volume: mount.volume.clone(),
                    });
                }
            }

            for secret in service.secrets.values() {
                if !self.secrets.contains(secret) {
                    return Err(TopologyError::UnknownSecret {
                        service: service.name.clone(),
                        secret: secret.clone(),
                    });
                }
            }

            if service.role == ServiceRole::EdgeProxy {
                self.edge.check_probes(&service.name, &service.probes)?;
            }
        }

        let mut datasets: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for volume in self.volumes.values() {
            datasets
                .entry(volume.dataset.as_str())
                .or_default()
                .push(volume.name.clone());
        }
        if let Some((dataset, volumes)) = datasets.into_iter().find(|(_, v)| v.len() > 1) {
            return Err(TopologyError::DatasetBoundTwice {
                dataset: dataset.to_string(),
                volumes,
            });
        }

        self.edge.validate()?;

        let sequence = self.start_sequence();
        if sequence.len() < self.services.len() {
            let placed: BTreeSet<&str> = sequence.iter().map(|s| s.name.as_str()).collect();
            let services = self
                .services
                .iter()
                .filter(|s| !placed.contains(s.name.as_str()))
                .map(|s| s.name.clone())
                .collect();
            return Err(TopologyError::Cycle { services });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::secrets::SecretSpec;

    fn stack() -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::new("nginx", ServiceRole::EdgeProxy, "nginx")
                .with_endpoint("nginx", 8080)
                .with_dependency(Dependency::reachable("uwsgi")),
            ServiceDescriptor::new("uwsgi", ServiceRole::AppServer, "django")
                .with_endpoint("uwsgi", 3031)
                .with_dependency(Dependency::reachable("postgres"))
                .with_dependency(Dependency::reachable("redis"))
                .with_dependency(Dependency::completed("initializer")),
            ServiceDescriptor::new("initializer", ServiceRole::Initializer, "django")
                .with_dependency(Dependency::reachable("postgres")),
            ServiceDescriptor::new("postgres", ServiceRole::Store, "postgres").with_endpoint("postgres", 5432),
            ServiceDescriptor::new("redis", ServiceRole::Broker, "redis").with_endpoint("redis", 6379),
            ServiceDescriptor::new("celeryworker", ServiceRole::Worker, "django")
                .with_dependency(Dependency::reachable("postgres"))
                .with_dependency(Dependency::reachable("redis")),
        ]
    }

    fn build(services: Vec<ServiceDescriptor>) -> Result<Topology, TopologyError> {
        Topology::new(
            "test",
            services,
            Vec::new(),
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
    }

    fn names(wave: &[&ServiceDescriptor]) -> Vec<String> {
        wave.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_start_order_waves() {
        let topology = build(stack()).unwrap();
        let waves = topology.start_order();
        assert_eq!(names(&waves[0]), vec!["postgres", "redis"]);
        assert_eq!(names(&waves[1]), vec!["initializer", "celeryworker"]);
        assert_eq!(names(&waves[2]), vec!["uwsgi"]);
        assert_eq!(names(&waves[3]), vec!["nginx"]);
    }

    #[test]
    fn test_every_dependency_precedes_its_dependent() {
        let topology = build(stack()).unwrap();
        let sequence: Vec<&str> = topology.start_sequence().iter().map(|s| s.name.as_str()).collect();
        for service in topology.services() {
            let own = sequence.iter().position(|n| *n == service.name).unwrap();
            for dep in &service.depends_on {
                let dep_pos = sequence.iter().position(|n| *n == dep.service).unwrap();
                assert!(dep_pos < own, "{} must start before {}", dep.service, service.name);
            }
        }
    }

    #[test]
    fn test_gates_only_for_reachable_dependencies() {
        let topology = build(stack()).unwrap();
        let uwsgi = topology.service("uwsgi").unwrap();
        let gates = topology.gates_for(uwsgi);
        let targets: Vec<String> = gates.iter().map(|g| g.gate.target().to_string()).collect();
        assert_eq!(targets, vec!["postgres:5432", "redis:6379"]);
        assert!(gates.iter().all(|g| g.gate.timeout() == DEFAULT_TIMEOUT));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let mut services = stack();
        services.push(ServiceDescriptor::new("redis", ServiceRole::Broker, "valkey").with_endpoint("redis", 6379));
        assert_eq!(
            build(services).unwrap_err(),
            TopologyError::DuplicateService {
                name: "redis".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_and_self_dependencies_rejected() {
        let mut services = stack();
        services.push(
            ServiceDescriptor::new("celerybeat", ServiceRole::Scheduler, "django")
                .with_dependency(Dependency::reachable("rabbitmq")),
        );
        assert!(matches!(
            build(services).unwrap_err(),
            TopologyError::UnknownDependency { .. }
        ));

        let looped = vec![ServiceDescriptor::new("postgres", ServiceRole::Store, "postgres")
            .with_endpoint("postgres", 5432)
            .with_dependency(Dependency::reachable("postgres"))];
        assert!(matches!(build(looped).unwrap_err(), TopologyError::SelfDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let services = vec![
            ServiceDescriptor::new("a", ServiceRole::AppServer, "x")
                .with_endpoint("a", 1)
                .with_dependency(Dependency::reachable("b")),
            ServiceDescriptor::new("b", ServiceRole::AppServer, "x")
                .with_endpoint("b", 2)
                .with_dependency(Dependency::reachable("a")),
            ServiceDescriptor::new("c", ServiceRole::Store, "x").with_endpoint("c", 3),
        ];
        match build(services).unwrap_err() {
            TopologyError::Cycle { services } => assert_eq!(services, vec!["a", "b"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_condition_checks() {
        let services = vec![
            ServiceDescriptor::new("worker", ServiceRole::Worker, "x"),
            ServiceDescriptor::new("web", ServiceRole::AppServer, "x")
                .with_dependency(Dependency::reachable("worker")),
        ];
        assert!(matches!(
            build(services).unwrap_err(),
            TopologyError::UnreachableDependency { .. }
        ));

        let services = vec![
            ServiceDescriptor::new("postgres", ServiceRole::Store, "x").with_endpoint("postgres", 5432),
            ServiceDescriptor::new("web", ServiceRole::AppServer, "x")
                .with_dependency(Dependency::completed("postgres")),
        ];
        assert!(matches!(build(services).unwrap_err(), TopologyError::NotOneShot { .. }));
    }

    #[test]
    fn test_volume_and_secret_references() {
        let services = vec![ServiceDescriptor::new("postgres", ServiceRole::Store, "x")
            .with_volume("pgdata", "/var/lib/postgresql/data", false)];
        assert!(matches!(build(services).unwrap_err(), TopologyError::UnknownVolume { .. }));

        let services = vec![ServiceDescriptor::new("uwsgi", ServiceRole::AppServer, "x")
            .with_secret("DD_SECRET_KEY", "secret_key")];
        assert!(matches!(build(services).unwrap_err(), TopologyError::UnknownSecret { .. }));

        let registry = SecretRegistry::new([SecretSpec {
            name: "secret_key".to_string(),
            env: "DD_SECRET_KEY".to_string(),
            insecure_default: None,
        }]);
        let services = vec![
            ServiceDescriptor::new("uwsgi", ServiceRole::AppServer, "x").with_secret("DD_SECRET_KEY", "secret_key"),
            ServiceDescriptor::new("celerybeat", ServiceRole::Scheduler, "x").with_secret("DD_SECRET_KEY", "secret_key"),
        ];
        let topology = Topology::new("t", services, Vec::new(), registry, EdgeProxySettings::default()).unwrap();
        assert_eq!(topology.services_using_secret("secret_key"), vec!["uwsgi", "celerybeat"]);
    }

    #[test]
    fn test_dataset_bound_once() {
        let volumes = vec![
            Volume {
                name: "media_a".to_string(),
                dataset: "media".to_string(),
            },
            Volume {
                name: "media_b".to_string(),
                dataset: "media".to_string(),
            },
        ];
        let err = Topology::new(
            "t",
            Vec::new(),
            volumes,
            SecretRegistry::default(),
            EdgeProxySettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::DatasetBoundTwice { .. }));
    }

    #[test]
    fn test_dependents_of() {
        let topology = build(stack()).unwrap();
        let dependents: Vec<&str> = topology
            .dependents_of("postgres")
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(dependents, vec!["uwsgi", "initializer", "celeryworker"]);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(ServiceRole::from_str("app-server"), Some(ServiceRole::AppServer));
        assert_eq!(ServiceRole::from_str("Edge_Proxy"), Some(ServiceRole::EdgeProxy));
        assert_eq!(ServiceRole::from_str("mystery"), None);
        assert!(ServiceRole::Initializer.is_one_shot());
        assert!(!ServiceRole::Worker.is_one_shot());
    }
}
