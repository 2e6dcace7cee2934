//! # Topology Configuration
//!
//! A topology file declares secrets, volumes, edge proxy settings and the
//! services of one deployment:
//!
//! ```yaml
//! name: defectdojo
//! readiness_timeout_secs: 30
//! secrets:
//!   secret_key: { env: DD_SECRET_KEY, insecure_default: hhZCp... }
//! volumes:
//!   defectdojo_postgres: { dataset: database }
//! services:
//!   - name: postgres
//!     role: store
//!     image: postgres:16-alpine
//!     endpoint: { host: postgres, port: 5432 }
//! ```
//!
//! Without `--topology` (or `STACKGATE_TOPOLOGY`) the built-in reference
//! topology is used.

mod edge;
mod probe;
mod secrets;
mod service;

pub use edge::{parse_flag, EdgeConfig};
pub use probe::{HttpProbeConfig, ProbeConfig, ProbesConfig, TcpProbeConfig};
pub use secrets::{SecretConfig, VolumeConfig};
pub use service::{DependencyConfig, EndpointConfig, MountConfig, ServiceConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::domain::{
    Dependency, Endpoint, SecretRegistry, ServiceDescriptor, ServiceRole, Topology, VolumeMount,
};
use crate::error::ConfigError;
use crate::validation::{validate_env_var_name, validate_numeric_range, validate_service_name};

/// Reference topology shipped with the binary
pub const REFERENCE_TOPOLOGY: &str = include_str!("../../stack.yaml");

/// Whole topology file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Deployment name, used as the compose project name
    pub name: String,

    /// Default readiness gate timeout (default: 30, range: 1-3600)
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    #[serde(default)]
    pub secrets: BTreeMap<String, SecretConfig>,

    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,

    #[serde(default)]
    pub edge: EdgeConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl TopologyConfig {
    /// Parse a topology document
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            ConfigError::ParseError {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// The built-in reference topology
    pub fn reference() -> Result<Self> {
        Self::from_yaml(REFERENCE_TOPOLOGY).context("Built-in reference topology is invalid")
    }

    /// Validate values are within reasonable bounds
    pub fn validate(&self) -> Result<()> {
        validate_service_name(&self.name, "name")?;
        validate_numeric_range(self.readiness_timeout_secs, "readiness_timeout_secs", 1, 3600)?;

        for (name, secret) in &self.secrets {
            validate_env_var_name(&secret.env, &format!("secrets.{}.env", name))?;
        }

        for service in &self.services {
            validate_service_name(&service.name, "services[].name")?;
            if ServiceRole::from_str(&service.role).is_none() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.role", service.name),
                    value: service.role.clone(),
                }
                .into());
            }
            if service.image.trim().is_empty() {
                anyhow::bail!("{}.image cannot be empty", service.name);
            }
            if let Some(endpoint) = &service.endpoint {
                if endpoint.host.is_empty() || endpoint.port == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.endpoint", service.name),
                        value: format!("{}:{}", endpoint.host, endpoint.port),
                    }
                    .into());
                }
            }
            for env in service.environment.keys().chain(service.secrets.keys()) {
                validate_env_var_name(env, &format!("{}.environment", service.name))?;
            }
            validate_numeric_range(service.replicas as u64, &format!("{}.replicas", service.name), 1, 64)?;
            if let Some(timeout) = service.readiness_timeout_secs {
                validate_numeric_range(
                    timeout,
                    &format!("{}.readiness_timeout_secs", service.name),
                    1,
                    3600,
                )?;
            }
            service.probes.validate(&service.name)?;
        }

        Ok(())
    }

    /// Convert into a validated [`Topology`]
    pub fn into_topology(self) -> Result<Topology> {
        self.validate()?;

        let default_timeout = Duration::from_secs(self.readiness_timeout_secs);
        let edge = self.edge.to_settings();

        let services = self
            .services
            .iter()
            .map(|config| {
                let role = ServiceRole::from_str(&config.role).ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("{}.role", config.name),
                    value: config.role.clone(),
                })?;
                let probes = if role == ServiceRole::EdgeProxy && config.probes.is_empty() {
                    edge.probes()
                } else {
                    config.probes.to_probe_set()
                };

                Ok(ServiceDescriptor {
                    name: config.name.clone(),
                    role,
                    image: config.image.clone(),
                    command: config.command.clone(),
                    endpoint: config
                        .endpoint
                        .as_ref()
                        .map(|e| Endpoint::new(e.host.clone(), e.port)),
                    environment: config.environment.clone(),
                    secrets: config.secrets.clone(),
                    depends_on: config
                        .depends_on
                        .iter()
                        .map(|d| Dependency {
                            service: d.service().to_string(),
                            condition: d.condition(),
                        })
                        .collect(),
                    probes,
                    volumes: config
                        .volumes
                        .iter()
                        .map(|m| VolumeMount {
                            volume: m.volume.clone(),
                            path: m.path.clone(),
                            read_only: m.read_only,
                        })
                        .collect(),
                    replicas: config.replicas,
                    readiness_timeout: config
                        .readiness_timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default_timeout),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let volumes = self
            .volumes
            .iter()
            .map(|(name, volume)| volume.to_volume(name))
            .collect();
        let secrets = SecretRegistry::new(self.secrets.iter().map(|(name, secret)| secret.to_spec(name)));

        let topology = Topology::new(self.name, services, volumes, secrets, edge)?;
        Ok(topology)
    }
}

/// Load a topology from `path`, or the reference topology when `None`.
/// Edge proxy flags are overridden from the process environment.
pub fn load_topology(path: Option<&Path>) -> Result<Topology> {
    let mut config = match path {
        Some(path) => {
            debug!("Loading topology from {}", path.display());
            TopologyConfig::load(path)?
        }
        None => {
            debug!("Using built-in reference topology");
            TopologyConfig::reference()?
        }
    };
    config.edge.apply_env(|name| std::env::var(name).ok())?;
    config.into_topology()
}

fn default_readiness_timeout_secs() -> u64 {
    30
}
