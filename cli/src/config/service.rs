//! Service-level configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::probe::ProbesConfig;
use crate::domain::DependencyCondition;

/// Host and port a service listens on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

/// A dependency, either a bare service name or `{ service, condition }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DependencyConfig {
    Name(String),
    Detailed {
        service: String,
        #[serde(default)]
        condition: DependencyCondition,
    },
}

impl DependencyConfig {
    pub fn service(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { service, .. } => service,
        }
    }

    pub fn condition(&self) -> DependencyCondition {
        match self {
            Self::Name(_) => DependencyCondition::Reachable,
            Self::Detailed { condition, .. } => *condition,
        }
    }
}

/// Volume mounted into a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountConfig {
    /// Declared volume name
    pub volume: String,

    /// Mount path inside the container
    pub path: String,

    /// Mount read-only (default: false)
    #[serde(default)]
    pub read_only: bool,
}

/// Service-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (e.g., "uwsgi", "postgres")
    pub name: String,

    /// Service role: store, broker, initializer, worker, scheduler, app_server, edge_proxy
    pub role: String,

    /// Container image reference
    pub image: String,

    /// Entrypoint command run after all gates pass
    #[serde(default)]
    pub command: Vec<String>,

    /// Network endpoint, required for services others wait on
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,

    /// Literal environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Env var name → secret identity
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    /// Services that must be ready first
    #[serde(default)]
    pub depends_on: Vec<DependencyConfig>,

    /// Startup, liveness and readiness probes
    #[serde(default)]
    pub probes: ProbesConfig,

    /// Volume mounts
    #[serde(default)]
    pub volumes: Vec<MountConfig>,

    /// Number of instances (default: 1, range: 1-64)
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Per-service readiness timeout override, in seconds
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,
}

fn default_replicas() -> u32 {
    1
}
