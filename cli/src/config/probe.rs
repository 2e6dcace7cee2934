//! Probe configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{ProbeHandler, ProbeSet, ProbeSpec, Scheme};
use crate::validation::validate_numeric_range;

/// HTTP GET probe target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpProbeConfig {
    pub path: String,
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
}

/// TCP connect probe target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpProbeConfig {
    pub port: u16,
}

/// One probe. Exactly one of `http` or `tcp` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeConfig {
    #[serde(default)]
    pub http: Option<HttpProbeConfig>,

    #[serde(default)]
    pub tcp: Option<TcpProbeConfig>,

    /// Delay before the first probe (default: 0, range: 0-600)
    #[serde(default)]
    pub initial_delay_secs: u64,

    /// Seconds between probes (default: 10, range: 1-300)
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Per-probe timeout in seconds (default: 1, range: 1-60)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive failures before acting (default: 3, range: 1-120)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before recovering (default: 1, range: 1-120)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

/// The three optional probes of a service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbesConfig {
    #[serde(default)]
    pub startup: Option<ProbeConfig>,
    #[serde(default)]
    pub liveness: Option<ProbeConfig>,
    #[serde(default)]
    pub readiness: Option<ProbeConfig>,
}

impl ProbeConfig {
    /// Validate values are within reasonable bounds
    pub fn validate(&self, field_name: &str) -> anyhow::Result<()> {
        match (&self.http, &self.tcp) {
            (Some(_), Some(_)) => anyhow::bail!("{} sets both http and tcp", field_name),
            (None, None) => anyhow::bail!("{} needs an http or tcp handler", field_name),
            (Some(http), None) => {
                if !http.path.starts_with('/') {
                    anyhow::bail!("{} http path must start with '/', got: {}", field_name, http.path);
                }
                if http.port == 0 {
                    anyhow::bail!("{} port cannot be 0", field_name);
                }
            }
            (None, Some(tcp)) => {
                if tcp.port == 0 {
                    anyhow::bail!("{} port cannot be 0", field_name);
                }
            }
        }

        validate_numeric_range(self.initial_delay_secs, &format!("{}.initial_delay_secs", field_name), 0, 600)?;
        validate_numeric_range(self.period_secs, &format!("{}.period_secs", field_name), 1, 300)?;
        validate_numeric_range(self.timeout_secs, &format!("{}.timeout_secs", field_name), 1, 60)?;
        validate_numeric_range(
            self.failure_threshold as u64,
            &format!("{}.failure_threshold", field_name),
            1,
            120,
        )?;
        validate_numeric_range(
            self.success_threshold as u64,
            &format!("{}.success_threshold", field_name),
            1,
            120,
        )?;

        Ok(())
    }

    pub fn to_spec(&self) -> ProbeSpec {
        let handler = match (&self.http, &self.tcp) {
            (Some(http), _) => ProbeHandler::HttpGet {
                path: http.path.clone(),
                port: http.port,
                scheme: http.scheme,
            },
            (None, Some(tcp)) => ProbeHandler::TcpSocket { port: tcp.port },
            // unreachable after validate()
            (None, None) => ProbeHandler::TcpSocket { port: 0 },
        };

        ProbeSpec {
            handler,
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            period: Duration::from_secs(self.period_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
        }
    }
}

impl ProbesConfig {
    pub fn validate(&self, service: &str) -> anyhow::Result<()> {
        for (kind, probe) in [
            ("startup", &self.startup),
            ("liveness", &self.liveness),
            ("readiness", &self.readiness),
        ] {
            if let Some(probe) = probe {
                probe.validate(&format!("{}.probes.{}", service, kind))?;
            }
        }
        Ok(())
    }

    pub fn to_probe_set(&self) -> ProbeSet {
        ProbeSet {
            startup: self.startup.as_ref().map(ProbeConfig::to_spec),
            liveness: self.liveness.as_ref().map(ProbeConfig::to_spec),
            readiness: self.readiness.as_ref().map(ProbeConfig::to_spec),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.startup.is_none() && self.liveness.is_none() && self.readiness.is_none()
    }
}

fn default_period_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    1
}
