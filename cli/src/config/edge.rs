//! Edge proxy configuration.

use serde::{Deserialize, Serialize};

use super::service::EndpointConfig;
use crate::domain::{Endpoint, EdgeProxySettings};

/// Edge proxy settings as written in the topology file.
///
/// `USE_TLS`, `GENERATE_TLS_CERTIFICATE` and `NGINX_METRICS_ENABLED` override
/// the file values when set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeConfig {
    /// Terminate TLS (default: false)
    #[serde(default)]
    pub tls: bool,

    /// Generate a self-signed certificate at startup (default: false)
    #[serde(default)]
    pub generate_certificate: bool,

    /// Expose the metrics exporter (default: false)
    #[serde(default)]
    pub metrics: bool,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_https_port")]
    pub https_port: u16,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Application server the proxy forwards to
    #[serde(default = "default_upstream")]
    pub upstream: EndpointConfig,

    #[serde(default = "default_static_root")]
    pub static_root: String,

    #[serde(default = "default_media_root")]
    pub media_root: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            tls: false,
            generate_certificate: false,
            metrics: false,
            http_port: default_http_port(),
            https_port: default_https_port(),
            metrics_port: default_metrics_port(),
            upstream: default_upstream(),
            static_root: default_static_root(),
            media_root: default_media_root(),
        }
    }
}

impl EdgeConfig {
    /// Apply environment flag overrides using `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, field) in [
            ("USE_TLS", &mut self.tls),
            ("GENERATE_TLS_CERTIFICATE", &mut self.generate_certificate),
            ("NGINX_METRICS_ENABLED", &mut self.metrics),
        ] {
            if let Some(value) = lookup(var) {
                *field = parse_flag(var, &value)?;
            }
        }
        Ok(())
    }

    pub fn to_settings(&self) -> EdgeProxySettings {
        EdgeProxySettings {
            tls: self.tls,
            generate_certificate: self.generate_certificate,
            metrics: self.metrics,
            http_port: self.http_port,
            https_port: self.https_port,
            metrics_port: self.metrics_port,
            upstream: Endpoint::new(self.upstream.host.clone(), self.upstream.port),
            static_root: self.static_root.clone(),
            media_root: self.media_root.clone(),
        }
    }
}

/// Parse a boolean environment flag (`true/false`, `1/0`, `yes/no`, `on/off`)
pub fn parse_flag(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got: '{}'", name, other),
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_metrics_port() -> u16 {
    9113
}

fn default_upstream() -> EndpointConfig {
    EndpointConfig {
        host: "uwsgi".to_string(),
        port: 3031,
    }
}

fn default_static_root() -> String {
    "/usr/share/nginx/html/static".to_string()
}

fn default_media_root() -> String {
    "/usr/share/nginx/html/media".to_string()
}
