//! Edge proxy settings and request routing.
//!
//! The proxy answers `/nginx_health` itself and forwards `/uwsgi_health` to
//! the application server, so an orchestrator can tell proxy-layer health
//! apart from application-layer health.

use serde::Serialize;
use std::fmt;

use super::probe::{ProbeSet, ProbeSpec, Scheme};
use super::topology::Endpoint;
use crate::error::TopologyError;

pub const PROXY_HEALTH_PATH: &str = "/nginx_health";
pub const UPSTREAM_HEALTH_PATH: &str = "/uwsgi_health";
pub const LOGIN_PATH: &str = "/login";
pub const METRICS_PATH: &str = "/metrics";

/// Where the proxy sends a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answered by the proxy itself
    ProxyHealth,
    /// Served from the static asset root
    Static(String),
    /// Served from the shared media volume
    Media(String),
    /// Metrics exporter
    Metrics,
    /// Forwarded to the application server
    Upstream(Endpoint),
    /// Path climbs out of its root; answered with 400
    Rejected,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::ProxyHealth => write!(f, "proxy"),
            Route::Static(path) => write!(f, "static {}", path),
            Route::Media(path) => write!(f, "media {}", path),
            Route::Metrics => write!(f, "metrics exporter"),
            Route::Upstream(endpoint) => write!(f, "upstream {}", endpoint),
            Route::Rejected => write!(f, "rejected"),
        }
    }
}

/// Paths listed by `check`
pub const SAMPLE_PATHS: &[&str] = &[PROXY_HEALTH_PATH, UPSTREAM_HEALTH_PATH, LOGIN_PATH, METRICS_PATH, "/static/", "/media/"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeProxySettings {
    pub tls: bool,
    pub generate_certificate: bool,
    pub metrics: bool,
    pub http_port: u16,
    pub https_port: u16,
    pub metrics_port: u16,
    pub upstream: Endpoint,
    pub static_root: String,
    pub media_root: String,
}

impl Default for EdgeProxySettings {
    fn default() -> Self {
        Self {
            tls: false,
            generate_certificate: false,
            metrics: false,
            http_port: 8080,
            https_port: 8443,
            metrics_port: 9113,
            upstream: Endpoint::new("uwsgi", 3031),
            static_root: "/usr/share/nginx/html/static".to_string(),
            media_root: "/usr/share/nginx/html/media".to_string(),
        }
    }
}

impl EdgeProxySettings {
    /// Externally advertised scheme and port
    pub fn advertised(&self) -> (Scheme, u16) {
        if self.tls {
            (Scheme::Https, self.https_port)
        } else {
            (Scheme::Http, self.http_port)
        }
    }

    /// Ports the proxy publishes
    pub fn published_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.http_port];
        if self.tls {
            ports.push(self.https_port);
        }
        if self.metrics {
            ports.push(self.metrics_port);
        }
        ports
    }

    /// Probes derived from the TLS setting, so scheme and port always agree
    pub fn probes(&self) -> ProbeSet {
        let (scheme, port) = self.advertised();
        ProbeSet {
            startup: Some(ProbeSpec::http(LOGIN_PATH, port, scheme).with_failure_threshold(30)),
            liveness: Some(ProbeSpec::http(PROXY_HEALTH_PATH, port, scheme)),
            readiness: Some(ProbeSpec::http(UPSTREAM_HEALTH_PATH, port, scheme)),
        }
    }

    pub fn route(&self, path: &str) -> Route {
        let path = path.split(['?', '#']).next().unwrap_or(path);

        if path == PROXY_HEALTH_PATH {
            return Route::ProxyHealth;
        }
        if self.metrics && path == METRICS_PATH {
            return Route::Metrics;
        }
        if let Some(rest) = path.strip_prefix("/static/") {
            return match join_under(&self.static_root, rest) {
                Some(file) => Route::Static(file),
                None => Route::Rejected,
            };
        }
        if let Some(rest) = path.strip_prefix("/media/") {
            return match join_under(&self.media_root, rest) {
                Some(file) => Route::Media(file),
                None => Route::Rejected,
            };
        }
        Route::Upstream(self.upstream.clone())
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        let fail = |message: String| Err(TopologyError::EdgeProxy { message });

        if self.generate_certificate && !self.tls {
            return fail("certificate generation requires TLS to be enabled".to_string());
        }
        if self.http_port == 0 || self.https_port == 0 || self.metrics_port == 0 {
            return fail("ports cannot be 0".to_string());
        }
        let ports = self.published_ports();
        for (i, port) in ports.iter().enumerate() {
            if ports[i + 1..].contains(port) {
                return fail(format!("port {} is used twice", port));
            }
        }
        if self.upstream.port == 0 {
            return fail("upstream port cannot be 0".to_string());
        }
        Ok(())
    }

    /// Configured HTTP probes must use the advertised scheme and port
    pub fn check_probes(&self, service: &str, probes: &ProbeSet) -> Result<(), TopologyError> {
        let (scheme, port) = self.advertised();

        for (kind, spec) in probes.iter() {
            if let super::probe::ProbeHandler::HttpGet {
                scheme: probe_scheme,
                port: probe_port,
                ..
            } = &spec.handler
            {
                if *probe_scheme != scheme || *probe_port != port {
                    return Err(TopologyError::ProbeMismatch {
                        service: service.to_string(),
                        probe: kind.to_string(),
                        expected: format!("{}:{}", scheme, port),
                        actual: format!("{}:{}", probe_scheme, probe_port),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Join a request path under `root`, or `None` if any segment is `..`
fn join_under(root: &str, rest: &str) -> Option<String> {
    let mut joined = root.trim_end_matches('/').to_string();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            _ => {
                joined.push('/');
                joined.push_str(segment);
            }
        }
    }
    Some(joined)
}
