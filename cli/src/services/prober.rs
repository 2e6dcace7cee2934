//! Probe execution against running instances.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::domain::{ProbeHandler, ProbeSpec};

/// Runs one probe attempt and reports pass/fail
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, spec: &ProbeSpec) -> bool;
}

/// Probes over the network: HTTP GET or TCP connect
pub struct NetworkProber {
    client: Client,
}

impl NetworkProber {
    pub fn new() -> anyhow::Result<Self> {
        // Self-signed certificates are expected when the edge proxy generates its own
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    async fn http_get(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                debug!("Probe {} -> {}", url, status);
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                false
            }
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, host: &str, spec: &ProbeSpec) -> bool {
        match &spec.handler {
            ProbeHandler::HttpGet { path, port, scheme } => {
                let url = format!("{}://{}:{}{}", scheme, host, port, path);
                self.http_get(&url, spec.timeout).await
            }
            ProbeHandler::TcpSocket { port } => self.tcp_connect(host, *port, spec.timeout).await,
        }
    }
}
