//! Readiness gates
//!
//! A gate blocks a service's startup until an upstream dependency accepts TCP
//! connections, or fails once its timeout elapses. The same gate serves the
//! `wait-for` entrypoint wrapper and every dependency edge in the supervisor.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::GateError;

/// Interval between connection attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Readiness timeout used when a service does not set one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Network address a gate waits on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GateTarget {
    pub host: String,
    pub port: u16,
}

impl GateTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for GateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for GateTarget {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GateError::InvalidTarget {
            target: s.to_string(),
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

/// Connection seam so gates can be driven without real sockets
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempt a single connection, giving up after `budget`
    async fn connect(&self, target: &GateTarget, budget: Duration) -> std::io::Result<()>;
}

/// Plain TCP connect
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &GateTarget, budget: Duration) -> std::io::Result<()> {
        let addr = (target.host.as_str(), target.port);
        match tokio::time::timeout(budget, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection attempt timed out",
            )),
        }
    }
}

/// Timed reachability check blocking downstream startup
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    target: GateTarget,
    timeout: Duration,
    poll_interval: Duration,
}

impl ReadinessGate {
    pub fn new(target: GateTarget, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Builder: set the interval between attempts
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        // A zero interval would spin
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn target(&self) -> &GateTarget {
        &self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait on a real TCP socket
    pub async fn wait(&self) -> Result<Duration, GateError> {
        self.wait_with(&TcpConnector).await
    }

    /// Wait using the given connector. Returns how long the wait took.
    pub async fn wait_with<C: Connector + ?Sized>(&self, connector: &C) -> Result<Duration, GateError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u32;

        loop {
            let attempt_started = Instant::now();
            let remaining = deadline.saturating_duration_since(attempt_started);
            if remaining.is_zero() {
                return Err(GateError::Timeout {
                    target: self.target.to_string(),
                    timeout: self.timeout,
                    attempts,
                });
            }

            attempts += 1;
            let budget = remaining.min(self.poll_interval);
            match connector.connect(&self.target, budget).await {
                Ok(()) => {
                    let waited = started.elapsed();
                    info!(
                        "✓ {} is reachable (after {} attempt{}, {:.1}s)",
                        self.target,
                        attempts,
                        if attempts == 1 { "" } else { "s" },
                        waited.as_secs_f64()
                    );
                    return Ok(waited);
                }
                Err(e) => {
                    debug!(
                        "{} is unavailable (attempt {}): {} - retrying in {:?}",
                        self.target, attempts, e, self.poll_interval
                    );
                }
            }

            let next = (attempt_started + self.poll_interval).min(deadline);
            tokio::time::sleep_until(next).await;
        }
    }

    /// Wait until reachable, timed out, or `cancel` resolves
    pub async fn wait_until<C, F>(&self, connector: &C, cancel: F) -> Result<Duration, GateError>
    where
        C: Connector + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.wait_with(connector) => result,
            _ = cancel => Err(GateError::Cancelled {
                target: self.target.to_string(),
            }),
        }
    }
}

/// Wait on several targets within one shared deadline, in order.
pub async fn wait_all<C: Connector + ?Sized>(
    targets: &[GateTarget],
    timeout: Duration,
    poll_interval: Duration,
    connector: &C,
) -> Result<Duration, GateError> {
    let started = Instant::now();
    for target in targets {
        let remaining = timeout.saturating_sub(started.elapsed());
        ReadinessGate::new(target.clone(), remaining)
            .with_poll_interval(poll_interval)
            .wait_with(connector)
            .await
            .map_err(|e| match e {
                // Report the overall budget rather than the leftover slice
                GateError::Timeout { target, attempts, .. } => GateError::Timeout {
                    target,
                    timeout,
                    attempts,
                },
                other => other,
            })?;
    }
    Ok(started.elapsed())
}
