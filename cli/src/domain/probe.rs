//! Health probe definitions and the per-instance health state machine.
//!
//! Startup, liveness and readiness probes are tracked independently:
//! startup gates the instance into `Running`, liveness failures force a
//! restart of that instance only, and readiness only toggles whether the
//! instance receives traffic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which probe produced an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Startup,
    Liveness,
    Readiness,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 3] = [ProbeKind::Startup, ProbeKind::Liveness, ProbeKind::Readiness];

    fn index(self) -> usize {
        match self {
            ProbeKind::Startup => 0,
            ProbeKind::Liveness => 1,
            ProbeKind::Readiness => 2,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::Startup => "startup",
            ProbeKind::Liveness => "liveness",
            ProbeKind::Readiness => "readiness",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// How a probe checks the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeHandler {
    HttpGet { path: String, port: u16, scheme: Scheme },
    TcpSocket { port: u16 },
}

impl ProbeHandler {
    pub fn port(&self) -> u16 {
        match self {
            ProbeHandler::HttpGet { port, .. } | ProbeHandler::TcpSocket { port } => *port,
        }
    }
}

impl fmt::Display for ProbeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeHandler::HttpGet { path, port, scheme } => write!(f, "{} :{}{}", scheme, port, path),
            ProbeHandler::TcpSocket { port } => write!(f, "tcp :{}", port),
        }
    }
}

/// A single probe definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeSpec {
    pub handler: ProbeHandler,
    pub initial_delay: Duration,
    pub period: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl ProbeSpec {
    pub fn http(path: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self::with_handler(ProbeHandler::HttpGet {
            path: path.into(),
            port,
            scheme,
        })
    }

    pub fn tcp(port: u16) -> Self {
        Self::with_handler(ProbeHandler::TcpSocket { port })
    }

    fn with_handler(handler: ProbeHandler) -> Self {
        Self {
            handler,
            initial_delay: Duration::ZERO,
            period: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
            failure_threshold: 3,
            success_threshold: 1,
        }
    }

    /// Builder: set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Builder: set the polling period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

/// The three optional probes of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<ProbeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness: Option<ProbeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ProbeSpec>,
}

impl ProbeSet {
    pub fn get(&self, kind: ProbeKind) -> Option<&ProbeSpec> {
        match kind {
            ProbeKind::Startup => self.startup.as_ref(),
            ProbeKind::Liveness => self.liveness.as_ref(),
            ProbeKind::Readiness => self.readiness.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProbeKind, &ProbeSpec)> {
        ProbeKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|spec| (kind, spec)))
    }

    pub fn is_empty(&self) -> bool {
        self.startup.is_none() && self.liveness.is_none() && self.readiness.is_none()
    }
}

/// Process-level state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Starting,
    Running,
    Restarting,
    FailedToStart,
}

/// Side effects the supervisor must carry out after an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Started,
    StartupFailed,
    Restart,
    AddToRouting,
    RemoveFromRouting,
}

#[derive(Debug, Clone, Copy, Default)]
struct Streak {
    successes: u32,
    failures: u32,
}

impl Streak {
    fn record(&mut self, success: bool) {
        if success {
            self.successes = self.successes.saturating_add(1);
            self.failures = 0;
        } else {
            self.failures = self.failures.saturating_add(1);
            self.successes = 0;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    failure: u32,
    success: u32,
}

/// Health tracking for one service instance
#[derive(Debug, Clone)]
pub struct HealthState {
    lifecycle: Lifecycle,
    serving: bool,
    restarts: u32,
    streaks: [Streak; 3],
    thresholds: [Option<Thresholds>; 3],
}

impl HealthState {
    pub fn new(probes: &ProbeSet) -> Self {
        let thresholds = ProbeKind::ALL.map(|kind| {
            probes.get(kind).map(|spec| Thresholds {
                failure: spec.failure_threshold.max(1),
                success: spec.success_threshold.max(1),
            })
        });

        let mut state = Self {
            lifecycle: Lifecycle::Starting,
            serving: false,
            restarts: 0,
            streaks: [Streak::default(); 3],
            thresholds,
        };
        state.enter_starting();
        state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the instance should receive traffic
    pub fn is_serving(&self) -> bool {
        self.serving
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Apply one probe result and return the resulting actions, in order
    pub fn observe(&mut self, kind: ProbeKind, success: bool) -> Vec<HealthAction> {
        let Some(thresholds) = self.thresholds[kind.index()] else {
            return Vec::new();
        };

        match (self.lifecycle, kind) {
            (Lifecycle::Starting, ProbeKind::Startup) => {
                let streak = &mut self.streaks[kind.index()];
                streak.record(success);
                if success {
                    self.lifecycle = Lifecycle::Running;
                    let mut actions = vec![HealthAction::Started];
                    if self.thresholds[ProbeKind::Readiness.index()].is_none() {
                        self.serving = true;
                        actions.push(HealthAction::AddToRouting);
                    }
                    actions
                } else if streak.failures >= thresholds.failure {
                    self.lifecycle = Lifecycle::FailedToStart;
                    vec![HealthAction::StartupFailed]
                } else {
                    Vec::new()
                }
            }
            (Lifecycle::Running, ProbeKind::Liveness) => {
                let streak = &mut self.streaks[kind.index()];
                streak.record(success);
                if !success && streak.failures >= thresholds.failure {
                    self.lifecycle = Lifecycle::Restarting;
                    let mut actions = Vec::with_capacity(2);
                    if self.serving {
                        self.serving = false;
                        actions.push(HealthAction::RemoveFromRouting);
                    }
                    actions.push(HealthAction::Restart);
                    actions
                } else {
                    Vec::new()
                }
            }
            (Lifecycle::Running, ProbeKind::Readiness) => {
                let streak = &mut self.streaks[kind.index()];
                streak.record(success);
                if success && !self.serving && streak.successes >= thresholds.success {
                    self.serving = true;
                    vec![HealthAction::AddToRouting]
                } else if !success && self.serving && streak.failures >= thresholds.failure {
                    self.serving = false;
                    vec![HealthAction::RemoveFromRouting]
                } else {
                    Vec::new()
                }
            }
            // Startup results after start, liveness/readiness before start,
            // and everything while restarting or failed are ignored.
            _ => Vec::new(),
        }
    }

    /// The instance has been restarted; begin tracking from scratch
    pub fn restarted(&mut self) {
        self.restarts += 1;
        self.enter_starting();
    }

    fn enter_starting(&mut self) {
        self.streaks = [Streak::default(); 3];
        self.serving = false;
        if self.thresholds[ProbeKind::Startup.index()].is_some() {
            self.lifecycle = Lifecycle::Starting;
        } else {
            self.lifecycle = Lifecycle::Running;
            self.serving = self.thresholds[ProbeKind::Readiness.index()].is_none();
        }
    }
}
