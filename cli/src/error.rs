//! Centralized error types for stackgate
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use std::time::Duration;
use thiserror::Error;

/// Structural problems in a service topology
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Service '{name}' is declared more than once")]
    DuplicateService { name: String },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Service '{service}' depends on itself")]
    SelfDependency { service: String },

    #[error("Dependency cycle between services: {}", services.join(", "))]
    Cycle { services: Vec<String> },

    #[error("Service '{service}' waits for '{dependency}' to be reachable, but '{dependency}' declares no endpoint")]
    UnreachableDependency { service: String, dependency: String },

    #[error("Service '{service}' waits for '{dependency}' to complete, but '{dependency}' is not a one-shot service")]
    NotOneShot { service: String, dependency: String },

    #[error("Service '{service}' mounts undeclared volume '{volume}'")]
    UnknownVolume { service: String, volume: String },

    #[error("Dataset '{dataset}' is bound by more than one volume: {}", volumes.join(", "))]
    DatasetBoundTwice { dataset: String, volumes: Vec<String> },

    #[error("Service '{service}' references undeclared secret '{secret}'")]
    UnknownSecret { service: String, secret: String },

    #[error("Probe mismatch on '{service}' {probe} probe: expected {expected}, got {actual}")]
    ProbeMismatch {
        service: String,
        probe: String,
        expected: String,
        actual: String,
    },

    #[error("Edge proxy misconfigured: {message}")]
    EdgeProxy { message: String },
}

/// Readiness gate failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    #[error("Invalid gate target '{target}': expected host:port")]
    InvalidTarget { target: String },

    #[error("Timed out after {} waiting for {target} ({attempts} attempts)", humantime::format_duration(*timeout))]
    Timeout {
        target: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("Wait for {target} was cancelled")]
    Cancelled { target: String },
}

/// Secret resolution failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SecretError {
    #[error("Required secret '{secret}' is missing. Set {env}")]
    Missing { secret: String, env: String },

    #[error("Secret '{secret}' still uses its insecure default; set {env} to a real value")]
    InsecureDefault { secret: String, env: String },

    #[error("Secret '{secret}' is not resolved")]
    Unresolved { secret: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

/// Supervisor runtime failures
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Service '{service}' failed to start: {message}")]
    StartFailed { service: String, message: String },

    #[error("One-shot service '{service}' exited with status {}", code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    OneShotFailed { service: String, code: Option<i32> },

    #[error("Service '{service}' gave up after {restarts} restarts")]
    RestartBudgetExhausted { service: String, restarts: u32 },

    #[error("Service '{service}' never started: dependency '{dependency}' failed")]
    DependencyFailed { service: String, dependency: String },
}

/// Exit status for an anyhow error chain. Gate timeouts use 124, like `timeout(1)`.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(gate) = cause.downcast_ref::<GateError>() {
            if matches!(gate, GateError::Timeout { .. }) {
                return 124;
            }
        }
    }
    1
}
