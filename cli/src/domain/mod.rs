//! Domain layer - pure deployment logic
//!
//! This module contains topology, health and routing rules with no external I/O.
//! Types and functions here can be unit tested without mocking.

pub mod edge;
pub mod probe;
pub mod secrets;
pub mod topology;

// Re-export commonly used types
pub use edge::{EdgeProxySettings, Route};
pub use probe::{HealthAction, HealthState, Lifecycle, ProbeHandler, ProbeKind, ProbeSet, ProbeSpec, Scheme};
pub use secrets::{Profile, ResolvedSecrets, SecretRegistry, SecretSpec};
pub use topology::{
    Dependency, DependencyCondition, DependencyGate, Endpoint, ServiceDescriptor, ServiceRole,
    Topology, Volume, VolumeMount,
};
