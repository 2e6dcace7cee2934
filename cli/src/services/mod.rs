//! Services layer - orchestration logic
//!
//! This module coordinates between domain logic and the processes and
//! network endpoints it supervises.

pub mod prober;
pub mod runtime;
pub mod supervisor;

// Re-export commonly used types
pub use prober::{NetworkProber, Prober};
pub use runtime::{InstanceId, ProcessRuntime, ServiceRuntime};
pub use supervisor::{RoutingTable, StartupEvent, StartupEventKind, Supervisor, SupervisorOptions};
