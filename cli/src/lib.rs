//! stackgate: readiness-gated startup supervision for multi-service stacks.
//!
//! - [`domain`]: topology, probes, edge routing and secrets, free of I/O
//! - [`gate`]: the reusable readiness gate
//! - [`services`]: supervisor, process runtime and network probes
//! - [`config`]: YAML topology files
//! - [`commands`]: the `stackgate` subcommands

pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod gate;
pub mod services;
pub mod ui;
pub mod validation;
