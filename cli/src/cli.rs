//! CLI definitions for stackgate
//!
//! This module contains all CLI argument parsing structures using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use stackgate::domain::Profile;
use stackgate::services::supervisor::DEFAULT_MAX_RESTARTS;

#[derive(Parser)]
#[command(
    name = "stackgate",
    version,
    about = "Readiness-gated startup supervisor for multi-service stacks",
    long_about = "Starts a service topology in dependency order.\nEach service waits on readiness gates for its dependencies, one-shot initializers run to completion first, and probes drive routing and restarts."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Topology file (defaults to the built-in reference topology)
    #[arg(long, global = true, env = "STACKGATE_TOPOLOGY")]
    pub topology: Option<PathBuf>,

    /// Deployment profile: evaluation allows insecure secret defaults
    #[arg(long, global = true, env = "STACKGATE_PROFILE", value_enum, default_value_t = Profile::Evaluation)]
    pub profile: Profile,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Wait until every HOST:PORT accepts connections, then exec the command
    WaitFor {
        /// Targets to wait on (HOST:PORT)
        #[arg(required = true, value_name = "HOST:PORT")]
        targets: Vec<String>,

        /// Overall deadline shared by all targets
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// Interval between connection attempts
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Command to exec once all targets are reachable
        #[arg(last = true, value_name = "CMD")]
        command: Vec<String>,
    },

    /// Print the start order as waves with each service's gates
    Plan {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate the topology and resolve secrets for the profile
    Check,

    /// Render a Docker Compose document
    Render {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start and supervise every service until Ctrl-C
    Up {
        /// Restarts allowed per instance before giving up
        #[arg(long, default_value_t = DEFAULT_MAX_RESTARTS)]
        max_restarts: u32,

        /// Services run as local processes; gates and probes target 127.0.0.1
        #[arg(long)]
        local: bool,
    },
}
