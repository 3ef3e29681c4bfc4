//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tiered - dependency-aware provisioning for a two-tier AWS stack.
#[derive(Parser, Debug)]
#[command(name = "tiered")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TIERED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Provider backend.
    #[arg(long, global = true, default_value = "cloudcontrol", env = "TIERED_PROVIDER")]
    pub provider: ProviderKind,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the deployment configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the resource graph in dependency order.
    Graph,

    /// Generate and display the reconciliation plan.
    Plan {
        /// Show changed attributes and dependencies per action.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply the plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum number of provider calls in flight.
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Destroy all recorded resources.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check for drift between recorded and live state.
    Drift,

    /// Show stack outputs.
    Outputs,

    /// Probe the load balancer over HTTP.
    Probe {
        /// Keep probing until healthy or this many seconds pass.
        #[arg(long, default_value = "0")]
        wait: u64,

        /// Request path.
        #[arg(long, default_value = "/")]
        path: String,
    },

    /// Plan and apply against a simulated cloud seeded from current state.
    Rehearse {
        /// Make the create of this node fail.
        #[arg(long)]
        fail: Vec<String>,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Provider backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// AWS Cloud Control API.
    #[default]
    Cloudcontrol,
    /// In-memory simulated cloud; nothing real is touched.
    Simulated,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
