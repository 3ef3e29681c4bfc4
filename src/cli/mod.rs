//! CLI module for the tiered deployment tool.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting two-tier stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, ProviderKind, StateCommands};
pub use output::OutputFormatter;
