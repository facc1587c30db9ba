//! Command-line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Autonomous R&D mission engine
#[derive(Debug, Parser)]
#[command(name = "md", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a mission until complete or halted
    Run {
        /// Problem statement for a new mission; omit to resume
        #[arg(long)]
        mission: Option<String>,

        /// Workspace directory for agent artifacts
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Cycle budget for a new mission
        #[arg(long)]
        cycles: Option<u32>,
    },

    /// Print the mission status
    Status,

    /// Reset the mission record (the only way out of COMPLETE)
    Reset,
}
