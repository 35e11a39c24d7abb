//! CLI argument parsing for probeweave

use crate::aggregator::SortKey;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "probeweave")]
#[command(version)]
#[command(about = "Opt-in call-site timing with saved, comparable sessions", long_about = None)]
pub struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the header of a session file
    Inspect {
        /// Session file
        file: PathBuf,
    },

    /// List the saved sessions of a target
    List {
        /// Target name, e.g. `Pawn.Tick`
        target: String,

        /// Session directory (defaults to the configured one)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Compare two session files
    Compare {
        /// Baseline session
        lhs: PathBuf,
        /// Session compared against the baseline
        rhs: PathBuf,
    },

    /// Drive a synthetic workload through the engine and print the ranking
    Simulate {
        /// Number of host cycles to run
        #[arg(long, default_value = "200")]
        cycles: u32,

        /// Number of simulated call sites
        #[arg(long, default_value = "3")]
        targets: usize,

        /// Ranking key for the printed logs
        #[arg(long, value_enum, default_value = "percent")]
        sort: SortKey,

        /// Random seed for the workload
        #[arg(long)]
        seed: Option<u64>,

        /// Collect a session from the first target and save it
        #[arg(long)]
        save: bool,

        /// Label stored with the saved session
        #[arg(long, value_name = "LABEL")]
        label: Option<String>,
    },
}
