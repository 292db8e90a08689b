//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keep partner library catalogues mirrored and fresh.
///
/// Interlend harvests bibliographic records from configured host systems into
/// a local store, refreshes their availability snapshots, and resumes
/// interrupted work from durable checkpoints.
#[derive(Parser, Debug)]
#[command(name = "interlend")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path (default: ~/.config/interlend/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file path (default: interlend.db in the working directory)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until interrupted
    Run,

    /// Harvest sources once, to exhaustion
    Sync {
        /// Only harvest this source (default: all enabled sources)
        #[arg(long)]
        source: Option<String>,
    },

    /// Refresh stale availability snapshots once
    Recheck,

    /// Show checkpoints, record counts, and recent runs
    Status,

    /// List configured sources
    Sources,

    /// Delete a checkpoint so the next run starts a fresh bootstrap
    Reset {
        /// Source system id whose checkpoint to delete. Omit for the
        /// broker-wide availability-recheck checkpoint.
        #[arg(long)]
        source: Option<String>,

        /// Checkpoint process to delete
        #[arg(long, default_value = "harvest")]
        process: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}
