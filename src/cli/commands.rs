//! CLI command definitions using clap.
//!
//! - enqueue: run inbound posts through intake into the queue
//! - cycle / run: one dispatcher cycle, or cycles on an interval
//! - listen: event-driven intake with a request worker pool
//! - request: answer one interactive request
//! - queue / limit: inspect state

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Akari - meme image bot
#[derive(Parser, Debug)]
#[command(name = "akari")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `queue`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Read inbound posts (JSON lines) and queue timeline candidates
    Enqueue {
        /// File to read; stdin when omitted
        input: Option<PathBuf>,
    },

    /// Run one dispatcher cycle
    Cycle,

    /// Run dispatcher cycles until interrupted
    Run {
        /// Seconds between cycles, overriding the config
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Read inbound posts from stdin as they arrive, queueing timeline posts
    /// and answering requests in the background
    Listen,

    /// Answer a single request and print the reply
    Request {
        /// Request text
        text: String,

        /// Handle of the requesting user
        #[arg(short = 'u', long, default_value = "operator")]
        handle: String,

        /// Follower count of the requesting user
        #[arg(short, long, default_value_t = 1000)]
        followers: u64,

        /// Source image URL (http or https) to use instead of searching
        #[arg(short, long)]
        image: Option<String>,
    },

    /// Show queued candidates ranked by score
    Queue {
        /// Include ineligible candidates
        #[arg(short, long)]
        all: bool,
    },

    /// Show a rate-limit counter
    Limit {
        scope: String,
        identity: String,

        /// Count a hit instead of only reading
        #[arg(long)]
        hit: bool,

        /// Window size for --hit
        #[arg(long, default_value_t = 1)]
        max: u32,

        /// Window length in seconds for --hit
        #[arg(long, default_value_t = 60)]
        ttl: u64,
    },
}
