//! CLI arguments
//!
//! Command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the file sharing node
#[derive(Debug, Parser)]
#[command(name = "peershare")]
#[command(about = "Decentralized peer-to-peer file sharing with tracker-less discovery", long_about = None)]
pub struct CliArgs {
    /// Path to the torrent metainfo file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Working directory for in-progress downloads
    #[arg(short, long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Directory completed files are published to
    #[arg(short, long, value_name = "DIR")]
    pub shared_dir: Option<PathBuf>,

    /// Listening port for peer connections
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// UDP port for DHT datagrams
    #[arg(short = 'd', long, default_value_t = 6881)]
    pub dht_port: u16,

    /// Maximum concurrent serving connections
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Seconds of silence before a peer session is closed
    #[arg(long, default_value_t = 120)]
    pub idle_timeout: u64,

    /// Known DHT contacts to greet at startup, ip:port
    #[arg(long, value_name = "ADDR")]
    pub bootstrap: Vec<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
