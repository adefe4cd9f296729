//! Runtime configuration
//!
//! Resolves CLI arguments into the settings the node runs with.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::cli::args::CliArgs;
use crate::error::ShareError;

/// Resolved configuration for one sharing node
#[derive(Debug, Clone)]
pub struct Config {
    /// Torrent metainfo file path
    pub torrent_file: PathBuf,
    /// Working directory for in-progress downloads
    pub work_dir: PathBuf,
    /// Directory completed files are published to
    pub shared_dir: PathBuf,
    /// Peer wire listening port
    pub port: u16,
    /// DHT UDP port
    pub dht_port: u16,
    /// Maximum concurrent serving connections
    pub max_connections: usize,
    /// Session idle cutoff
    pub idle_timeout: Duration,
    /// DHT contacts greeted at startup
    pub bootstrap: Vec<SocketAddr>,
}

impl Config {
    /// Resolve CLI arguments into a configuration
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let work_dir = args.work_dir.clone().unwrap_or_else(|| PathBuf::from("./work"));
        let shared_dir = args.shared_dir.clone().unwrap_or_else(|| PathBuf::from("./shared"));

        let mut bootstrap = Vec::new();
        for raw in &args.bootstrap {
            let addr: SocketAddr = raw.parse().map_err(|_| {
                ShareError::config_error_with_field(
                    format!("Invalid bootstrap address: {}", raw),
                    "bootstrap",
                )
            })?;
            bootstrap.push(addr);
        }

        let config = Self {
            torrent_file: args.torrent_file.clone(),
            work_dir,
            shared_dir,
            port: args.port,
            dht_port: args.dht_port,
            max_connections: args.max_connections,
            idle_timeout: Duration::from_secs(args.idle_timeout),
            bootstrap,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the resolved settings
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ShareError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.dht_port == 0 {
            return Err(
                ShareError::config_error_with_field("DHT port cannot be 0", "dht_port").into()
            );
        }
        if self.max_connections == 0 {
            return Err(ShareError::config_error_with_field(
                "max_connections must be at least 1",
                "max_connections",
            )
            .into());
        }
        if self.idle_timeout < Duration::from_secs(1) {
            return Err(ShareError::config_error_with_field(
                "idle_timeout must be at least one second",
                "idle_timeout",
            )
            .into());
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(
                ShareError::config_error_with_field("work_dir cannot be empty", "work_dir").into()
            );
        }
        if self.shared_dir.as_os_str().is_empty() {
            return Err(ShareError::config_error_with_field(
                "shared_dir cannot be empty",
                "shared_dir",
            )
            .into());
        }
        Ok(())
    }

    /// Listen address for the peer wire socket
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Bind address for the DHT socket
    pub fn dht_addr(&self) -> String {
        format!("0.0.0.0:{}", self.dht_port)
    }
}
