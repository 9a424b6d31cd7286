//! CLI configuration module
//!
//! Manages configuration for the CLI application.

use crate::cli::args::CliArgs;
use crate::dht::{DhtSettings, Kuid};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the DHT node binary
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind to
    pub bind: SocketAddr,
    /// Bootstrap seeds
    pub seeds: Vec<SocketAddr>,
    /// DHT tunables
    pub settings: DhtSettings,
    /// Value to store as (key, value)
    pub put: Option<(String, String)>,
    /// Key to look up
    pub get: Option<String>,
    /// Interval between status reports
    pub status_interval: Duration,
    /// Exit after put/get
    pub once: bool,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let settings = match &args.settings {
            Some(path) => DhtSettings::from_json_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => DhtSettings::default(),
        };

        let put = match &args.put {
            Some(pair) => {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--put expects KEY=VALUE, got {:?}", pair))?;
                Some((key.to_string(), value.to_string()))
            }
            None => None,
        };

        Ok(Self {
            bind: args.bind,
            seeds: args.seeds.clone(),
            settings,
            put,
            get: args.get.clone(),
            status_interval: Duration::from_secs(args.status_interval),
            once: args.once,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.settings.validate().context("Invalid DHT settings")?;

        for seed in &self.seeds {
            if seed.port() == 0 || seed.ip().is_unspecified() {
                return Err(anyhow::anyhow!("Seed address {} is not reachable", seed));
            }
        }

        if let Some((key, _)) = &self.put {
            if key.is_empty() {
                return Err(anyhow::anyhow!("--put key cannot be empty"));
            }
        }

        if let Some(key) = &self.get {
            if key.is_empty() {
                return Err(anyhow::anyhow!("--get key cannot be empty"));
            }
        }

        if self.once && self.put.is_none() && self.get.is_none() {
            return Err(anyhow::anyhow!("--once needs --put or --get"));
        }

        Ok(())
    }

    /// DHT key for a text key
    pub fn key_for(name: &str) -> Kuid {
        Kuid::hash_of(name.as_bytes())
    }

    /// Get the status report interval (None when disabled)
    pub fn status_interval(&self) -> Option<Duration> {
        if self.status_interval == Duration::ZERO {
            None
        } else {
            Some(self.status_interval)
        }
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
