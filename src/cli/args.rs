//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the DHT node
#[derive(Debug, Parser)]
#[command(name = "overlay-dht")]
#[command(about = "Run a Kademlia-style DHT node", long_about = None)]
pub struct CliArgs {
    /// Address to bind the UDP socket to
    #[arg(short, long, default_value = "0.0.0.0:6346")]
    pub bind: SocketAddr,

    /// Address of a node already in the network (repeatable)
    #[arg(short, long = "seed", value_name = "ADDR")]
    pub seeds: Vec<SocketAddr>,

    /// JSON file overriding DHT settings
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Store a text value once bootstrapped
    #[arg(long, value_name = "KEY=VALUE")]
    pub put: Option<String>,

    /// Look up a key once bootstrapped
    #[arg(long, value_name = "KEY")]
    pub get: Option<String>,

    /// Seconds between status reports (0 = none)
    #[arg(long, default_value_t = 60)]
    pub status_interval: u64,

    /// Exit after --put / --get instead of staying in the network
    #[arg(long)]
    pub once: bool,

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

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["overlay-dht"]).unwrap();
        assert_eq!(args.bind, "0.0.0.0:6346".parse::<SocketAddr>().unwrap());
        assert!(args.seeds.is_empty());
        assert!(args.settings.is_none());
        assert_eq!(args.status_interval, 60);
        assert!(!args.once);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_seeds_repeat() {
        let args = CliArgs::try_parse_from([
            "overlay-dht",
            "--seed",
            "10.0.0.1:6346",
            "-s",
            "10.0.0.2:6346",
            "--get",
            "song",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.seeds.len(), 2);
        assert_eq!(args.get.as_deref(), Some("song"));
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_bad_seed_rejected() {
        assert!(CliArgs::try_parse_from(["overlay-dht", "--seed", "not-an-address"]).is_err());
    }
}
