//! Status display module
//!
//! Prints node status and operation results in the CLI.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::dht::{DhtStatus, FindValueResult, StoreResult};

/// Status display for CLI
pub struct StatusDisplay {
    /// Start time of the node
    start_time: Instant,
    /// Quiet mode (no status output)
    quiet: bool,
}

impl StatusDisplay {
    /// Create a new status display
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
        }
    }

    /// Format duration to human readable string
    pub fn format_duration(duration: Duration) -> String {
        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Value bytes as text, or hex when not UTF-8
    pub fn format_value(value: &[u8]) -> String {
        match std::str::from_utf8(value) {
            Ok(text) => text.to_string(),
            Err(_) => format!("0x{}", hex::encode(value)),
        }
    }

    /// One-line summary of a node
    pub fn format_summary(status: &DhtStatus) -> String {
        format!(
            "{} | {} | contacts: {} ({} cached) | buckets: {} | values: {} | ~{} nodes",
            status.addr,
            if status.ready { "ready" } else { "not ready" },
            status.contacts,
            status.cached_contacts,
            status.buckets,
            status.values,
            status.estimated_size,
        )
    }

    /// Print the node status as JSON
    pub fn print_status(&self, status: &DhtStatus) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let json = serde_json::to_string(status).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", json)?;
        stdout.flush()
    }

    /// Print the outcome of a value lookup
    pub fn print_values(&self, name: &str, result: &FindValueResult) -> io::Result<()> {
        if !result.is_found() {
            println!("{}: not found ({} nodes queried)", name, result.queried);
            return Ok(());
        }

        for entity in &result.entities {
            println!(
                "{} = {} (from {} at {})",
                name,
                Self::format_value(&entity.value),
                entity.creator.to_hex(),
                entity.creator_addr
            );
        }
        if !self.quiet {
            println!(
                "  {} hops, {} nodes queried, {} ms",
                result.hops,
                result.queried,
                result.elapsed.as_millis()
            );
        }
        Ok(())
    }

    /// Print the outcome of a store
    pub fn print_store(&self, name: &str, result: &StoreResult) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!(
            "{}: stored at {} nodes, {} failed ({} ms)",
            name,
            result.stored_at.len(),
            result.failed.len(),
            result.elapsed.as_millis()
        );
        Ok(())
    }

    /// Print a status message
    pub fn print_message(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!("{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("Error: {}", message);
        Ok(())
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
