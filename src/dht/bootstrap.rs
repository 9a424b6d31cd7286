//! DHT bootstrap module
//!
//! Joins the network through seed addresses: every seed is pinged, then
//! node lookups for the local id fill the routing table until it is full
//! enough or the attempts run out. The node answers pings only once this
//! completes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dht::lookup::LookupManager;
use crate::error::{DhtError, Result};

/// Bootstrap configuration
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    /// Addresses of nodes already in the network
    pub seeds: Vec<SocketAddr>,
}

impl BootstrapConfig {
    pub fn new(seeds: Vec<SocketAddr>) -> Self {
        Self { seeds }
    }

    /// Seeds with duplicates and `local_addr` removed
    fn usable_seeds(&self, local_addr: SocketAddr) -> Vec<SocketAddr> {
        let mut seeds = Vec::with_capacity(self.seeds.len());
        for seed in &self.seeds {
            if *seed != local_addr && !seeds.contains(seed) {
                seeds.push(*seed);
            }
        }
        seeds
    }
}

/// Outcome of a bootstrap
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapResult {
    /// Seeds that answered the initial ping
    pub seeds_responded: usize,
    /// Node lookups run for the local id
    pub lookups: usize,
    /// Contacts in the routing table afterwards
    pub contacts: usize,
    pub fill_ratio: f64,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Bootstrap the node. With no seeds the node is the first of its network
/// and is bootstrapped at once; otherwise at least one seed must answer.
pub async fn bootstrap(lookups: &LookupManager, config: &BootstrapConfig) -> Result<BootstrapResult> {
    let dispatcher = lookups.dispatcher();
    let settings = dispatcher.settings();
    let started = Instant::now();
    let seeds = config.usable_seeds(dispatcher.local_addr());

    if seeds.is_empty() {
        info!("No bootstrap seeds, starting a new network");
        dispatcher.set_bootstrapped(true);
        let (contacts, fill_ratio) = table_fill(lookups);
        return Ok(BootstrapResult {
            seeds_responded: 0,
            lookups: 0,
            contacts,
            fill_ratio,
            elapsed: started.elapsed(),
        });
    }

    info!("Bootstrapping DHT network from {} seeds...", seeds.len());
    let pings = seeds.iter().map(|seed| dispatcher.ping(*seed, None));
    let seeds_responded = join_all(pings)
        .await
        .into_iter()
        .zip(&seeds)
        .filter(|(result, seed)| match result {
            Ok(_) => true,
            Err(e) => {
                debug!("Bootstrap seed {} did not answer: {}", seed, e);
                false
            }
        })
        .count();

    if seeds_responded == 0 {
        warn!("None of {} bootstrap seeds answered", seeds.len());
        return Err(DhtError::network_error_with_address(
            "No bootstrap seed responded",
            seeds.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(","),
        ));
    }

    let local_id = dispatcher.local_id();
    let mut attempts = 0;
    while attempts < settings.bootstrap_max_attempts {
        attempts += 1;
        match lookups.lookup_nodes(local_id).await {
            Ok(result) => debug!(
                "Bootstrap lookup {} found {} contacts in {} hops",
                attempts,
                result.contacts.len(),
                result.hops
            ),
            Err(e) => warn!("Bootstrap lookup {} failed: {}", attempts, e),
        }
        if dispatcher.routing().read().fill_ratio() >= settings.bootstrap_fill_ratio {
            break;
        }
    }

    dispatcher.set_bootstrapped(true);
    let (contacts, fill_ratio) = table_fill(lookups);
    info!(
        "DHT bootstrapping complete: {} contacts after {} lookups ({:.0}% full)",
        contacts,
        attempts,
        fill_ratio * 100.0
    );

    Ok(BootstrapResult {
        seeds_responded,
        lookups: attempts,
        contacts,
        fill_ratio,
        elapsed: started.elapsed(),
    })
}

fn table_fill(lookups: &LookupManager) -> (usize, f64) {
    let routing = lookups.dispatcher().routing().read();
    (routing.len(), routing.fill_ratio())
}
