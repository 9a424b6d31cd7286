//! Network size estimation
//!
//! With n nodes spread uniformly over the key space, the j-th closest node
//! to any id lies at about j/n of the space away. A least-squares fit of the
//! observed distances x_j against j gives n = sum(j^2) / sum(j * x_j). The
//! local estimate is averaged with estimates reported by other nodes in
//! Ping responses.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::dht::kuid::Kuid;

/// Remote estimates kept for averaging
const MAX_REMOTE_ESTIMATES: usize = 10;

/// Least-squares network size from the distances of `ids` to `local_id`
pub fn estimate_size(local_id: &Kuid, ids: &[Kuid]) -> u32 {
    let mut fractions: Vec<f64> = ids
        .iter()
        .filter(|id| *id != local_id)
        .map(|id| local_id.distance(id).as_fraction())
        .collect();
    if fractions.is_empty() {
        return 1;
    }
    fractions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut sum_j2 = 0.0f64;
    let mut sum_jx = 0.0f64;
    for (i, x) in fractions.iter().enumerate() {
        let j = (i + 1) as f64;
        sum_j2 += j * j;
        sum_jx += j * x;
    }

    let floor = fractions.len() as f64 + 1.0;
    if sum_jx <= 0.0 {
        return floor as u32;
    }
    (sum_j2 / sum_jx).max(floor).min(u32::MAX as f64) as u32
}

/// Cached size estimate of the network
#[derive(Debug)]
pub struct SizeEstimator {
    local_estimate: u32,
    computed_at: Option<Instant>,
    remote_estimates: VecDeque<u32>,
    update_interval: Duration,
}

impl SizeEstimator {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            local_estimate: 1,
            computed_at: None,
            remote_estimates: VecDeque::new(),
            update_interval,
        }
    }

    /// True if the local estimate should be recomputed
    pub fn is_stale(&self, now: Instant) -> bool {
        self.computed_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.update_interval)
    }

    /// Recompute the local estimate from the contacts closest to `local_id`
    pub fn update(&mut self, local_id: &Kuid, closest: &[Kuid], now: Instant) {
        self.local_estimate = estimate_size(local_id, closest);
        self.computed_at = Some(now);
    }

    /// Record an estimate reported by another node
    pub fn add_remote_estimate(&mut self, size: u32) {
        if size == 0 {
            return;
        }
        self.remote_estimates.push_back(size);
        while self.remote_estimates.len() > MAX_REMOTE_ESTIMATES {
            self.remote_estimates.pop_front();
        }
    }

    /// Average of the local estimate and the remote ones
    pub fn estimated_size(&self) -> u32 {
        let total: u64 = self.remote_estimates.iter().map(|&s| s as u64).sum::<u64>() + self.local_estimate as u64;
        let count = self.remote_estimates.len() as u64 + 1;
        (total / count) as u32
    }

    pub fn local_estimate(&self) -> u32 {
        self.local_estimate
    }
}
