//! DHT maintenance module
//!
//! Background upkeep of a running node: stale buckets are refreshed with a
//! lookup for a random id in their range, local values are republished
//! before remote copies expire, expired values are dropped, token secrets
//! rotate, and ready-state listeners learn when the node joins or appears
//! to lose the network.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dht::database::DhtValueEntity;
use crate::dht::kuid::Kuid;
use crate::dht::lookup::LookupManager;
use crate::dht::store::store;

/// How often the ready state and token rotation are checked
const READY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type ReadyListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Ready flag with change listeners
#[derive(Default)]
pub struct ReadyState {
    ready: AtomicBool,
    listeners: Mutex<Vec<ReadyListener>>,
}

impl ReadyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Register a listener called with the new state on every change
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Set the state, notifying listeners if it changed. Returns true on a change.
    pub fn update(&self, ready: bool) -> bool {
        if self.ready.swap(ready, Ordering::SeqCst) == ready {
            return false;
        }
        info!("DHT is now {}", if ready { "ready" } else { "not ready" });
        let listeners: Vec<ReadyListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(ready);
        }
        true
    }
}

impl std::fmt::Debug for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyState")
            .field("ready", &self.is_ready())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Runs the periodic maintenance of one node
#[derive(Debug, Clone)]
pub struct Refresher {
    lookups: Arc<LookupManager>,
    ready: Arc<ReadyState>,
}

impl Refresher {
    pub fn new(lookups: Arc<LookupManager>, ready: Arc<ReadyState>) -> Self {
        Self { lookups, ready }
    }

    /// Look up a random id in every bucket untouched for the refresh
    /// interval. Returns how many buckets were refreshed.
    pub async fn refresh_buckets(&self) -> usize {
        let dispatcher = self.lookups.dispatcher();
        if !dispatcher.is_bootstrapped() {
            return 0;
        }
        let older_than = dispatcher.settings().bucket_refresh_interval();
        let stale = dispatcher.routing().read().buckets_due_for_refresh(older_than);
        if stale.is_empty() {
            return 0;
        }

        debug!("Refreshing {} stale DHT buckets", stale.len());
        let mut refreshed = 0;
        for range in stale {
            let target = range.random_id();
            match self.lookups.lookup_nodes(target).await {
                Ok(_) => refreshed += 1,
                Err(e) => debug!("Refresh lookup for {} failed: {}", target.to_hex(), e),
            }
            // touched even on failure so an empty range is not retried every check
            dispatcher.routing().write().touch_bucket(&target);
        }
        refreshed
    }

    /// Store local values whose last publication is older than the
    /// republish interval. Returns how many values were republished.
    pub async fn republish(&self) -> usize {
        let dispatcher = self.lookups.dispatcher();
        if !dispatcher.is_bootstrapped() {
            return 0;
        }
        let due = dispatcher
            .database()
            .read()
            .values_due_for_republish(dispatcher.settings().republish_interval());
        if due.is_empty() {
            return 0;
        }

        let mut by_key: BTreeMap<Kuid, Vec<DhtValueEntity>> = BTreeMap::new();
        for entity in due {
            by_key.entry(entity.key).or_default().push(entity);
        }

        info!("Republishing values under {} keys", by_key.len());
        let mut republished = 0;
        for (key, entities) in by_key {
            let creators: Vec<Kuid> = entities.iter().map(|e| e.creator).collect();
            match store(self.lookups.clone(), key, entities).await {
                Ok(result) if result.is_successful() => republished += creators.len(),
                Ok(_) => warn!("Republish of {} reached no node", key.to_hex()),
                Err(e) => warn!("Republish of {} failed: {}", key.to_hex(), e),
            }
            // retried at the next interval either way
            let now = Instant::now();
            {
                let mut database = dispatcher.database().write();
                for creator in &creators {
                    database.mark_republished(&key, creator, now);
                }
            }
        }
        republished
    }

    /// Drop expired values
    pub fn clean_database(&self) -> usize {
        self.lookups.dispatcher().database().write().expire(Instant::now())
    }

    /// Rotate token secrets when due and recompute the ready state
    pub fn check_ready_state(&self) -> bool {
        let dispatcher = self.lookups.dispatcher();
        if dispatcher.tokens().rotate_if_due() {
            debug!("Rotated security token secret");
        }
        let ready = dispatcher.is_bootstrapped() && !dispatcher.routing().read().appears_disconnected();
        self.ready.update(ready);
        ready
    }

    /// Maintenance loop; runs until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let settings = self.lookups.dispatcher().settings().clone();
        let mut ready_check = interval(READY_CHECK_INTERVAL);
        let mut bucket_check = interval(settings.bucket_refresh_check());
        let mut republish_check = interval(settings.bucket_refresh_check());
        let mut cleaner = interval(settings.database_cleaner_period());
        for timer in [&mut ready_check, &mut bucket_check, &mut republish_check, &mut cleaner] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        bucket_check.tick().await;
        republish_check.tick().await;
        cleaner.tick().await;

        debug!("DHT maintenance running");
        loop {
            tokio::select! {
                _ = ready_check.tick() => {
                    self.check_ready_state();
                }
                _ = bucket_check.tick() => {
                    self.refresh_buckets().await;
                }
                _ = republish_check.tick() => {
                    self.republish().await;
                }
                _ = cleaner.tick() => {
                    self.clean_database();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.ready.update(false);
        debug!("DHT maintenance stopped");
    }
}
