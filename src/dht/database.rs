//! DHT value database module
//!
//! Stores values by key. Each key holds a bag of entities, at most one per
//! creator. Values created by this node are marked local: they never expire
//! here, remote stores cannot overwrite them, and only they are republished.
//!
//! Remote values are direct when the creator itself sent them and indirect
//! when some other node did. Only a direct store may remove a value, and an
//! indirect store never replaces a direct one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dht::kuid::Kuid;
use crate::dht::settings::DhtSettings;
use crate::error::{DhtError, Result};

/// Four-character value type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DhtValueType(pub u32);

impl DhtValueType {
    /// Matches every type in a lookup filter
    pub const ANY: DhtValueType = DhtValueType(0);
    pub const BINARY: DhtValueType = DhtValueType(u32::from_be_bytes(*b"BINA"));
    pub const TEXT: DhtValueType = DhtValueType(u32::from_be_bytes(*b"TEXT"));

    pub fn matches(&self, other: &DhtValueType) -> bool {
        *self == DhtValueType::ANY || self == other
    }
}

impl std::fmt::Display for DhtValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == DhtValueType::ANY {
            return write!(f, "ANY");
        }
        let text: String = self
            .0
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect();
        write!(f, "{}", text)
    }
}

/// A value stored under a key by one creator
#[derive(Debug, Clone)]
pub struct DhtValueEntity {
    /// Node that created the value
    pub creator: Kuid,
    /// Address of the creator when it published
    pub creator_addr: SocketAddr,
    /// Key the value is stored under
    pub key: Kuid,
    pub value_type: DhtValueType,
    pub version: u16,
    /// Raw value bytes; empty means "remove"
    pub value: Vec<u8>,
    /// When this node stored or last republished the value
    pub published: Instant,
    /// Created by this node
    pub local: bool,
    /// Received from the creator itself
    pub direct: bool,
}

impl DhtValueEntity {
    pub fn new(
        creator: Kuid,
        creator_addr: SocketAddr,
        key: Kuid,
        value_type: DhtValueType,
        value: Vec<u8>,
    ) -> Self {
        Self {
            creator,
            creator_addr,
            key,
            value_type,
            version: 0,
            value,
            published: Instant::now(),
            local: false,
            direct: false,
        }
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Mark the value as created by this node
    pub fn into_local(mut self) -> Self {
        self.local = true;
        self.direct = true;
        self
    }

    /// Tag a received value by whether `sender` is its creator
    pub fn received_from(mut self, sender: &Kuid) -> Self {
        self.local = false;
        self.direct = self.creator == *sender;
        self
    }

    /// Empty values ask the receiver to drop the entry
    pub fn is_removal(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_expired_at(&self, now: Instant, ttl: Duration) -> bool {
        !self.local && now.saturating_duration_since(self.published) >= ttl
    }

    /// Size of the entity on the wire
    pub fn encoded_len(&self) -> usize {
        let addr_len = match self.creator_addr {
            SocketAddr::V4(_) => 1 + 4 + 2,
            SocketAddr::V6(_) => 1 + 16 + 2,
        };
        20 + addr_len + 20 + 4 + 2 + 2 + self.value.len()
    }
}

/// Equality over the fields that travel on the wire
impl PartialEq for DhtValueEntity {
    fn eq(&self, other: &Self) -> bool {
        self.creator == other.creator
            && self.creator_addr == other.creator_addr
            && self.key == other.key
            && self.value_type == other.value_type
            && self.version == other.version
            && self.value == other.value
    }
}

impl Eq for DhtValueEntity {}

/// The values stored under one key
#[derive(Debug, Clone)]
pub struct ValueBag {
    key: Kuid,
    values: HashMap<Kuid, DhtValueEntity>,
    request_load: f32,
    last_request: Option<Instant>,
}

impl ValueBag {
    fn new(key: Kuid) -> Self {
        Self {
            key,
            values: HashMap::new(),
            request_load: 0.0,
            last_request: None,
        }
    }

    pub fn key(&self) -> &Kuid {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &DhtValueEntity> {
        self.values.values()
    }

    pub fn request_load(&self) -> f32 {
        self.request_load
    }

    /// Update the smoothed request rate (requests per second) for a request at `now`
    fn increment_request_load(&mut self, now: Instant, smoothing: f32, nulling_delay: Duration) -> f32 {
        let Some(last) = self.last_request.replace(now) else {
            return self.request_load;
        };
        let delay = now.saturating_duration_since(last);
        if delay > nulling_delay {
            self.request_load = 0.0;
            return self.request_load;
        }
        // bursts within one millisecond count as one millisecond apart
        let secs = delay.as_secs_f32().max(0.001);
        self.request_load = smoothing * (1.0 / secs) + (1.0 - smoothing) * self.request_load;
        self.request_load
    }

    /// Oldest entry not created locally
    fn oldest_remote(&self) -> Option<Kuid> {
        self.values
            .values()
            .filter(|e| !e.local)
            .min_by_key(|e| e.published)
            .map(|e| e.creator)
    }
}

/// Key/value store of one node
#[derive(Debug)]
pub struct Database {
    bags: HashMap<Kuid, ValueBag>,
    max_values_per_key: usize,
    max_keys: usize,
    max_value_size: usize,
    value_ttl: Duration,
    load_smoothing: f32,
    load_nulling_delay: Duration,
}

impl Database {
    pub fn new(settings: &DhtSettings) -> Self {
        Self {
            bags: HashMap::new(),
            max_values_per_key: settings.max_values_per_key,
            max_keys: settings.max_keys,
            max_value_size: settings.max_value_size,
            value_ttl: settings.value_ttl(),
            load_smoothing: settings.request_load_smoothing,
            load_nulling_delay: settings.request_load_nulling_delay(),
        }
    }

    /// Store, replace or remove an entity
    pub fn store(&mut self, entity: DhtValueEntity) -> Result<()> {
        self.store_at(entity, Instant::now())
    }

    pub fn store_at(&mut self, mut entity: DhtValueEntity, now: Instant) -> Result<()> {
        if entity.value.len() > self.max_value_size {
            return Err(DhtError::validation_error_with_field(
                format!("value of {} bytes exceeds {}", entity.value.len(), self.max_value_size),
                "value",
            ));
        }

        if let Some(existing) = self.bags.get(&entity.key).and_then(|b| b.values.get(&entity.creator)) {
            if existing.local && !entity.local {
                return Err(DhtError::validation_error_with_field(
                    "cannot overwrite a local value",
                    entity.key.to_hex(),
                ));
            }
            if existing.direct && !entity.direct {
                return Err(DhtError::validation_error_with_field(
                    format!("{} holds a value sent by its creator", entity.creator.to_hex()),
                    entity.key.to_hex(),
                ));
            }
        }

        if entity.is_removal() {
            if !entity.direct {
                return Err(DhtError::validation_error_with_field(
                    "only the creator may remove a value",
                    entity.key.to_hex(),
                ));
            }
            self.remove(&entity.key, &entity.creator);
            return Ok(());
        }

        if !self.bags.contains_key(&entity.key) && self.bags.len() >= self.max_keys {
            return Err(DhtError::capacity_exceeded(
                format!("database holds {} keys", self.bags.len()),
                "database-keys",
            ));
        }

        let max_values = self.max_values_per_key;
        let bag = self
            .bags
            .entry(entity.key)
            .or_insert_with(|| ValueBag::new(entity.key));

        if !bag.values.contains_key(&entity.creator) && bag.len() >= max_values {
            match bag.oldest_remote() {
                Some(oldest) => {
                    trace!("Evicting value of {} under {}", oldest.to_hex(), entity.key.to_hex());
                    bag.values.remove(&oldest);
                }
                None => {
                    return Err(DhtError::capacity_exceeded(
                        format!("key {} holds {} local values", entity.key.to_hex(), bag.len()),
                        "values-per-key",
                    ));
                }
            }
        }

        entity.published = now;
        debug!(
            "Stored {} bytes under {} from {}",
            entity.value.len(),
            entity.key.to_hex(),
            entity.creator.to_hex()
        );
        bag.values.insert(entity.creator, entity);
        Ok(())
    }

    /// Remove the value stored by `creator` under `key`
    pub fn remove(&mut self, key: &Kuid, creator: &Kuid) -> Option<DhtValueEntity> {
        let bag = self.bags.get_mut(key)?;
        let removed = bag.values.remove(creator);
        if bag.is_empty() {
            self.bags.remove(key);
        }
        removed
    }

    /// Live values under `key`
    pub fn get(&self, key: &Kuid) -> Vec<DhtValueEntity> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &Kuid, now: Instant) -> Vec<DhtValueEntity> {
        let ttl = self.value_ttl;
        self.bags
            .get(key)
            .map(|bag| {
                bag.values
                    .values()
                    .filter(|e| !e.is_expired_at(now, ttl))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a lookup of `key` and return its smoothed request load
    pub fn record_request(&mut self, key: &Kuid, now: Instant) -> f32 {
        let smoothing = self.load_smoothing;
        let nulling_delay = self.load_nulling_delay;
        match self.bags.get_mut(key) {
            Some(bag) => bag.increment_request_load(now, smoothing, nulling_delay),
            None => 0.0,
        }
    }

    pub fn request_load(&self, key: &Kuid) -> f32 {
        self.bags.get(key).map_or(0.0, |b| b.request_load())
    }

    /// Drop expired remote values. Returns the number removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.value_ttl;
        let mut removed = 0;
        self.bags.retain(|_, bag| {
            let before = bag.len();
            bag.values.retain(|_, e| !e.is_expired_at(now, ttl));
            removed += before - bag.len();
            !bag.is_empty()
        });
        if removed > 0 {
            debug!("Expired {} values", removed);
        }
        removed
    }

    /// Local values last published at least `older_than` ago
    pub fn values_due_for_republish(&self, older_than: Duration) -> Vec<DhtValueEntity> {
        self.values_due_for_republish_at(Instant::now(), older_than)
    }

    pub fn values_due_for_republish_at(&self, now: Instant, older_than: Duration) -> Vec<DhtValueEntity> {
        self.bags
            .values()
            .flat_map(|bag| bag.values.values())
            .filter(|e| e.local && now.saturating_duration_since(e.published) >= older_than)
            .cloned()
            .collect()
    }

    pub fn mark_republished(&mut self, key: &Kuid, creator: &Kuid, now: Instant) {
        if let Some(entity) = self.bags.get_mut(key).and_then(|b| b.values.get_mut(creator)) {
            entity.published = now;
        }
    }

    pub fn local_values(&self) -> Vec<DhtValueEntity> {
        self.bags
            .values()
            .flat_map(|bag| bag.values.values())
            .filter(|e| e.local)
            .cloned()
            .collect()
    }

    pub fn contains_key(&self, key: &Kuid) -> bool {
        self.bags.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.bags.len()
    }

    pub fn value_count(&self) -> usize {
        self.bags.values().map(|b| b.len()).sum()
    }
}
