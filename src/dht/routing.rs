//! DHT routing table module
//!
//! Implements the Kademlia routing table as a binary trie of k-buckets.
//!
//! Every bucket covers the ids sharing its `depth`-bit prefix, so the
//! buckets partition the key space into contiguous ranges. They are stored
//! in a `BTreeMap` keyed by range start; the bucket for an id is the last
//! one starting at or below it. Only the bucket covering the local id ever
//! splits. Other full buckets keep newcomers in a replacement cache and
//! ask the caller to probe their least-recently-seen contact.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dht::contact::Contact;
use crate::dht::kuid::{Kuid, KUID_BITS};
use crate::dht::settings::DhtSettings;

/// A live contact seen within this window is not replaced on a spoof check
const RECENTLY_ALIVE_WINDOW: Duration = Duration::from_secs(60);

/// What happened to a contact offered to the routing table
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// Inserted into a bucket with free space
    Added,
    /// Existing entry refreshed
    Updated,
    /// Took the slot of an `Unknown` or `Dead` least-recently-seen contact
    Replaced { evicted: Contact },
    /// Bucket full: parked in the replacement cache. If `probe` is set the
    /// caller should ping it and call `evict_unresponsive` on timeout.
    Cached { probe: Option<Contact> },
    /// Same id, different address, existing entry not recently alive. The
    /// caller should ping `existing` and call `replace_spoofed` on timeout.
    SpoofSuspected { existing: Contact, candidate: Contact },
    /// Local node, firewalled node, or a conflicting live entry
    Ignored,
}

/// The id range a bucket covers: every id starting with `depth` bits of `prefix`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    pub prefix: Kuid,
    pub depth: usize,
}

impl BucketRange {
    pub fn contains(&self, id: &Kuid) -> bool {
        id.has_prefix(&self.prefix, self.depth)
    }

    /// Random id inside this range
    pub fn random_id(&self) -> Kuid {
        Kuid::random_with_prefix(&self.prefix, self.depth)
    }
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Range covered by this bucket
    range: BucketRange,
    /// Live contacts, least recently seen first
    contacts: Vec<Contact>,
    /// Replacement cache, most recently seen last
    cache: VecDeque<Contact>,
    /// When this bucket last saw activity
    last_touched: Instant,
}

impl KBucket {
    /// Create a new KBucket
    pub fn new(prefix: Kuid, depth: usize) -> Self {
        Self {
            range: BucketRange {
                prefix: prefix.truncate(depth),
                depth,
            },
            contacts: Vec::new(),
            cache: VecDeque::new(),
            last_touched: Instant::now(),
        }
    }

    pub fn range(&self) -> BucketRange {
        self.range
    }

    pub fn depth(&self) -> usize {
        self.range.depth
    }

    pub fn contains_id(&self, id: &Kuid) -> bool {
        self.range.contains(id)
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn cached_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.cache.iter()
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    /// Get the number of live contacts in the bucket
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    fn get_mut(&mut self, id: &Kuid) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id == *id)
    }

    fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    fn push_live(&mut self, contact: Contact) {
        self.cache.retain(|c| c.id != contact.id);
        self.contacts.push(contact);
    }

    /// Merge an observation into an existing entry and move it to the MRS end
    fn update(&mut self, contact: &Contact) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = self.contacts.remove(pos);
            existing.merge(contact);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove_live(&mut self, id: &Kuid) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| c.id == *id)?;
        Some(self.contacts.remove(pos))
    }

    fn add_cached(&mut self, contact: Contact, max: usize) {
        self.cache.retain(|c| c.id != contact.id);
        self.cache.push_back(contact);
        while self.cache.len() > max {
            self.cache.pop_front();
        }
    }

    fn cached_mut(&mut self, id: &Kuid) -> Option<&mut Contact> {
        self.cache.iter_mut().find(|c| c.id == *id)
    }

    fn remove_cached(&mut self, id: &Kuid) -> Option<Contact> {
        let pos = self.cache.iter().position(|c| c.id == *id)?;
        self.cache.remove(pos)
    }

    /// Promote the most recently seen cached contact into the live set
    fn promote_from_cache(&mut self) -> Option<Kuid> {
        let promoted = self.cache.pop_back()?;
        let id = promoted.id;
        self.contacts.push(promoted);
        Some(id)
    }

    /// Split into the two halves one bit deeper
    fn split(self) -> (KBucket, KBucket) {
        let depth = self.range.depth;
        let mut left = KBucket::new(self.range.prefix, depth + 1);
        let mut right = KBucket::new(self.range.prefix.with_bit(depth, true), depth + 1);
        left.last_touched = self.last_touched;
        right.last_touched = self.last_touched;

        for contact in self.contacts {
            if contact.id.bit(depth) {
                right.contacts.push(contact);
            } else {
                left.contacts.push(contact);
            }
        }
        for contact in self.cache {
            if contact.id.bit(depth) {
                right.cache.push_back(contact);
            } else {
                left.cache.push_back(contact);
            }
        }
        (left, right)
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    /// Our node ID
    local_id: Kuid,
    /// Bucket size (K)
    k: usize,
    /// Replacement cache size per bucket
    cache_size: usize,
    /// Failures after which a contact is evicted
    max_failures: u32,
    /// Failures in a row after which failures are ignored
    max_consecutive_failures: u32,
    /// Buckets keyed by the first id of their range
    buckets: BTreeMap<Kuid, KBucket>,
    consecutive_failures: u32,
}

impl RoutingTable {
    /// Create a new routing table with one bucket covering the whole space
    pub fn new(local_id: Kuid, settings: &DhtSettings) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(Kuid::MIN, KBucket::new(Kuid::MIN, 0));
        Self {
            local_id,
            k: settings.k,
            cache_size: settings.replacement_cache_size,
            max_failures: settings.max_contact_failures,
            max_consecutive_failures: settings.max_consecutive_failures,
            buckets,
            consecutive_failures: 0,
        }
    }

    /// Create a routing table with default settings and a custom K
    pub fn with_bucket_size(local_id: Kuid, k: usize) -> Self {
        let settings = DhtSettings {
            k,
            ..DhtSettings::default()
        };
        Self::new(local_id, &settings)
    }

    pub fn local_id(&self) -> &Kuid {
        &self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    fn bucket_key(&self, id: &Kuid) -> Kuid {
        self.buckets
            .range(..=*id)
            .next_back()
            .map(|(key, _)| *key)
            .unwrap_or(Kuid::MIN)
    }

    /// The bucket covering `id`
    pub fn bucket_for(&self, id: &Kuid) -> Option<&KBucket> {
        self.buckets.get(&self.bucket_key(id))
    }

    fn bucket_for_mut(&mut self, id: &Kuid) -> Option<&mut KBucket> {
        let key = self.bucket_key(id);
        self.buckets.get_mut(&key)
    }

    /// Insert a contact or refresh the existing entry
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        if contact.id == self.local_id {
            return AddOutcome::Ignored;
        }
        if contact.firewalled {
            trace!("Not adding firewalled contact {}", contact);
            return AddOutcome::Ignored;
        }
        if contact.is_alive() {
            self.consecutive_failures = 0;
        }

        loop {
            let k = self.k;
            let local_id = self.local_id;
            let cache_size = self.cache_size;
            let key = self.bucket_key(&contact.id);
            let Some(bucket) = self.buckets.get_mut(&key) else {
                return AddOutcome::Ignored;
            };

            if let Some(existing) = bucket.get(&contact.id) {
                if !existing.is_alive() || existing.addr == contact.addr {
                    bucket.update(&contact);
                    if contact.is_alive() {
                        bucket.touch();
                    }
                    return AddOutcome::Updated;
                }
                if contact.is_alive() && !existing.recently_alive(RECENTLY_ALIVE_WINDOW) {
                    return AddOutcome::SpoofSuspected {
                        existing: existing.clone(),
                        candidate: contact,
                    };
                }
                debug!("Ignoring {} which conflicts with live contact {}", contact, existing);
                return AddOutcome::Ignored;
            }

            if bucket.len() < k {
                let alive = contact.is_alive();
                bucket.push_live(contact);
                if alive {
                    bucket.touch();
                }
                return AddOutcome::Added;
            }

            if bucket.contains_id(&local_id) && bucket.depth() < KUID_BITS {
                self.split(key);
                continue;
            }

            let lrs = match bucket.least_recently_seen() {
                Some(lrs) => lrs.clone(),
                None => return AddOutcome::Ignored,
            };
            if contact.is_alive() && !lrs.is_alive() {
                trace!("Replacing {} with {}", lrs, contact);
                bucket.remove_live(&lrs.id);
                bucket.push_live(contact);
                bucket.touch();
                return AddOutcome::Replaced { evicted: lrs };
            }

            let probe = if contact.is_alive() { Some(lrs) } else { None };
            bucket.add_cached(contact, cache_size);
            return AddOutcome::Cached { probe };
        }
    }

    fn split(&mut self, key: Kuid) {
        if let Some(bucket) = self.buckets.remove(&key) {
            trace!("Splitting bucket {}/{}", bucket.range.prefix.to_hex(), bucket.range.depth);
            let (left, right) = bucket.split();
            self.buckets.insert(left.range.prefix, left);
            self.buckets.insert(right.range.prefix, right);
        }
    }

    /// Record a failed request. Returns the contact if it was evicted.
    pub fn mark_failed(&mut self, id: &Kuid) -> Option<Contact> {
        if *id == self.local_id {
            return None;
        }
        if self.consecutive_failures >= self.max_consecutive_failures {
            debug!("Ignoring failure of {}: too many failures in a row", id.to_hex());
            return None;
        }

        let max_failures = self.max_failures;
        let bucket = self.bucket_for_mut(id)?;

        if let Some(contact) = bucket.get_mut(id) {
            contact.fail(max_failures);
            let dead = contact.is_dead();
            self.consecutive_failures += 1;
            if !dead {
                return None;
            }
            let bucket = self.bucket_for_mut(id)?;
            let evicted = bucket.remove_live(id);
            if let Some(promoted) = bucket.promote_from_cache() {
                debug!("Promoted {} from replacement cache", promoted.to_hex());
                bucket.touch();
            }
            return evicted;
        }

        if let Some(cached) = bucket.cached_mut(id) {
            cached.fail(max_failures);
            if cached.is_dead() {
                return bucket.remove_cached(id);
            }
        }
        None
    }

    /// Evict a live contact that did not answer a liveness probe sent at
    /// `probed_at`, backfilling from the replacement cache.
    pub fn evict_unresponsive(&mut self, id: &Kuid, probed_at: Instant) -> Option<Contact> {
        let bucket = self.bucket_for_mut(id)?;
        let answered = bucket.get(id).map(|c| c.is_alive() && c.last_seen > probed_at)?;
        if answered {
            return None;
        }
        let evicted = bucket.remove_live(id);
        if bucket.promote_from_cache().is_some() {
            bucket.touch();
        }
        evicted
    }

    /// Move `existing.id` to the candidate's address if the entry did not
    /// answer a spoof check sent at `probed_at`.
    pub fn replace_spoofed(&mut self, candidate: &Contact, probed_at: Instant) -> bool {
        let Some(bucket) = self.bucket_for_mut(&candidate.id) else {
            return false;
        };
        let answered = match bucket.get(&candidate.id) {
            Some(current) => current.is_alive() && current.last_seen > probed_at,
            None => false,
        };
        if answered {
            return false;
        }
        if bucket.update(candidate) {
            bucket.touch();
            true
        } else {
            false
        }
    }

    /// Up to `count` contacts closest to `key`, closest first. Among equal
    /// distances contacts with fewer failures come first.
    pub fn contacts_near(&self, key: &Kuid, count: usize) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .buckets
            .values()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| !c.is_dead())
            .cloned()
            .collect();

        contacts.sort_by(|a, b| {
            a.id.distance(key)
                .cmp(&b.id.distance(key))
                .then(a.failures.cmp(&b.failures))
        });
        contacts.truncate(count);
        contacts
    }

    /// Get a contact by id
    pub fn get(&self, id: &Kuid) -> Option<Contact> {
        self.bucket_for(id).and_then(|b| b.get(id).cloned())
    }

    pub fn contains(&self, id: &Kuid) -> bool {
        self.bucket_for(id).map_or(false, |b| b.get(id).is_some())
    }

    /// Get all live contacts
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    /// Number of live contacts
    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of contacts waiting in replacement caches
    pub fn cached_len(&self) -> usize {
        self.buckets.values().map(|b| b.cache.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> impl Iterator<Item = &KBucket> {
        self.buckets.values()
    }

    /// Live contacts relative to one full bucket, capped at 1.0
    pub fn fill_ratio(&self) -> f64 {
        if self.k == 0 {
            return 0.0;
        }
        (self.len() as f64 / self.k as f64).min(1.0)
    }

    /// Ranges of buckets untouched for at least `older_than`
    pub fn buckets_due_for_refresh(&self, older_than: Duration) -> Vec<BucketRange> {
        self.buckets_due_for_refresh_at(Instant::now(), older_than)
    }

    pub fn buckets_due_for_refresh_at(&self, now: Instant, older_than: Duration) -> Vec<BucketRange> {
        self.buckets
            .values()
            .filter(|b| now.saturating_duration_since(b.last_touched) >= older_than)
            .map(|b| b.range)
            .collect()
    }

    /// Mark the bucket covering `id` as recently used
    pub fn touch_bucket(&mut self, id: &Kuid) {
        if let Some(bucket) = self.bucket_for_mut(id) {
            bucket.touch();
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True when failures have piled up with no successful exchange
    pub fn appears_disconnected(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn id_with_first_byte(first: u8, last: u8) -> Kuid {
        let mut id = [0u8; 20];
        id[0] = first;
        id[19] = last;
        Kuid::new(id)
    }

    #[test]
    fn test_routing_table_new() {
        let table = RoutingTable::with_bucket_size(Kuid::random(), 20);
        assert_eq!(table.bucket_count(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_add_contact() {
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, 20);
        let contact = Contact::alive(Kuid::new([2u8; 20]), addr(6881));
        assert!(matches!(table.add(contact), AddOutcome::Added));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_local_and_firewalled_ignored() {
        let local = Kuid::random();
        let mut table = RoutingTable::with_bucket_size(local, 20);
        assert!(matches!(table.add(Contact::alive(local, addr(1))), AddOutcome::Ignored));
        let firewalled = Contact::alive(Kuid::random(), addr(2)).with_firewalled(true);
        assert!(matches!(table.add(firewalled), AddOutcome::Ignored));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_updates() {
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, 20);
        let id = Kuid::new([3u8; 20]);
        table.add(Contact::new(id, addr(6881)));
        let outcome = table.add(Contact::alive(id, addr(6881)));
        assert!(matches!(outcome, AddOutcome::Updated));
        assert_eq!(table.len(), 1);
        assert!(table.get(&id).unwrap().is_alive());
    }

    #[test]
    fn test_local_bucket_splits() {
        let k = 4;
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, k);
        for i in 0..(k as u8 * 4) {
            table.add(Contact::alive(id_with_first_byte(0x80 | i, i), addr(7000 + i as u16)));
            table.add(Contact::alive(id_with_first_byte(i, i + 1), addr(8000 + i as u16)));
        }
        assert!(table.bucket_count() > 1);
        for bucket in table.buckets() {
            assert!(bucket.len() <= k);
        }
    }

    #[test]
    fn test_bucket_invariants_random_inserts() {
        let k = 8;
        let local = Kuid::random();
        let mut table = RoutingTable::with_bucket_size(local, k);
        for i in 0..2000u32 {
            let contact = Contact::alive(Kuid::random(), addr((i % 60000) as u16 + 1));
            table.add(contact);
        }

        let mut covered = 0usize;
        for bucket in table.buckets() {
            assert!(bucket.len() <= k);
            for contact in bucket.contacts() {
                assert!(bucket.contains_id(&contact.id));
            }
            covered += 1;
        }
        assert_eq!(covered, table.bucket_count());
        assert!(table.bucket_for(&local).unwrap().contains_id(&local));
    }

    #[test]
    fn test_buckets_partition_key_space() {
        let mut table = RoutingTable::with_bucket_size(Kuid::random(), 2);
        for i in 0..300u16 {
            table.add(Contact::alive(Kuid::random(), addr(i + 1)));
        }
        for _ in 0..200 {
            let id = Kuid::random();
            let matching = table.buckets().filter(|b| b.contains_id(&id)).count();
            assert_eq!(matching, 1);
        }
    }

    #[test]
    fn test_full_remote_bucket_caches_and_probes() {
        let k = 2;
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, k);
        // Far half of the space: never contains the local id
        let a = Contact::alive(id_with_first_byte(0x80, 1), addr(1));
        let b = Contact::alive(id_with_first_byte(0x81, 2), addr(2));
        let c = Contact::alive(id_with_first_byte(0x82, 3), addr(3));
        let near = Contact::alive(id_with_first_byte(0x01, 4), addr(4));
        table.add(a.clone());
        table.add(b);
        // force a split so the far half gets its own bucket
        table.add(near);
        let outcome = table.add(c.clone());
        match outcome {
            AddOutcome::Cached { probe: Some(probe) } => assert_eq!(probe.id, a.id),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!table.contains(&c.id));

        let probed_at = Instant::now();
        let evicted = table.evict_unresponsive(&a.id, probed_at).unwrap();
        assert_eq!(evicted.id, a.id);
        assert!(table.contains(&c.id));
    }

    #[test]
    fn test_unknown_lrs_replaced_immediately() {
        let k = 1;
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, k);
        let far_unknown = Contact::new(id_with_first_byte(0x80, 1), addr(1));
        let near = Contact::alive(id_with_first_byte(0x01, 1), addr(2));
        let far_alive = Contact::alive(id_with_first_byte(0x90, 1), addr(3));
        table.add(far_unknown.clone());
        table.add(near);
        match table.add(far_alive.clone()) {
            AddOutcome::Replaced { evicted } => assert_eq!(evicted.id, far_unknown.id),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(table.contains(&far_alive.id));
    }

    #[test]
    fn test_mark_failed_evicts_and_backfills() {
        let settings = DhtSettings {
            k: 1,
            max_contact_failures: 2,
            ..DhtSettings::default()
        };
        let mut table = RoutingTable::new(Kuid::MIN, &settings);
        let near = Contact::alive(id_with_first_byte(0x01, 1), addr(1));
        let far = Contact::alive(id_with_first_byte(0x80, 1), addr(2));
        let spare = Contact::alive(id_with_first_byte(0x81, 1), addr(3));
        table.add(near);
        table.add(far.clone());
        assert!(matches!(table.add(spare.clone()), AddOutcome::Cached { .. }));

        assert!(table.mark_failed(&far.id).is_none());
        let evicted = table.mark_failed(&far.id).unwrap();
        assert_eq!(evicted.id, far.id);
        assert!(table.contains(&spare.id));
    }

    #[test]
    fn test_consecutive_failure_guard() {
        let settings = DhtSettings {
            max_consecutive_failures: 2,
            max_contact_failures: 100,
            ..DhtSettings::default()
        };
        let mut table = RoutingTable::new(Kuid::MIN, &settings);
        let contact = Contact::alive(Kuid::new([7u8; 20]), addr(1));
        table.add(contact.clone());
        table.mark_failed(&contact.id);
        table.mark_failed(&contact.id);
        assert!(table.appears_disconnected());
        table.mark_failed(&contact.id);
        assert_eq!(table.get(&contact.id).unwrap().failures, 2);

        table.add(Contact::alive(contact.id, contact.addr));
        assert!(!table.appears_disconnected());
    }

    #[test]
    fn test_spoof_suspected() {
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, 20);
        let id = Kuid::new([9u8; 20]);
        let mut stale = Contact::alive(id, addr(1));
        stale.last_seen = Instant::now() - Duration::from_secs(3600);
        table.add(stale);
        // entry is alive at addr 1 but old; a claim from addr 2 triggers a check
        let claim = Contact::alive(id, addr(2));
        match table.add(claim.clone()) {
            AddOutcome::SpoofSuspected { existing, candidate } => {
                assert_eq!(existing.addr, addr(1));
                assert_eq!(candidate.addr, addr(2));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(table.replace_spoofed(&claim, Instant::now()));
        assert_eq!(table.get(&id).unwrap().addr, addr(2));
    }

    #[test]
    fn test_contacts_near_sorted() {
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, 20);
        let target = Kuid::MAX;
        table.add(Contact::alive(Kuid::new([0xF0u8; 20]), addr(1)));
        table.add(Contact::alive(Kuid::new([0x0Fu8; 20]), addr(2)));
        table.add(Contact::alive(Kuid::new([0xFFu8; 20]), addr(3)));

        let closest = table.contacts_near(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, Kuid::new([0xFFu8; 20]));
        assert_eq!(closest[1].id, Kuid::new([0xF0u8; 20]));
    }

    #[test]
    fn test_buckets_due_for_refresh() {
        let table = RoutingTable::with_bucket_size(Kuid::random(), 20);
        assert!(table.buckets_due_for_refresh(Duration::from_secs(1000)).is_empty());
        let later = Instant::now() + Duration::from_secs(2000);
        let due = table.buckets_due_for_refresh_at(later, Duration::from_secs(1000));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].depth, 0);
        assert!(due[0].contains(&due[0].random_id()));
    }

    #[test]
    fn test_fill_ratio() {
        let mut table = RoutingTable::with_bucket_size(Kuid::MIN, 4);
        assert_eq!(table.fill_ratio(), 0.0);
        table.add(Contact::alive(Kuid::new([1u8; 20]), addr(1)));
        table.add(Contact::alive(Kuid::new([2u8; 20]), addr(2)));
        assert!((table.fill_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
