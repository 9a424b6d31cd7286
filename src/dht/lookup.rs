//! DHT lookup module
//!
//! Iterative lookups converging on the nodes closest to a target id, or on
//! the values stored under a key. Up to alpha requests are in flight, always
//! to the closest contacts not yet queried. The lookup ends when nothing is
//! in flight and no remaining candidate is closer than the k-th closest
//! node that answered. A value lookup ends at the first response carrying
//! values unless exhaustive value lookups are enabled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, trace};

use crate::dht::contact::Contact;
use crate::dht::database::{DhtValueEntity, DhtValueType};
use crate::dht::dispatcher::MessageDispatcher;
use crate::dht::future::DhtFuture;
use crate::dht::kuid::Kuid;
use crate::dht::message::{ContactInfo, FindValueReply, Message, MessageBody};
use crate::dht::token::SecurityToken;
use crate::error::{DhtError, Result};

/// Outcome of a node lookup
#[derive(Debug, Clone)]
pub struct NodeLookupResult {
    pub target: Kuid,
    /// Closest nodes that answered, closest first
    pub contacts: Vec<Contact>,
    /// Security tokens those nodes issued to us
    pub tokens: HashMap<Kuid, SecurityToken>,
    /// Longest chain of responses that led to a contact
    pub hops: usize,
    /// Requests sent
    pub queried: usize,
    pub elapsed: Duration,
}

impl NodeLookupResult {
    pub fn token_for(&self, id: &Kuid) -> Option<&SecurityToken> {
        self.tokens.get(id)
    }
}

/// Outcome of a value lookup
#[derive(Debug, Clone)]
pub struct FindValueResult {
    pub key: Kuid,
    /// Values found, at most one per creator
    pub entities: Vec<DhtValueEntity>,
    /// Highest request load reported by a responder holding values
    pub request_load: f32,
    /// Closest nodes that answered, closest first
    pub contacts: Vec<Contact>,
    pub hops: usize,
    pub queried: usize,
    pub elapsed: Duration,
}

impl FindValueResult {
    pub fn is_found(&self) -> bool {
        !self.entities.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum LookupKind {
    Nodes,
    Values { value_type: DhtValueType, exhaustive: bool },
}

/// Candidate order: distance, then failure count, then discovery order
type CandidateKey = (Kuid, u32, u64);

/// Bookkeeping of one lookup, independent of the network
#[derive(Debug)]
struct LookupState {
    target: Kuid,
    k: usize,
    known: HashSet<Kuid>,
    candidates: BTreeMap<CandidateKey, (Contact, usize)>,
    responses: BTreeMap<Kuid, (Contact, SecurityToken)>,
    next_seq: u64,
    queried: usize,
    hops: usize,
}

impl LookupState {
    fn new(target: Kuid, local_id: Kuid, k: usize) -> Self {
        let mut known = HashSet::new();
        known.insert(local_id);
        Self {
            target,
            k,
            known,
            candidates: BTreeMap::new(),
            responses: BTreeMap::new(),
            next_seq: 0,
            queried: 0,
            hops: 0,
        }
    }

    /// Queue a contact discovered at `hop`. Returns false if already known.
    fn add_candidate(&mut self, contact: Contact, hop: usize) -> bool {
        if !self.known.insert(contact.id) {
            return false;
        }
        let distance = contact.id.distance(&self.target);
        self.enqueue(distance, contact, hop);
        true
    }

    fn enqueue(&mut self, distance: Kuid, contact: Contact, hop: usize) {
        let key = (distance, contact.failures, self.next_seq);
        self.next_seq += 1;
        self.candidates.insert(key, (contact, hop));
    }

    /// Distance of the k-th closest responder, once k have answered
    fn kth_distance(&self) -> Option<Kuid> {
        if self.responses.len() < self.k {
            return None;
        }
        self.responses.keys().nth(self.k - 1).copied()
    }

    /// Closest unqueried candidate still worth asking
    fn next_candidate(&mut self) -> Option<(Contact, usize)> {
        let (key, _) = self.candidates.iter().next()?;
        let key = *key;
        if let Some(kth) = self.kth_distance() {
            if key.0 >= kth {
                self.candidates.clear();
                return None;
            }
        }
        let next = self.candidates.remove(&key)?;
        self.queried += 1;
        Some(next)
    }

    fn record_response(&mut self, contact: Contact, token: SecurityToken, hop: usize) {
        self.hops = self.hops.max(hop);
        self.responses.insert(contact.id.distance(&self.target), (contact, token));
        while self.responses.len() > self.k {
            let last = self.responses.keys().next_back().copied();
            if let Some(last) = last {
                self.responses.remove(&last);
            }
        }
    }

    fn closest(&self) -> Vec<Contact> {
        self.responses.values().map(|(c, _)| c.clone()).collect()
    }

    fn tokens(&self) -> HashMap<Kuid, SecurityToken> {
        self.responses
            .values()
            .filter(|(_, token)| !token.is_empty())
            .map(|(c, token)| (c.id, token.clone()))
            .collect()
    }
}

struct LookupOutcome {
    state: LookupState,
    entities: Vec<DhtValueEntity>,
    request_load: f32,
    elapsed: Duration,
}

async fn run_lookup(dispatcher: Arc<MessageDispatcher>, target: Kuid, kind: LookupKind) -> Result<LookupOutcome> {
    let settings = dispatcher.settings().clone();
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + settings.lookup_timeout();
    let alpha = match kind {
        LookupKind::Nodes => settings.alpha,
        LookupKind::Values { .. } => settings.value_alpha,
    };

    let mut state = LookupState::new(target, dispatcher.local_id(), settings.k);
    let seeds = dispatcher.routing().read().contacts_near(&target, settings.k);
    for seed in seeds {
        state.add_candidate(seed, 1);
    }

    let mut found: HashMap<Kuid, DhtValueEntity> = HashMap::new();
    let mut request_load = 0.0f32;
    let mut in_flight = FuturesUnordered::new();

    loop {
        while in_flight.len() < alpha {
            let Some((contact, hop)) = state.next_candidate() else {
                break;
            };
            let body = match kind {
                LookupKind::Nodes => MessageBody::FindNodeRequest { target },
                LookupKind::Values { value_type, .. } => MessageBody::FindValueRequest { key: target, value_type },
            };
            trace!("Lookup {} querying {} (hop {})", target.to_hex(), contact, hop);
            let request = dispatcher.send_request(contact.addr, Some(contact.id), body);
            in_flight.push(async move { (contact, hop, request.await) });
        }

        if in_flight.is_empty() {
            break;
        }

        let (contact, hop, result) = match tokio::time::timeout_at(deadline, in_flight.next()).await {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(_) => {
                info!("Lookup for {} hit its deadline with {} requests in flight", target.to_hex(), in_flight.len());
                break;
            }
        };

        let message: Message = match result {
            Ok(message) => message,
            Err(e) => {
                trace!("Lookup {}: {} failed: {}", target.to_hex(), contact, e);
                continue;
            }
        };

        let responder = message.sender.to_contact(contact.addr);
        let (token, contacts) = match message.body {
            MessageBody::FindNodeResponse { token, contacts } => (token, contacts),
            MessageBody::FindValueResponse(FindValueReply::Contacts { token, contacts }) => (token, contacts),
            MessageBody::FindValueResponse(FindValueReply::Values {
                request_load: load,
                entities,
            }) => {
                if let LookupKind::Values { value_type, exhaustive } = kind {
                    request_load = request_load.max(load);
                    for entity in entities {
                        if entity.key == target && value_type.matches(&entity.value_type) {
                            found.entry(entity.creator).or_insert(entity);
                        }
                    }
                    state.record_response(responder, SecurityToken::empty(), hop);
                    if !found.is_empty() && !exhaustive {
                        debug!("Lookup {} found {} values at hop {}", target.to_hex(), found.len(), hop);
                        break;
                    }
                }
                continue;
            }
            other => {
                debug!("Lookup {}: unexpected {} from {}", target.to_hex(), other.opcode(), contact);
                continue;
            }
        };

        state.record_response(responder, token, hop);
        learn_contacts(&dispatcher, &mut state, contacts, hop + 1);
    }

    // no bucket refresh needed where we just looked
    dispatcher.routing().write().touch_bucket(&target);

    Ok(LookupOutcome {
        state,
        entities: found.into_values().collect(),
        request_load,
        elapsed: started.elapsed(),
    })
}

fn learn_contacts(dispatcher: &Arc<MessageDispatcher>, state: &mut LookupState, contacts: Vec<ContactInfo>, hop: usize) {
    for info in contacts {
        if info.id == dispatcher.local_id() {
            continue;
        }
        let contact = info.to_contact();
        if state.add_candidate(contact.clone(), hop) {
            dispatcher.add_contact(contact);
        }
    }
}

/// Starts lookups and caps how many run at once
#[derive(Debug)]
pub struct LookupManager {
    dispatcher: Arc<MessageDispatcher>,
    permits: Arc<Semaphore>,
    max_lookups: usize,
}

impl LookupManager {
    pub fn new(dispatcher: Arc<MessageDispatcher>) -> Self {
        let max_lookups = dispatcher.settings().max_concurrent_lookups;
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(max_lookups)),
            max_lookups,
        }
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Lookups currently running
    pub fn active_lookups(&self) -> usize {
        self.max_lookups - self.permits.available_permits()
    }

    /// Find the k nodes closest to `target`
    pub fn lookup_nodes(&self, target: Kuid) -> DhtFuture<NodeLookupResult> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return DhtFuture::ready(Err(too_many_lookups(self.max_lookups)));
        };
        let dispatcher = self.dispatcher.clone();
        DhtFuture::spawn(async move {
            let _permit = permit;
            let outcome = run_lookup(dispatcher, target, LookupKind::Nodes).await?;
            let result = NodeLookupResult {
                target,
                contacts: outcome.state.closest(),
                tokens: outcome.state.tokens(),
                hops: outcome.state.hops,
                queried: outcome.state.queried,
                elapsed: outcome.elapsed,
            };
            debug!(
                "Node lookup {} done: {} contacts, {} hops, {} queried",
                target.to_hex(),
                result.contacts.len(),
                result.hops,
                result.queried
            );
            Ok(result)
        })
    }

    /// Find values of `value_type` stored under `key`
    pub fn lookup_value(&self, key: Kuid, value_type: DhtValueType) -> DhtFuture<FindValueResult> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return DhtFuture::ready(Err(too_many_lookups(self.max_lookups)));
        };
        let dispatcher = self.dispatcher.clone();
        let exhaustive = dispatcher.settings().exhaustive_value_lookup;
        DhtFuture::spawn(async move {
            let _permit = permit;
            let kind = LookupKind::Values { value_type, exhaustive };
            let outcome = run_lookup(dispatcher, key, kind).await?;
            let result = FindValueResult {
                key,
                entities: outcome.entities,
                request_load: outcome.request_load,
                contacts: outcome.state.closest(),
                hops: outcome.state.hops,
                queried: outcome.state.queried,
                elapsed: outcome.elapsed,
            };
            debug!(
                "Value lookup {} done: {} values, {} queried",
                key.to_hex(),
                result.entities.len(),
                result.queried
            );
            Ok(result)
        })
    }
}

fn too_many_lookups(max: usize) -> DhtError {
    DhtError::capacity_exceeded(format!("{} lookups already running", max), "concurrent-lookups")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::database::Database;
    use crate::dht::message::Sender;
    use crate::dht::routing::RoutingTable;
    use crate::dht::settings::DhtSettings;
    use crate::dht::transport::MemoryNetwork;
    use parking_lot::RwLock;
    use std::net::SocketAddr;
    use tokio::sync::watch;

    fn addr() -> SocketAddr {
        "10.0.0.1:6346".parse().unwrap()
    }

    fn id(first: u8) -> Kuid {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        Kuid::new(bytes)
    }

    #[test]
    fn test_candidates_closest_first() {
        let mut state = LookupState::new(Kuid::MIN, Kuid::MAX, 20);
        state.add_candidate(Contact::new(id(0x40), addr()), 1);
        state.add_candidate(Contact::new(id(0x10), addr()), 1);
        state.add_candidate(Contact::new(id(0x80), addr()), 1);
        assert!(!state.add_candidate(Contact::new(id(0x10), addr()), 2));

        let order: Vec<Kuid> = std::iter::from_fn(|| state.next_candidate().map(|(c, _)| c.id)).collect();
        assert_eq!(order, vec![id(0x10), id(0x40), id(0x80)]);
        assert_eq!(state.queried, 3);
    }

    #[test]
    fn test_local_id_never_queued() {
        let local = id(0x01);
        let mut state = LookupState::new(Kuid::MIN, local, 20);
        assert!(!state.add_candidate(Contact::new(local, addr()), 1));
        assert!(state.next_candidate().is_none());
    }

    fn with_failures(first: u8, failures: u32) -> Contact {
        let mut contact = Contact::new(id(first), addr());
        contact.failures = failures;
        contact
    }

    #[test]
    fn test_tie_break_by_failures_then_discovery() {
        // distinct ids never share a distance, so queue equal distances directly
        let mut state = LookupState::new(Kuid::MIN, Kuid::MAX, 20);
        let distance = id(0x20);
        state.enqueue(distance, with_failures(0xA1, 2), 1);
        state.enqueue(distance, with_failures(0xA2, 0), 1);
        state.enqueue(distance, with_failures(0xA3, 0), 2);
        state.enqueue(id(0x10), with_failures(0xA4, 3), 2);

        let order: Vec<Kuid> = std::iter::from_fn(|| state.next_candidate().map(|(c, _)| c.id)).collect();
        assert_eq!(order, vec![id(0xA4), id(0xA2), id(0xA3), id(0xA1)]);
    }

    #[test]
    fn test_distance_outranks_failures() {
        let mut state = LookupState::new(Kuid::MIN, Kuid::MAX, 20);
        assert!(state.add_candidate(with_failures(0x40, 0), 1));
        assert!(state.add_candidate(with_failures(0x20, 3), 1));
        let first = state.next_candidate().map(|(c, _)| c.id);
        assert_eq!(first, Some(id(0x20)));
    }

    fn manager_on(network: &Arc<MemoryNetwork>, settings: DhtSettings) -> (Arc<LookupManager>, watch::Sender<bool>) {
        let local = Kuid::random();
        let dispatcher = Arc::new(MessageDispatcher::new(
            Sender::local(local, 0, false),
            Arc::new(network.bind_next().unwrap()),
            settings.clone(),
            Arc::new(RwLock::new(RoutingTable::new(local, &settings))),
            Arc::new(RwLock::new(Database::new(&settings))),
        ));
        dispatcher.set_bootstrapped(true);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(dispatcher.clone().run(rx));
        (Arc::new(LookupManager::new(dispatcher)), tx)
    }

    #[tokio::test]
    async fn test_cancelled_lookup_sends_nothing_more() {
        let network = MemoryNetwork::new();
        let settings = DhtSettings {
            request_timeout_ms: 100,
            request_sweep_interval_ms: 10,
            lookup_timeout_ms: 5_000,
            ..DhtSettings::default()
        };
        let (lookups, _shutdown) = manager_on(&network, settings);
        let dispatcher = lookups.dispatcher().clone();
        for host in 1..=12u8 {
            let silent: SocketAddr = format!("10.9.0.{}:6346", host).parse().unwrap();
            dispatcher.routing().write().add(Contact::alive(Kuid::random(), silent));
        }

        let lookup = lookups.lookup_nodes(Kuid::random());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let sent = dispatcher.traffic_stats().sent;
        assert_eq!(sent, 3);
        assert_eq!(lookups.active_lookups(), 1);

        assert!(lookup.cancel());
        assert_eq!(lookup.await.unwrap_err(), DhtError::Cancelled);

        // well past the point where timeouts would have freed slots for more queries
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dispatcher.traffic_stats().sent, sent);
        assert_eq!(lookups.active_lookups(), 0);
    }

    #[test]
    fn test_converges_when_no_closer_candidate() {
        let mut state = LookupState::new(Kuid::MIN, Kuid::MAX, 2);
        state.record_response(Contact::alive(id(0x01), addr()), SecurityToken::empty(), 1);
        state.record_response(Contact::alive(id(0x02), addr()), SecurityToken::empty(), 2);
        state.add_candidate(Contact::new(id(0x03), addr()), 3);
        assert!(state.next_candidate().is_none());
        assert_eq!(state.hops, 2);

        state.add_candidate(Contact::new(Kuid::MIN.with_bit(159, true), addr()), 3);
        assert!(state.next_candidate().is_some());
    }

    #[test]
    fn test_responses_keep_k_closest() {
        let mut state = LookupState::new(Kuid::MIN, Kuid::MAX, 2);
        state.record_response(Contact::alive(id(0x30), addr()), SecurityToken::new(vec![1]), 1);
        state.record_response(Contact::alive(id(0x10), addr()), SecurityToken::new(vec![2]), 1);
        state.record_response(Contact::alive(id(0x20), addr()), SecurityToken::empty(), 1);
        let closest: Vec<Kuid> = state.closest().iter().map(|c| c.id).collect();
        assert_eq!(closest, vec![id(0x10), id(0x20)]);
        let tokens = state.tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[&id(0x10)].as_bytes(), &[2]);
    }
}
