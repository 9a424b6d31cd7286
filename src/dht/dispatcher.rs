//! DHT message dispatcher
//!
//! Owns the transport. Outbound requests get a random correlation id and a
//! deadline in the pending table; responses are matched on (id, source
//! address) and resolve the request's future. A periodic sweep fails
//! requests past their deadline and counts the failure against the contact.
//! Inbound requests are answered from the routing table and the database.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::dht::contact::Contact;
use crate::dht::database::{Database, DhtValueEntity};
use crate::dht::estimator::SizeEstimator;
use crate::dht::future::{Completer, DhtFuture};
use crate::dht::kuid::Kuid;
use crate::dht::message::{
    ContactInfo, FindValueReply, Message, MessageBody, MessageId, OpCode, Sender, StoreStatus,
    StoreStatusCode, HEADER_LENGTH,
};
use crate::dht::routing::{AddOutcome, RoutingTable};
use crate::dht::settings::DhtSettings;
use crate::dht::token::{SecurityToken, SecurityTokenIssuer};
use crate::dht::transport::Transport;
use crate::error::{DhtError, Result};

/// Receive errors in a row after which the receive loop gives up
const MAX_RECV_ERRORS: u32 = 100;

/// How long a computed size estimate is reused
const ESTIMATE_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// An outstanding request
struct PendingRequest {
    addr: SocketAddr,
    contact_id: Option<Kuid>,
    opcode: OpCode,
    sent_at: Instant,
    deadline: Instant,
    completer: Completer<Message>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
}

/// Snapshot of the dispatcher's traffic counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrafficStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub timeouts: u64,
}

/// Sends requests, matches responses and answers inbound requests
pub struct MessageDispatcher {
    local: Sender,
    transport: Arc<dyn Transport>,
    settings: DhtSettings,
    routing: Arc<RwLock<RoutingTable>>,
    database: Arc<RwLock<Database>>,
    tokens: SecurityTokenIssuer,
    estimator: Mutex<SizeEstimator>,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    probing: Mutex<HashSet<Kuid>>,
    bootstrapped: AtomicBool,
    external_addr: RwLock<Option<SocketAddr>>,
    counters: Counters,
}

impl MessageDispatcher {
    pub fn new(
        local: Sender,
        transport: Arc<dyn Transport>,
        settings: DhtSettings,
        routing: Arc<RwLock<RoutingTable>>,
        database: Arc<RwLock<Database>>,
    ) -> Self {
        let tokens = SecurityTokenIssuer::new(settings.token_rotation_interval());
        Self {
            local,
            transport,
            settings,
            routing,
            database,
            tokens,
            estimator: Mutex::new(SizeEstimator::new(ESTIMATE_UPDATE_INTERVAL)),
            pending: Mutex::new(HashMap::new()),
            probing: Mutex::new(HashSet::new()),
            bootstrapped: AtomicBool::new(false),
            external_addr: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    pub fn local_id(&self) -> Kuid {
        self.local.id
    }

    pub fn local_sender(&self) -> Sender {
        self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn settings(&self) -> &DhtSettings {
        &self.settings
    }

    pub fn routing(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing
    }

    pub fn database(&self) -> &Arc<RwLock<Database>> {
        &self.database
    }

    pub fn tokens(&self) -> &SecurityTokenIssuer {
        &self.tokens
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn set_bootstrapped(&self, bootstrapped: bool) {
        self.bootstrapped.store(bootstrapped, Ordering::SeqCst);
    }

    /// Our address as last reported by a Ping response
    pub fn external_addr(&self) -> Option<SocketAddr> {
        *self.external_addr.read()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn traffic_stats(&self) -> TrafficStats {
        TrafficStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Current network size estimate
    pub fn estimated_size(&self) -> u32 {
        let now = Instant::now();
        let mut estimator = self.estimator.lock();
        if estimator.is_stale(now) {
            let closest: Vec<Kuid> = self
                .routing
                .read()
                .contacts_near(&self.local.id, self.settings.k)
                .iter()
                .map(|c| c.id)
                .collect();
            estimator.update(&self.local.id, &closest, now);
        }
        estimator.estimated_size()
    }

    /// Send a request to `addr`. If `contact_id` is set the response must
    /// come from that node and a timeout counts against it.
    pub fn send_request(
        self: &Arc<Self>,
        addr: SocketAddr,
        contact_id: Option<Kuid>,
        body: MessageBody,
    ) -> DhtFuture<Message> {
        let opcode = body.opcode();
        let (future, completer) = DhtFuture::new();

        let (id, bytes) = {
            let mut pending = self.pending.lock();
            if pending.len() >= self.settings.max_pending_requests {
                warn!("Pending request table full, refusing {} to {}", opcode, addr);
                completer.fail(DhtError::capacity_exceeded(
                    format!("{} requests outstanding", pending.len()),
                    "pending-requests",
                ));
                return future;
            }

            let mut message = Message::request(self.local, body);
            while pending.contains_key(&message.id) {
                message.id = MessageId::random();
            }
            let bytes = message.encode();
            if bytes.len() > self.settings.max_message_size {
                completer.fail(DhtError::protocol_error_with_source(
                    "Message too large",
                    format!("{} bytes, limit {}", bytes.len(), self.settings.max_message_size),
                ));
                return future;
            }

            let now = Instant::now();
            pending.insert(
                message.id,
                PendingRequest {
                    addr,
                    contact_id,
                    opcode,
                    sent_at: now,
                    deadline: now + self.settings.request_timeout(),
                    completer,
                },
            );
            (message.id, bytes)
        };

        let weak = Arc::downgrade(self);
        future.on_cancel(move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.pending.lock().remove(&id);
            }
        });

        debug!("Sending {} to {} ({:?})", opcode, addr, id);
        let this = self.clone();
        tokio::spawn(async move {
            match this.transport.send_to(&bytes, addr).await {
                Ok(()) => {
                    this.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Failed to send {} to {}: {}", opcode, addr, e);
                    let removed = this.pending.lock().remove(&id);
                    if let Some(request) = removed {
                        request.completer.fail(e);
                    }
                }
            }
        });

        future
    }

    /// Ping a node, optionally requiring it to answer with `contact_id`
    pub fn ping(self: &Arc<Self>, addr: SocketAddr, contact_id: Option<Kuid>) -> DhtFuture<Message> {
        self.send_request(addr, contact_id, MessageBody::PingRequest)
    }

    /// Offer a contact to the routing table and start any liveness probe
    /// the table asks for
    pub fn add_contact(self: &Arc<Self>, contact: Contact) -> AddOutcome {
        let outcome = self.routing.write().add(contact);
        match &outcome {
            AddOutcome::Cached { probe: Some(lrs) } => self.probe(lrs.clone(), None),
            AddOutcome::SpoofSuspected { existing, candidate } => {
                debug!("{} claims the id of {}, checking", candidate.addr, existing);
                self.probe(existing.clone(), Some(candidate.clone()));
            }
            _ => {}
        }
        outcome
    }

    /// Ping `target`; if it does not answer, evict it or, for a spoof
    /// check, move its entry to `candidate`'s address.
    fn probe(self: &Arc<Self>, target: Contact, candidate: Option<Contact>) {
        if !self.probing.lock().insert(target.id) {
            return;
        }
        let probed_at = Instant::now();
        let future = self.ping(target.addr, Some(target.id));
        let weak = Arc::downgrade(self);
        future.add_listener(move |result| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.probing.lock().remove(&target.id);
            if result.is_ok() {
                return;
            }
            match candidate {
                Some(candidate) => {
                    if this.routing.write().replace_spoofed(&candidate, probed_at) {
                        info!("Contact {} moved to {}", candidate.id.to_hex(), candidate.addr);
                    }
                }
                None => {
                    if let Some(evicted) = this.routing.write().evict_unresponsive(&target.id, probed_at) {
                        debug!("Evicted unresponsive contact {}", evicted);
                    }
                }
            }
        });
    }

    /// Decode and process one inbound datagram. Malformed input is dropped.
    pub async fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        trace!("Handling datagram from {} ({} bytes)", from, data.len());
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if data.len() > self.settings.max_message_size {
            warn!("Dropping oversized datagram from {} ({} bytes)", from, data.len());
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", from, e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if message.sender.id == self.local.id {
            debug!("Dropping message from {} carrying our own id", from);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if message.is_request() {
            self.handle_request(message, from).await;
        } else {
            self.handle_response(message, from);
        }
    }

    fn handle_response(self: &Arc<Self>, message: Message, from: SocketAddr) {
        let matched = {
            let mut pending = self.pending.lock();
            match pending.get(&message.id) {
                Some(request) if request.addr == from && request.opcode.response() == message.opcode() => {
                    pending.remove(&message.id)
                }
                _ => None,
            }
        };

        let Some(request) = matched else {
            debug!("Discarding unmatched {} from {}", message.opcode(), from);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let Some(expected) = request.contact_id {
            if expected != message.sender.id {
                warn!(
                    "{} from {} answered as {} instead of {}",
                    message.opcode(),
                    from,
                    message.sender.id.to_hex(),
                    expected.to_hex()
                );
                request.completer.fail(DhtError::security_error_with_address(
                    "Response from unexpected node",
                    from.to_string(),
                ));
                return;
            }
        }

        let mut contact = message.sender.to_contact(from);
        contact.rtt = Some(request.sent_at.elapsed());
        self.add_contact(contact);

        if let MessageBody::PingResponse {
            external_addr,
            estimated_size,
        } = &message.body
        {
            let mut current = self.external_addr.write();
            if *current != Some(*external_addr) {
                debug!("External address is {}", external_addr);
                *current = Some(*external_addr);
            }
            drop(current);
            self.estimator.lock().add_remote_estimate(*estimated_size);
        }

        request.completer.succeed(message);
    }

    async fn handle_request(self: &Arc<Self>, message: Message, from: SocketAddr) {
        debug!("Received {} from {}", message.opcode(), from);
        self.add_contact(message.sender.to_contact(from));

        let body = match message.body {
            MessageBody::PingRequest => {
                if !self.is_bootstrapped() {
                    debug!("Ignoring ping from {} while bootstrapping", from);
                    return;
                }
                MessageBody::PingResponse {
                    external_addr: from,
                    estimated_size: self.estimated_size(),
                }
            }
            MessageBody::FindNodeRequest { target } => MessageBody::FindNodeResponse {
                token: self.tokens.issue(&from),
                contacts: self.closest_for(&target, &message.sender.id),
            },
            MessageBody::FindValueRequest { key, value_type } => {
                let now = Instant::now();
                let values: Vec<DhtValueEntity> = self
                    .database
                    .read()
                    .get_at(&key, now)
                    .into_iter()
                    .filter(|e| value_type.matches(&e.value_type))
                    .collect();
                if values.is_empty() {
                    MessageBody::FindValueResponse(FindValueReply::Contacts {
                        token: self.tokens.issue(&from),
                        contacts: self.closest_for(&key, &message.sender.id),
                    })
                } else {
                    let request_load = self.database.write().record_request(&key, now);
                    MessageBody::FindValueResponse(FindValueReply::Values {
                        request_load,
                        entities: self.fit_values(values),
                    })
                }
            }
            MessageBody::StoreRequest { token, entities } => {
                self.handle_store(token, entities, &message.sender.id, from)
            }
            other => {
                debug!("Ignoring unexpected {} from {}", other.opcode(), from);
                return;
            }
        };

        let response = Message::response(message.id, self.local, body);
        self.send_message(&response, from).await;
    }

    fn handle_store(
        &self,
        token: SecurityToken,
        entities: Vec<DhtValueEntity>,
        sender: &Kuid,
        from: SocketAddr,
    ) -> MessageBody {
        if !self.tokens.validate(&token, &from) {
            warn!("Rejecting store of {} values from {}: invalid security token", entities.len(), from);
            let results = entities
                .iter()
                .map(|e| StoreStatus {
                    key: e.key,
                    creator: e.creator,
                    code: StoreStatusCode::InvalidToken,
                })
                .collect();
            return MessageBody::StoreResponse {
                status: StoreStatusCode::InvalidToken,
                results,
            };
        }

        let mut database = self.database.write();
        let results: Vec<StoreStatus> = entities
            .into_iter()
            .map(|entity| {
                let entity = entity.received_from(sender);
                let (key, creator) = (entity.key, entity.creator);
                let code = match database.store(entity) {
                    Ok(()) => StoreStatusCode::Success,
                    Err(e) => {
                        debug!("Store of {} from {} failed: {}", key.to_hex(), from, e);
                        StoreStatusCode::Failure
                    }
                };
                StoreStatus { key, creator, code }
            })
            .collect();

        let status = if results.iter().all(|r| r.code == StoreStatusCode::Success) {
            StoreStatusCode::Success
        } else {
            StoreStatusCode::Failure
        };
        MessageBody::StoreResponse { status, results }
    }

    /// The k contacts closest to `target`, leaving out the requester
    fn closest_for(&self, target: &Kuid, requester: &Kuid) -> Vec<ContactInfo> {
        let k = self.settings.k;
        self.routing
            .read()
            .contacts_near(target, k + 1)
            .iter()
            .filter(|c| c.id != *requester)
            .take(k)
            .map(ContactInfo::from)
            .collect()
    }

    /// As many values as fit in one datagram
    fn fit_values(&self, values: Vec<DhtValueEntity>) -> Vec<DhtValueEntity> {
        let mut size = HEADER_LENGTH + 1 + 4 + 2;
        let mut fitted = Vec::with_capacity(values.len());
        for value in values {
            size += value.encoded_len();
            if size > self.settings.max_message_size {
                break;
            }
            fitted.push(value);
        }
        fitted
    }

    async fn send_message(&self, message: &Message, to: SocketAddr) {
        let bytes = message.encode();
        match self.transport.send_to(&bytes, to).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!("Sent {} to {}", message.opcode(), to);
            }
            Err(e) => warn!("Failed to send {} to {}: {}", message.opcode(), to, e),
        }
    }

    /// Fail requests whose deadline passed. Returns how many expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<MessageId> = pending
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = expired.len();
        for request in expired {
            debug!("{} to {} timed out", request.opcode, request.addr);
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = request.contact_id {
                if let Some(evicted) = self.routing.write().mark_failed(&id) {
                    debug!("Evicted {} after repeated failures", evicted);
                }
            }
            request.completer.fail(DhtError::timeout_with_address(
                format!("No response to {}", request.opcode),
                request.addr.to_string(),
            ));
        }
        count
    }

    /// Fail every outstanding request with `error`
    pub fn fail_all_pending(&self, error: DhtError) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        for request in drained {
            request.completer.fail(error.clone());
        }
    }

    /// Receive loop plus timeout sweep; runs until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sweep = interval(self.settings.request_sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recv_errors = 0u32;

        info!("Message dispatcher running on {}", self.local_addr());
        let result = loop {
            tokio::select! {
                received = self.transport.recv_from() => {
                    match received {
                        Ok((data, from)) => {
                            recv_errors = 0;
                            self.handle_datagram(&data, from).await;
                        }
                        Err(e) => {
                            recv_errors += 1;
                            error!("Failed to receive datagram: {}", e);
                            if recv_errors >= MAX_RECV_ERRORS {
                                break Err(e);
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_expired(Instant::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        self.fail_all_pending(DhtError::Shutdown);
        info!("Message dispatcher stopped");
        result
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("local_id", &self.local.id)
            .field("local_addr", &self.transport.local_addr())
            .field("pending", &self.pending_count())
            .finish()
    }
}
