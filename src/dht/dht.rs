//! DHT main module
//!
//! `Dht` ties a node together: transport, dispatcher, routing table, value
//! database, lookups and background maintenance. Collaborators read and
//! write the overlay through `submit_find_value` and `submit_store` and
//! watch membership through `on_ready_state_changed`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dht::bootstrap::{bootstrap, BootstrapConfig, BootstrapResult};
use crate::dht::contact::Contact;
use crate::dht::database::{Database, DhtValueEntity, DhtValueType};
use crate::dht::dispatcher::{MessageDispatcher, TrafficStats};
use crate::dht::future::DhtFuture;
use crate::dht::kuid::Kuid;
use crate::dht::lookup::{FindValueResult, LookupManager, NodeLookupResult};
use crate::dht::message::Sender;
use crate::dht::refresher::{ReadyState, Refresher};
use crate::dht::routing::RoutingTable;
use crate::dht::settings::DhtSettings;
use crate::dht::store::{store, StoreResult};
use crate::dht::transport::{Transport, UdpTransport};
use crate::error::{DhtError, Result};

/// How long shutdown waits for a background task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Serialisable snapshot of a node
#[derive(Debug, Clone, Serialize)]
pub struct DhtStatus {
    pub id: String,
    pub addr: SocketAddr,
    pub external_addr: Option<SocketAddr>,
    pub bootstrapped: bool,
    pub ready: bool,
    pub contacts: usize,
    pub cached_contacts: usize,
    pub buckets: usize,
    pub keys: usize,
    pub values: usize,
    pub pending_requests: usize,
    pub active_lookups: usize,
    pub estimated_size: u32,
    pub traffic: TrafficStats,
}

/// A DHT node
pub struct Dht {
    dispatcher: Arc<MessageDispatcher>,
    lookups: Arc<LookupManager>,
    ready: Arc<ReadyState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Dht {
    /// Create a node on a UDP socket bound to `bind_addr`
    pub async fn bind(bind_addr: SocketAddr, settings: DhtSettings) -> Result<Self> {
        info!("Creating DHT instance on {}", bind_addr);
        settings.validate()?;
        let transport = UdpTransport::bind(bind_addr, settings.max_message_size).await?;
        Self::with_transport(Arc::new(transport), settings)
    }

    /// Create a node with a random id on any transport
    pub fn with_transport(transport: Arc<dyn Transport>, settings: DhtSettings) -> Result<Self> {
        Self::with_id(Kuid::random(), transport, settings)
    }

    pub fn with_id(local_id: Kuid, transport: Arc<dyn Transport>, settings: DhtSettings) -> Result<Self> {
        settings.validate()?;
        let routing = Arc::new(RwLock::new(RoutingTable::new(local_id, &settings)));
        let database = Arc::new(RwLock::new(Database::new(&settings)));
        let sender = Sender::local(local_id, rand::random(), false);
        let dispatcher = Arc::new(MessageDispatcher::new(sender, transport, settings, routing, database));
        let lookups = Arc::new(LookupManager::new(dispatcher.clone()));
        let (shutdown, _) = watch::channel(false);

        info!("DHT initialized with ID: {}", local_id.to_hex());
        Ok(Self {
            dispatcher,
            lookups,
            ready: Arc::new(ReadyState::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> Kuid {
        self.dispatcher.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.local_addr()
    }

    /// This node as other nodes see it
    pub fn local_contact(&self) -> Contact {
        let addr = self.dispatcher.external_addr().unwrap_or_else(|| self.local_addr());
        self.dispatcher.local_sender().to_contact(addr)
    }

    pub fn settings(&self) -> &DhtSettings {
        self.dispatcher.settings()
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn lookups(&self) -> &Arc<LookupManager> {
        &self.lookups
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the receive loop and background maintenance
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("DHT is already running");
            return;
        }
        info!("Starting DHT service...");
        self.shutdown.send_replace(false);

        let dispatcher = self.dispatcher.clone();
        let receiver = self.shutdown.subscribe();
        let io_task = tokio::spawn(async move {
            if let Err(e) = dispatcher.run(receiver).await {
                error!("DHT receive loop failed: {}", e);
            }
        });

        let refresher = Refresher::new(self.lookups.clone(), self.ready.clone());
        let maintenance = tokio::spawn(refresher.run(self.shutdown.subscribe()));

        self.tasks.lock().extend([io_task, maintenance]);
        info!("DHT service started");
    }

    /// Join the network through `seeds`; starts the node if needed
    pub async fn bootstrap(&self, seeds: Vec<SocketAddr>) -> Result<BootstrapResult> {
        if !self.is_running() {
            self.start();
        }
        let result = bootstrap(&self.lookups, &BootstrapConfig::new(seeds)).await;
        match &result {
            Ok(_) => {
                let disconnected = self.dispatcher.routing().read().appears_disconnected();
                self.ready.update(!disconnected);
            }
            Err(e) => error!("Failed to bootstrap DHT: {}", e),
        }
        result
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.dispatcher.is_bootstrapped()
    }

    /// Bootstrapped and not cut off from the network
    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Call `listener` whenever the node becomes ready or stops being ready
    pub fn on_ready_state_changed<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.ready.add_listener(listener);
    }

    /// Find the k nodes closest to `target`
    pub fn lookup_nodes(&self, target: Kuid) -> DhtFuture<NodeLookupResult> {
        self.lookups.lookup_nodes(target)
    }

    /// Find values of `value_type` stored under `key`
    pub fn submit_find_value(&self, key: Kuid, value_type: DhtValueType) -> DhtFuture<FindValueResult> {
        if !self.is_bootstrapped() {
            return DhtFuture::ready(Err(DhtError::NotBootstrapped));
        }
        debug!("Finding values under {}", key.to_hex());
        self.lookups.lookup_value(key, value_type)
    }

    /// Store `value` under `key` as a value of this node and replicate it to
    /// the nodes closest to the key. An empty value removes it instead.
    pub fn submit_store(&self, key: Kuid, value_type: DhtValueType, value: Vec<u8>) -> DhtFuture<StoreResult> {
        if !self.is_bootstrapped() {
            return DhtFuture::ready(Err(DhtError::NotBootstrapped));
        }
        let creator = self.local_contact();
        let entity = DhtValueEntity::new(creator.id, creator.addr, key, value_type, value).into_local();
        if let Err(e) = self.dispatcher.database().write().store(entity.clone()) {
            return DhtFuture::ready(Err(e));
        }
        debug!("Storing {} bytes under {}", entity.value.len(), key.to_hex());
        store(self.lookups.clone(), key, vec![entity])
    }

    /// Remove this node's value under `key` locally and at the closest nodes
    pub fn submit_remove(&self, key: Kuid, value_type: DhtValueType) -> DhtFuture<StoreResult> {
        self.submit_store(key, value_type, Vec::new())
    }

    /// Ping `addr`, resolving to the contact that answered
    pub fn ping(&self, addr: SocketAddr) -> DhtFuture<Contact> {
        let request = self.dispatcher.ping(addr, None);
        DhtFuture::spawn(async move {
            let response = request.await?;
            Ok(response.sender.to_contact(addr))
        })
    }

    pub fn status(&self) -> DhtStatus {
        let (contacts, cached_contacts, buckets) = {
            let routing = self.dispatcher.routing().read();
            (routing.len(), routing.cached_len(), routing.bucket_count())
        };
        let (keys, values) = {
            let database = self.dispatcher.database().read();
            (database.key_count(), database.value_count())
        };
        DhtStatus {
            id: self.local_id().to_hex(),
            addr: self.local_addr(),
            external_addr: self.dispatcher.external_addr(),
            bootstrapped: self.is_bootstrapped(),
            ready: self.is_ready(),
            contacts,
            cached_contacts,
            buckets,
            keys,
            values,
            pending_requests: self.dispatcher.pending_count(),
            active_lookups: self.lookups.active_lookups(),
            estimated_size: self.dispatcher.estimated_size(),
            traffic: self.dispatcher.traffic_stats(),
        }
    }

    /// Stop the node and wait for its tasks to finish
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down DHT...");
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if !e.is_cancelled() {
                        warn!("DHT task ended abnormally: {}", e);
                    }
                }
                Err(_) => {
                    debug!("DHT task still busy after {:?}, aborting", SHUTDOWN_GRACE);
                    task.abort();
                }
            }
        }
        self.dispatcher.set_bootstrapped(false);
        self.ready.update(false);
        info!("DHT stopped");
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("id", &self.local_id())
            .field("addr", &self.local_addr())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::transport::MemoryNetwork;
    use std::sync::atomic::AtomicUsize;

    fn node(network: &Arc<MemoryNetwork>) -> Dht {
        let transport = Arc::new(network.bind_next().unwrap());
        Dht::with_transport(transport, DhtSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_first_node_bootstraps_alone() {
        let network = MemoryNetwork::new();
        let dht = node(&network);
        assert!(!dht.is_bootstrapped());

        let result = dht.bootstrap(Vec::new()).await.unwrap();
        assert_eq!(result.seeds_responded, 0);
        assert!(dht.is_bootstrapped());
        assert!(dht.is_ready());
        assert!(dht.is_running());
        dht.shutdown().await;
        assert!(!dht.is_ready());
    }

    #[tokio::test]
    async fn test_operations_require_bootstrap() {
        let network = MemoryNetwork::new();
        let dht = node(&network);
        let err = dht.submit_find_value(Kuid::random(), DhtValueType::ANY).await.unwrap_err();
        assert_eq!(err, DhtError::NotBootstrapped);
        let err = dht
            .submit_store(Kuid::random(), DhtValueType::BINARY, b"v".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, DhtError::NotBootstrapped);
    }

    #[tokio::test]
    async fn test_store_keeps_local_copy() {
        let network = MemoryNetwork::new();
        let dht = node(&network);
        dht.bootstrap(Vec::new()).await.unwrap();

        let key = Kuid::hash_of(b"alone");
        let result = dht.submit_store(key, DhtValueType::TEXT, b"hello".to_vec()).await.unwrap();
        assert!(!result.is_successful());

        let values = dht.dispatcher().database().read().get(&key);
        assert_eq!(values.len(), 1);
        assert!(values[0].local);
        assert_eq!(values[0].value, b"hello");

        dht.submit_remove(key, DhtValueType::TEXT).await.unwrap();
        assert!(!dht.dispatcher().database().read().contains_key(&key));
        dht.shutdown().await;
    }

    #[tokio::test]
    async fn test_ready_listener_fires_on_bootstrap() {
        let network = MemoryNetwork::new();
        let dht = node(&network);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        dht.on_ready_state_changed(move |ready| {
            if ready {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        dht.bootstrap(Vec::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        dht.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let network = MemoryNetwork::new();
        let dht = node(&network);
        let status = dht.status();
        assert_eq!(status.id, dht.local_id().to_hex());
        assert_eq!(status.addr, dht.local_addr());
        assert!(!status.bootstrapped);
        assert_eq!(status.contacts, 0);
        assert_eq!(status.buckets, 1);

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bootstrapped\":false"));
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let network = MemoryNetwork::new();
        let transport = Arc::new(network.bind_next().unwrap());
        let settings = DhtSettings {
            k: 0,
            ..DhtSettings::default()
        };
        assert!(Dht::with_transport(transport, settings).is_err());
    }
}
