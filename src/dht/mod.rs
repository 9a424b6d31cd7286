//! DHT (Distributed Hash Table) module
//!
//! Kademlia-style overlay: 160-bit ids, XOR distance, k-buckets, iterative
//! lookups and token-protected value replication over UDP.

pub mod kuid;
pub mod contact;
pub mod routing;
pub mod message;
pub mod token;
pub mod future;
pub mod transport;
pub mod estimator;
pub mod settings;
pub mod database;
pub mod dispatcher;
pub mod lookup;
pub mod store;
pub mod bootstrap;
pub mod refresher;
pub mod dht;

// Re-exports for convenience
pub use kuid::{Kuid, KUID_BITS, KUID_LENGTH};
pub use contact::{Contact, ContactState};
pub use routing::{AddOutcome, BucketRange, KBucket, RoutingTable};
pub use message::{Message, MessageBody, MessageId, OpCode, StoreStatusCode};
pub use token::{SecurityToken, SecurityTokenIssuer};
pub use future::{Completer, DhtFuture};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
pub use settings::DhtSettings;
pub use database::{Database, DhtValueEntity, DhtValueType};
pub use dispatcher::{MessageDispatcher, TrafficStats};
pub use lookup::{FindValueResult, LookupManager, NodeLookupResult};
pub use store::StoreResult;
pub use bootstrap::{BootstrapConfig, BootstrapResult};
pub use refresher::{ReadyState, Refresher};
pub use dht::{Dht, DhtStatus};
