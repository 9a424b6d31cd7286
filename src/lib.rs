//! overlay-dht
//!
//! A Kademlia-derived DHT node: iterative lookups, security-token protected
//! stores, value replication and routing-table maintenance over UDP.

pub mod dht;
pub mod cli;
pub mod error;

pub use error::{DhtError, Result};

pub use dht::{
    BootstrapConfig, BootstrapResult, Contact, ContactState, Dht, DhtFuture, DhtSettings, DhtStatus,
    DhtValueEntity, DhtValueType, FindValueResult, Kuid, MemoryNetwork, NodeLookupResult, RoutingTable,
    StoreResult, Transport, UdpTransport,
};
pub use cli::{CliArgs, Config, StatusDisplay};
