//! DHT contact module
//!
//! Represents a remote node in the DHT network: its identifier, socket
//! address, vendor tags, and liveness bookkeeping.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::dht::kuid::Kuid;

/// Four-character vendor code used by this implementation
pub const LOCAL_VENDOR: u32 = u32::from_be_bytes(*b"OVDH");

/// Protocol version advertised in every message
pub const LOCAL_VERSION: u16 = 1;

/// Liveness classification of a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    /// Contacted us directly or answered one of our requests
    Alive,
    /// Learned second-hand from another node's response
    Unknown,
    /// Failed too many requests in a row
    Dead,
}

/// Represents a DHT contact
#[derive(Debug, Clone)]
pub struct Contact {
    /// Node identifier
    pub id: Kuid,
    /// Node address
    pub addr: SocketAddr,
    /// Vendor code of the remote implementation
    pub vendor: u32,
    /// Protocol version of the remote implementation
    pub version: u16,
    /// Changes whenever the remote node restarts with the same id
    pub instance_id: u8,
    /// Whether the node can't accept unsolicited datagrams
    pub firewalled: bool,
    /// Liveness state
    pub state: ContactState,
    /// Smoothed round-trip time
    pub rtt: Option<Duration>,
    /// Consecutive failed requests
    pub failures: u32,
    /// When the node was last heard from
    pub last_seen: Instant,
    /// When the node last failed a request
    pub last_failed: Option<Instant>,
}

impl Contact {
    /// Create a contact learned second-hand (state `Unknown`)
    pub fn new(id: Kuid, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            vendor: 0,
            version: 0,
            instance_id: 0,
            firewalled: false,
            state: ContactState::Unknown,
            rtt: None,
            failures: 0,
            last_seen: Instant::now(),
            last_failed: None,
        }
    }

    /// Create a contact that talked to us directly (state `Alive`)
    pub fn alive(id: Kuid, addr: SocketAddr) -> Self {
        let mut contact = Self::new(id, addr);
        contact.state = ContactState::Alive;
        contact
    }

    /// Set vendor and version tags
    pub fn with_vendor(mut self, vendor: u32, version: u16) -> Self {
        self.vendor = vendor;
        self.version = version;
        self
    }

    /// Set the instance id
    pub fn with_instance_id(mut self, instance_id: u8) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Set the firewalled flag
    pub fn with_firewalled(mut self, firewalled: bool) -> Self {
        self.firewalled = firewalled;
        self
    }

    /// Vendor code as text, e.g. `OVDH`
    pub fn vendor_string(&self) -> String {
        self.vendor
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }

    /// XOR distance to another id
    pub fn distance_to(&self, other: &Kuid) -> Kuid {
        self.id.distance(other)
    }

    /// Record a successful exchange
    pub fn touch(&mut self, rtt: Option<Duration>) {
        self.state = ContactState::Alive;
        self.failures = 0;
        self.last_seen = Instant::now();
        if let Some(sample) = rtt {
            self.rtt = Some(match self.rtt {
                Some(prev) => (prev * 7 + sample) / 8,
                None => sample,
            });
        }
    }

    /// Record a failed request; the contact becomes `Dead` at `max_failures`
    pub fn fail(&mut self, max_failures: u32) {
        self.failures = self.failures.saturating_add(1);
        self.last_failed = Some(Instant::now());
        if self.failures >= max_failures {
            self.state = ContactState::Dead;
        }
    }

    /// Fold a fresher observation of the same node into this one
    pub fn merge(&mut self, newer: &Contact) {
        debug_assert_eq!(self.id, newer.id);
        self.addr = newer.addr;
        if newer.vendor != 0 {
            self.vendor = newer.vendor;
            self.version = newer.version;
        }
        self.instance_id = newer.instance_id;
        self.firewalled = newer.firewalled;
        if newer.state == ContactState::Alive {
            self.touch(newer.rtt);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_unknown(&self) -> bool {
        self.state == ContactState::Unknown
    }

    pub fn is_dead(&self) -> bool {
        self.state == ContactState::Dead
    }

    /// True if the last request to this node failed
    pub fn has_failed(&self) -> bool {
        self.failures > 0
    }

    /// True if the node was alive within `window`
    pub fn recently_alive(&self, window: Duration) -> bool {
        self.is_alive() && self.last_seen.elapsed() < window
    }

    /// Get the time since last seen
    pub fn time_since_seen(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({:?})", self.id.to_hex(), self.addr, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_contact_new_is_unknown() {
        let contact = Contact::new(Kuid::new([1u8; 20]), addr());
        assert!(contact.is_unknown());
        assert_eq!(contact.failures, 0);
    }

    #[test]
    fn test_contact_alive() {
        let contact = Contact::alive(Kuid::new([1u8; 20]), addr());
        assert!(contact.is_alive());
        assert!(contact.recently_alive(Duration::from_secs(60)));
    }

    #[test]
    fn test_fail_until_dead() {
        let mut contact = Contact::alive(Kuid::random(), addr());
        contact.fail(3);
        contact.fail(3);
        assert!(contact.has_failed());
        assert!(!contact.is_dead());
        contact.fail(3);
        assert!(contact.is_dead());
    }

    #[test]
    fn test_touch_resets_failures() {
        let mut contact = Contact::new(Kuid::random(), addr());
        contact.fail(3);
        contact.touch(Some(Duration::from_millis(80)));
        assert!(contact.is_alive());
        assert_eq!(contact.failures, 0);
        assert_eq!(contact.rtt, Some(Duration::from_millis(80)));

        contact.touch(Some(Duration::from_millis(160)));
        assert_eq!(contact.rtt, Some(Duration::from_millis(90)));
    }

    #[test]
    fn test_merge_takes_newer_address() {
        let id = Kuid::random();
        let mut old = Contact::new(id, addr());
        let newer = Contact::alive(id, "127.0.0.1:7000".parse().unwrap())
            .with_vendor(LOCAL_VENDOR, LOCAL_VERSION)
            .with_instance_id(4);
        old.merge(&newer);
        assert_eq!(old.addr, newer.addr);
        assert_eq!(old.instance_id, 4);
        assert_eq!(old.vendor_string(), "OVDH");
        assert!(old.is_alive());
    }

    #[test]
    fn test_contact_equality_by_id() {
        let id = Kuid::random();
        let a = Contact::new(id, addr());
        let b = Contact::alive(id, "10.0.0.1:1".parse().unwrap());
        assert_eq!(a, b);
    }
}
