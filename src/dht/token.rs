//! Security token module
//!
//! Address-bound tokens that prove a requester was recently reachable at
//! the address it claims. A token is an HMAC-SHA1 over the rotation epoch
//! and the requester's IP and port, keyed by a secret that rotates
//! periodically. The current and previous secrets are both accepted, so a
//! token stays valid across one rotation boundary. Nothing is stored per
//! issued token.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha1::Sha1;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Secret key length in bytes
const SECRET_LENGTH: usize = 32;

/// Longest token accepted on the wire
pub const MAX_TOKEN_LENGTH: usize = u8::MAX as usize;

/// Opaque token bytes. An empty token means "no token".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityToken(Vec<u8>);

impl SecurityToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

struct Secrets {
    current: [u8; SECRET_LENGTH],
    previous: [u8; SECRET_LENGTH],
    epoch: u64,
    rotated_at: Instant,
}

/// Issues and validates security tokens
pub struct SecurityTokenIssuer {
    secrets: RwLock<Secrets>,
    rotation_interval: Duration,
}

fn random_secret() -> [u8; SECRET_LENGTH] {
    let mut secret = [0u8; SECRET_LENGTH];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn keyed_mac(secret: &[u8], epoch: u64, addr: &SocketAddr) -> Option<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(secret).ok()?;
    mac.update(&epoch.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => mac.update(&ip.octets()),
        IpAddr::V6(ip) => mac.update(&ip.octets()),
    }
    mac.update(&addr.port().to_be_bytes());
    Some(mac)
}

impl SecurityTokenIssuer {
    pub fn new(rotation_interval: Duration) -> Self {
        Self {
            secrets: RwLock::new(Secrets {
                current: random_secret(),
                previous: random_secret(),
                epoch: 0,
                rotated_at: Instant::now(),
            }),
            rotation_interval,
        }
    }

    /// Issue a token bound to `addr` under the current secret
    pub fn issue(&self, addr: &SocketAddr) -> SecurityToken {
        let secrets = self.secrets.read();
        match keyed_mac(&secrets.current, secrets.epoch, addr) {
            Some(mac) => SecurityToken(mac.finalize().into_bytes().to_vec()),
            None => SecurityToken::empty(),
        }
    }

    /// True if `token` was issued for exactly `addr` under the current or
    /// previous secret
    pub fn validate(&self, token: &SecurityToken, addr: &SocketAddr) -> bool {
        if token.is_empty() {
            return false;
        }
        let secrets = self.secrets.read();
        let current = keyed_mac(&secrets.current, secrets.epoch, addr)
            .map_or(false, |mac| mac.verify_slice(token.as_bytes()).is_ok());
        if current {
            return true;
        }
        secrets.epoch > 0
            && keyed_mac(&secrets.previous, secrets.epoch - 1, addr)
                .map_or(false, |mac| mac.verify_slice(token.as_bytes()).is_ok())
    }

    /// Replace the secret; tokens from the previous epoch stay valid
    pub fn rotate(&self) {
        let mut secrets = self.secrets.write();
        secrets.previous = secrets.current;
        secrets.current = random_secret();
        secrets.epoch += 1;
        secrets.rotated_at = Instant::now();
        debug!("Rotated token secret, epoch {}", secrets.epoch);
    }

    /// Rotate if the rotation interval has passed. Returns true if rotated.
    pub fn rotate_if_due(&self) -> bool {
        let due = self.secrets.read().rotated_at.elapsed() >= self.rotation_interval;
        if due {
            self.rotate();
        }
        due
    }

    pub fn epoch(&self) -> u64 {
        self.secrets.read().epoch
    }
}

impl std::fmt::Debug for SecurityTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityTokenIssuer")
            .field("epoch", &self.epoch())
            .field("rotation_interval", &self.rotation_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_issue_and_validate() {
        let issuer = SecurityTokenIssuer::new(Duration::from_secs(300));
        let a = addr("10.0.0.1:4000");
        let token = issuer.issue(&a);
        assert_eq!(token.len(), 20);
        assert!(issuer.validate(&token, &a));
    }

    #[test]
    fn test_token_bound_to_address() {
        let issuer = SecurityTokenIssuer::new(Duration::from_secs(300));
        let token = issuer.issue(&addr("10.0.0.1:4000"));
        assert!(!issuer.validate(&token, &addr("10.0.0.2:4000")));
        assert!(!issuer.validate(&token, &addr("10.0.0.1:4001")));
        assert!(!issuer.validate(&token, &addr("[::1]:4000")));
    }

    #[test]
    fn test_empty_and_garbage_tokens_rejected() {
        let issuer = SecurityTokenIssuer::new(Duration::from_secs(300));
        let a = addr("127.0.0.1:5000");
        assert!(!issuer.validate(&SecurityToken::empty(), &a));
        assert!(!issuer.validate(&SecurityToken::new(vec![0u8; 20]), &a));
    }

    #[test]
    fn test_token_survives_one_rotation() {
        let issuer = SecurityTokenIssuer::new(Duration::from_secs(300));
        let a = addr("192.168.1.10:6346");
        let token = issuer.issue(&a);
        issuer.rotate();
        assert!(issuer.validate(&token, &a));
        issuer.rotate();
        assert!(!issuer.validate(&token, &a));
    }

    #[test]
    fn test_tokens_from_other_issuer_rejected() {
        let a = addr("10.1.1.1:1234");
        let one = SecurityTokenIssuer::new(Duration::from_secs(300));
        let two = SecurityTokenIssuer::new(Duration::from_secs(300));
        assert!(!two.validate(&one.issue(&a), &a));
    }

    #[test]
    fn test_rotate_if_due() {
        let issuer = SecurityTokenIssuer::new(Duration::ZERO);
        assert!(issuer.rotate_if_due());
        assert_eq!(issuer.epoch(), 1);

        let issuer = SecurityTokenIssuer::new(Duration::from_secs(3600));
        assert!(!issuer.rotate_if_due());
        assert_eq!(issuer.epoch(), 0);
    }
}
