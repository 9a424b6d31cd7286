//! DHT key space module
//!
//! 160-bit identifiers shared by nodes and values, and the XOR metric.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{DhtError, Result};

/// Identifier length in bytes
pub const KUID_LENGTH: usize = 20;

/// Identifier length in bits
pub const KUID_BITS: usize = KUID_LENGTH * 8;

/// Kademlia unique identifier (160 bits)
///
/// Byte order is big-endian, so the derived `Ord` is the unsigned integer
/// order. XOR distances are `Kuid`s too and compare the same way.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kuid(pub [u8; KUID_LENGTH]);

impl Kuid {
    /// The all-zero identifier
    pub const MIN: Kuid = Kuid([0u8; KUID_LENGTH]);

    /// The all-ones identifier
    pub const MAX: Kuid = Kuid([0xFFu8; KUID_LENGTH]);

    /// Create a new Kuid from bytes
    pub fn new(id: [u8; KUID_LENGTH]) -> Self {
        Self(id)
    }

    /// Generate a random Kuid
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut id = [0u8; KUID_LENGTH];
        rng.fill(&mut id);
        Self(id)
    }

    /// Parse a Kuid from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KUID_LENGTH {
            return Err(DhtError::protocol_error_with_source(
                "Invalid KUID length",
                format!("expected {} bytes, got {}", KUID_LENGTH, bytes.len()),
            ));
        }
        let mut id = [0u8; KUID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Derive the Kuid of a resource key by hashing it
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut id = [0u8; KUID_LENGTH];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Get the Kuid as bytes
    pub fn as_bytes(&self) -> &[u8; KUID_LENGTH] {
        &self.0
    }

    /// Get the Kuid as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a Kuid from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str)
            .ok()
            .and_then(|bytes| Self::from_bytes(&bytes).ok())
    }

    /// Bitwise XOR of two identifiers
    pub fn xor(&self, other: &Kuid) -> Kuid {
        let mut out = [0u8; KUID_LENGTH];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Kuid(out)
    }

    /// XOR distance, smaller is closer
    pub fn distance(&self, other: &Kuid) -> Kuid {
        self.xor(other)
    }

    /// Value of the bit at `index`, counting from the most significant bit
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < KUID_BITS);
        (self.0[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// Copy of this id with the bit at `index` set to `value`
    pub fn with_bit(&self, index: usize, value: bool) -> Kuid {
        let mut out = self.0;
        let mask = 1u8 << (7 - (index % 8));
        if value {
            out[index / 8] |= mask;
        } else {
            out[index / 8] &= !mask;
        }
        Kuid(out)
    }

    /// Number of leading bits shared with `other`
    pub fn common_prefix_len(&self, other: &Kuid) -> usize {
        let dist = self.xor(other);
        for (i, &byte) in dist.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        KUID_BITS
    }

    /// True if the first `depth` bits of `self` equal those of `prefix`
    pub fn has_prefix(&self, prefix: &Kuid, depth: usize) -> bool {
        self.common_prefix_len(prefix) >= depth
    }

    /// Keep the first `depth` bits, zero the rest
    pub fn truncate(&self, depth: usize) -> Kuid {
        let mut out = [0u8; KUID_LENGTH];
        for (i, b) in out.iter_mut().enumerate() {
            let start = i * 8;
            if start + 8 <= depth {
                *b = self.0[i];
            } else if start < depth {
                let keep = depth - start;
                *b = self.0[i] & (0xFFu8 << (8 - keep));
            }
        }
        Kuid(out)
    }

    /// Random id that shares the first `depth` bits with `prefix`
    pub fn random_with_prefix(prefix: &Kuid, depth: usize) -> Kuid {
        let random = Kuid::random();
        let mut out = [0u8; KUID_LENGTH];
        let fixed = prefix.truncate(depth);
        let mask = Kuid::MAX.truncate(depth);
        for (i, b) in out.iter_mut().enumerate() {
            *b = fixed.0[i] | (random.0[i] & !mask.0[i]);
        }
        Kuid(out)
    }

    /// The id as a fraction of the key space in `[0, 1)`
    pub fn as_fraction(&self) -> f64 {
        let mut hi = [0u8; 8];
        hi.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(hi) as f64 / 2f64.powi(64)
    }
}

impl fmt::Debug for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Kuid {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self> {
        Kuid::from_hex(s).ok_or_else(|| DhtError::validation_error_with_field("Invalid KUID hex string", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kuid_random() {
        let a = Kuid::random();
        let b = Kuid::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_distance_symmetric_and_zero() {
        for _ in 0..32 {
            let a = Kuid::random();
            let b = Kuid::random();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.distance(&a), Kuid::MIN);
        }
    }

    #[test]
    fn test_distance_ordering() {
        let target = Kuid::MIN;
        let near = Kuid::new([0x01; KUID_LENGTH]);
        let far = Kuid::new([0x80; KUID_LENGTH]);
        assert!(near.distance(&target) < far.distance(&target));
    }

    #[test]
    fn test_from_bytes_invalid_length() {
        assert!(Kuid::from_bytes(&[1u8; 10]).is_err());
        assert!(Kuid::from_bytes(&[1u8; 20]).is_ok());
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Kuid::new([0xAB; KUID_LENGTH]);
        assert_eq!(id.to_hex().len(), 40);
        assert_eq!(Kuid::from_hex(&id.to_hex()), Some(id));
        assert_eq!(id.to_string().parse::<Kuid>().unwrap(), id);
        assert!(Kuid::from_hex("zz").is_none());
    }

    #[test]
    fn test_hash_of_is_deterministic() {
        assert_eq!(Kuid::hash_of(b"song.mp3"), Kuid::hash_of(b"song.mp3"));
        assert_ne!(Kuid::hash_of(b"song.mp3"), Kuid::hash_of(b"song.ogg"));
    }

    #[test]
    fn test_bits() {
        let id = Kuid::MIN.with_bit(0, true).with_bit(9, true);
        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(9));
        assert_eq!(id.0[0], 0x80);
        assert_eq!(id.0[1], 0x40);
        assert!(!id.with_bit(0, false).bit(0));
    }

    #[test]
    fn test_common_prefix_len() {
        let a = Kuid::MIN;
        assert_eq!(a.common_prefix_len(&a), KUID_BITS);
        assert_eq!(a.common_prefix_len(&Kuid::MIN.with_bit(0, true)), 0);
        assert_eq!(a.common_prefix_len(&Kuid::MIN.with_bit(12, true)), 12);
    }

    #[test]
    fn test_truncate() {
        let id = Kuid::MAX.truncate(12);
        assert_eq!(id.0[0], 0xFF);
        assert_eq!(id.0[1], 0xF0);
        assert_eq!(id.0[2], 0x00);
        assert_eq!(Kuid::MAX.truncate(0), Kuid::MIN);
        assert_eq!(Kuid::MAX.truncate(KUID_BITS), Kuid::MAX);
    }

    #[test]
    fn test_random_with_prefix_stays_in_range() {
        let prefix = Kuid::new([0b1010_1100; KUID_LENGTH]);
        for depth in [0, 1, 7, 8, 13, 100, 160] {
            let id = Kuid::random_with_prefix(&prefix, depth);
            assert!(id.has_prefix(&prefix, depth), "depth {}", depth);
        }
    }

    #[test]
    fn test_as_fraction() {
        assert_eq!(Kuid::MIN.as_fraction(), 0.0);
        let half = Kuid::MIN.with_bit(0, true);
        assert!((half.as_fraction() - 0.5).abs() < 1e-12);
        assert!(Kuid::MAX.as_fraction() < 1.0 + 1e-12);
    }
}
