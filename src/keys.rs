//! # DHT Key Space
//!
//! 256-bit keys with an XOR distance metric:
//!
//! - [`DhtKey`]: 32-byte identifier for everything addressable in the DHT
//!   (router contacts under their identity key, introsets under a derived
//!   location key)
//! - `distance(a, b) = a XOR b`, compared as an unsigned big-endian integer
//! - Router ids map to keys verbatim; service addresses derive their key by
//!   hashing (see `service::NetworkAddress::dht_key`)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 256-bit DHT key.
///
/// Ordering is plain lexicographic over the bytes, which is what distance
/// tie-breaking and the bucket's ordered storage rely on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DhtKey([u8; 32]);

impl DhtKey {
    pub const LEN: usize = 32;

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Uniformly random key from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        if getrandom::getrandom(&mut bytes).is_err() {
            // CSPRNG failure is not survivable for key material; fall back to
            // the rand entropy source, which aborts on its own failure.
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut bytes);
        }
        Self(bytes)
    }

    /// XOR distance to `other`.
    #[inline]
    pub fn distance(&self, other: &DhtKey) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// True iff `candidate` is strictly closer to `self` than `other` is.
    #[inline]
    pub fn closer_than(&self, candidate: &DhtKey, other: &DhtKey) -> bool {
        distance_cmp(&self.distance(candidate), &self.distance(other)) == Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhtKey({}..)", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for DhtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Compare two XOR distances as unsigned big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> DhtKey {
        DhtKey::from_bytes([fill; 32])
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = DhtKey::random();
        let b = DhtKey::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 32]);
    }

    #[test]
    fn closer_than_orders_by_xor_magnitude() {
        let target = key(0x00);
        let near = key(0x01);
        let far = key(0x80);
        assert!(target.closer_than(&near, &far));
        assert!(!target.closer_than(&far, &near));
        assert!(!target.closer_than(&near, &near));
    }

    #[test]
    fn distance_cmp_is_big_endian() {
        // A difference in the first byte dominates everything after it.
        let mut hi = [0u8; 32];
        hi[0] = 1;
        let mut lo = [0xffu8; 32];
        lo[0] = 0;
        assert_eq!(distance_cmp(&lo, &hi), Ordering::Less);
        assert_eq!(distance_cmp(&hi, &lo), Ordering::Greater);
    }

    #[test]
    fn hex_round_trip() {
        let k = DhtKey::random();
        assert_eq!(DhtKey::from_hex(&k.to_hex()).unwrap(), k);
        assert!(DhtKey::from_hex("abcd").is_err());
    }

    #[test]
    fn random_keys_are_distinct() {
        assert_ne!(DhtKey::random(), DhtKey::random());
    }
}
