//! # Identity Types
//!
//! Core identity types used throughout umbra:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`RouterId`]: 32-byte public key serving as a router's long-lived
//!   identifier; used verbatim as the router's DHT key
//! - [`RouterContact`]: signed, expiring record describing how to reach a
//!   router (addresses, encryption key, exit capability)
//!
//! ## Identity model
//!
//! Identity = Ed25519 public key. Possession of the private key proves
//! identity; no external CA is involved. Router contacts are replaced on
//! refresh, never mutated in place, so a contact's signature always covers
//! exactly the bytes it was issued with.
//!
//! ## Contact lifetime
//!
//! A contact is *live* while `now < expires_at` and *fresh* while
//! `now < expires_at - FRESH_DELTA_MS`. Stale-but-live contacts are still
//! served from the DHT but trigger a refresh lookup toward the owner.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, RC_SIGNATURE_DOMAIN};
use crate::keys::DhtKey;

/// Default validity window for a freshly issued router contact.
pub const RC_LIFETIME_MS: u64 = 60 * 60 * 1000;

/// A contact closer to expiry than this is stale and should be refreshed.
pub const FRESH_DELTA_MS: u64 = 60 * 1000;

/// Upper bound on addresses carried by one contact.
/// Anything larger is malformed and rejected before signature checking.
pub const MAX_CONTACT_ADDRS: usize = 8;

/// Wire format version emitted by this implementation.
pub const RC_VERSION: u16 = 1;

/// Returns current time as milliseconds since Unix epoch.
/// Used for issue/expiry stamps in signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn router_id(&self) -> RouterId {
        RouterId::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }

    /// Create a signed router contact for this identity.
    ///
    /// `enc_key` is the router's static x25519 public key used during path
    /// builds; `addrs` are dialable `host:port` strings.
    pub fn create_contact(
        &self,
        addrs: Vec<String>,
        enc_key: [u8; 32],
        allows_exit: bool,
    ) -> RouterContact {
        let issued_at = now_ms();
        let mut rc = RouterContact {
            rid: self.router_id(),
            enc_key,
            addrs,
            version: RC_VERSION,
            allows_exit,
            issued_at,
            expires_at: issued_at + RC_LIFETIME_MS,
            signature: Vec::new(),
        };
        rc.signature = sign_with_domain(self, RC_SIGNATURE_DOMAIN, &rc.signed_payload());
        rc
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("router_id", &self.router_id())
            .finish_non_exhaustive()
    }
}

/// Long-lived public identity of a router.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouterId([u8; 32]);

impl RouterId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// A router id is usable only if it decodes to a real Ed25519 point;
    /// all-zero and junk identities are dropped at the edges.
    pub fn is_valid(&self) -> bool {
        if self.0 == [0u8; 32] || self.0 == [0xffu8; 32] {
            return false;
        }
        VerifyingKey::from_bytes(&self.0).is_ok()
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

impl From<&RouterId> for DhtKey {
    /// Router ids occupy the key space verbatim.
    fn from(rid: &RouterId) -> Self {
        DhtKey::from_bytes(*rid.as_bytes())
    }
}

impl std::fmt::Debug for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterId({}..)", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Signed record describing how to reach a router.
///
/// Contacts are immutable once signed; a refresh issues a replacement with
/// a later `issued_at`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterContact {
    pub rid: RouterId,
    /// Static x25519 public key used to derive per-hop path keys.
    pub enc_key: [u8; 32],
    /// Dialable `host:port` strings, most-preferred first.
    pub addrs: Vec<String>,
    pub version: u16,
    /// Whether this router advertises exit service.
    pub allows_exit: bool,
    /// Milliseconds since Unix epoch.
    pub issued_at: u64,
    pub expires_at: u64,
    /// Ed25519 signature over [`Self::signed_payload`].
    pub signature: Vec<u8>,
}

impl RouterContact {
    pub fn dht_key(&self) -> DhtKey {
        DhtKey::from(&self.rid)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn is_live(&self, now: u64) -> bool {
        !self.is_expired(now)
    }

    /// Live but within the staleness window; the DHT refreshes these
    /// before handing them out.
    pub fn expires_soon(&self, now: u64) -> bool {
        now + FRESH_DELTA_MS >= self.expires_at
    }

    pub fn is_fresh(&self, now: u64) -> bool {
        !self.expires_soon(now)
    }

    /// Structural sanity independent of the signature.
    pub fn validate_structure(&self) -> bool {
        self.rid.is_valid()
            && !self.addrs.is_empty()
            && self.addrs.len() <= MAX_CONTACT_ADDRS
            && self.issued_at < self.expires_at
    }

    /// The canonical bytes the signature covers: everything but the
    /// signature itself.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(self.rid.as_bytes());
        payload.extend_from_slice(&self.enc_key);
        for addr in &self.addrs {
            payload.extend_from_slice(&(addr.len() as u32).to_be_bytes());
            payload.extend_from_slice(addr.as_bytes());
        }
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.push(self.allows_exit as u8);
        payload.extend_from_slice(&self.issued_at.to_be_bytes());
        payload.extend_from_slice(&self.expires_at.to_be_bytes());
        payload
    }

    /// Verify structure and signature. Freshness is checked separately so
    /// callers can distinguish "forged" from "merely old".
    pub fn verify(&self) -> Result<(), SignatureError> {
        if !self.validate_structure() {
            return Err(SignatureError::InvalidPublicKey);
        }
        verify_with_domain(
            &self.rid,
            RC_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
    }

    /// First dialable address, if any.
    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> (Keypair, RouterContact) {
        let kp = Keypair::generate();
        let rc = kp.create_contact(vec!["127.0.0.1:7000".into()], [7u8; 32], false);
        (kp, rc)
    }

    #[test]
    fn contact_signature_verifies() {
        let (_kp, rc) = contact();
        assert!(rc.verify().is_ok());
    }

    #[test]
    fn tampered_contact_fails_verification() {
        let (_kp, mut rc) = contact();
        rc.allows_exit = true;
        assert!(rc.verify().is_err());
    }

    #[test]
    fn contact_from_wrong_key_fails() {
        let (_kp, mut rc) = contact();
        rc.rid = Keypair::generate().router_id();
        assert!(rc.verify().is_err());
    }

    #[test]
    fn liveness_and_freshness_windows() {
        let (_kp, rc) = contact();
        let now = rc.issued_at;
        assert!(rc.is_live(now));
        assert!(rc.is_fresh(now));
        // Inside the staleness window but still live.
        let stale = rc.expires_at - FRESH_DELTA_MS / 2;
        assert!(rc.is_live(stale));
        assert!(rc.expires_soon(stale));
        // Past expiry.
        assert!(rc.is_expired(rc.expires_at));
        assert!(rc.is_expired(rc.expires_at + 1));
    }

    #[test]
    fn structure_rejects_empty_and_oversized_addr_lists() {
        let (_kp, mut rc) = contact();
        rc.addrs.clear();
        assert!(!rc.validate_structure());
        rc.addrs = (0..MAX_CONTACT_ADDRS + 1)
            .map(|i| format!("10.0.0.{i}:9000"))
            .collect();
        assert!(!rc.validate_structure());
    }

    #[test]
    fn router_id_validity() {
        assert!(!RouterId::from_bytes([0u8; 32]).is_valid());
        assert!(!RouterId::from_bytes([0xffu8; 32]).is_valid());
        assert!(Keypair::generate().router_id().is_valid());
    }

    #[test]
    fn router_id_maps_to_key_verbatim() {
        let rid = Keypair::generate().router_id();
        assert_eq!(DhtKey::from(&rid).as_bytes(), rid.as_bytes());
    }
}
