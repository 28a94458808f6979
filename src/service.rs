//! # Hidden-Service Records
//!
//! Types describing remote hidden-service endpoints:
//!
//! - [`NetworkAddress`]: a service's public identity plus its `.loki` text
//!   form
//! - [`IntroSet`] / [`Introduction`]: the cleartext rendezvous description
//!   (which pivot routers terminate the service's paths)
//! - [`EncryptedIntroSet`]: the publishable form, sealed under a key only
//!   holders of the clear address can derive, signed by a signer key that
//!   hashes to its DHT location
//! - [`EncryptedOnsRecord`]: a name-lookup response sealed under the
//!   queried ONS name; decryption failure means the response was not for
//!   that name
//!
//! ## Location binding
//!
//! An introset is stored at `location = blake3(signer)`. Both the service
//! and its clients derive `signer` from the clear address, so lookups and
//! publishes land on the same replica set while the DHT itself learns
//! nothing about the address. Storage nodes verify the hash binding and
//! the signature but can decrypt nothing.

use serde::{Deserialize, Serialize};

use crate::crypto::{
    self, derive_record_key, verify_with_domain_raw, SealNonce, INTROSET_SIGNATURE_DOMAIN,
};
use crate::identity::{Keypair, RouterId};
use crate::keys::DhtKey;
use crate::path::HopId;

/// Textual suffix of ONS names.
pub const ONS_SUFFIX: &str = ".loki";

/// Validity window for a freshly sealed introset.
pub const INTROSET_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// KDF context for introset sealing keys.
const INTROSET_SEAL_CONTEXT: &str = "umbra introset v1";

/// KDF context for ONS record sealing keys.
const ONS_SEAL_CONTEXT: &str = "umbra ons record v1";

/// KDF context for the address-derived introset signer seed.
const DERIVED_SIGNER_CONTEXT: &str = "umbra derived signer v1";

/// Check ONS name syntax: a single lower-case label of letters, digits and
/// interior hyphens, 1-63 bytes, followed by `.loki`.
pub fn is_valid_ons(name: &str) -> bool {
    let Some(label) = name.strip_suffix(ONS_SUFFIX) else {
        return false;
    };
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Public identity of a hidden service (or service-node endpoint).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress([u8; 32]);

impl NetworkAddress {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The address-derived signer key: the public half of an Ed25519 key
    /// whose seed is derived from the clear address. Anyone who knows the
    /// address can compute it; the DHT only ever sees the result.
    pub fn derived_signer(&self) -> [u8; 32] {
        self.derived_signer_keypair().public_key_bytes()
    }

    pub(crate) fn derived_signer_keypair(&self) -> Keypair {
        let seed = blake3::derive_key(DERIVED_SIGNER_CONTEXT, &self.0);
        Keypair::from_secret_key_bytes(&seed)
    }

    /// DHT location of this address's introset.
    pub fn dht_key(&self) -> DhtKey {
        DhtKey::from_bytes(*blake3::hash(&self.derived_signer()).as_bytes())
    }
}

impl std::fmt::Debug for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkAddress({}..)", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", hex::encode(self.0), ONS_SUFFIX)
    }
}

impl std::str::FromStr for NetworkAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.strip_suffix(ONS_SUFFIX).ok_or(AddressParseError)?;
        let bytes = hex::decode(label).map_err(|_| AddressParseError)?;
        if bytes.len() != 32 {
            return Err(AddressParseError);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParseError;

impl std::fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not a valid network address")
    }
}

impl std::error::Error for AddressParseError {}

/// One rendezvous point of a hidden service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Introduction {
    /// Pivot router terminating one of the service's paths.
    pub pivot: RouterId,
    /// Hop id to address on that pivot.
    pub path_id: HopId,
    /// Milliseconds since Unix epoch.
    pub expires_at: u64,
}

/// Cleartext introset: what a client learns after decrypting.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntroSet {
    pub address: NetworkAddress,
    pub intros: Vec<Introduction>,
}

/// Publishable, sealed introset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedIntroSet {
    /// DHT location; must equal `blake3(signer)`.
    pub location: DhtKey,
    /// Address-derived Ed25519 signer.
    pub signer: [u8; 32],
    pub nonce: SealNonce,
    pub ciphertext: Vec<u8>,
    /// Milliseconds since Unix epoch.
    pub signed_at: u64,
    pub expires_at: u64,
    pub signature: Vec<u8>,
}

impl EncryptedIntroSet {
    /// Seal and sign an introset for publication.
    pub fn seal(introset: &IntroSet, now: u64) -> Result<Self, crypto::SealError> {
        let address = introset.address;
        let key = derive_record_key(INTROSET_SEAL_CONTEXT, address.as_bytes());
        let nonce = crypto::random_seal_nonce();
        let plaintext =
            bincode::serialize(introset).map_err(|_| crypto::SealError::SealFailed)?;
        let ciphertext = crypto::seal(&key, &nonce, &plaintext)?;

        let signer_keypair = address.derived_signer_keypair();
        let mut out = Self {
            location: address.dht_key(),
            signer: signer_keypair.public_key_bytes(),
            nonce,
            ciphertext,
            signed_at: now,
            expires_at: now + INTROSET_LIFETIME_MS,
            signature: Vec::new(),
        };
        out.signature = crypto::sign_with_domain(
            &signer_keypair,
            INTROSET_SIGNATURE_DOMAIN,
            &out.signed_payload(),
        );
        Ok(out)
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(96 + self.ciphertext.len());
        payload.extend_from_slice(self.location.as_bytes());
        payload.extend_from_slice(&self.signer);
        payload.extend_from_slice(&self.nonce);
        payload.extend_from_slice(&self.ciphertext);
        payload.extend_from_slice(&self.signed_at.to_be_bytes());
        payload.extend_from_slice(&self.expires_at.to_be_bytes());
        payload
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Storage-node validation: location binding, signature, expiry.
    /// Requires no knowledge of the clear address.
    pub fn verify(&self, now: u64) -> bool {
        if self.is_expired(now) {
            return false;
        }
        if blake3::hash(&self.signer).as_bytes() != self.location.as_bytes() {
            return false;
        }
        verify_with_domain_raw(
            &self.signer,
            INTROSET_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
        .is_ok()
    }

    /// Client-side decryption under the clear address. `None` for a wrong
    /// address, tampered ciphertext or an inner/outer address mismatch.
    pub fn decrypt(&self, address: &NetworkAddress) -> Option<IntroSet> {
        let key = derive_record_key(INTROSET_SEAL_CONTEXT, address.as_bytes());
        let plaintext = crypto::open(&key, &self.nonce, &self.ciphertext).ok()?;
        let introset: IntroSet = crate::messages::deserialize_bounded(&plaintext).ok()?;
        (introset.address == *address).then_some(introset)
    }
}

/// ONS lookup response: a network address sealed under the queried name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedOnsRecord {
    pub nonce: SealNonce,
    pub ciphertext: Vec<u8>,
}

impl EncryptedOnsRecord {
    pub fn seal(address: &NetworkAddress, name: &str) -> Result<Self, crypto::SealError> {
        let key = derive_record_key(ONS_SEAL_CONTEXT, name.as_bytes());
        let nonce = crypto::random_seal_nonce();
        let ciphertext = crypto::seal(&key, &nonce, address.as_bytes())?;
        Ok(Self { nonce, ciphertext })
    }

    /// Decrypts only under the name the record was sealed for.
    pub fn decrypt(&self, name: &str) -> Option<NetworkAddress> {
        let key = derive_record_key(ONS_SEAL_CONTEXT, name.as_bytes());
        let plaintext = crypto::open(&key, &self.nonce, &self.ciphertext).ok()?;
        let bytes: [u8; 32] = plaintext.try_into().ok()?;
        Some(NetworkAddress::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> NetworkAddress {
        NetworkAddress::from_bytes(*Keypair::generate().router_id().as_bytes())
    }

    fn introset(addr: NetworkAddress) -> IntroSet {
        IntroSet {
            address: addr,
            intros: vec![Introduction {
                pivot: Keypair::generate().router_id(),
                path_id: HopId::random(),
                expires_at: 10_000,
            }],
        }
    }

    #[test]
    fn ons_name_validation() {
        assert!(is_valid_ons("alice.loki"));
        assert!(is_valid_ons("a-1-b.loki"));
        assert!(!is_valid_ons("alice"));
        assert!(!is_valid_ons(".loki"));
        assert!(!is_valid_ons("Alice.loki"));
        assert!(!is_valid_ons("-alice.loki"));
        assert!(!is_valid_ons("alice-.loki"));
        assert!(!is_valid_ons(&format!("{}.loki", "a".repeat(64))));
    }

    #[test]
    fn address_text_round_trip() {
        let addr = address();
        let parsed: NetworkAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("nothex.loki".parse::<NetworkAddress>().is_err());
    }

    #[test]
    fn sealed_introset_verifies_and_decrypts() {
        let addr = address();
        let iset = introset(addr);
        let sealed = EncryptedIntroSet::seal(&iset, 1_000).unwrap();
        assert!(sealed.verify(1_000));
        assert_eq!(sealed.location, addr.dht_key());
        assert_eq!(sealed.decrypt(&addr), Some(iset));
    }

    #[test]
    fn introset_rejects_wrong_address() {
        let addr = address();
        let sealed = EncryptedIntroSet::seal(&introset(addr), 1_000).unwrap();
        assert_eq!(sealed.decrypt(&address()), None);
    }

    #[test]
    fn introset_verification_catches_tampering_and_expiry() {
        let addr = address();
        let mut sealed = EncryptedIntroSet::seal(&introset(addr), 1_000).unwrap();
        assert!(!sealed.verify(sealed.expires_at));

        sealed.expires_at += 1;
        assert!(!sealed.verify(1_000), "signature must cover expiry");

        let mut wrong_location = EncryptedIntroSet::seal(&introset(addr), 1_000).unwrap();
        wrong_location.location = DhtKey::random();
        assert!(!wrong_location.verify(1_000));
    }

    #[test]
    fn ons_record_decrypts_only_under_its_name() {
        let addr = address();
        let record = EncryptedOnsRecord::seal(&addr, "alice.loki").unwrap();
        assert_eq!(record.decrypt("alice.loki"), Some(addr));
        assert_eq!(record.decrypt("bob.loki"), None);
    }
}
