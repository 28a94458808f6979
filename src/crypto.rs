//! # Cryptographic Infrastructure
//!
//! Crypto primitives shared across the node:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **Hop keys**: x25519 agreement between a path owner and each hop's
//!   static encryption key, hashed down to a per-hop symmetric key
//! - **Onion layers**: AES-256-CTR keystreams, one per hop; applying a
//!   hop's keystream twice cancels it, which is what layered wrapping and
//!   peeling rely on
//! - **Sealed records**: AES-256-GCM for introsets, ONS records and path
//!   build frames; decryption failure doubles as wrong-key detection
//! - **Link TLS**: self-signed Ed25519 certificates binding a QUIC
//!   connection to the peer's router id
//!
//! ## Identity binding
//!
//! The TLS layer carries no CA trust. Each side presents a self-signed
//! certificate whose subject public key *is* its router id; verifiers
//! accept the handshake only if that key matches the id the dialer asked
//! for (encoded in the SNI) or, server-side, is a structurally valid
//! Ed25519 point.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{Context, Result};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::identity::{Keypair, RouterId};

/// AES-256 in counter mode; the onion layer cipher for path frames.
type OnionCipher = ctr::Ctr128BE<aes::Aes256>;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures, shared by router
/// contacts and introduction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// Each signed record type uses a unique prefix so a signature can never be
// replayed in a different context.

/// Domain separation prefix for router contact signatures.
pub const RC_SIGNATURE_DOMAIN: &[u8] = b"umbra-rc-v1:";

/// Domain separation prefix for encrypted introset signatures.
pub const INTROSET_SIGNATURE_DOMAIN: &[u8] = b"umbra-introset-v1:";

/// KDF context for per-hop path keys.
const HOP_KEY_CONTEXT: &str = "umbra path hop key v1";

/// KDF context for sealed-box keys (build frames).
const SEALED_BOX_CONTEXT: &str = "umbra sealed box v1";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign `data` with the given domain prefix prepended.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated Ed25519 signature claimed by `signer`.
pub fn verify_with_domain(
    signer: &RouterId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    verify_with_domain_raw(signer.as_bytes(), domain, data, signature)
}

/// Same as [`verify_with_domain`] for raw 32-byte signer keys (introset
/// signers are not router ids).
pub fn verify_with_domain_raw(
    signer: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key =
        VerifyingKey::from_bytes(signer).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Hop Keys and Onion Layers
// ============================================================================

/// Nonce carried by every onion-wrapped frame.
pub const ONION_NONCE_LEN: usize = 16;

pub type OnionNonce = [u8; ONION_NONCE_LEN];

/// Fresh random nonce for an outbound onion frame.
pub fn random_onion_nonce() -> OnionNonce {
    let mut nonce = [0u8; ONION_NONCE_LEN];
    if getrandom::getrandom(&mut nonce).is_err() {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut nonce);
    }
    nonce
}

/// Generate the node's static x25519 encryption keypair.
pub fn generate_encryption_secret() -> StaticSecret {
    StaticSecret::random_from_rng(rand::rngs::OsRng)
}

pub fn encryption_public_key(secret: &StaticSecret) -> [u8; 32] {
    PublicKey::from(secret).to_bytes()
}

/// Derive the symmetric key shared between a path owner's ephemeral key
/// and one hop's static encryption key. Both sides compute the same value.
pub fn derive_hop_key_static(secret: &StaticSecret, peer_public: &[u8; 32]) -> [u8; 32] {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    blake3::derive_key(HOP_KEY_CONTEXT, shared.as_bytes())
}

/// Apply one hop's keystream over `buf` in place.
///
/// CTR mode is its own inverse, so the same call both adds and strips a
/// layer; the direction is a matter of bookkeeping, not of cipher state.
pub fn apply_onion_layer(key: &[u8; 32], nonce: &OnionNonce, buf: &mut [u8]) {
    let mut cipher = OnionCipher::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

// ============================================================================
// Sealed Records (AES-256-GCM)
// ============================================================================

/// Error type for sealed-record operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// Authentication failed: wrong key, wrong nonce or tampered data.
    OpenFailed,
    /// Encryption failed (never expected with valid inputs).
    SealFailed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::OpenFailed => write!(f, "sealed record failed to open"),
            SealError::SealFailed => write!(f, "sealing failed"),
        }
    }
}

impl std::error::Error for SealError {}

/// GCM nonce length.
pub const SEAL_NONCE_LEN: usize = 12;

pub type SealNonce = [u8; SEAL_NONCE_LEN];

pub fn random_seal_nonce() -> SealNonce {
    let mut nonce = [0u8; SEAL_NONCE_LEN];
    if getrandom::getrandom(&mut nonce).is_err() {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut nonce);
    }
    nonce
}

/// Derive a sealing key from arbitrary material under a caller-chosen
/// context string (service addresses, ONS names).
pub fn derive_record_key(context: &str, material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, material)
}

pub fn seal(
    key: &[u8; 32],
    nonce: &SealNonce,
    plaintext: &[u8],
) -> std::result::Result<Vec<u8>, SealError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| SealError::SealFailed)
}

pub fn open(
    key: &[u8; 32],
    nonce: &SealNonce,
    ciphertext: &[u8],
) -> std::result::Result<Vec<u8>, SealError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::OpenFailed)
}

/// A record sealed to a recipient's static x25519 key with a one-shot
/// ephemeral key. Used for per-hop path build records.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SealedBox {
    pub ephemeral: [u8; 32],
    pub nonce: SealNonce,
    pub ciphertext: Vec<u8>,
}

pub fn seal_to(
    recipient: &[u8; 32],
    plaintext: &[u8],
) -> std::result::Result<SealedBox, SealError> {
    let eph = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pub = PublicKey::from(&eph).to_bytes();
    let shared = eph.diffie_hellman(&PublicKey::from(*recipient));
    let key = blake3::derive_key(SEALED_BOX_CONTEXT, shared.as_bytes());
    let nonce = random_seal_nonce();
    let ciphertext = seal(&key, &nonce, plaintext)?;
    Ok(SealedBox {
        ephemeral: eph_pub,
        nonce,
        ciphertext,
    })
}

pub fn open_sealed(
    secret: &StaticSecret,
    sealed: &SealedBox,
) -> std::result::Result<Vec<u8>, SealError> {
    let shared = secret.diffie_hellman(&PublicKey::from(sealed.ephemeral));
    let key = blake3::derive_key(SEALED_BOX_CONTEXT, shared.as_bytes());
    open(&key, &sealed.nonce, &sealed.ciphertext)
}

// ============================================================================
// Link TLS (QUIC certificates bound to router ids)
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for all link connections.
pub const ALPN: &[u8] = b"umbra";

pub fn generate_link_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    // Minimal PKCS#8 v1 wrapping of the raw Ed25519 seed.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to build Ed25519 key pair for link certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["umbra".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign link certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let client_cert_verifier = Arc::new(RouterClientCertVerifier);
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config exclusively owned right after creation");
    transport_config.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .expect("60s fits in a VarInt duration"),
    ));
    transport_config.max_concurrent_uni_streams(64u32.into());

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RouterServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;

    let mut client_crypto = client_crypto;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Router id a live QUIC connection authenticated as, if any.
pub fn extract_verified_router_id(connection: &quinn::Connection) -> Option<RouterId> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    let rid = RouterId::from_bytes(public_key);
    rid.is_valid().then_some(rid)
}

/// SNI encoding of a router id: hex split into two DNS labels to stay
/// under the 63-byte label limit.
pub(crate) fn router_id_to_sni(rid: &RouterId) -> String {
    let hex = rid.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn router_id_from_sni(sni: &str) -> Option<RouterId> {
    let hex_str: String = sni.split('.').collect();
    let bytes = hex::decode(&hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Some(RouterId::from_bytes(arr))
}

#[derive(Debug)]
struct RouterClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for RouterClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if !RouterId::from_bytes(public_key).is_valid() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct RouterServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for RouterServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let expected_sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        };

        let expected = router_id_from_sni(expected_sni).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;

        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if RouterId::from_bytes(public_key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
