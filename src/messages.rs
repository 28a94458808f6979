//! # Wire Protocol Messages
//!
//! All serializable message types exchanged between routers. Messages are
//! serialized with bincode under strict size limits; every inbound decode
//! goes through [`deserialize_bounded`].
//!
//! ## Taxonomy
//!
//! | Kind | Purpose |
//! |------|---------|
//! | `DhtMessage` | directory traffic: router/introset lookups, publishes, exploration |
//! | `PathBuildFrame` | hop-by-hop circuit construction |
//! | `RelayFrame` | onion-wrapped up/downstream traffic on an existing circuit |
//! | `PathControl` / `PathControlReply` | RPC carried inside relay frames, visible only at the pivot |
//! | `PathDht` | DHT replies travelling back down a local path |
//!
//! A decode failure on any inbound frame is a protocol error: the caller
//! drops the connection rather than guessing.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{OnionNonce, SealedBox};
use crate::identity::{RouterContact, RouterId};
use crate::keys::DhtKey;
use crate::path::HopId;
use crate::service::{EncryptedIntroSet, EncryptedOnsRecord};

/// Maximum size of any single link frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization; slightly above the frame limit
/// to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// Always use this for deserializing untrusted bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_frame(frame: &LinkFrame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<LinkFrame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// DHT Messages
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DhtMessage {
    /// Router contact lookup. `iterative` asks the peer not to forward on
    /// our behalf and to answer with a nearer hint instead.
    FindRouter {
        txid: u64,
        target: DhtKey,
        iterative: bool,
    },
    /// Lookup answer: full contacts when known, nearer router ids as a
    /// hint or exploration result otherwise.
    GotRouter {
        txid: u64,
        rcs: Vec<RouterContact>,
        nearest: Vec<RouterId>,
    },
    FindIntroSet {
        txid: u64,
        location: DhtKey,
        relayed: bool,
        relay_order: u64,
    },
    GotIntroSet {
        txid: u64,
        introset: Option<EncryptedIntroSet>,
    },
    PublishIntroSet {
        txid: u64,
        introset: EncryptedIntroSet,
        relayed: bool,
        relay_order: u64,
    },
    /// Ask a peer for routers useful to a newcomer near `target`.
    ExploreNetwork { txid: u64, target: DhtKey },
}

impl DhtMessage {
    pub fn txid(&self) -> u64 {
        match self {
            DhtMessage::FindRouter { txid, .. }
            | DhtMessage::GotRouter { txid, .. }
            | DhtMessage::FindIntroSet { txid, .. }
            | DhtMessage::GotIntroSet { txid, .. }
            | DhtMessage::PublishIntroSet { txid, .. }
            | DhtMessage::ExploreNetwork { txid, .. } => *txid,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            DhtMessage::FindRouter { .. } => "find_router",
            DhtMessage::GotRouter { .. } => "got_router",
            DhtMessage::FindIntroSet { .. } => "find_introset",
            DhtMessage::GotIntroSet { .. } => "got_introset",
            DhtMessage::PublishIntroSet { .. } => "publish_introset",
            DhtMessage::ExploreNetwork { .. } => "explore_network",
        }
    }
}

/// Zero or more DHT replies travelling back down a local path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathDht {
    pub messages: Vec<DhtMessage>,
}

// ============================================================================
// Path Frames
// ============================================================================

/// Per-hop build record, sealed to the hop's encryption key.
///
/// `upstream` is absent at the pivot. Adjacent hops share an id: this
/// hop's `tx_id` equals the next hop's `rx_id`, which is what makes
/// forwarding a purely local table lookup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecord {
    pub rx_id: HopId,
    pub tx_id: HopId,
    pub upstream: Option<RouterId>,
    /// Symmetric key for this hop's onion layer.
    pub key: [u8; 32],
    pub lifetime_ms: u64,
}

/// Circuit construction frame. Each relay opens `hops[0]`, registers the
/// transit hop, and forwards the remainder upstream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathBuildFrame {
    pub hops: Vec<SealedBox>,
}

/// Onion-wrapped traffic on an established circuit. `hop_id` addresses
/// the receiving relay's local registration; the payload gains or loses
/// one keystream layer per hop.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelayFrame {
    pub hop_id: HopId,
    pub nonce: OnionNonce,
    pub payload: Vec<u8>,
}

/// Everything a link connection can carry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum LinkFrame {
    Dht(DhtMessage),
    PathBuild(PathBuildFrame),
    /// Build confirmation travelling back toward the owner.
    PathBuildReply { hop_id: HopId, ok: bool },
    /// Toward the pivot.
    Upstream(RelayFrame),
    /// Toward the owner.
    Downstream(RelayFrame),
}

// ============================================================================
// Path Control RPC (visible only at the endpoints)
// ============================================================================

/// Control method names carried by [`PathControl`].
pub mod methods {
    pub const LOOKUP_NAME: &str = "lookup_name";
    pub const FIND_INTRO: &str = "find_intro";
    pub const PUBLISH_INTRO: &str = "publish_intro";
    pub const OBTAIN_EXIT: &str = "obtain_exit";
    pub const CLOSE_EXIT: &str = "close_exit";
    pub const UPDATE_EXIT: &str = "update_exit";
    pub const PATH_LATENCY: &str = "path_latency";
    pub const PATH_DHT: &str = "path_dht";
    pub const PATH_CLOSE: &str = "path_close";
}

/// Payload an endpoint finds after all onion layers are stripped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum PathPayload {
    Control(PathControl),
    Reply(PathControlReply),
    Data { body: Vec<u8> },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathControl {
    pub seq: u64,
    pub method: String,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathControlReply {
    pub seq: u64,
    pub body: Vec<u8>,
}

// ============================================================================
// Control Method Bodies
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NameLookupBody {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NameLookupReplyBody {
    pub record: Option<EncryptedOnsRecord>,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FindIntroBody {
    pub location: DhtKey,
    pub relayed: bool,
    pub relay_order: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PublishIntroBody {
    pub introset: EncryptedIntroSet,
    pub relayed: bool,
    pub relay_order: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IntroReplyBody {
    pub introset: Option<EncryptedIntroSet>,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObtainExitBody {
    /// Non-zero requests exit traffic; zero requests snode service only.
    pub flag: u64,
    pub tx_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CloseExitBody {
    pub tx_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateExitBody {
    pub tx_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LatencyBody {
    pub probe_id: u64,
}

/// Generic status reply body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusBody {
    pub status: String,
}

pub const STATUS_OK: &str = "OK";
pub const STATUS_NOT_FOUND: &str = "not found";
pub const STATUS_DENIED: &str = "denied";
pub const STATUS_TIMEOUT: &str = "timeout";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn frame_round_trip() {
        let frame = LinkFrame::Dht(DhtMessage::FindRouter {
            txid: 42,
            target: DhtKey::random(),
            iterative: false,
        });
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn truncated_frame_fails_to_decode() {
        let frame = LinkFrame::Dht(DhtMessage::ExploreNetwork {
            txid: 7,
            target: DhtKey::random(),
        });
        let bytes = encode_frame(&frame).unwrap();
        assert!(decode_frame(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        // A relay frame larger than the deserialize limit must not allocate.
        let frame = LinkFrame::Upstream(RelayFrame {
            hop_id: HopId::random(),
            nonce: [0u8; 16],
            payload: vec![0u8; MAX_FRAME_SIZE * 2],
        });
        let bytes = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .serialize(&frame)
            .unwrap();
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn txid_accessor_covers_all_kinds() {
        let rc = Keypair::generate().create_contact(vec!["127.0.0.1:1".into()], [0u8; 32], false);
        let messages = vec![
            DhtMessage::FindRouter {
                txid: 1,
                target: DhtKey::random(),
                iterative: true,
            },
            DhtMessage::GotRouter {
                txid: 2,
                rcs: vec![rc],
                nearest: vec![],
            },
            DhtMessage::FindIntroSet {
                txid: 3,
                location: DhtKey::random(),
                relayed: false,
                relay_order: 0,
            },
            DhtMessage::GotIntroSet {
                txid: 4,
                introset: None,
            },
            DhtMessage::ExploreNetwork {
                txid: 5,
                target: DhtKey::random(),
            },
        ];
        let txids: Vec<u64> = messages.iter().map(|m| m.txid()).collect();
        assert_eq!(txids, vec![1, 2, 3, 4, 5]);
    }
}
