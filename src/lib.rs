//! # Umbra - Onion-Routed Overlay Network Node
//!
//! Umbra is a relay and client for an anonymizing overlay network. Nodes
//! are identified by long-lived Ed25519 keys, discover each other through
//! a Kademlia-style distributed directory of router contacts and
//! encrypted introduction sets, and tunnel traffic over multi-hop
//! onion-encrypted paths to hidden services and exit routers.
//!
//! ## Architecture
//!
//! All control-plane state lives on a **single event loop**: a router
//! actor owns the node db, the DHT handler, the path registry and the
//! path builders, and processes posted closures, inbound link frames and
//! a one-second maintenance tick strictly in order. Cross-task access
//! goes through the cloneable [`router::Router`] handle (`call_soon` /
//! `call_every`); disk IO runs on a blocking pool and re-enters the loop
//! as posted closures.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `keys` | 256-bit DHT key space with XOR metric |
//! | `identity` | Ed25519 keypairs, router ids, signed router contacts |
//! | `service` | Hidden-service addresses, ONS names, encrypted introsets |
//! | `crypto` | Signatures, hop keys, onion layers, sealed records, link TLS |
//! | `bucket` | DHT node storage with nearest-N queries |
//! | `nodedb` | Persistent router contact store behind a disk-IO queue |
//! | `transactions` | Pending lookup tracker keyed by `(peer, txid)` |
//! | `messages` | Wire message taxonomy, bounded bincode codec |
//! | `dht` | DHT message handler: lookups, exploration, publication |
//! | `path` | One onion circuit: layered encryption, control RPC, liveness |
//! | `path_context` | Own-path and transit-hop registries, build rate limit |
//! | `path_handler` | Per-consumer path builder |
//! | `remote` | Name/introset fan-out and session initiation |
//! | `profiles` | Router reputation |
//! | `link` | QUIC transport with identity-bound TLS |
//! | `router` | The event loop and node state |
//! | `config` / `context` | Configuration and the outer run shell |

pub mod bucket;
pub mod config;
pub mod context;
pub mod crypto;
pub mod dht;
pub mod identity;
pub mod keys;
pub mod link;
pub mod messages;
pub mod nodedb;
pub mod path;
pub mod path_context;
pub mod path_handler;
pub mod profiles;
pub mod remote;
pub mod router;
pub mod service;
pub mod transactions;

pub use config::{Config, ConfigError};
pub use context::{Context, RuntimeOptions, Signal};
pub use identity::{Keypair, RouterContact, RouterId};
pub use keys::DhtKey;
pub use router::Router;
pub use service::NetworkAddress;
