//! # Remote Handler
//!
//! Resolves names and introsets for remote endpoints by fanning queries
//! out over every established path of its path handler, and initiates
//! sessions to hidden services and exits.
//!
//! ## Fan-out contract
//!
//! One query goes to every ready path in parallel. The first response
//! that decrypts under the queried name (or address) wins and fires the
//! callback; later successes are ignored. Only when every path has
//! answered or timed out without a decryptable record does the callback
//! fire with `None`; exactly once either way.
//!
//! Fan-out bookkeeping lives behind a mutex shared with the per-path
//! response hooks; this is the one lock in the control plane, the
//! counterpart of the original's paths-map lock, and it is only ever
//! taken from the event loop.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::link::LinkSender;
use crate::messages::{IntroReplyBody, NameLookupReplyBody};
use crate::path::{HandlerId, HopId};
use crate::path_context::PathContext;
use crate::path_handler::PathHandler;
use crate::service::{is_valid_ons, IntroSet, NetworkAddress};

/// Completion callback for a name resolution.
pub type NameCallback = Box<dyn FnOnce(Option<NetworkAddress>) + Send>;

/// Completion callback for an introset lookup.
pub type IntroCallback = Box<dyn FnOnce(Option<IntroSet>) + Send>;

/// Session initiation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Exit and service-node sessions are mutually exclusive.
    ExitToSnode,
    /// No established path to query over.
    NoPaths,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::ExitToSnode => {
                write!(f, "cannot initiate exit session to a service node")
            }
            SessionError::NoPaths => write!(f, "no established paths"),
        }
    }
}

impl std::error::Error for SessionError {}

/// An IP range mapped to a remote endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IpRange {
    pub base: IpAddr,
    pub prefix_len: u8,
}

impl std::fmt::Display for IpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

struct NameFanout {
    name: String,
    outstanding: usize,
    done: bool,
    callback: Option<NameCallback>,
}

struct IntroFanout {
    address: NetworkAddress,
    outstanding: usize,
    done: bool,
    callback: Option<IntroCallback>,
}

#[derive(Default)]
struct FanoutTable {
    names: HashMap<u64, NameFanout>,
    intros: HashMap<u64, IntroFanout>,
    next_id: u64,
}

impl FanoutTable {
    fn next_id(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

pub struct RemoteHandler {
    name: String,
    handler_id: HandlerId,
    fanouts: Arc<Mutex<FanoutTable>>,
    /// Remote endpoints whose introsets resolved during session setup.
    active_sessions: Arc<Mutex<HashMap<NetworkAddress, bool>>>,
    address_map: HashMap<SocketAddr, NetworkAddress>,
    address_map_inverse: HashMap<NetworkAddress, SocketAddr>,
    range_map: HashMap<IpRange, NetworkAddress>,
    range_map_inverse: HashMap<NetworkAddress, IpRange>,
}

impl RemoteHandler {
    pub fn new(name: impl Into<String>, handler_id: HandlerId) -> Self {
        Self {
            name: name.into(),
            handler_id,
            fanouts: Arc::new(Mutex::new(FanoutTable::default())),
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            address_map: HashMap::new(),
            address_map_inverse: HashMap::new(),
            range_map: HashMap::new(),
            range_map_inverse: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler_id
    }

    fn ready_paths(
        handler: &PathHandler,
        paths: &PathContext,
        now: Instant,
    ) -> Vec<HopId> {
        handler
            .path_keys()
            .into_iter()
            .filter(|k| paths.get_path(k).is_some_and(|p| p.is_ready(now)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Name resolution
    // ------------------------------------------------------------------

    /// Resolve an ONS name over every ready path. The callback fires
    /// exactly once: with the address from the first response that
    /// decrypts under `name`, or with `None` when every path has failed.
    pub fn resolve_ons(
        &mut self,
        name: &str,
        callback: NameCallback,
        handler: &PathHandler,
        paths: &mut PathContext,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        if !is_valid_ons(name) {
            debug!(name, "invalid ons name queried for lookup");
            return callback(None);
        }
        let ready = Self::ready_paths(handler, paths, now);
        if ready.is_empty() {
            debug!(handler = %self.name, name, "no ready paths for name lookup");
            return callback(None);
        }
        debug!(handler = %self.name, name, paths = ready.len(), "looking up ons name");

        let id = {
            let mut table = self.fanouts.lock().unwrap();
            let id = table.next_id();
            table.names.insert(
                id,
                NameFanout {
                    name: name.to_string(),
                    outstanding: ready.len(),
                    done: false,
                    callback: Some(callback),
                },
            );
            id
        };

        for key in ready {
            let Some(path) = paths.get_path_mut(&key) else {
                Self::finish_name(&self.fanouts, id, None);
                continue;
            };
            info!(
                handler = %self.name,
                pivot = %path.pivot_rid(),
                name,
                "querying pivot for name lookup"
            );
            let fanouts = self.fanouts.clone();
            path.resolve_ons(
                name,
                Box::new(move |body, _timed_out| {
                    Self::finish_name(&fanouts, id, body);
                }),
                link,
                now,
            );
        }
    }

    fn finish_name(fanouts: &Arc<Mutex<FanoutTable>>, id: u64, body: Option<Vec<u8>>) {
        // The callback fires outside the lock so it may freely post new
        // lookups.
        let mut fire: Option<(NameCallback, Option<NetworkAddress>)> = None;
        {
            let mut table = fanouts.lock().unwrap();
            let Some(fanout) = table.names.get_mut(&id) else {
                return;
            };
            fanout.outstanding = fanout.outstanding.saturating_sub(1);
            if !fanout.done {
                if let Some(address) = body.as_deref().and_then(|bytes| {
                    let reply: NameLookupReplyBody =
                        crate::messages::deserialize_bounded(bytes).ok()?;
                    reply.record?.decrypt(&fanout.name)
                }) {
                    fanout.done = true;
                    if let Some(callback) = fanout.callback.take() {
                        fire = Some((callback, Some(address)));
                    }
                }
            }
            if fanout.outstanding == 0 {
                let fanout = table.names.remove(&id).expect("entry present");
                if let Some(callback) = fanout.callback {
                    warn!(name = %fanout.name, "name lookup failed on every path");
                    fire = Some((callback, None));
                }
            }
        }
        if let Some((callback, result)) = fire {
            callback(result);
        }
    }

    // ------------------------------------------------------------------
    // Introset lookup
    // ------------------------------------------------------------------

    /// Fetch the introset for `remote`, fanning out over every ready
    /// path; the first response that decrypts under the address wins.
    pub fn lookup_intro(
        &mut self,
        remote: NetworkAddress,
        is_relayed: bool,
        order: u64,
        callback: IntroCallback,
        handler: &PathHandler,
        paths: &mut PathContext,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        let ready = Self::ready_paths(handler, paths, now);
        if ready.is_empty() {
            debug!(handler = %self.name, remote = %remote, "no ready paths for introset lookup");
            return callback(None);
        }
        let location = remote.dht_key();
        debug!(handler = %self.name, remote = %remote, paths = ready.len(), "looking up introset");

        let id = {
            let mut table = self.fanouts.lock().unwrap();
            let id = table.next_id();
            table.intros.insert(
                id,
                IntroFanout {
                    address: remote,
                    outstanding: ready.len(),
                    done: false,
                    callback: Some(callback),
                },
            );
            id
        };

        for key in ready {
            let Some(path) = paths.get_path_mut(&key) else {
                Self::finish_intro(&self.fanouts, id, None);
                continue;
            };
            info!(
                handler = %self.name,
                pivot = %path.pivot_rid(),
                remote = %remote,
                "querying pivot for introset lookup"
            );
            let fanouts = self.fanouts.clone();
            path.find_intro(
                location,
                is_relayed,
                order,
                Box::new(move |body, _timed_out| {
                    Self::finish_intro(&fanouts, id, body);
                }),
                link,
                now,
            );
        }
    }

    fn finish_intro(fanouts: &Arc<Mutex<FanoutTable>>, id: u64, body: Option<Vec<u8>>) {
        let mut fire: Option<(IntroCallback, Option<IntroSet>)> = None;
        {
            let mut table = fanouts.lock().unwrap();
            let Some(fanout) = table.intros.get_mut(&id) else {
                return;
            };
            fanout.outstanding = fanout.outstanding.saturating_sub(1);
            if !fanout.done {
                if let Some(introset) = body.as_deref().and_then(|bytes| {
                    let reply: IntroReplyBody =
                        crate::messages::deserialize_bounded(bytes).ok()?;
                    reply.introset?.decrypt(&fanout.address)
                }) {
                    fanout.done = true;
                    if let Some(callback) = fanout.callback.take() {
                        fire = Some((callback, Some(introset)));
                    }
                }
            }
            if fanout.outstanding == 0 {
                let fanout = table.intros.remove(&id).expect("entry present");
                if let Some(callback) = fanout.callback {
                    warn!(remote = %fanout.address, "introset lookup failed on every path");
                    fire = Some((callback, None));
                }
            }
        }
        if let Some((callback, result)) = fire {
            callback(result);
        }
    }

    // ------------------------------------------------------------------
    // Session initiation
    // ------------------------------------------------------------------

    /// Kick off a session to `remote`. Rejects exit sessions to service
    /// nodes outright; otherwise resolves the introset and hands the
    /// result to session negotiation.
    pub fn initiate_session(
        &mut self,
        remote: NetworkAddress,
        is_exit: bool,
        is_snode: bool,
        handler: &PathHandler,
        paths: &mut PathContext,
        link: &dyn LinkSender,
        now: Instant,
    ) -> Result<(), SessionError> {
        if is_exit && is_snode {
            return Err(SessionError::ExitToSnode);
        }
        let sessions = self.active_sessions.clone();
        self.lookup_intro(
            remote,
            false,
            0,
            Box::new(move |introset| match introset {
                Some(introset) => {
                    info!(
                        remote = %introset.address,
                        intros = introset.intros.len(),
                        is_exit,
                        "introset resolved, negotiating session"
                    );
                    sessions.lock().unwrap().insert(remote, is_exit);
                }
                None => {
                    warn!(remote = %remote, "session initiation failed: no introset");
                }
            }),
            handler,
            paths,
            link,
            now,
        );
        Ok(())
    }

    pub fn has_session(&self, remote: &NetworkAddress) -> bool {
        self.active_sessions.lock().unwrap().contains_key(remote)
    }

    // ------------------------------------------------------------------
    // Address maps
    // ------------------------------------------------------------------

    /// Bind a local address to a remote endpoint, replacing any previous
    /// binding of either side.
    pub fn map_remote_to_local_addr(&mut self, remote: NetworkAddress, local: SocketAddr) {
        if let Some(old_local) = self.address_map_inverse.insert(remote, local) {
            self.address_map.remove(&old_local);
        }
        if let Some(old_remote) = self.address_map.insert(local, remote) {
            if old_remote != remote {
                self.address_map_inverse.remove(&old_remote);
            }
        }
    }

    pub fn unmap_local_addr_by_remote(&mut self, remote: &NetworkAddress) {
        if let Some(local) = self.address_map_inverse.remove(remote) {
            self.address_map.remove(&local);
        }
    }

    pub fn local_addr_for_remote(&self, remote: &NetworkAddress) -> Option<SocketAddr> {
        self.address_map_inverse.get(remote).copied()
    }

    pub fn remote_for_local_addr(&self, local: &SocketAddr) -> Option<NetworkAddress> {
        self.address_map.get(local).copied()
    }

    pub fn map_remote_to_local_range(&mut self, remote: NetworkAddress, range: IpRange) {
        if let Some(old_range) = self.range_map_inverse.insert(remote, range) {
            self.range_map.remove(&old_range);
        }
        if let Some(old_remote) = self.range_map.insert(range, remote) {
            if old_remote != remote {
                self.range_map_inverse.remove(&old_remote);
            }
        }
    }

    pub fn unmap_local_range_by_remote(&mut self, remote: &NetworkAddress) {
        if let Some(range) = self.range_map_inverse.remove(remote) {
            self.range_map.remove(&range);
        }
    }

    pub fn remote_for_range(&self, range: &IpRange) -> Option<NetworkAddress> {
        self.range_map.get(range).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::dht::testenv::TestNode;
    use crate::identity::Keypair;
    use crate::messages::{LinkFrame, PathControlReply, PathPayload, RelayFrame};
    use crate::path_handler::PathRole;
    use crate::service::{EncryptedIntroSet, EncryptedOnsRecord, Introduction};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn remote_address() -> NetworkAddress {
        NetworkAddress::from_bytes(*Keypair::generate().router_id().as_bytes())
    }

    /// A node with `n` established paths registered to a handler.
    fn node_with_paths(n: usize) -> (TestNode, PathHandler, RemoteHandler) {
        let mut node = TestNode::new();
        let mut dht = node.handler();
        for _ in 0..8 {
            node.seed_contact(&mut dht);
        }
        let mut handler =
            PathHandler::with_default_len(HandlerId(1), "remote", n, PathRole::General);
        let mut env = crate::path_handler::HandlerEnv {
            node_db: &node.node_db,
            paths: &mut node.paths,
            profiles: &node.profiles,
            link: &node.link,
            now: node.now,
            now_ms: crate::identity::now_ms(),
        };
        assert_eq!(handler.build_more(n, &mut env), n);
        drop(env);
        for key in handler.path_keys() {
            node.paths.get_path_mut(&key).unwrap().mark_established(node.now);
            handler.handle_path_built(key);
        }
        node.link.clear();
        let remote = RemoteHandler::new("remote", HandlerId(1));
        (node, handler, remote)
    }

    /// Deliver `reply` to the path as a fully-layered downstream frame,
    /// as if every relay had added its keystream on the way back.
    fn deliver_reply(node: &mut TestNode, key: &HopId, reply: PathControlReply) {
        let nonce = crypto::random_onion_nonce();
        let mut bytes = bincode::serialize(&PathPayload::Reply(reply)).unwrap();
        let path = node.paths.get_path(key).unwrap();
        let hop_keys = path.hop_keys();
        let hop_id = path.upstream_rx_id();
        for hop_key in hop_keys.iter().rev() {
            crypto::apply_onion_layer(hop_key, &nonce, &mut bytes);
        }
        let now = node.now;
        node.paths.get_path_mut(key).unwrap().on_downstream(
            RelayFrame {
                hop_id,
                nonce,
                payload: bytes,
            },
            now,
        );
    }

    /// Sequence of the most recent control sent over this path.
    fn control_seq(node: &TestNode, key: &HopId) -> u64 {
        node.paths.get_path(key).unwrap().last_seq()
    }

    #[test]
    fn invalid_name_resolves_none_immediately() {
        let (mut node, handler, mut remote) = node_with_paths(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        remote.resolve_ons(
            "Not_An_Ons_Name",
            Box::new(move |result| {
                assert!(result.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(node.link.sent().is_empty(), "no queries for invalid names");
    }

    #[test]
    fn no_ready_paths_resolves_none() {
        let mut node = TestNode::new();
        let handler = PathHandler::with_default_len(HandlerId(1), "remote", 2, PathRole::General);
        let mut remote = RemoteHandler::new("remote", HandlerId(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        remote.resolve_ons(
            "alice.loki",
            Box::new(move |result| {
                assert!(result.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fan_out_queries_every_ready_path() {
        let (mut node, handler, mut remote) = node_with_paths(3);
        remote.resolve_ons(
            "alice.loki",
            Box::new(|_| {}),
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );
        let upstream_frames = node
            .link
            .sent()
            .into_iter()
            .filter(|(_, f)| matches!(f, LinkFrame::Upstream(_)))
            .count();
        assert_eq!(upstream_frames, 3);
    }

    #[test]
    fn first_decryptable_response_wins_and_is_idempotent() {
        let (mut node, handler, mut remote) = node_with_paths(2);
        let target = remote_address();
        let results: Arc<Mutex<Vec<Option<NetworkAddress>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        remote.resolve_ons(
            "alice.loki",
            Box::new(move |result| {
                sink.lock().unwrap().push(result);
            }),
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );

        let keys = handler.path_keys();
        let record = EncryptedOnsRecord::seal(&target, "alice.loki").unwrap();
        let good = bincode::serialize(&NameLookupReplyBody {
            record: Some(record),
            status: "OK".into(),
        })
        .unwrap();
        let seq0 = control_seq(&node, &keys[0]);
        deliver_reply(
            &mut node,
            &keys[0],
            PathControlReply {
                seq: seq0,
                body: good.clone(),
            },
        );
        assert_eq!(results.lock().unwrap().as_slice(), &[Some(target)]);

        // The second path's answer changes nothing.
        let seq1 = control_seq(&node, &keys[1]);
        deliver_reply(
            &mut node,
            &keys[1],
            PathControlReply {
                seq: seq1,
                body: good,
            },
        );
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn all_failures_resolve_none_once() {
        let (mut node, handler, mut remote) = node_with_paths(2);
        let results: Arc<Mutex<Vec<Option<NetworkAddress>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        remote.resolve_ons(
            "alice.loki",
            Box::new(move |result| {
                sink.lock().unwrap().push(result);
            }),
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );

        // A record sealed for a different name does not decrypt.
        let wrong = bincode::serialize(&NameLookupReplyBody {
            record: Some(EncryptedOnsRecord::seal(&remote_address(), "bob.loki").unwrap()),
            status: "OK".into(),
        })
        .unwrap();
        let keys = handler.path_keys();
        for key in &keys {
            let seq = control_seq(&node, key);
            deliver_reply(
                &mut node,
                key,
                PathControlReply {
                    seq,
                    body: wrong.clone(),
                },
            );
        }
        assert_eq!(results.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn intro_lookup_decrypts_under_address() {
        let (mut node, handler, mut remote) = node_with_paths(1);
        let address = remote_address();
        let introset = crate::service::IntroSet {
            address,
            intros: vec![Introduction {
                pivot: Keypair::generate().router_id(),
                path_id: HopId::random(),
                expires_at: 5_000,
            }],
        };
        let sealed = EncryptedIntroSet::seal(&introset, crate::identity::now_ms()).unwrap();

        let results: Arc<Mutex<Vec<Option<IntroSet>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        remote.lookup_intro(
            address,
            false,
            0,
            Box::new(move |result| {
                sink.lock().unwrap().push(result);
            }),
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );

        let key = handler.path_keys()[0];
        let body = bincode::serialize(&IntroReplyBody {
            introset: Some(sealed),
            status: "OK".into(),
        })
        .unwrap();
        let seq = control_seq(&node, &key);
        deliver_reply(&mut node, &key, PathControlReply { seq, body });
        assert_eq!(results.lock().unwrap().as_slice(), &[Some(introset)]);
    }

    #[test]
    fn exit_session_to_snode_is_rejected() {
        let (mut node, handler, mut remote) = node_with_paths(1);
        let result = remote.initiate_session(
            remote_address(),
            true,
            true,
            &handler,
            &mut node.paths,
            &node.link,
            node.now,
        );
        assert_eq!(result, Err(SessionError::ExitToSnode));
        assert!(node.link.sent().is_empty());
    }

    #[test]
    fn address_map_is_a_bijection() {
        let (_node, _handler, mut remote) = node_with_paths(1);
        let a = remote_address();
        let b = remote_address();
        let local_a: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let local_b: SocketAddr = "10.0.0.2:53".parse().unwrap();

        remote.map_remote_to_local_addr(a, local_a);
        assert_eq!(remote.local_addr_for_remote(&a), Some(local_a));
        assert_eq!(remote.remote_for_local_addr(&local_a), Some(a));

        // Rebinding the remote moves it; the old local is free again.
        remote.map_remote_to_local_addr(a, local_b);
        assert_eq!(remote.remote_for_local_addr(&local_a), None);
        assert_eq!(remote.local_addr_for_remote(&a), Some(local_b));

        // Map then unmap leaves no residue.
        remote.map_remote_to_local_addr(b, local_a);
        remote.unmap_local_addr_by_remote(&b);
        assert_eq!(remote.local_addr_for_remote(&b), None);
        assert_eq!(remote.remote_for_local_addr(&local_a), None);
        assert_eq!(remote.local_addr_for_remote(&a), Some(local_b));
    }

    #[test]
    fn range_map_round_trip() {
        let (_node, _handler, mut remote) = node_with_paths(1);
        let a = remote_address();
        let range = IpRange {
            base: "10.10.0.0".parse().unwrap(),
            prefix_len: 16,
        };
        remote.map_remote_to_local_range(a, range);
        assert_eq!(remote.remote_for_range(&range), Some(a));
        remote.unmap_local_range_by_remote(&a);
        assert_eq!(remote.remote_for_range(&range), None);
    }
}
