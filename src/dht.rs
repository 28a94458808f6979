//! # DHT Message Handler
//!
//! The distributed directory's control center. The handler owns the two
//! node buckets (router contacts and encrypted introsets), the three
//! pending-transaction tables, and a CSPRNG-seeded transaction id counter.
//! It routes every inbound DHT message, decides between recursive and
//! iterative forwarding, serves exploratory lookups, and publishes
//! introsets across their replica set.
//!
//! ## Key operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `handle_message` | dispatch one inbound message, appending replies |
//! | `lookup_router` / `lookup_router_recursive` | client-side contact lookups |
//! | `lookup_router_relayed` | serve a lookup on behalf of a peer |
//! | `lookup_introset_*` / `propagate_*` | introset fetch and publish |
//! | `explore` | periodic neighborhood discovery |
//! | `cleanup` | 1 s tick: expire transactions and stale nodes |
//!
//! ## Environment
//!
//! Handler methods and transaction jobs receive a [`DhtEnv`] of disjoint
//! borrows (node db, path context, profiles, link, our contact, the
//! current instants) instead of holding back-references. Jobs that need
//! follow-up lookups push [`Deferred`] actions onto the environment; the
//! handler drains them once the originating table call has returned, so
//! a job can never re-enter the table that still holds it.

use std::collections::BTreeSet;

use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::bucket::{Bucket, IsNode, RcNode};
use crate::crypto;
use crate::identity::{RouterContact, RouterId};
use crate::keys::DhtKey;
use crate::link::LinkSender;
use crate::messages::{
    DhtMessage, IntroReplyBody, LinkFrame, PathControlReply, PathDht, RelayFrame, StatusBody,
    STATUS_NOT_FOUND, STATUS_OK, STATUS_TIMEOUT,
};
use crate::nodedb::NodeDb;
use crate::path::HopId;
use crate::path_context::PathContext;
use crate::profiles::Profiles;
use crate::service::EncryptedIntroSet;
use crate::transactions::{
    IntroSetLookupHandler, LookupError, PendingExploreLookups, PendingIntroSetLookups,
    PendingRouterLookups, RouterLookupHandler, TxJob, TxOwner, TxStep,
};

/// Default timeout for recursive router lookups.
const ROUTER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for introset lookups and publishes.
const INTROSET_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for direct (unrelayed) introset lookups.
const INTROSET_DIRECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for exploration round trips.
const EXPLORE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Peers asked per exploration round.
const EXPLORE_PEERS: usize = 3;

/// Upper bound on routers returned to an exploring peer.
const EXPLORATORY_REPLY_MAX: usize = 4;

/// Replica set size for introset publication.
const INTROSET_REPLICAS: usize = 4;

/// Outbound DHT traffic keeps the peer's connection around this long.
const SESSION_PERSIST: Duration = Duration::from_secs(60);

/// Hops a router lookup will chase iterative hints across before giving
/// up with "not found".
const MAX_LOOKUP_ATTEMPTS: u32 = 4;

/// Follow-up actions queued by jobs and drained by the handler.
pub enum Deferred {
    /// Fetch this router's contact via our closest known peer.
    LookupRouter { target: RouterId },
}

/// Disjoint borrows of the router's collaborators, handed to every DHT
/// operation for the duration of one event.
pub struct DhtEnv<'a> {
    pub node_db: &'a mut NodeDb,
    pub paths: &'a mut PathContext,
    pub profiles: &'a mut Profiles,
    pub link: &'a dyn LinkSender,
    pub our_rc: &'a RouterContact,
    /// Monotonic clock for timers and transaction deadlines.
    pub now: tokio::time::Instant,
    /// Wall clock (ms since epoch) for record expiry.
    pub now_ms: u64,
    pub deferred: Vec<Deferred>,
}

impl DhtEnv<'_> {
    pub fn our_key(&self) -> DhtKey {
        self.our_rc.dht_key()
    }

    /// Send a DHT message and bias the peer's connection open for a
    /// minute, so the reply does not pay a reconnect.
    pub fn send_dht(&self, to: &DhtKey, msg: DhtMessage) {
        let rid = RouterId::from_bytes(*to.as_bytes());
        trace!(peer = %rid, kind = msg.kind(), "dht send");
        self.link.send(rid, LinkFrame::Dht(msg));
        self.link.persist_until(rid, self.now + SESSION_PERSIST);
    }

    /// Send a control reply down a path we serve as pivot, adding our
    /// onion layer. `path_rx` is the hop id the request arrived on.
    pub fn send_path_reply(&mut self, path_rx: HopId, reply: PathControlReply) -> bool {
        let our_rid = self.our_rc.rid;
        let Some(hop) = self.paths.get_transit_hop(&our_rid, &path_rx) else {
            debug!(%path_rx, "no transit hop for path reply");
            return false;
        };
        let payload = crate::messages::PathPayload::Reply(reply);
        let Ok(mut bytes) = bincode::serialize(&payload) else {
            return false;
        };
        let nonce = crypto::random_onion_nonce();
        crypto::apply_onion_layer(&hop.key, &nonce, &mut bytes);
        self.link.send(
            hop.downstream,
            LinkFrame::Downstream(RelayFrame {
                hop_id: hop.rx_id,
                nonce,
                payload: bytes,
            }),
        );
        true
    }

    pub fn defer(&mut self, action: Deferred) {
        self.deferred.push(action);
    }
}

pub struct DhtHandler {
    our_key: DhtKey,
    rc_nodes: Bucket<RcNode>,
    is_nodes: Bucket<IsNode>,
    pub(crate) router_lookups: PendingRouterLookups,
    pub(crate) introset_lookups: PendingIntroSetLookups,
    pub(crate) explore_lookups: PendingExploreLookups,
    ids: u64,
    allow_transit: bool,
}

impl DhtHandler {
    /// Initialise the handler. The caller schedules [`Self::cleanup`] on
    /// a one-second tick and [`Self::explore`] on the explore interval.
    pub fn new(our_key: DhtKey) -> Self {
        let mut seed = [0u8; 8];
        if getrandom::getrandom(&mut seed).is_err() {
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut seed);
        }
        Self {
            our_key,
            rc_nodes: Bucket::new(),
            is_nodes: Bucket::new(),
            router_lookups: PendingRouterLookups::new(ROUTER_LOOKUP_TIMEOUT),
            introset_lookups: PendingIntroSetLookups::new(INTROSET_LOOKUP_TIMEOUT),
            explore_lookups: PendingExploreLookups::new(EXPLORE_LOOKUP_TIMEOUT),
            ids: u64::from_le_bytes(seed),
            allow_transit: false,
        }
    }

    pub fn our_key(&self) -> DhtKey {
        self.our_key
    }

    pub fn allow_transit(&mut self) {
        self.allow_transit = true;
    }

    pub fn is_transit_allowed(&self) -> bool {
        self.allow_transit
    }

    pub fn nodes(&self) -> &Bucket<RcNode> {
        &self.rc_nodes
    }

    pub fn services(&self) -> &Bucket<IsNode> {
        &self.is_nodes
    }

    pub fn put_rc_node(&mut self, rc: RouterContact) {
        self.rc_nodes.put(rc.dht_key(), RcNode::new(rc));
    }

    pub fn del_rc_node(&mut self, key: &DhtKey) {
        self.rc_nodes.del(key);
    }

    pub fn get_introset_by_location(&self, location: &DhtKey) -> Option<&EncryptedIntroSet> {
        self.is_nodes.get(location).map(|node| &node.introset)
    }

    /// Store a verified introset at its location.
    pub fn store_introset(&mut self, introset: EncryptedIntroSet) {
        self.is_nodes
            .put(introset.location, IsNode::new(introset));
    }

    fn next_id(&mut self) -> u64 {
        self.ids = self.ids.wrapping_add(1);
        self.ids
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Route one inbound message, appending any replies for the sender.
    /// Returns false only for malformed content; the caller then drops
    /// the connection.
    pub fn handle_message(
        &mut self,
        from: DhtKey,
        msg: DhtMessage,
        replies: &mut Vec<DhtMessage>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        let ok = match msg {
            DhtMessage::FindRouter {
                txid,
                target,
                iterative,
            } => {
                self.lookup_router_relayed(from, txid, target, !iterative, replies, env);
                true
            }
            DhtMessage::ExploreNetwork { txid, target } => {
                // Exploration failures are resource exhaustion, not
                // protocol errors; the request is dropped, not the link.
                let _ = self.handle_exploratory_router_lookup(from, txid, target, replies, env);
                true
            }
            DhtMessage::GotRouter { txid, rcs, nearest } => {
                self.handle_got_router(from, txid, rcs, nearest, env)
            }
            DhtMessage::FindIntroSet { txid, location, .. } => {
                let introset = self.get_introset_by_location(&location).cloned();
                replies.push(DhtMessage::GotIntroSet { txid, introset });
                true
            }
            DhtMessage::GotIntroSet { txid, introset } => {
                self.handle_got_introset(from, txid, introset, env)
            }
            DhtMessage::PublishIntroSet {
                txid,
                introset,
                relayed,
                relay_order,
            } => self.handle_publish_introset(from, txid, introset, relayed, relay_order, replies, env),
        };
        self.drain_deferred(env);
        ok
    }

    fn handle_got_router(
        &mut self,
        from: DhtKey,
        txid: u64,
        rcs: Vec<RouterContact>,
        nearest: Vec<RouterId>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        for rc in &rcs {
            if rc.verify().is_err() {
                warn!(peer = %from, "got_router carried an invalid contact");
                return false;
            }
        }
        for rc in &rcs {
            self.observe_rc(rc, env);
        }
        let owner = TxOwner::new(from, txid);
        if self.explore_lookups.contains(&owner) {
            self.explore_lookups.on_reply(&owner, nearest, env);
        } else {
            // An empty answer with a hint is an iterative redirect: chase
            // the hinted peer while it is strictly closer to the target,
            // up to a bounded number of hops.
            if rcs.is_empty() {
                if let (Some(hint), Some(target), Some(attempts)) = (
                    nearest.first(),
                    self.router_lookups.target_of(&owner),
                    self.router_lookups.attempts_of(&owner),
                ) {
                    let hint_key = DhtKey::from(hint);
                    if attempts < MAX_LOOKUP_ATTEMPTS
                        && hint_key != owner.peer
                        && target.closer_than(&hint_key, &owner.peer)
                    {
                        let new_owner = TxOwner::new(hint_key, self.next_id());
                        trace!(
                            txid = owner.txid,
                            attempt = attempts + 1,
                            "chasing iterative hint"
                        );
                        self.router_lookups.reissue(&owner, new_owner, env);
                        return true;
                    }
                }
            }
            self.router_lookups.on_reply(&owner, rcs, env);
        }
        true
    }

    fn handle_got_introset(
        &mut self,
        from: DhtKey,
        txid: u64,
        introset: Option<EncryptedIntroSet>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        if let Some(iset) = &introset {
            if !iset.verify(env.now_ms) {
                warn!(peer = %from, "got_introset failed verification");
                return false;
            }
        }
        let owner = TxOwner::new(from, txid);
        let values: Vec<EncryptedIntroSet> = introset.into_iter().collect();
        self.introset_lookups.on_reply(&owner, values, env);
        true
    }

    fn handle_publish_introset(
        &mut self,
        from: DhtKey,
        txid: u64,
        introset: EncryptedIntroSet,
        relayed: bool,
        relay_order: u64,
        replies: &mut Vec<DhtMessage>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        if !introset.verify(env.now_ms) {
            warn!(peer = %from, "publish_introset failed verification");
            return false;
        }
        if relayed {
            match self.select_replica(&introset.location, relay_order) {
                Some(chosen) if chosen != self.our_key => {
                    // Forward to the selected replica; the ack to the
                    // publisher is deferred to the propagate job.
                    self.propagate_introset_to(
                        TxOwner::new(from, txid),
                        introset,
                        chosen,
                        relay_order,
                        env,
                    );
                    return true;
                }
                _ => {}
            }
        }
        debug!(location = %introset.location, "storing introset");
        self.is_nodes
            .put(introset.location, IsNode::new(introset.clone()));
        replies.push(DhtMessage::GotIntroSet {
            txid,
            introset: Some(introset),
        });
        true
    }

    /// Admit a verified contact: node db, RC bucket, link address book.
    fn observe_rc(&mut self, rc: &RouterContact, env: &mut DhtEnv<'_>) {
        if rc.is_expired(env.now_ms) {
            return;
        }
        if env.node_db.put_rc_async(rc.clone()) {
            self.rc_nodes.put(rc.dht_key(), RcNode::new(rc.clone()));
            if let Some(addr) = rc.primary_addr().and_then(|a| a.parse().ok()) {
                env.link.add_address(rc.rid, addr);
            }
        }
    }

    // ------------------------------------------------------------------
    // Router lookups
    // ------------------------------------------------------------------

    /// Serve a router lookup on behalf of `requester`.
    pub fn lookup_router_relayed(
        &mut self,
        requester: DhtKey,
        txid: u64,
        target: DhtKey,
        recursive: bool,
        replies: &mut Vec<DhtMessage>,
        env: &mut DhtEnv<'_>,
    ) {
        if target == self.our_key {
            // We are the target; hand over our own contact.
            replies.push(DhtMessage::GotRouter {
                txid,
                rcs: vec![env.our_rc.clone()],
                nearest: Vec::new(),
            });
            return;
        }
        let target_rid = RouterId::from_bytes(*target.as_bytes());
        if !env.profiles.session_allowed(&target_rid) {
            // Explicitly not allowed: empty answer, not an error.
            replies.push(DhtMessage::GotRouter {
                txid,
                rcs: Vec::new(),
                nearest: Vec::new(),
            });
            return;
        }
        let Some(rc) = env.node_db.find_closest_to(&target).cloned() else {
            replies.push(DhtMessage::GotRouter {
                txid,
                rcs: Vec::new(),
                nearest: Vec::new(),
            });
            return;
        };
        let next = rc.dht_key();
        if next == target {
            if rc.expires_soon(env.now_ms) {
                // Refresh from the target itself; the reply to the
                // requester rides on the recursive transaction.
                self.lookup_router_recursive(
                    target,
                    TxOwner::new(requester, txid),
                    next,
                    None,
                    env,
                );
            } else {
                replies.push(DhtMessage::GotRouter {
                    txid,
                    rcs: vec![rc],
                    nearest: Vec::new(),
                });
            }
        } else if recursive {
            if target.closer_than(&next, &self.our_key) {
                // The next peer is closer than we are; forward for them.
                self.lookup_router_recursive(
                    target,
                    TxOwner::new(requester, txid),
                    next,
                    None,
                    env,
                );
            } else {
                // We are the closest node that will answer; an empty
                // reply tells the caller to go iterative.
                replies.push(DhtMessage::GotRouter {
                    txid,
                    rcs: Vec::new(),
                    nearest: Vec::new(),
                });
            }
        } else {
            // Iterative: hint at whoever we know nearest the target.
            replies.push(DhtMessage::GotRouter {
                txid,
                rcs: Vec::new(),
                nearest: vec![rc.rid],
            });
        }
    }

    /// Start a recursive lookup for `target` via `askpeer` on behalf of
    /// `asker` (ourselves or a remote requester).
    pub fn lookup_router_recursive(
        &mut self,
        target: DhtKey,
        asker: TxOwner,
        askpeer: DhtKey,
        handler: Option<RouterLookupHandler>,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(askpeer, self.next_id());
        self.router_lookups.new_tx(
            owner,
            asker,
            target,
            Box::new(RecursiveRouterLookup {
                target,
                asker,
                handler,
            }),
            None,
            env,
        );
    }

    /// Client-side lookup: pick the closest bucket peer as first hop.
    /// Returns false (and resolves the handler) when we know nobody.
    pub fn lookup_router(
        &mut self,
        target: RouterId,
        handler: Option<RouterLookupHandler>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        let target_key = DhtKey::from(&target);
        let Some(askpeer) = self.rc_nodes.find_closest(&target_key) else {
            if let Some(handler) = handler {
                handler(Err(LookupError::NotFound));
            }
            return false;
        };
        let our = self.our_key;
        self.lookup_router_recursive(target_key, TxOwner::new(our, 0), askpeer, handler, env);
        true
    }

    pub fn has_router_lookup(&self, target: &DhtKey) -> bool {
        self.router_lookups.has_lookup_for(target)
    }

    /// Lookup whose reply is delivered down a local path we serve.
    /// `txid` is the requester's DHT transaction id; `seq` is the control
    /// sequence the wrapped reply must answer to.
    pub fn lookup_router_for_path(
        &mut self,
        target: DhtKey,
        txid: u64,
        seq: u64,
        path_rx: HopId,
        askpeer: DhtKey,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(askpeer, self.next_id());
        let asker = TxOwner::new(self.our_key, txid);
        self.router_lookups.new_tx(
            owner,
            asker,
            target,
            Box::new(LocalRouterLookup {
                target,
                txid,
                seq,
                path_rx,
            }),
            None,
            env,
        );
    }

    // ------------------------------------------------------------------
    // Introset lookups and publication
    // ------------------------------------------------------------------

    pub fn lookup_introset_relayed(
        &mut self,
        location: DhtKey,
        whoasked: TxOwner,
        askpeer: DhtKey,
        relay_order: u64,
        handler: Option<IntroSetLookupHandler>,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(askpeer, self.next_id());
        self.introset_lookups.new_tx(
            owner,
            whoasked,
            location,
            Box::new(ServiceAddressLookup {
                location,
                asker: whoasked,
                relayed: true,
                relay_order,
                handler,
            }),
            None,
            env,
        );
    }

    pub fn lookup_introset_direct(
        &mut self,
        location: DhtKey,
        whoasked: TxOwner,
        askpeer: DhtKey,
        handler: Option<IntroSetLookupHandler>,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(askpeer, self.next_id());
        self.introset_lookups.new_tx(
            owner,
            whoasked,
            location,
            Box::new(ServiceAddressLookup {
                location,
                asker: whoasked,
                relayed: false,
                relay_order: 0,
                handler,
            }),
            Some(INTROSET_DIRECT_TIMEOUT),
            env,
        );
    }

    /// Introset lookup whose result rides down a local path.
    pub fn lookup_introset_for_path(
        &mut self,
        location: DhtKey,
        seq: u64,
        path_rx: HopId,
        askpeer: DhtKey,
        relay_order: u64,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(askpeer, self.next_id());
        let asker = TxOwner::new(self.our_key, seq);
        self.introset_lookups.new_tx(
            owner,
            asker,
            location,
            Box::new(LocalServiceAddressLookup {
                location,
                seq,
                path_rx,
                relay_order,
            }),
            None,
            env,
        );
    }

    /// Publish an introset that arrived over one of our paths; the ack
    /// goes back down that path.
    pub fn propagate_local_introset(
        &mut self,
        path_rx: HopId,
        seq: u64,
        introset: EncryptedIntroSet,
        tellpeer: DhtKey,
        relay_order: u64,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(tellpeer, self.next_id());
        let asker = TxOwner::new(self.our_key, seq);
        let location = introset.location;
        self.introset_lookups.new_tx(
            owner,
            asker,
            location,
            Box::new(LocalPublishServiceJob {
                introset,
                seq,
                path_rx,
                relay_order,
            }),
            None,
            env,
        );
    }

    /// Forward an introset publication to `tellpeer`, acking `from` when
    /// the replica confirms.
    pub fn propagate_introset_to(
        &mut self,
        from: TxOwner,
        introset: EncryptedIntroSet,
        tellpeer: DhtKey,
        relay_order: u64,
        env: &mut DhtEnv<'_>,
    ) {
        let owner = TxOwner::new(tellpeer, self.next_id());
        let location = introset.location;
        self.introset_lookups.new_tx(
            owner,
            from,
            location,
            Box::new(PublishServiceJob {
                introset,
                asker: from,
                relay_order,
            }),
            None,
            env,
        );
    }

    /// The replica a publish with `relay_order` lands on: index
    /// `relay_order % len` into the replica set for `location`. The set
    /// is the closest known DHT keys (our own included), distance
    /// ascending with lexicographic tie-break.
    pub(crate) fn select_replica(&self, location: &DhtKey, relay_order: u64) -> Option<DhtKey> {
        let (mut candidates, _) =
            self.rc_nodes
                .get_many_nearest(location, INTROSET_REPLICAS, &BTreeSet::new());
        candidates.push(self.our_key);
        candidates.sort_by(|a, b| {
            crate::keys::distance_cmp(&location.distance(a), &location.distance(b))
                .then_with(|| a.cmp(b))
        });
        candidates.dedup();
        candidates.truncate(INTROSET_REPLICAS);
        if candidates.is_empty() {
            return None;
        }
        let index = (relay_order as usize) % candidates.len();
        Some(candidates[index])
    }

    // ------------------------------------------------------------------
    // Exploration
    // ------------------------------------------------------------------

    /// Serve an exploring peer: up to four reputable routers nearest
    /// `target`, never including ourselves or the requester. Returns
    /// false (no reply) when nothing qualifies.
    pub fn handle_exploratory_router_lookup(
        &mut self,
        requester: DhtKey,
        txid: u64,
        target: DhtKey,
        replies: &mut Vec<DhtMessage>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        let node_count = self.rc_nodes.len();
        if node_count == 0 {
            warn!("cannot serve exploratory lookup, no dht peers");
            return false;
        }
        let exclude: BTreeSet<DhtKey> = [self.our_key, requester].into();
        let want = node_count.min(EXPLORATORY_REPLY_MAX);
        let (found, _) = self.rc_nodes.get_many_nearest(&target, want, &exclude);
        let nearest: Vec<RouterId> = found
            .iter()
            .map(|k| RouterId::from_bytes(*k.as_bytes()))
            .filter(|rid| !env.profiles.is_bad_for_connect(rid))
            .collect();
        if nearest.is_empty() {
            warn!(
                have = node_count,
                "not enough reputable dht nodes for exploratory lookup"
            );
            return false;
        }
        debug!(gave = nearest.len(), "served exploratory lookup");
        replies.push(DhtMessage::GotRouter {
            txid,
            rcs: Vec::new(),
            nearest,
        });
        true
    }

    /// Ask `n` random bucket peers for fresh routers.
    pub fn explore(&mut self, env: &mut DhtEnv<'_>) {
        let peers = self.rc_nodes.get_many_random(EXPLORE_PEERS);
        if peers.is_empty() {
            debug!("no peers to explore via");
            return;
        }
        debug!(peers = peers.len(), "exploring network");
        for peer in peers {
            self.explore_network_via(peer, env);
        }
    }

    pub fn explore_network_via(&mut self, askpeer: DhtKey, env: &mut DhtEnv<'_>) {
        let txid = self.next_id();
        let owner = TxOwner::new(askpeer, txid);
        let asker = TxOwner::new(self.our_key, txid);
        let target = self.our_key;
        self.explore_lookups.new_tx(
            owner,
            asker,
            askpeer,
            Box::new(ExploreNetworkJob { target }),
            None,
            env,
        );
        self.drain_deferred(env);
    }

    // ------------------------------------------------------------------
    // Path-relayed requests
    // ------------------------------------------------------------------

    /// Handle DHT messages that arrived down a path we serve as pivot.
    /// Replies, if any, are wrapped and sent back down the path; a
    /// request that produces none is still a success.
    ///
    /// Router lookups that would forward recursively go through the
    /// path-aware job so the eventual answer still rides down the path
    /// instead of evaporating at a local asker.
    pub fn handle_relayed_request(
        &mut self,
        path_rx: HopId,
        seq: u64,
        messages: Vec<DhtMessage>,
        env: &mut DhtEnv<'_>,
    ) -> bool {
        let from = self.our_key;
        let mut replies = Vec::new();
        for msg in messages {
            match msg {
                DhtMessage::FindRouter { txid, target, .. } if target != self.our_key => {
                    match self.rc_nodes.find_closest(&target) {
                        Some(askpeer) => {
                            self.lookup_router_for_path(target, txid, seq, path_rx, askpeer, env);
                        }
                        None => replies.push(DhtMessage::GotRouter {
                            txid,
                            rcs: Vec::new(),
                            nearest: Vec::new(),
                        }),
                    }
                }
                other => {
                    if !self.handle_message(from, other, &mut replies, env) {
                        return false;
                    }
                }
            }
        }
        if !replies.is_empty() {
            let Ok(body) = bincode::serialize(&PathDht { messages: replies }) else {
                return false;
            };
            env.send_path_reply(path_rx, PathControlReply { seq, body });
        }
        true
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// One-second tick: expire the transaction tables, then evict bucket
    /// nodes whose records lapsed.
    pub fn cleanup(&mut self, env: &mut DhtEnv<'_>) {
        let now = env.now;
        self.router_lookups.expire(now, env);
        self.introset_lookups.expire(now, env);
        self.explore_lookups.expire(now, env);
        self.drain_deferred(env);

        let now_ms = env.now_ms;
        self.rc_nodes.retain(|_, node| !node.rc.is_expired(now_ms));
        self.is_nodes
            .retain(|_, node| !node.introset.is_expired(now_ms));
    }

    fn drain_deferred(&mut self, env: &mut DhtEnv<'_>) {
        loop {
            let batch = std::mem::take(&mut env.deferred);
            if batch.is_empty() {
                break;
            }
            for action in batch {
                match action {
                    Deferred::LookupRouter { target } => {
                        let key = DhtKey::from(&target);
                        if !self.has_router_lookup(&key) {
                            self.lookup_router(target, None, env);
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Transaction Jobs
// ============================================================================

/// Client-side recursive contact lookup; also serves deferred replies to
/// remote requesters (the `asker` is then the remote peer).
struct RecursiveRouterLookup {
    target: DhtKey,
    asker: TxOwner,
    handler: Option<RouterLookupHandler>,
}

impl TxJob<RouterContact> for RecursiveRouterLookup {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::FindRouter {
                txid: owner.txid,
                target: self.target,
                iterative: false,
            },
        );
    }

    fn on_values(&mut self, _values: &[RouterContact], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, found: &[RouterContact], timed_out: bool, env: &mut DhtEnv<'_>) {
        if self.asker.peer != env.our_key() {
            env.send_dht(
                &self.asker.peer,
                DhtMessage::GotRouter {
                    txid: self.asker.txid,
                    rcs: found.to_vec(),
                    nearest: Vec::new(),
                },
            );
        }
        if let Some(handler) = self.handler.take() {
            let result = if timed_out {
                Err(LookupError::Timeout)
            } else if found.is_empty() {
                Err(LookupError::NotFound)
            } else {
                Ok(found.to_vec())
            };
            handler(result);
        }
    }
}

/// Router lookup whose result is delivered down a local path.
struct LocalRouterLookup {
    target: DhtKey,
    txid: u64,
    seq: u64,
    path_rx: HopId,
}

impl TxJob<RouterContact> for LocalRouterLookup {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::FindRouter {
                txid: owner.txid,
                target: self.target,
                iterative: false,
            },
        );
    }

    fn on_values(&mut self, _values: &[RouterContact], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, found: &[RouterContact], _timed_out: bool, env: &mut DhtEnv<'_>) {
        let reply = DhtMessage::GotRouter {
            txid: self.txid,
            rcs: found.to_vec(),
            nearest: Vec::new(),
        };
        let Ok(body) = bincode::serialize(&PathDht {
            messages: vec![reply],
        }) else {
            return;
        };
        env.send_path_reply(
            self.path_rx,
            PathControlReply {
                seq: self.seq,
                body,
            },
        );
    }
}

/// Neighborhood discovery via one peer; every unknown router id in the
/// answer becomes a follow-up contact lookup.
struct ExploreNetworkJob {
    target: DhtKey,
}

impl TxJob<RouterId> for ExploreNetworkJob {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::ExploreNetwork {
                txid: owner.txid,
                target: self.target,
            },
        );
    }

    fn on_values(&mut self, _values: &[RouterId], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, found: &[RouterId], timed_out: bool, env: &mut DhtEnv<'_>) {
        if timed_out {
            trace!("exploration round timed out");
            return;
        }
        debug!(routers = found.len(), "got routers from exploration");
        for rid in found {
            if !env.node_db.has(rid) {
                env.defer(Deferred::LookupRouter { target: *rid });
            }
        }
    }
}

/// Client-side introset fetch.
struct ServiceAddressLookup {
    location: DhtKey,
    asker: TxOwner,
    relayed: bool,
    relay_order: u64,
    handler: Option<IntroSetLookupHandler>,
}

impl TxJob<EncryptedIntroSet> for ServiceAddressLookup {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::FindIntroSet {
                txid: owner.txid,
                location: self.location,
                relayed: self.relayed,
                relay_order: self.relay_order,
            },
        );
    }

    fn on_values(&mut self, _values: &[EncryptedIntroSet], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, found: &[EncryptedIntroSet], timed_out: bool, env: &mut DhtEnv<'_>) {
        if self.asker.peer != env.our_key() {
            env.send_dht(
                &self.asker.peer,
                DhtMessage::GotIntroSet {
                    txid: self.asker.txid,
                    introset: found.first().cloned(),
                },
            );
        }
        if let Some(handler) = self.handler.take() {
            let result = if timed_out {
                Err(LookupError::Timeout)
            } else {
                match found.first() {
                    Some(iset) => Ok(iset.clone()),
                    None => Err(LookupError::NotFound),
                }
            };
            handler(result);
        }
    }
}

/// Introset fetch whose result rides down a local path.
struct LocalServiceAddressLookup {
    location: DhtKey,
    seq: u64,
    path_rx: HopId,
    relay_order: u64,
}

impl TxJob<EncryptedIntroSet> for LocalServiceAddressLookup {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::FindIntroSet {
                txid: owner.txid,
                location: self.location,
                relayed: true,
                relay_order: self.relay_order,
            },
        );
    }

    fn on_values(&mut self, _values: &[EncryptedIntroSet], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, found: &[EncryptedIntroSet], timed_out: bool, env: &mut DhtEnv<'_>) {
        let status = if timed_out {
            STATUS_TIMEOUT
        } else if found.is_empty() {
            STATUS_NOT_FOUND
        } else {
            STATUS_OK
        };
        let Ok(body) = bincode::serialize(&IntroReplyBody {
            introset: found.first().cloned(),
            status: status.to_string(),
        }) else {
            return;
        };
        env.send_path_reply(
            self.path_rx,
            PathControlReply {
                seq: self.seq,
                body,
            },
        );
    }
}

/// Store-and-forward publication toward a replica, acking a remote peer.
struct PublishServiceJob {
    introset: EncryptedIntroSet,
    asker: TxOwner,
    relay_order: u64,
}

impl TxJob<EncryptedIntroSet> for PublishServiceJob {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::PublishIntroSet {
                txid: owner.txid,
                introset: self.introset.clone(),
                relayed: false,
                relay_order: self.relay_order,
            },
        );
    }

    fn on_values(&mut self, _values: &[EncryptedIntroSet], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, _found: &[EncryptedIntroSet], timed_out: bool, env: &mut DhtEnv<'_>) {
        let introset = (!timed_out).then(|| self.introset.clone());
        env.send_dht(
            &self.asker.peer,
            DhtMessage::GotIntroSet {
                txid: self.asker.txid,
                introset,
            },
        );
    }
}

/// Publication initiated over one of our paths; the ack goes back down.
struct LocalPublishServiceJob {
    introset: EncryptedIntroSet,
    seq: u64,
    path_rx: HopId,
    relay_order: u64,
}

impl TxJob<EncryptedIntroSet> for LocalPublishServiceJob {
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>) {
        env.send_dht(
            &owner.peer,
            DhtMessage::PublishIntroSet {
                txid: owner.txid,
                introset: self.introset.clone(),
                relayed: false,
                relay_order: self.relay_order,
            },
        );
    }

    fn on_values(&mut self, _values: &[EncryptedIntroSet], _env: &mut DhtEnv<'_>) -> TxStep {
        TxStep::Complete
    }

    fn send_reply(&mut self, _found: &[EncryptedIntroSet], timed_out: bool, env: &mut DhtEnv<'_>) {
        let status = if timed_out { STATUS_TIMEOUT } else { STATUS_OK };
        let Ok(body) = bincode::serialize(&StatusBody {
            status: status.to_string(),
        }) else {
            return;
        };
        env.send_path_reply(
            self.path_rx,
            PathControlReply {
                seq: self.seq,
                body,
            },
        );
    }
}

#[cfg(test)]
pub(crate) mod testenv {
    //! Shared fixture: a node's collaborators wired to a recording link.

    use super::*;
    use crate::identity::{now_ms, Keypair};
    use crate::link::testing::RecordingLink;
    use crate::nodedb::{DiskIoQueue, RcChecker};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("umbra-dht-{}-{}", std::process::id(), n))
    }

    pub(crate) struct TestNode {
        pub node_db: NodeDb,
        pub paths: PathContext,
        pub profiles: Profiles,
        pub link: RecordingLink,
        pub keypair: Keypair,
        pub our_rc: RouterContact,
        pub now: Instant,
    }

    impl TestNode {
        pub fn new() -> Self {
            let disk: DiskIoQueue = Arc::new(|job: Box<dyn FnOnce() + Send>| job());
            // Structure-only checker so tests can forge timestamps.
            let checker: RcChecker = Arc::new(|rc: &RouterContact| rc.validate_structure());
            let mut node_db = NodeDb::new(test_dir(), disk, checker);
            node_db.load_all().unwrap();

            let keypair = Keypair::generate();
            let secret = crypto::generate_encryption_secret();
            let our_rc = keypair.create_contact(
                vec!["127.0.0.1:7400".into()],
                crypto::encryption_public_key(&secret),
                false,
            );
            let paths = PathContext::new(keypair.router_id());
            Self {
                node_db,
                paths,
                profiles: Profiles::new(),
                link: RecordingLink::new(),
                keypair,
                our_rc,
                now: Instant::now(),
            }
        }

        pub fn env(&mut self) -> DhtEnv<'_> {
            DhtEnv {
                node_db: &mut self.node_db,
                paths: &mut self.paths,
                profiles: &mut self.profiles,
                link: &self.link,
                our_rc: &self.our_rc,
                now: self.now,
                now_ms: now_ms(),
                deferred: Vec::new(),
            }
        }

        pub fn handler(&self) -> DhtHandler {
            DhtHandler::new(self.our_rc.dht_key())
        }

        /// A fresh signed contact, admitted to the node db and bucket.
        pub fn seed_contact(&mut self, handler: &mut DhtHandler) -> RouterContact {
            let secret = crypto::generate_encryption_secret();
            let rc = Keypair::generate().create_contact(
                vec!["127.0.0.1:7500".into()],
                crypto::encryption_public_key(&secret),
                false,
            );
            assert!(self.node_db.put_rc_async(rc.clone()));
            handler.put_rc_node(rc.clone());
            rc
        }
    }
}
