//! # Router
//!
//! The node's event loop and the state it confines. All mutable control-
//! plane state (node db, DHT handler, path context, path handlers,
//! remote handler, profiles) lives in [`RouterState`], owned by a single
//! actor task. The public [`Router`] handle is cheap to clone and posts
//! `FnOnce(&mut RouterState)` closures onto the loop (`call_soon`);
//! periodic work posts through interval tasks cancelled by dropping their
//! token (`call_every`).
//!
//! ## Loop inputs
//!
//! The actor selects over three sources, processed serially in FIFO
//! order: posted closures, inbound link frames, and a one-second
//! maintenance tick (transaction expiry, path expiry, liveness probes,
//! builder drive, profile decay).
//!
//! ## Disk IO
//!
//! Node-db writes never run on the loop. The disk queue wraps
//! `spawn_blocking`; completions that need loop state re-enter through
//! `call_soon`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use x25519_dalek::StaticSecret;

use crate::config::Config;
use crate::crypto;
use crate::dht::{DhtEnv, DhtHandler};
use crate::identity::{now_ms, Keypair, RouterContact, RouterId};
use crate::keys::DhtKey;
use crate::link::{InboundFrame, LinkSender, QuicLink};
use crate::messages::{
    self, methods, BuildRecord, DhtMessage, FindIntroBody, LatencyBody, LinkFrame, NameLookupBody,
    NameLookupReplyBody, ObtainExitBody, PathBuildFrame, PathControl, PathControlReply, PathDht,
    PathPayload, PublishIntroBody, RelayFrame, StatusBody, STATUS_DENIED, STATUS_NOT_FOUND,
    STATUS_OK, UpdateExitBody, CloseExitBody,
};
use crate::nodedb::{DiskIoQueue, NodeDb, RcChecker};
use crate::path::{HandlerId, HopId, PathStatus};
use crate::path_context::{PathContext, TransitHop};
use crate::path_handler::{HandlerEnv, PathHandler, PathRole};
use crate::profiles::Profiles;
use crate::remote::{IntroCallback, NameCallback, RemoteHandler, SessionError};
use crate::service::{EncryptedOnsRecord, NetworkAddress};

/// Network exploration cadence.
const EXPLORE_INTERVAL: Duration = Duration::from_secs(60);

/// Accepted transit hop lifetimes are clamped into this range.
const MIN_TRANSIT_LIFETIME_MS: u64 = 10_000;
const MAX_TRANSIT_LIFETIME_MS: u64 = 30 * 60 * 1000;

/// A closure run on the event loop with exclusive access to the state.
pub type LoopCall = Box<dyn FnOnce(&mut RouterState) + Send>;

/// Assemble a DHT environment from disjoint state borrows, leaving the
/// DHT handler itself free to be borrowed alongside.
fn dht_env<'a>(
    node_db: &'a mut NodeDb,
    paths: &'a mut PathContext,
    profiles: &'a mut Profiles,
    link: &'a dyn LinkSender,
    our_rc: &'a RouterContact,
) -> DhtEnv<'a> {
    DhtEnv {
        node_db,
        paths,
        profiles,
        link,
        our_rc,
        now: Instant::now(),
        now_ms: now_ms(),
        deferred: Vec::new(),
    }
}

/// Keeps a `call_every` timer alive; dropping it stops the timer.
pub struct TimerToken(Arc<()>);

/// Cheap-to-clone handle onto a running router.
#[derive(Clone)]
pub struct Router {
    calls: mpsc::UnboundedSender<LoopCall>,
    rid: RouterId,
    local_addr: SocketAddr,
}

impl Router {
    /// Build the node from its configuration and start the event loop.
    pub async fn spawn(config: Config) -> Result<(Self, JoinHandle<()>)> {
        config.validate().map_err(anyhow::Error::new)?;
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;

        let keypair = load_or_create_identity(&config.data_dir)?;
        let enc_secret = load_or_create_encryption(&config.data_dir)?;
        let rid = keypair.router_id();

        let (link, inbound_rx) = QuicLink::spawn(&keypair, config.bind)?;
        let local_addr = link.local_addr();
        let our_rc = keypair.create_contact(
            vec![local_addr.to_string()],
            crypto::encryption_public_key(&enc_secret),
            config.allows_exit,
        );
        info!(rid = %rid, addr = %local_addr, "router identity ready");

        let disk: DiskIoQueue = Arc::new(|job: Box<dyn FnOnce() + Send>| {
            tokio::task::spawn_blocking(job);
        });
        let checker: RcChecker =
            Arc::new(|rc: &RouterContact| rc.verify().is_ok() && rc.is_live(now_ms()));
        let mut node_db = NodeDb::new(config.data_dir.join("nodedb"), disk, checker);
        let loaded = node_db
            .load_all()
            .context("failed to load node database")?;
        debug!(loaded, "node database loaded");

        let mut dht = DhtHandler::new(our_rc.dht_key());
        let mut paths = PathContext::new(rid);
        if config.allow_transit {
            dht.allow_transit();
            paths.allow_transit();
        }

        let link: Arc<QuicLink> = Arc::new(link);
        // Everything already persisted is dialable and DHT-known.
        let seeded: Vec<RouterContact> = {
            let wall = now_ms();
            node_db.sample(node_db.len(), |rc| rc.is_live(wall))
        };
        for rc in &seeded {
            dht.put_rc_node(rc.clone());
            if let Some(addr) = rc.primary_addr().and_then(|a| a.parse().ok()) {
                link.add_address(rc.rid, addr);
            }
        }
        for peer in &config.bootstrap {
            link.add_address(peer.rid, peer.addr);
        }

        let lookup_handler_id = HandlerId(1);
        let mut handlers = HashMap::new();
        handlers.insert(
            lookup_handler_id,
            PathHandler::new(
                lookup_handler_id,
                "lookups",
                config.num_lookup_paths,
                config.hop_count,
                PathRole::General,
            ),
        );
        let remote = RemoteHandler::new("remote", lookup_handler_id);

        let ons_registry: HashMap<String, NetworkAddress> =
            config.ons_records.iter().cloned().collect();
        let bootstrap_keys: Vec<DhtKey> =
            config.bootstrap.iter().map(|p| DhtKey::from(&p.rid)).collect();

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let state = RouterState {
            keypair,
            enc_secret,
            our_rc,
            allows_exit: config.allows_exit,
            node_db,
            dht,
            paths,
            profiles: Profiles::new(),
            handlers,
            remote,
            link,
            ons_registry,
            exit_grants: HashMap::new(),
            timers: Vec::new(),
            stopping: false,
        };

        let handle = Self {
            calls: calls_tx,
            rid,
            local_addr,
        };
        let join = tokio::spawn(actor_loop(state, calls_rx, inbound_rx));

        // Periodic exploration, plus an immediate round through the
        // bootstrap peers so a cold node has somewhere to start.
        let explore_timer = handle.call_every(
            EXPLORE_INTERVAL,
            Arc::new(|state: &mut RouterState| state.explore_tick()),
        );
        handle.call_soon(move |state| {
            state.timers.push(explore_timer);
            for peer in bootstrap_keys {
                state.bootstrap_via(peer);
            }
        });

        Ok((handle, join))
    }

    pub fn router_id(&self) -> RouterId {
        self.rid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run `f` on the next loop turn. Returns false once the loop is gone.
    pub fn call_soon(&self, f: impl FnOnce(&mut RouterState) + Send + 'static) -> bool {
        self.calls.send(Box::new(f)).is_ok()
    }

    /// Run `f` every `interval` until the returned token is dropped.
    pub fn call_every(
        &self,
        interval: Duration,
        f: Arc<dyn Fn(&mut RouterState) + Send + Sync>,
    ) -> TimerToken {
        let token = TimerToken(Arc::new(()));
        let weak = Arc::downgrade(&token.0);
        let calls = self.calls.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if weak.upgrade().is_none() {
                    break;
                }
                let f = f.clone();
                if calls.send(Box::new(move |state| f(state))).is_err() {
                    break;
                }
            }
        });
        token
    }

    /// Post a clean shutdown.
    pub fn stop(&self) {
        let _ = self.call_soon(|state| state.begin_shutdown());
    }

    /// Resolve an ONS name over the lookup paths.
    pub fn resolve_ons(&self, name: String, callback: NameCallback) {
        if !self.call_soon(move |state| state.resolve_ons(&name, callback)) {
            warn!("resolve_ons posted to a stopped router");
        }
    }

    /// Fetch the introset for a remote endpoint.
    pub fn lookup_intro(&self, remote: NetworkAddress, callback: IntroCallback) {
        let _ = self.call_soon(move |state| state.lookup_intro(remote, callback));
    }

    /// Start a session toward a remote endpoint or exit.
    pub fn initiate_session(
        &self,
        remote: NetworkAddress,
        is_exit: bool,
        is_snode: bool,
    ) -> Result<(), SessionError> {
        if is_exit && is_snode {
            return Err(SessionError::ExitToSnode);
        }
        let _ = self.call_soon(move |state| {
            if let Err(err) = state.initiate_session(remote, is_exit, is_snode) {
                warn!(remote = %remote, error = %err, "session initiation failed");
            }
        });
        Ok(())
    }
}

async fn actor_loop(
    mut state: RouterState,
    mut calls: mpsc::UnboundedReceiver<LoopCall>,
    mut inbound: mpsc::Receiver<InboundFrame>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.tick().await;
    info!("router main loop running");
    loop {
        tokio::select! {
            call = calls.recv() => match call {
                Some(call) => call(&mut state),
                None => break,
            },
            frame = inbound.recv() => match frame {
                Some(frame) => state.handle_inbound(frame),
                None => break,
            },
            _ = tick.tick() => state.on_tick(),
        }
        if state.stopping {
            break;
        }
    }
    info!("router main loop stopped");
}

/// All loop-confined node state.
pub struct RouterState {
    pub keypair: Keypair,
    enc_secret: StaticSecret,
    pub our_rc: RouterContact,
    allows_exit: bool,
    pub node_db: NodeDb,
    pub dht: DhtHandler,
    pub paths: PathContext,
    pub profiles: Profiles,
    pub handlers: HashMap<HandlerId, PathHandler>,
    pub remote: RemoteHandler,
    link: Arc<dyn LinkSender>,
    /// Names this node answers `lookup_name` for.
    ons_registry: HashMap<String, NetworkAddress>,
    /// Exit grants per serving hop id.
    exit_grants: HashMap<HopId, u64>,
    timers: Vec<TimerToken>,
    stopping: bool,
}

impl RouterState {
    pub fn router_id(&self) -> RouterId {
        self.our_rc.rid
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    fn on_tick(&mut self) {
        let now = Instant::now();
        let wall = now_ms();

        // DHT transaction expiry and node eviction.
        {
            let mut env = DhtEnv {
                node_db: &mut self.node_db,
                paths: &mut self.paths,
                profiles: &mut self.profiles,
                link: self.link.as_ref(),
                our_rc: &self.our_rc,
                now,
                now_ms: wall,
                deferred: Vec::new(),
            };
            self.dht.cleanup(&mut env);
        }

        // Expired paths: established ones just end; a path that never
        // established counts as a failed build.
        let removed = self.paths.expire_paths(now);
        for path in removed {
            self.exit_grants.remove(&path.upstream_rx_id());
            let Some(handler) = self.handlers.get_mut(&path.handler()) else {
                continue;
            };
            if path.ever_established() {
                handler.forget(&path.upstream_rx_id());
            } else {
                let mut env = HandlerEnv {
                    node_db: &self.node_db,
                    paths: &mut self.paths,
                    profiles: &self.profiles,
                    link: self.link.as_ref(),
                    now,
                    now_ms: wall,
                };
                handler.handle_path_died(&path, &mut env);
            }
        }

        // Liveness probes; collect deaths first, then notify handlers.
        let mut died: Vec<HopId> = Vec::new();
        {
            let link = self.link.as_ref();
            for path in self.paths.iter_own_paths_mut() {
                if path.tick(now, link) {
                    died.push(path.upstream_rx_id());
                }
            }
        }
        for canonical in died {
            let Some(path) = self.paths.remove_own_path(&canonical) else {
                continue;
            };
            warn!(upstream = %path.upstream(), pivot = %path.pivot_rid(), "path died");
            self.profiles.path_failed(&path.upstream(), now);
            if let Some(handler) = self.handlers.get_mut(&path.handler()) {
                let mut env = HandlerEnv {
                    node_db: &self.node_db,
                    paths: &mut self.paths,
                    profiles: &self.profiles,
                    link: self.link.as_ref(),
                    now,
                    now_ms: wall,
                };
                handler.handle_path_died(&path, &mut env);
            }
        }

        // Drive the builders.
        let handler_ids: Vec<HandlerId> = self.handlers.keys().copied().collect();
        for id in handler_ids {
            let Some(handler) = self.handlers.get_mut(&id) else {
                continue;
            };
            let mut env = HandlerEnv {
                node_db: &self.node_db,
                paths: &mut self.paths,
                profiles: &self.profiles,
                link: self.link.as_ref(),
                now,
                now_ms: wall,
            };
            handler.tick(&mut env);
        }

        self.profiles.decay(now);
        self.node_db.remove_expired(wall);
    }

    fn explore_tick(&mut self) {
        let mut env = dht_env(
            &mut self.node_db,
            &mut self.paths,
            &mut self.profiles,
            self.link.as_ref(),
            &self.our_rc,
        );
        self.dht.explore(&mut env);
    }

    fn bootstrap_via(&mut self, peer: DhtKey) {
        debug!(peer = %peer, "bootstrapping via peer");
        let mut env = dht_env(
            &mut self.node_db,
            &mut self.paths,
            &mut self.profiles,
            self.link.as_ref(),
            &self.our_rc,
        );
        self.dht.explore_network_via(peer, &mut env);
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    pub fn handle_inbound(&mut self, frame: InboundFrame) {
        let InboundFrame {
            from,
            remote_addr,
            frame,
        } = frame;
        match frame {
            LinkFrame::Dht(msg) => self.handle_dht_frame(from, msg),
            LinkFrame::PathBuild(build) => self.handle_path_build(from, remote_addr, build),
            LinkFrame::PathBuildReply { hop_id, ok } => {
                self.handle_path_build_reply(from, hop_id, ok)
            }
            LinkFrame::Upstream(relay) => self.handle_upstream(from, relay),
            LinkFrame::Downstream(relay) => self.handle_downstream(from, relay),
        }
    }

    fn handle_dht_frame(&mut self, from: RouterId, msg: DhtMessage) {
        let from_key = DhtKey::from(&from);
        let mut replies = Vec::new();
        let ok = {
            let mut env = DhtEnv {
                node_db: &mut self.node_db,
                paths: &mut self.paths,
                profiles: &mut self.profiles,
                link: self.link.as_ref(),
                our_rc: &self.our_rc,
                now: Instant::now(),
                now_ms: now_ms(),
                deferred: Vec::new(),
            };
            let ok = self.dht.handle_message(from_key, msg, &mut replies, &mut env);
            if ok {
                for reply in replies {
                    env.send_dht(&from_key, reply);
                }
            }
            ok
        };
        if !ok {
            debug!(peer = %from, "malformed dht message, dropping connection");
            self.link.drop_peer(from);
        }
    }

    /// Serve one hop of someone's path build: open our record, register
    /// the transit hop, forward the remainder or confirm as pivot.
    fn handle_path_build(&mut self, from: RouterId, remote_addr: SocketAddr, build: PathBuildFrame) {
        let now = Instant::now();
        if build.hops.is_empty() {
            self.link.drop_peer(from);
            return;
        }
        if !self.paths.is_transit_allowed() {
            debug!(peer = %from, "path build refused: transit not allowed");
            return;
        }
        if self.paths.check_path_limit_hit_by_ip(remote_addr, now) {
            warn!(addr = %remote_addr, "path build limit hit for ip");
            return;
        }
        let Ok(plaintext) = crypto::open_sealed(&self.enc_secret, &build.hops[0]) else {
            debug!(peer = %from, "undecryptable build record");
            self.link.drop_peer(from);
            return;
        };
        let Ok(record) = messages::deserialize_bounded::<BuildRecord>(&plaintext) else {
            self.link.drop_peer(from);
            return;
        };
        let lifetime_ms = record
            .lifetime_ms
            .clamp(MIN_TRANSIT_LIFETIME_MS, MAX_TRANSIT_LIFETIME_MS);
        let upstream = record.upstream.unwrap_or_else(|| self.router_id());
        let hop = TransitHop {
            downstream: from,
            upstream,
            rx_id: record.rx_id,
            tx_id: record.tx_id,
            key: record.key,
            expires_at: now + Duration::from_millis(lifetime_ms),
        };
        if self.paths.put_transit_hop(hop).is_err() {
            debug!(peer = %from, "transit hop id collision");
            self.link.send(
                from,
                LinkFrame::PathBuildReply {
                    hop_id: record.rx_id,
                    ok: false,
                },
            );
            return;
        }
        match record.upstream {
            Some(next) => {
                if build.hops.len() < 2 {
                    // Non-terminal record with nothing left to forward.
                    self.paths.remove_transit_hop(&from, &record.rx_id);
                    self.link.drop_peer(from);
                    return;
                }
                if let Some(rc) = self.node_db.get(&next) {
                    if let Some(addr) = rc.primary_addr().and_then(|a| a.parse().ok()) {
                        self.link.add_address(next, addr);
                    }
                }
                trace!(peer = %from, next = %next, "forwarding path build");
                self.link.send(
                    next,
                    LinkFrame::PathBuild(PathBuildFrame {
                        hops: build.hops[1..].to_vec(),
                    }),
                );
            }
            None => {
                trace!(peer = %from, "confirming path build as pivot");
                self.link.send(
                    from,
                    LinkFrame::PathBuildReply {
                        hop_id: record.rx_id,
                        ok: true,
                    },
                );
            }
        }
    }

    fn handle_path_build_reply(&mut self, from: RouterId, hop_id: HopId, ok: bool) {
        let now = Instant::now();
        if let Some(path) = self.paths.get_path_mut(&hop_id) {
            if path.upstream() != from {
                trace!(peer = %from, "build reply from unexpected hop");
                return;
            }
            let canonical = path.upstream_rx_id();
            let handler_id = path.handler();
            if ok {
                if path.mark_established(now) {
                    info!(upstream = %path.upstream(), pivot = %path.pivot_rid(), "path established");
                    self.profiles.path_succeeded(&from, now);
                    if let Some(handler) = self.handlers.get_mut(&handler_id) {
                        handler.handle_path_built(canonical);
                    }
                }
            } else {
                path.mark_build_failed();
                let Some(path) = self.paths.remove_own_path(&canonical) else {
                    return;
                };
                self.profiles.path_failed(&from, now);
                if let Some(handler) = self.handlers.get_mut(&handler_id) {
                    let mut env = HandlerEnv {
                        node_db: &self.node_db,
                        paths: &mut self.paths,
                        profiles: &self.profiles,
                        link: self.link.as_ref(),
                        now,
                        now_ms: now_ms(),
                    };
                    handler.handle_path_died(&path, &mut env);
                }
            }
        } else if let Some(hop) = self.paths.get_transit_hop(&from, &hop_id).cloned() {
            // Relay leg: pass the confirmation toward the owner.
            if hop.upstream != from {
                return;
            }
            self.link.send(
                hop.downstream,
                LinkFrame::PathBuildReply {
                    hop_id: hop.rx_id,
                    ok,
                },
            );
            if !ok {
                self.paths.remove_transit_hop(&from, &hop_id);
            }
        }
    }

    fn handle_upstream(&mut self, from: RouterId, relay: RelayFrame) {
        let Some(hop) = self.paths.get_transit_hop(&from, &relay.hop_id).cloned() else {
            trace!(peer = %from, "upstream frame for unknown hop");
            return;
        };
        if hop.downstream != from {
            trace!(peer = %from, "upstream frame from the wrong side");
            return;
        }
        let mut payload = relay.payload;
        crypto::apply_onion_layer(&hop.key, &relay.nonce, &mut payload);
        if hop.upstream == self.router_id() {
            match messages::deserialize_bounded::<PathPayload>(&payload) {
                Ok(decoded) => self.handle_pivot_payload(from, hop, decoded),
                Err(err) => {
                    debug!(peer = %from, error = %err, "undecodable path payload at pivot");
                    self.link.drop_peer(from);
                }
            }
        } else {
            self.link.send(
                hop.upstream,
                LinkFrame::Upstream(RelayFrame {
                    hop_id: hop.tx_id,
                    nonce: relay.nonce,
                    payload,
                }),
            );
        }
    }

    fn handle_downstream(&mut self, from: RouterId, relay: RelayFrame) {
        let now = Instant::now();
        if self.paths.get_path(&relay.hop_id).is_some() {
            let payload = {
                let path = self
                    .paths
                    .get_path_mut(&relay.hop_id)
                    .expect("checked above");
                if path.upstream() != from {
                    trace!(peer = %from, "downstream frame from unexpected hop");
                    return;
                }
                path.on_downstream(relay, now)
            };
            if let Some(PathPayload::Data { body }) = payload {
                // Traffic plane is external; account for it and move on.
                trace!(bytes = body.len(), "path data delivered");
            }
            return;
        }
        let Some(hop) = self.paths.get_transit_hop(&from, &relay.hop_id).cloned() else {
            trace!(peer = %from, "downstream frame for unknown hop");
            return;
        };
        if hop.upstream != from {
            trace!(peer = %from, "downstream frame from the wrong side");
            return;
        }
        let mut payload = relay.payload;
        crypto::apply_onion_layer(&hop.key, &relay.nonce, &mut payload);
        self.link.send(
            hop.downstream,
            LinkFrame::Downstream(RelayFrame {
                hop_id: hop.rx_id,
                nonce: relay.nonce,
                payload,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Pivot-side control handling
    // ------------------------------------------------------------------

    fn handle_pivot_payload(&mut self, from: RouterId, hop: TransitHop, payload: PathPayload) {
        match payload {
            PathPayload::Control(control) => self.handle_path_control(from, hop, control),
            PathPayload::Reply(_) => {
                trace!(peer = %from, "unexpected control reply at pivot");
            }
            PathPayload::Data { body } => {
                if self.exit_grants.contains_key(&hop.rx_id) {
                    trace!(bytes = body.len(), "exit data frame");
                } else {
                    trace!(bytes = body.len(), "data frame without exit grant dropped");
                }
            }
        }
    }

    fn handle_path_control(&mut self, from: RouterId, hop: TransitHop, control: PathControl) {
        let seq = control.seq;
        match control.method.as_str() {
            methods::LOOKUP_NAME => {
                let Ok(body) = messages::deserialize_bounded::<NameLookupBody>(&control.body)
                else {
                    return;
                };
                let reply = match self.ons_registry.get(&body.name) {
                    Some(address) => match EncryptedOnsRecord::seal(address, &body.name) {
                        Ok(record) => NameLookupReplyBody {
                            record: Some(record),
                            status: STATUS_OK.to_string(),
                        },
                        Err(_) => NameLookupReplyBody {
                            record: None,
                            status: STATUS_NOT_FOUND.to_string(),
                        },
                    },
                    None => NameLookupReplyBody {
                        record: None,
                        status: STATUS_NOT_FOUND.to_string(),
                    },
                };
                let Ok(bytes) = bincode::serialize(&reply) else {
                    return;
                };
                self.send_transit_reply(&hop, PathControlReply { seq, body: bytes });
            }
            methods::FIND_INTRO => {
                let Ok(body) = messages::deserialize_bounded::<FindIntroBody>(&control.body)
                else {
                    return;
                };
                if let Some(introset) = self.dht.get_introset_by_location(&body.location).cloned()
                {
                    let Ok(bytes) = bincode::serialize(&messages::IntroReplyBody {
                        introset: Some(introset),
                        status: STATUS_OK.to_string(),
                    }) else {
                        return;
                    };
                    self.send_transit_reply(&hop, PathControlReply { seq, body: bytes });
                    return;
                }
                let askpeer = self.dht.nodes().find_closest(&body.location);
                match askpeer {
                    Some(askpeer) => {
                        let mut env = dht_env(
                            &mut self.node_db,
                            &mut self.paths,
                            &mut self.profiles,
                            self.link.as_ref(),
                            &self.our_rc,
                        );
                        self.dht.lookup_introset_for_path(
                            body.location,
                            seq,
                            hop.rx_id,
                            askpeer,
                            body.relay_order,
                            &mut env,
                        );
                    }
                    None => {
                        let Ok(bytes) = bincode::serialize(&messages::IntroReplyBody {
                            introset: None,
                            status: STATUS_NOT_FOUND.to_string(),
                        }) else {
                            return;
                        };
                        self.send_transit_reply(&hop, PathControlReply { seq, body: bytes });
                    }
                }
            }
            methods::PUBLISH_INTRO => {
                let Ok(body) = messages::deserialize_bounded::<PublishIntroBody>(&control.body)
                else {
                    return;
                };
                if !body.introset.verify(now_ms()) {
                    warn!(peer = %from, "publish over path failed verification");
                    return;
                }
                let location = body.introset.location;
                let chosen = body
                    .relayed
                    .then(|| self.dht.select_replica(&location, body.relay_order))
                    .flatten();
                match chosen {
                    Some(replica) if replica != self.dht.our_key() => {
                        let mut env = dht_env(
                            &mut self.node_db,
                            &mut self.paths,
                            &mut self.profiles,
                            self.link.as_ref(),
                            &self.our_rc,
                        );
                        self.dht.propagate_local_introset(
                            hop.rx_id,
                            seq,
                            body.introset,
                            replica,
                            body.relay_order,
                            &mut env,
                        );
                    }
                    _ => {
                        self.dht.store_introset(body.introset);
                        let Ok(bytes) = bincode::serialize(&StatusBody {
                            status: STATUS_OK.to_string(),
                        }) else {
                            return;
                        };
                        self.send_transit_reply(&hop, PathControlReply { seq, body: bytes });
                    }
                }
            }
            methods::OBTAIN_EXIT => {
                let Ok(body) = messages::deserialize_bounded::<ObtainExitBody>(&control.body)
                else {
                    return;
                };
                let status = if self.allows_exit {
                    self.exit_grants.insert(hop.rx_id, body.tx_id);
                    info!(peer = %from, tx_id = body.tx_id, "granted exit");
                    STATUS_OK
                } else {
                    STATUS_DENIED
                };
                self.reply_status(&hop, seq, status);
            }
            methods::CLOSE_EXIT => {
                let Ok(body) = messages::deserialize_bounded::<CloseExitBody>(&control.body)
                else {
                    return;
                };
                let status = match self.exit_grants.get(&hop.rx_id) {
                    Some(granted) if *granted == body.tx_id => {
                        self.exit_grants.remove(&hop.rx_id);
                        STATUS_OK
                    }
                    Some(_) => STATUS_DENIED,
                    None => STATUS_NOT_FOUND,
                };
                self.reply_status(&hop, seq, status);
            }
            methods::UPDATE_EXIT => {
                let Ok(body) = messages::deserialize_bounded::<UpdateExitBody>(&control.body)
                else {
                    return;
                };
                let status = if self.exit_grants.get(&hop.rx_id) == Some(&body.tx_id) {
                    STATUS_OK
                } else {
                    STATUS_DENIED
                };
                self.reply_status(&hop, seq, status);
            }
            methods::PATH_LATENCY => {
                let Ok(body) = messages::deserialize_bounded::<LatencyBody>(&control.body) else {
                    return;
                };
                let Ok(bytes) = bincode::serialize(&LatencyBody {
                    probe_id: body.probe_id,
                }) else {
                    return;
                };
                self.send_transit_reply(&hop, PathControlReply { seq, body: bytes });
            }
            methods::PATH_DHT => {
                let Ok(body) = messages::deserialize_bounded::<PathDht>(&control.body) else {
                    return;
                };
                let mut env = dht_env(
                    &mut self.node_db,
                    &mut self.paths,
                    &mut self.profiles,
                    self.link.as_ref(),
                    &self.our_rc,
                );
                if !self
                    .dht
                    .handle_relayed_request(hop.rx_id, seq, body.messages, &mut env)
                {
                    debug!(peer = %from, "malformed dht request over path");
                }
            }
            methods::PATH_CLOSE => {
                self.exit_grants.remove(&hop.rx_id);
                self.paths.remove_transit_hop(&hop.downstream, &hop.rx_id);
                debug!(peer = %from, "path closed by owner");
            }
            other => {
                debug!(method = other, "unknown path control method");
            }
        }
    }

    fn reply_status(&self, hop: &TransitHop, seq: u64, status: &str) {
        let Ok(bytes) = bincode::serialize(&StatusBody {
            status: status.to_string(),
        }) else {
            return;
        };
        self.send_transit_reply(hop, PathControlReply { seq, body: bytes });
    }

    fn send_transit_reply(&self, hop: &TransitHop, reply: PathControlReply) {
        let Ok(mut bytes) = bincode::serialize(&PathPayload::Reply(reply)) else {
            return;
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
    }

    // ------------------------------------------------------------------
    // Remote operations
    // ------------------------------------------------------------------

    pub fn resolve_ons(&mut self, name: &str, callback: NameCallback) {
        let handler_id = self.remote.handler_id();
        let Some(handler) = self.handlers.get(&handler_id) else {
            return callback(None);
        };
        self.remote.resolve_ons(
            name,
            callback,
            handler,
            &mut self.paths,
            self.link.as_ref(),
            Instant::now(),
        );
    }

    pub fn lookup_intro(&mut self, remote: NetworkAddress, callback: IntroCallback) {
        let handler_id = self.remote.handler_id();
        let Some(handler) = self.handlers.get(&handler_id) else {
            return callback(None);
        };
        self.remote.lookup_intro(
            remote,
            false,
            0,
            callback,
            handler,
            &mut self.paths,
            self.link.as_ref(),
            Instant::now(),
        );
    }

    pub fn initiate_session(
        &mut self,
        remote: NetworkAddress,
        is_exit: bool,
        is_snode: bool,
    ) -> Result<(), SessionError> {
        let handler_id = self.remote.handler_id();
        let Some(handler) = self.handlers.get(&handler_id) else {
            return Err(SessionError::NoPaths);
        };
        self.remote.initiate_session(
            remote,
            is_exit,
            is_snode,
            handler,
            &mut self.paths,
            self.link.as_ref(),
            Instant::now(),
        )
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        info!("stopping router");
        let now = Instant::now();
        let canonicals: Vec<HopId> = self
            .paths
            .iter_own_paths()
            .map(|p| p.upstream_rx_id())
            .collect();
        for canonical in canonicals {
            if let Some(path) = self.paths.get_path_mut(&canonical) {
                if path.status() != PathStatus::Closed {
                    path.stop(self.link.as_ref(), now);
                }
            }
        }
        self.timers.clear();
        self.stopping = true;
    }
}

fn load_or_create_identity(dir: &FsPath) -> Result<Keypair> {
    let path = dir.join("identity.key");
    match std::fs::read(&path) {
        Ok(bytes) => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("corrupt identity key at {}", path.display()))?;
            Ok(Keypair::from_secret_key_bytes(&seed))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            std::fs::write(&path, keypair.secret_key_bytes())
                .with_context(|| format!("failed to persist identity at {}", path.display()))?;
            Ok(keypair)
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn load_or_create_encryption(dir: &FsPath) -> Result<StaticSecret> {
    let path = dir.join("encryption.key");
    match std::fs::read(&path) {
        Ok(bytes) => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("corrupt encryption key at {}", path.display()))?;
            Ok(StaticSecret::from(seed))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let secret = crypto::generate_encryption_secret();
            std::fs::write(&path, secret.to_bytes())
                .with_context(|| format!("failed to persist encryption key at {}", path.display()))?;
            Ok(secret)
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::link::testing::RecordingLink;
    use crate::path::Path;

    struct TestRouter {
        state: RouterState,
        link: Arc<RecordingLink>,
        enc_public: [u8; 32],
    }

    fn test_router(allow_transit: bool) -> TestRouter {
        use std::sync::atomic::{AtomicU64, Ordering};
        static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "umbra-router-{}-{}",
            std::process::id(),
            n
        ));

        let keypair = Keypair::generate();
        let enc_secret = crypto::generate_encryption_secret();
        let enc_public = crypto::encryption_public_key(&enc_secret);
        let our_rc =
            keypair.create_contact(vec!["127.0.0.1:7600".into()], enc_public, true);

        let disk: DiskIoQueue = Arc::new(|job: Box<dyn FnOnce() + Send>| job());
        let checker: RcChecker = Arc::new(|rc: &RouterContact| rc.validate_structure());
        let mut node_db = NodeDb::new(dir, disk, checker);
        node_db.load_all().unwrap();

        let mut dht = DhtHandler::new(our_rc.dht_key());
        let mut paths = PathContext::new(keypair.router_id());
        if allow_transit {
            dht.allow_transit();
            paths.allow_transit();
        }
        let link = Arc::new(RecordingLink::new());
        let mut handlers = HashMap::new();
        handlers.insert(
            HandlerId(1),
            PathHandler::with_default_len(HandlerId(1), "lookups", 2, PathRole::General),
        );
        let state = RouterState {
            keypair,
            enc_secret,
            our_rc,
            allows_exit: true,
            node_db,
            dht,
            paths,
            profiles: Profiles::new(),
            handlers,
            remote: RemoteHandler::new("remote", HandlerId(1)),
            link: link.clone(),
            ons_registry: HashMap::new(),
            exit_grants: HashMap::new(),
            timers: Vec::new(),
            stopping: false,
        };
        TestRouter {
            state,
            link,
            enc_public,
        }
    }

    fn inbound(from: RouterId, frame: LinkFrame) -> InboundFrame {
        InboundFrame {
            from,
            remote_addr: "127.0.0.1:5555".parse().unwrap(),
            frame,
        }
    }

    /// Build a two-record frame: one for this router, one terminal record
    /// for `next`. Returns our record for assertions.
    fn build_frame_for(router: &TestRouter, next: Option<RouterId>) -> (PathBuildFrame, BuildRecord) {
        let rx_id = HopId::random();
        let record = BuildRecord {
            rx_id,
            // The pivot's tx loops back to its rx, per the owner's layout.
            tx_id: if next.is_some() { HopId::random() } else { rx_id },
            upstream: next,
            key: [8u8; 32],
            lifetime_ms: 600_000,
        };
        let sealed =
            crypto::seal_to(&router.enc_public, &bincode::serialize(&record).unwrap()).unwrap();
        let mut hops = vec![sealed];
        if next.is_some() {
            // Opaque record for the next hop; this router cannot open it.
            let other = crypto::generate_encryption_secret();
            hops.push(
                crypto::seal_to(
                    &crypto::encryption_public_key(&other),
                    &bincode::serialize(&BuildRecord {
                        rx_id: record.tx_id,
                        tx_id: record.tx_id,
                        upstream: None,
                        key: [9u8; 32],
                        lifetime_ms: 600_000,
                    })
                    .unwrap(),
                )
                .unwrap(),
            );
        }
        (PathBuildFrame { hops }, record)
    }

    #[test]
    fn transit_build_registers_and_forwards() {
        let mut router = test_router(true);
        let from = Keypair::generate().router_id();
        let next = Keypair::generate().router_id();
        let (frame, record) = build_frame_for(&router, Some(next));

        router
            .state
            .handle_inbound(inbound(from, LinkFrame::PathBuild(frame)));

        assert_eq!(router.state.paths.current_transit_paths(), 1);
        assert!(router.state.paths.get_transit_hop(&from, &record.rx_id).is_some());
        let forwarded = router.link.sent_to(&next);
        assert_eq!(forwarded.len(), 1);
        match &forwarded[0] {
            LinkFrame::PathBuild(fwd) => assert_eq!(fwd.hops.len(), 1),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn pivot_build_confirms_downstream() {
        let mut router = test_router(true);
        let from = Keypair::generate().router_id();
        let (frame, record) = build_frame_for(&router, None);

        router
            .state
            .handle_inbound(inbound(from, LinkFrame::PathBuild(frame)));

        let hop = router
            .state
            .paths
            .get_transit_hop(&from, &record.rx_id)
            .unwrap()
            .clone();
        assert_eq!(hop.upstream, router.state.router_id());
        let confirmations = router.link.sent_to(&from);
        assert!(confirmations.iter().any(|f| matches!(
            f,
            LinkFrame::PathBuildReply { hop_id, ok: true } if *hop_id == record.rx_id
        )));
    }

    #[test]
    fn transit_refused_when_not_allowed() {
        let mut router = test_router(false);
        let from = Keypair::generate().router_id();
        let (frame, _) = build_frame_for(&router, None);
        router
            .state
            .handle_inbound(inbound(from, LinkFrame::PathBuild(frame)));
        assert_eq!(router.state.paths.current_transit_paths(), 0);
        assert!(router.link.sent().is_empty());
    }

    #[test]
    fn undecryptable_build_record_drops_peer() {
        let mut router = test_router(true);
        let from = Keypair::generate().router_id();
        let other = crypto::generate_encryption_secret();
        let sealed = crypto::seal_to(
            &crypto::encryption_public_key(&other),
            b"not for us",
        )
        .unwrap();
        router.state.handle_inbound(inbound(
            from,
            LinkFrame::PathBuild(PathBuildFrame { hops: vec![sealed] }),
        ));
        assert_eq!(router.link.dropped(), vec![from]);
        assert_eq!(router.state.paths.current_transit_paths(), 0);
    }

    #[test]
    fn pivot_latency_probe_is_echoed() {
        let mut router = test_router(true);
        let from = Keypair::generate().router_id();
        let (frame, record) = build_frame_for(&router, None);
        router
            .state
            .handle_inbound(inbound(from, LinkFrame::PathBuild(frame)));
        router.link.clear();

        // One remaining onion layer (ours) around a latency control.
        let control = PathPayload::Control(PathControl {
            seq: 5,
            method: methods::PATH_LATENCY.to_string(),
            body: bincode::serialize(&LatencyBody { probe_id: 42 }).unwrap(),
        });
        let mut payload = bincode::serialize(&control).unwrap();
        let nonce = crypto::random_onion_nonce();
        crypto::apply_onion_layer(&record.key, &nonce, &mut payload);

        router.state.handle_inbound(inbound(
            from,
            LinkFrame::Upstream(RelayFrame {
                hop_id: record.rx_id,
                nonce,
                payload,
            }),
        ));

        let replies = router.link.sent_to(&from);
        assert_eq!(replies.len(), 1);
        let LinkFrame::Downstream(reply) = &replies[0] else {
            panic!("expected downstream reply");
        };
        assert_eq!(reply.hop_id, record.rx_id);
        // Strip our layer and decode the echo.
        let mut bytes = reply.payload.clone();
        crypto::apply_onion_layer(&record.key, &reply.nonce, &mut bytes);
        let decoded: PathPayload = messages::deserialize_bounded(&bytes).unwrap();
        let PathPayload::Reply(reply) = decoded else {
            panic!("expected reply payload");
        };
        assert_eq!(reply.seq, 5);
        let echoed: LatencyBody = messages::deserialize_bounded(&reply.body).unwrap();
        assert_eq!(echoed.probe_id, 42);
    }

    #[test]
    fn exit_grant_lifecycle_over_path_controls() {
        let mut router = test_router(true);
        let from = Keypair::generate().router_id();
        let (frame, record) = build_frame_for(&router, None);
        router
            .state
            .handle_inbound(inbound(from, LinkFrame::PathBuild(frame)));
        let hop = router
            .state
            .paths
            .get_transit_hop(&from, &record.rx_id)
            .unwrap()
            .clone();

        router.state.handle_path_control(
            from,
            hop.clone(),
            PathControl {
                seq: 1,
                method: methods::OBTAIN_EXIT.to_string(),
                body: bincode::serialize(&ObtainExitBody { flag: 1, tx_id: 9 }).unwrap(),
            },
        );
        assert_eq!(router.state.exit_grants.get(&record.rx_id), Some(&9));

        router.state.handle_path_control(
            from,
            hop,
            PathControl {
                seq: 2,
                method: methods::CLOSE_EXIT.to_string(),
                body: bincode::serialize(&CloseExitBody { tx_id: 9 }).unwrap(),
            },
        );
        assert!(router.state.exit_grants.is_empty());
    }

    #[test]
    fn own_path_build_reply_establishes_and_notifies_handler() {
        let mut router = test_router(true);
        let now = Instant::now();
        // Hand-build a path whose first hop we control.
        let secrets: Vec<_> = (0..3).map(|_| crypto::generate_encryption_secret()).collect();
        let rcs: Vec<RouterContact> = secrets
            .iter()
            .map(|s| {
                Keypair::generate().create_contact(
                    vec!["127.0.0.1:7601".into()],
                    crypto::encryption_public_key(s),
                    false,
                )
            })
            .collect();
        let first_rid = rcs[0].rid;
        let (path, _frame) = Path::build(rcs, HandlerId(1), now, false, true).unwrap();
        let canonical = router.state.paths.add_own_path(path);

        router.state.handle_inbound(inbound(
            first_rid,
            LinkFrame::PathBuildReply {
                hop_id: canonical,
                ok: true,
            },
        ));
        let path = router.state.paths.get_path(&canonical).unwrap();
        assert_eq!(path.status(), PathStatus::Established);

        // A second confirmation is a no-op.
        router.state.handle_inbound(inbound(
            first_rid,
            LinkFrame::PathBuildReply {
                hop_id: canonical,
                ok: true,
            },
        ));
        assert_eq!(
            router.state.paths.get_path(&canonical).unwrap().status(),
            PathStatus::Established
        );
    }

    #[test]
    fn failed_build_reply_removes_path() {
        let mut router = test_router(true);
        let now = Instant::now();
        let secrets: Vec<_> = (0..3).map(|_| crypto::generate_encryption_secret()).collect();
        let rcs: Vec<RouterContact> = secrets
            .iter()
            .map(|s| {
                Keypair::generate().create_contact(
                    vec!["127.0.0.1:7602".into()],
                    crypto::encryption_public_key(s),
                    false,
                )
            })
            .collect();
        let first_rid = rcs[0].rid;
        let (path, _frame) = Path::build(rcs, HandlerId(1), now, false, true).unwrap();
        let canonical = router.state.paths.add_own_path(path);

        router.state.handle_inbound(inbound(
            first_rid,
            LinkFrame::PathBuildReply {
                hop_id: canonical,
                ok: false,
            },
        ));
        assert!(router.state.paths.get_path(&canonical).is_none());
    }
}
