//! # Path
//!
//! One multi-hop onion circuit built by this node. A [`Path`] owns its hop
//! list (router contact, hop-id pair and symmetric key per hop), applies
//! layered encryption to outbound control and data frames, peels reply
//! layers, and tracks its own liveness.
//!
//! ## State machine
//!
//! ```text
//! BUILDING ──build-ok──▶ ESTABLISHED ──expire───▶ EXPIRED
//!    │                         │
//!    └──build-fail──▶ DEAD     └──explicit-close──▶ CLOSED
//! ```
//!
//! Establishment flips exactly once; the only way "back" to BUILDING is
//! [`Path::rebuild`], which produces a fresh path over the same routers
//! with new hop ids and keys.
//!
//! ## Hop id layout
//!
//! Adjacent hops share an id: `hops[i].tx_id == hops[i+1].rx_id`, and the
//! pivot's `tx_id` equals its own `rx_id`. Forwarding at a relay is then a
//! single table lookup, and the owner addresses the whole circuit through
//! `hops[0].rx_id`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::crypto::{self, OnionNonce};
use crate::identity::{RouterContact, RouterId};
use crate::keys::DhtKey;
use crate::link::LinkSender;
use crate::messages::{
    methods, BuildRecord, CloseExitBody, FindIntroBody, LinkFrame, NameLookupBody, ObtainExitBody,
    PathBuildFrame, PathControl, PathControlReply, PathPayload, PublishIntroBody, RelayFrame,
    UpdateExitBody,
};
use crate::service::EncryptedIntroSet;

/// Default circuit length.
pub const DEFAULT_HOP_COUNT: usize = 3;

/// Lifetime granted to every hop of a fresh path.
pub const DEFAULT_PATH_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// A path this close to expiry no longer counts as ready.
pub const EXPIRES_SOON_GUARD: Duration = Duration::from_secs(5);

/// Per-request timeout for path control RPCs.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time after which an established path gets a latency probe.
const LATENCY_PROBE_AFTER: Duration = Duration::from_secs(30);

/// Unanswered probe time after which the path is declared dead.
const LATENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 128-bit hop identifier, unique per local node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HopId([u8; 16]);

impl HopId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        if getrandom::getrandom(&mut bytes).is_err() {
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut bytes);
        }
        Self(bytes)
    }
}

impl std::fmt::Debug for HopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HopId({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for HopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identifies the path handler a path reports its lifecycle to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Completion hook for a path control RPC: `(reply body, timed_out)`.
/// The body is `None` exactly when the request timed out or was cancelled.
pub type ControlHook = Box<dyn FnOnce(Option<Vec<u8>>, bool) + Send>;

/// One hop of an owned path.
#[derive(Clone)]
pub struct Hop {
    pub rc: RouterContact,
    pub rx_id: HopId,
    pub tx_id: HopId,
    pub key: [u8; 32],
    pub lifetime: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Expired,
    Dead,
    Closed,
}

struct PendingControl {
    hook: ControlHook,
    sent_at: Instant,
    timeout: Duration,
}

pub struct Path {
    hops: Vec<Hop>,
    handler: HandlerId,
    status: PathStatus,
    build_started: Instant,
    last_recv: Instant,
    is_session: bool,
    is_client: bool,
    ever_established: bool,
    next_seq: u64,
    pending: HashMap<u64, PendingControl>,
    outstanding_probe: Option<(u64, Instant)>,
}

impl Path {
    /// Assemble a new path over `rcs` (first hop first, pivot last) and
    /// the build frame to send to the first hop. Fails only on an empty
    /// hop list or a sealing error.
    pub fn build(
        rcs: Vec<RouterContact>,
        handler: HandlerId,
        now: Instant,
        is_session: bool,
        is_client: bool,
    ) -> Result<(Self, PathBuildFrame), crypto::SealError> {
        if rcs.is_empty() {
            return Err(crypto::SealError::SealFailed);
        }
        let n = rcs.len();
        let rx_ids: Vec<HopId> = (0..n).map(|_| HopId::random()).collect();

        let mut hops = Vec::with_capacity(n);
        let mut records = Vec::with_capacity(n);
        for (i, rc) in rcs.into_iter().enumerate() {
            let rx_id = rx_ids[i];
            let tx_id = if i + 1 < n { rx_ids[i + 1] } else { rx_ids[i] };
            let mut key = [0u8; 32];
            if getrandom::getrandom(&mut key).is_err() {
                use rand::RngCore;
                rand::rngs::OsRng.fill_bytes(&mut key);
            }
            let record = BuildRecord {
                rx_id,
                tx_id,
                // Filled in below once every hop's rid is known.
                upstream: None,
                key,
                lifetime_ms: DEFAULT_PATH_LIFETIME.as_millis() as u64,
            };
            hops.push(Hop {
                rc,
                rx_id,
                tx_id,
                key,
                lifetime: DEFAULT_PATH_LIFETIME,
            });
            records.push(record);
        }
        // Fill in upstream links now that every rid is known.
        for i in 0..n {
            records[i].upstream = if i + 1 < n {
                Some(hops[i + 1].rc.rid)
            } else {
                None
            };
        }
        let sealed = hops
            .iter()
            .zip(records.iter())
            .map(|(hop, record)| {
                let plaintext =
                    bincode::serialize(record).map_err(|_| crypto::SealError::SealFailed)?;
                crypto::seal_to(&hop.rc.enc_key, &plaintext)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let path = Self {
            hops,
            handler,
            status: PathStatus::Building,
            build_started: now,
            last_recv: now,
            is_session,
            is_client,
            ever_established: false,
            next_seq: 1,
            pending: HashMap::new(),
            outstanding_probe: None,
        };
        Ok((path, PathBuildFrame { hops: sealed }))
    }

    /// A fresh BUILDING path over the same routers with new ids and keys.
    pub fn rebuild(&self, now: Instant) -> Result<(Self, PathBuildFrame), crypto::SealError> {
        Self::build(
            self.hops.iter().map(|h| h.rc.clone()).collect(),
            self.handler,
            now,
            self.is_session,
            self.is_client,
        )
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn status(&self) -> PathStatus {
        self.status
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn hop_rids(&self) -> Vec<RouterId> {
        self.hops.iter().map(|h| h.rc.rid).collect()
    }

    /// First hop's router.
    pub fn upstream(&self) -> RouterId {
        self.hops[0].rc.rid
    }

    pub fn upstream_rx_id(&self) -> HopId {
        self.hops[0].rx_id
    }

    pub fn upstream_tx_id(&self) -> HopId {
        self.hops[0].tx_id
    }

    /// Last hop's router; terminates DHT and name queries.
    pub fn pivot_rid(&self) -> RouterId {
        self.hops[self.hops.len() - 1].rc.rid
    }

    pub fn pivot_rx_id(&self) -> HopId {
        self.hops[self.hops.len() - 1].rx_id
    }

    pub fn pivot_tx_id(&self) -> HopId {
        self.hops[self.hops.len() - 1].tx_id
    }

    pub fn is_session_path(&self) -> bool {
        self.is_session
    }

    pub fn is_client_path(&self) -> bool {
        self.is_client
    }

    pub fn last_remote_activity_at(&self) -> Instant {
        self.last_recv
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Build confirmation arrived. Returns whether the flip happened; the
    /// transition is monotonic and fires at most once.
    pub fn mark_established(&mut self, now: Instant) -> bool {
        if self.status == PathStatus::Building {
            self.status = PathStatus::Established;
            self.ever_established = true;
            self.mark_active(now);
            true
        } else {
            false
        }
    }

    /// Whether the build ever completed, regardless of current status.
    pub fn ever_established(&self) -> bool {
        self.ever_established
    }

    /// Build rejected somewhere along the way.
    pub fn mark_build_failed(&mut self) {
        if self.status == PathStatus::Building {
            self.status = PathStatus::Dead;
        }
    }

    pub fn mark_active(&mut self, now: Instant) {
        if now > self.last_recv {
            self.last_recv = now;
        }
    }

    pub fn expire_time(&self) -> Instant {
        self.build_started + self.hops[0].lifetime
    }

    pub fn expires_soon(&self, now: Instant, delta: Duration) -> bool {
        now + delta >= self.expire_time()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(
            self.status,
            PathStatus::Expired | PathStatus::Dead | PathStatus::Closed
        ) || now >= self.expire_time()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.status == PathStatus::Established && !self.expires_soon(now, EXPIRES_SOON_GUARD)
    }

    // ------------------------------------------------------------------
    // Onion plumbing
    // ------------------------------------------------------------------

    /// Apply every hop's keystream. Used both to pre-wrap outbound frames
    /// (each relay strips one layer) and to peel fully-layered replies.
    fn apply_all_layers(&self, nonce: &OnionNonce, buf: &mut [u8]) {
        for hop in &self.hops {
            crypto::apply_onion_layer(&hop.key, nonce, buf);
        }
    }

    fn send_payload(&self, payload: &PathPayload, link: &dyn LinkSender) {
        let mut bytes = match bincode::serialize(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                trace!(error = %err, "failed to serialize path payload");
                return;
            }
        };
        let nonce = crypto::random_onion_nonce();
        self.apply_all_layers(&nonce, &mut bytes);
        link.send(
            self.upstream(),
            LinkFrame::Upstream(RelayFrame {
                hop_id: self.upstream_rx_id(),
                nonce,
                payload: bytes,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Control RPC
    // ------------------------------------------------------------------

    /// Send an onion-wrapped control request along the path. The hook, if
    /// any, fires with the decrypted reply body or with a timeout flag.
    /// Returns the request sequence number.
    pub fn send_path_control_message(
        &mut self,
        method: &str,
        body: Vec<u8>,
        hook: Option<ControlHook>,
        link: &dyn LinkSender,
        now: Instant,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let payload = PathPayload::Control(PathControl {
            seq,
            method: method.to_string(),
            body,
        });
        self.send_payload(&payload, link);
        if let Some(hook) = hook {
            self.pending.insert(
                seq,
                PendingControl {
                    hook,
                    sent_at: now,
                    timeout: CONTROL_TIMEOUT,
                },
            );
        }
        seq
    }

    /// Datagram send without a callback.
    pub fn send_path_data_message(&self, body: Vec<u8>, link: &dyn LinkSender) {
        self.send_payload(&PathPayload::Data { body }, link);
    }

    pub fn resolve_ons(
        &mut self,
        name: &str,
        hook: ControlHook,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        let body = bincode::serialize(&NameLookupBody {
            name: name.to_string(),
        })
        .expect("name lookup body serializes");
        self.send_path_control_message(methods::LOOKUP_NAME, body, Some(hook), link, now);
    }

    pub fn find_intro(
        &mut self,
        location: DhtKey,
        is_relayed: bool,
        order: u64,
        hook: ControlHook,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        let body = bincode::serialize(&FindIntroBody {
            location,
            relayed: is_relayed,
            relay_order: order,
        })
        .expect("find intro body serializes");
        self.send_path_control_message(methods::FIND_INTRO, body, Some(hook), link, now);
    }

    pub fn publish_intro(
        &mut self,
        introset: EncryptedIntroSet,
        is_relayed: bool,
        order: u64,
        hook: ControlHook,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        let body = bincode::serialize(&PublishIntroBody {
            introset,
            relayed: is_relayed,
            relay_order: order,
        })
        .expect("publish intro body serializes");
        self.send_path_control_message(methods::PUBLISH_INTRO, body, Some(hook), link, now);
    }

    pub fn obtain_exit(
        &mut self,
        flag: u64,
        tx_id: u64,
        hook: ControlHook,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        let body = bincode::serialize(&ObtainExitBody { flag, tx_id })
            .expect("obtain exit body serializes");
        self.send_path_control_message(methods::OBTAIN_EXIT, body, Some(hook), link, now);
    }

    pub fn close_exit(
        &mut self,
        tx_id: u64,
        hook: ControlHook,
        link: &dyn LinkSender,
        now: Instant,
    ) {
        let body =
            bincode::serialize(&CloseExitBody { tx_id }).expect("close exit body serializes");
        self.send_path_control_message(methods::CLOSE_EXIT, body, Some(hook), link, now);
    }

    pub fn update_exit(&mut self, tx_id: u64, link: &dyn LinkSender, now: Instant) {
        let body =
            bincode::serialize(&UpdateExitBody { tx_id }).expect("update exit body serializes");
        self.send_path_control_message(methods::UPDATE_EXIT, body, None, link, now);
    }

    /// Handle a downstream relay frame addressed to this path: peel every
    /// layer, dispatch control replies to their hooks, hand anything else
    /// back to the caller. `None` means the frame was a handled reply or
    /// undecodable.
    pub fn on_downstream(&mut self, frame: RelayFrame, now: Instant) -> Option<PathPayload> {
        let mut bytes = frame.payload;
        self.apply_all_layers(&frame.nonce, &mut bytes);
        let payload: PathPayload = match crate::messages::deserialize_bounded(&bytes) {
            Ok(payload) => payload,
            Err(err) => {
                trace!(error = %err, "undecodable downstream payload");
                return None;
            }
        };
        self.mark_active(now);
        match payload {
            PathPayload::Reply(reply) => {
                self.on_control_reply(reply);
                None
            }
            other => Some(other),
        }
    }

    fn on_control_reply(&mut self, reply: PathControlReply) {
        if let Some((probe_seq, _)) = self.outstanding_probe {
            if probe_seq == reply.seq {
                self.outstanding_probe = None;
                return;
            }
        }
        match self.pending.remove(&reply.seq) {
            Some(pending) => (pending.hook)(Some(reply.body), false),
            None => trace!(seq = reply.seq, "late control reply ignored"),
        }
    }

    /// Periodic maintenance driven by the path handler. Times out pending
    /// control requests, probes idle paths and declares them dead when a
    /// probe goes unanswered. Returns true when the path just died.
    pub fn tick(&mut self, now: Instant, link: &dyn LinkSender) -> bool {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.sent_at + p.timeout)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(pending) = self.pending.remove(&seq) {
                (pending.hook)(None, true);
            }
        }

        if self.status != PathStatus::Established {
            return false;
        }

        if let Some((_, probe_at)) = self.outstanding_probe {
            if now >= probe_at + LATENCY_PROBE_TIMEOUT {
                self.status = PathStatus::Dead;
                self.outstanding_probe = None;
                return true;
            }
        } else if now >= self.last_recv + LATENCY_PROBE_AFTER {
            let body = bincode::serialize(&crate::messages::LatencyBody {
                probe_id: self.next_seq,
            })
            .expect("latency body serializes");
            let seq = self.send_path_control_message(methods::PATH_LATENCY, body, None, link, now);
            self.outstanding_probe = Some((seq, now));
        }
        false
    }

    /// Close the path: propagate a close frame, resolve in-flight hooks
    /// with the timeout flag, transition to CLOSED.
    pub fn stop(&mut self, link: &dyn LinkSender, now: Instant) {
        if self.status == PathStatus::Closed {
            return;
        }
        if self.status == PathStatus::Established {
            self.send_path_control_message(methods::PATH_CLOSE, Vec::new(), None, link, now);
        }
        for (_, pending) in self.pending.drain() {
            (pending.hook)(None, true);
        }
        self.outstanding_probe = None;
        self.status = PathStatus::Closed;
    }

    /// Hop keys for test harnesses that simulate the relay side.
    #[cfg(test)]
    pub(crate) fn hop_keys(&self) -> Vec<[u8; 32]> {
        self.hops.iter().map(|h| h.key).collect()
    }

    /// Sequence number of the most recently sent control request.
    #[cfg(test)]
    pub(crate) fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    fn identity_key(&self) -> Vec<(RouterId, HopId, HopId)> {
        self.hops
            .iter()
            .map(|h| (h.rc.rid, h.rx_id, h.tx_id))
            .collect()
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.identity_key() == other.identity_key()
    }
}

impl Eq for Path {}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.upstream(), self.upstream_rx_id()).cmp(&(other.upstream(), other.upstream_rx_id()))
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("upstream", &self.upstream())
            .field("pivot", &self.pivot_rid())
            .field("hops", &self.hops.len())
            .field("status", &self.status)
            .finish()
    }
}
