//! # Path Context
//!
//! Node-wide registry of circuits: the paths we own and the transit hops
//! we serve on other nodes' paths. The context is the sole owner of both;
//! handlers and the DHT address paths through hop-id lookups.
//!
//! ## Dual registration
//!
//! An owned path is reachable under both of its first-hop ids (RX and TX)
//! through an alias map over a canonical store keyed by the first-hop RX
//! id. A transit hop is stored twice outright, under `(downstream, rx_id)`
//! and `(upstream, tx_id)`; the entries are identical and immutable, so
//! `current_transit_paths()` is simply half the table size.
//!
//! ## Build rate limiting
//!
//! Inbound path builds are limited per source IP (port stripped) through a
//! decaying set with a 500 ms window. The check is disabled in test builds
//! and under the `testnet` feature.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::RouterId;
use crate::path::{HopId, Path};

/// Window of the per-IP path-build limiter.
pub const PATH_BUILD_LIMIT_WINDOW: Duration = Duration::from_millis(500);

/// A hop this node serves on someone else's path.
///
/// Immutable once registered; expiry is fixed at creation.
#[derive(Clone, Debug)]
pub struct TransitHop {
    pub downstream: RouterId,
    /// Next router toward the pivot; our own rid when we are the pivot.
    pub upstream: RouterId,
    pub rx_id: HopId,
    pub tx_id: HopId,
    pub key: [u8; 32],
    pub expires_at: Instant,
}

impl TransitHop {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Error from [`PathContext::put_transit_hop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopIdCollision;

impl std::fmt::Display for HopIdCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hop id already registered")
    }
}

impl std::error::Error for HopIdCollision {}

/// Set whose entries vanish after a fixed window; re-insertion while an
/// entry is present fails. Backs the per-IP build limiter.
#[derive(Debug)]
pub struct DecayingSet<T> {
    window: Duration,
    entries: HashMap<T, Instant>,
}

impl<T: std::hash::Hash + Eq> DecayingSet<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Insert `value` at `now`. Returns false if it is already present
    /// and not yet decayed.
    pub fn insert(&mut self, value: T, now: Instant) -> bool {
        match self.entries.get(&value) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                self.entries.insert(value, now);
                true
            }
        }
    }

    /// Drop entries older than the window.
    pub fn decay(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, at| now.duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct PathContext {
    our_rid: RouterId,
    /// First-hop RX and TX ids, both aliased to the canonical key.
    own_paths: HashMap<HopId, HopId>,
    /// Canonical path store, keyed by first-hop RX id.
    paths: HashMap<HopId, Path>,
    transit_hops: HashMap<(RouterId, HopId), TransitHop>,
    allow_transit: bool,
    path_limits: DecayingSet<IpAddr>,
}

impl PathContext {
    pub fn new(our_rid: RouterId) -> Self {
        Self {
            our_rid,
            own_paths: HashMap::new(),
            paths: HashMap::new(),
            transit_hops: HashMap::new(),
            allow_transit: false,
            path_limits: DecayingSet::new(PATH_BUILD_LIMIT_WINDOW),
        }
    }

    pub fn our_router_id(&self) -> RouterId {
        self.our_rid
    }

    pub fn hop_is_us(&self, rid: &RouterId) -> bool {
        self.our_rid == *rid
    }

    pub fn allow_transit(&mut self) {
        self.allow_transit = true;
    }

    pub fn is_transit_allowed(&self) -> bool {
        self.allow_transit
    }

    // ------------------------------------------------------------------
    // Own paths
    // ------------------------------------------------------------------

    /// Register an owned path under both of its first-hop ids. The
    /// canonical key (first-hop RX id) is returned for handler bookkeeping.
    pub fn add_own_path(&mut self, path: Path) -> HopId {
        let canonical = path.upstream_rx_id();
        let tx = path.upstream_tx_id();
        self.own_paths.insert(canonical, canonical);
        self.own_paths.insert(tx, canonical);
        self.paths.insert(canonical, path);
        canonical
    }

    pub fn get_path(&self, hop_id: &HopId) -> Option<&Path> {
        let canonical = self.own_paths.get(hop_id)?;
        self.paths.get(canonical)
    }

    pub fn get_path_mut(&mut self, hop_id: &HopId) -> Option<&mut Path> {
        let canonical = *self.own_paths.get(hop_id)?;
        self.paths.get_mut(&canonical)
    }

    pub fn own_path_count(&self) -> usize {
        self.paths.len()
    }

    pub fn iter_own_paths(&self) -> impl Iterator<Item = &Path> {
        self.paths.values()
    }

    pub fn iter_own_paths_mut(&mut self) -> impl Iterator<Item = &mut Path> {
        self.paths.values_mut()
    }

    /// Ready paths whose pivot is `rid`. Scanning the canonical store
    /// yields each path once despite the dual registration.
    pub fn find_owned_paths_with_endpoint(&self, rid: &RouterId, now: Instant) -> Vec<&Path> {
        self.paths
            .values()
            .filter(|p| p.pivot_rid() == *rid && p.is_ready(now))
            .collect()
    }

    /// Remove a path explicitly (death, close). Returns the owned value.
    pub fn remove_own_path(&mut self, hop_id: &HopId) -> Option<Path> {
        let canonical = *self.own_paths.get(hop_id)?;
        let path = self.paths.remove(&canonical)?;
        self.own_paths.remove(&path.upstream_rx_id());
        self.own_paths.remove(&path.upstream_tx_id());
        Some(path)
    }

    // ------------------------------------------------------------------
    // Transit hops
    // ------------------------------------------------------------------

    /// Register a transit hop under both of its keys. Hop ids are unique
    /// node-wide: any collision with an existing transit registration or
    /// an owned path rejects the hop.
    pub fn put_transit_hop(&mut self, hop: TransitHop) -> Result<(), HopIdCollision> {
        let down_key = (hop.downstream, hop.rx_id);
        let up_key = (hop.upstream, hop.tx_id);
        if self.transit_hops.contains_key(&down_key) || self.transit_hops.contains_key(&up_key) {
            return Err(HopIdCollision);
        }
        if self.own_paths.contains_key(&hop.rx_id) || self.own_paths.contains_key(&hop.tx_id) {
            return Err(HopIdCollision);
        }
        trace!(
            downstream = %hop.downstream,
            upstream = %hop.upstream,
            "registered transit hop"
        );
        self.transit_hops.insert(down_key, hop.clone());
        self.transit_hops.insert(up_key, hop);
        Ok(())
    }

    pub fn get_transit_hop(&self, rid: &RouterId, hop_id: &HopId) -> Option<&TransitHop> {
        self.transit_hops.get(&(*rid, *hop_id))
    }

    /// Each live transit path occupies exactly two table entries.
    pub fn current_transit_paths(&self) -> usize {
        self.transit_hops.len() / 2
    }

    /// Drop a transit hop by either of its keys, removing both entries.
    pub fn remove_transit_hop(&mut self, rid: &RouterId, hop_id: &HopId) -> Option<TransitHop> {
        let hop = self.transit_hops.remove(&(*rid, *hop_id))?;
        self.transit_hops.remove(&(hop.downstream, hop.rx_id));
        self.transit_hops.remove(&(hop.upstream, hop.tx_id));
        Some(hop)
    }

    // ------------------------------------------------------------------
    // Rate limiting and expiry
    // ------------------------------------------------------------------

    /// Record a path-build attempt from `addr` (port stripped) and report
    /// whether the per-IP limit was hit. Disabled in test builds.
    pub fn check_path_limit_hit_by_ip(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if cfg!(any(test, feature = "testnet")) {
            return false;
        }
        !self.path_limits.insert(addr.ip(), now)
    }

    /// Decay the rate limiter, drop expired transit hops and expired own
    /// paths. Returns the removed own paths so the caller can notify
    /// their handlers.
    pub fn expire_paths(&mut self, now: Instant) -> Vec<Path> {
        self.path_limits.decay(now);

        self.transit_hops.retain(|_, hop| !hop.is_expired(now));

        let expired: Vec<HopId> = self
            .paths
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.upstream_rx_id())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for canonical in expired {
            if let Some(path) = self.remove_own_path(&canonical) {
                debug!(upstream = %path.upstream(), pivot = %path.pivot_rid(), "own path expired");
                removed.push(path);
            }
        }
        removed
    }
}
