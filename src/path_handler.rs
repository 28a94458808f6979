//! # Path Handler
//!
//! Keeps a target number of ready paths alive for one consumer (name
//! lookups, an exit session, a hidden service). The handler owns no
//! paths; it holds canonical hop-id keys into the [`PathContext`] and a
//! per-consumer view (pivot, blacklist, build bookkeeping).
//!
//! Hop selection draws uniformly from the node db, skipping expired,
//! blacklisted and reputationally bad routers, and places a pinned pivot
//! (an exit's rid) last. A path that dies young is rebuilt over the same
//! routers a bounded number of times before the handler falls back to
//! fresh selection.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::identity::{RouterContact, RouterId};
use crate::link::LinkSender;
use crate::messages::LinkFrame;
use crate::nodedb::NodeDb;
use crate::path::{HandlerId, HopId, Path, DEFAULT_HOP_COUNT};
use crate::path_context::PathContext;
use crate::profiles::Profiles;

/// Same-hops rebuild attempts before reselecting routers.
const MAX_SAME_HOPS_REBUILDS: u32 = 2;

/// What the handler's paths are for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathRole {
    /// Name and introset lookups.
    General,
    /// Traffic toward a hidden service.
    Session,
    /// Traffic toward an exit router.
    Exit,
}

/// Collaborators a handler needs for one operation.
pub struct HandlerEnv<'a> {
    pub node_db: &'a NodeDb,
    pub paths: &'a mut PathContext,
    pub profiles: &'a Profiles,
    pub link: &'a dyn LinkSender,
    pub now: Instant,
    pub now_ms: u64,
}

pub struct PathHandler {
    id: HandlerId,
    name: String,
    num_paths_desired: usize,
    hop_count: usize,
    role: PathRole,
    /// Canonical hop id (first-hop RX) to pivot rid, for every path this
    /// handler initiated that is still registered.
    paths: HashMap<HopId, RouterId>,
    /// Builds in flight (sent, not yet confirmed or failed).
    building: usize,
    blacklist: HashSet<RouterId>,
    pinned_pivot: Option<RouterId>,
    /// Same-hops rebuild counts per pivot.
    rebuilds: HashMap<RouterId, u32>,
}

impl PathHandler {
    pub fn new(
        id: HandlerId,
        name: impl Into<String>,
        num_paths_desired: usize,
        hop_count: usize,
        role: PathRole,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            num_paths_desired,
            hop_count: hop_count.max(1),
            role,
            paths: HashMap::new(),
            building: 0,
            blacklist: HashSet::new(),
            pinned_pivot: None,
            rebuilds: HashMap::new(),
        }
    }

    pub fn with_default_len(
        id: HandlerId,
        name: impl Into<String>,
        num_paths_desired: usize,
        role: PathRole,
    ) -> Self {
        Self::new(id, name, num_paths_desired, DEFAULT_HOP_COUNT, role)
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> PathRole {
        self.role
    }

    pub fn num_paths_desired(&self) -> usize {
        self.num_paths_desired
    }

    /// Force every new path to terminate at `rid` (exit sessions).
    pub fn pin_pivot(&mut self, rid: RouterId) {
        self.pinned_pivot = Some(rid);
    }

    pub fn blacklist_snode(&mut self, rid: RouterId) {
        self.blacklist.insert(rid);
    }

    /// Canonical hop ids of this handler's registered paths.
    pub fn path_keys(&self) -> Vec<HopId> {
        self.paths.keys().copied().collect()
    }

    pub fn owns_path(&self, canonical: &HopId) -> bool {
        self.paths.contains_key(canonical)
    }

    pub fn ready_count(&self, paths: &PathContext, now: Instant) -> usize {
        self.paths
            .keys()
            .filter(|k| paths.get_path(k).is_some_and(|p| p.is_ready(now)))
            .count()
    }

    pub fn building_count(&self) -> usize {
        self.building
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    /// Initiate up to `n` builds; reports how many actually started.
    pub fn build_more(&mut self, n: usize, env: &mut HandlerEnv<'_>) -> usize {
        let mut count = 0;
        debug!(
            handler = %self.name,
            n,
            needed = self.num_paths_desired,
            "building paths to random remotes"
        );
        for _ in 0..n {
            if self.build_path_to_random(env) {
                count += 1;
            }
        }
        if count < n {
            warn!(
                handler = %self.name,
                initiated = count,
                wanted = n,
                "only initiated part of the requested path builds"
            );
        }
        count
    }

    fn build_path_to_random(&mut self, env: &mut HandlerEnv<'_>) -> bool {
        let Some(hops) = self.get_hops_for_build(env) else {
            return false;
        };
        self.build_path(hops, env)
    }

    fn build_path(&mut self, hops: Vec<RouterContact>, env: &mut HandlerEnv<'_>) -> bool {
        let is_session = self.role != PathRole::General;
        let (path, frame) = match Path::build(hops, self.id, env.now, is_session, true) {
            Ok(built) => built,
            Err(err) => {
                warn!(handler = %self.name, error = %err, "path build frame failed");
                return false;
            }
        };
        let first = path.upstream();
        if let Some(rc) = env.node_db.get(&first) {
            if let Some(addr) = rc.primary_addr().and_then(|a| a.parse().ok()) {
                env.link.add_address(first, addr);
            }
        }
        let pivot = path.pivot_rid();
        debug!(handler = %self.name, upstream = %first, pivot = %pivot, "initiating path build");
        env.link.send(first, LinkFrame::PathBuild(frame));
        let canonical = env.paths.add_own_path(path);
        self.paths.insert(canonical, pivot);
        self.building += 1;
        true
    }

    /// Select hops for a new path: live, reputable, non-blacklisted,
    /// pairwise distinct, with any pinned pivot placed last. `None` when
    /// the candidate pool is too small.
    pub fn get_hops_for_build(&self, env: &HandlerEnv<'_>) -> Option<Vec<RouterContact>> {
        let now_ms = env.now_ms;
        let our_rid = env.paths.our_router_id();
        let usable = |rc: &RouterContact| {
            rc.is_live(now_ms)
                && rc.rid != our_rid
                && !self.blacklist.contains(&rc.rid)
                && !env.profiles.is_bad_for_connect(&rc.rid)
        };

        if let Some(pivot_rid) = self.pinned_pivot {
            let pivot_rc = env.node_db.get(&pivot_rid)?.clone();
            if !pivot_rc.is_live(now_ms) || self.blacklist.contains(&pivot_rid) {
                return None;
            }
            let mut hops =
                env.node_db
                    .sample(self.hop_count - 1, |rc| usable(rc) && rc.rid != pivot_rid);
            if hops.len() < self.hop_count - 1 {
                return None;
            }
            hops.push(pivot_rc);
            Some(hops)
        } else {
            let hops = env.node_db.sample(self.hop_count, usable);
            (hops.len() == self.hop_count).then_some(hops)
        }
    }

    pub fn should_build_more(&self, paths: &PathContext, now: Instant) -> bool {
        self.ready_count(paths, now) + self.building < self.num_paths_desired
    }

    /// No usable path and nothing on the way: build immediately.
    pub fn urgent_build(&self, paths: &PathContext, now: Instant) -> bool {
        self.ready_count(paths, now) == 0 && self.building == 0
    }

    /// Drive the builder; called from the router tick.
    pub fn tick(&mut self, env: &mut HandlerEnv<'_>) {
        if self.should_build_more(env.paths, env.now) {
            let missing =
                self.num_paths_desired - self.ready_count(env.paths, env.now).min(self.num_paths_desired);
            let missing = missing.saturating_sub(self.building);
            if missing > 0 {
                self.build_more(missing, env);
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle callbacks
    // ------------------------------------------------------------------

    /// Drop the bookkeeping for a path that reached its natural end of
    /// life; no rebuild follows.
    pub fn forget(&mut self, canonical: &HopId) {
        self.paths.remove(canonical);
    }

    pub fn handle_path_built(&mut self, canonical: HopId) {
        if self.paths.contains_key(&canonical) {
            self.building = self.building.saturating_sub(1);
            if let Some(pivot) = self.paths.get(&canonical) {
                self.rebuilds.remove(pivot);
            }
            debug!(handler = %self.name, "path established");
        }
    }

    /// A path died (build failure or lost liveness). The dead path has
    /// already been removed from the context; the handler may rebuild
    /// over the same routers a bounded number of times.
    pub fn handle_path_died(&mut self, path: &Path, env: &mut HandlerEnv<'_>) {
        let canonical = path.upstream_rx_id();
        if self.paths.remove(&canonical).is_none() {
            return;
        }
        if !path.ever_established() {
            // A death during build frees the in-flight slot.
            self.building = self.building.saturating_sub(1);
        }
        let pivot = path.pivot_rid();
        let attempts = self.rebuilds.entry(pivot).or_insert(0);
        if *attempts < MAX_SAME_HOPS_REBUILDS {
            *attempts += 1;
            debug!(
                handler = %self.name,
                pivot = %pivot,
                attempt = *attempts,
                "rebuilding dead path over the same hops"
            );
            match path.rebuild(env.now) {
                Ok((rebuilt, frame)) => {
                    let first = rebuilt.upstream();
                    env.link.send(first, LinkFrame::PathBuild(frame));
                    let canonical = env.paths.add_own_path(rebuilt);
                    self.paths.insert(canonical, pivot);
                    self.building += 1;
                }
                Err(err) => {
                    warn!(handler = %self.name, error = %err, "rebuild failed");
                }
            }
        } else {
            self.rebuilds.remove(&pivot);
            debug!(handler = %self.name, pivot = %pivot, "giving up on these hops");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::testenv::TestNode;
    use crate::path::PathStatus;

    fn handler_env<'a>(node: &'a mut TestNode) -> HandlerEnv<'a> {
        HandlerEnv {
            node_db: &node.node_db,
            paths: &mut node.paths,
            profiles: &node.profiles,
            link: &node.link,
            now: node.now,
            now_ms: crate::identity::now_ms(),
        }
    }

    fn seeded(n: usize) -> (TestNode, crate::dht::DhtHandler, Vec<RouterContact>) {
        let mut node = TestNode::new();
        let mut dht = node.handler();
        let contacts = (0..n).map(|_| node.seed_contact(&mut dht)).collect();
        (node, dht, contacts)
    }

    #[test]
    fn hop_selection_is_distinct_and_filtered() {
        let (mut node, _dht, contacts) = seeded(5);
        let mut handler =
            PathHandler::with_default_len(HandlerId(1), "lookup", 2, PathRole::General);
        handler.blacklist_snode(contacts[0].rid);

        let env = handler_env(&mut node);
        let hops = handler.get_hops_for_build(&env).expect("enough candidates");
        assert_eq!(hops.len(), DEFAULT_HOP_COUNT);
        let rids: HashSet<RouterId> = hops.iter().map(|rc| rc.rid).collect();
        assert_eq!(rids.len(), DEFAULT_HOP_COUNT, "hops are pairwise distinct");
        assert!(!rids.contains(&contacts[0].rid), "blacklist respected");
    }

    #[test]
    fn hop_selection_fails_on_thin_pool() {
        let (mut node, _dht, _contacts) = seeded(2);
        let handler = PathHandler::with_default_len(HandlerId(1), "lookup", 2, PathRole::General);
        let env = handler_env(&mut node);
        assert!(handler.get_hops_for_build(&env).is_none());
    }

    #[test]
    fn pinned_pivot_lands_last() {
        let (mut node, _dht, contacts) = seeded(6);
        let exit_rid = contacts[2].rid;
        let mut handler = PathHandler::with_default_len(HandlerId(2), "exit", 1, PathRole::Exit);
        handler.pin_pivot(exit_rid);

        let env = handler_env(&mut node);
        let hops = handler.get_hops_for_build(&env).expect("enough candidates");
        assert_eq!(hops.last().unwrap().rid, exit_rid);
        assert_eq!(
            hops.iter().filter(|rc| rc.rid == exit_rid).count(),
            1,
            "pivot appears exactly once"
        );
    }

    #[test]
    fn build_more_registers_paths_and_sends_frames() {
        let (mut node, _dht, _contacts) = seeded(8);
        let mut handler =
            PathHandler::with_default_len(HandlerId(3), "lookup", 4, PathRole::General);

        let mut env = handler_env(&mut node);
        let initiated = handler.build_more(2, &mut env);
        assert_eq!(initiated, 2);
        drop(env);

        assert_eq!(handler.building_count(), 2);
        assert_eq!(node.paths.own_path_count(), 2);
        let build_frames = node
            .link
            .sent()
            .into_iter()
            .filter(|(_, frame)| matches!(frame, LinkFrame::PathBuild(_)))
            .count();
        assert_eq!(build_frames, 2);
    }

    #[test]
    fn should_build_more_tracks_ready_and_building() {
        let (mut node, _dht, _contacts) = seeded(8);
        let mut handler =
            PathHandler::with_default_len(HandlerId(4), "lookup", 1, PathRole::General);
        let now = node.now;

        assert!(handler.should_build_more(&node.paths, now));
        assert!(handler.urgent_build(&node.paths, now));

        let mut env = handler_env(&mut node);
        assert_eq!(handler.build_more(1, &mut env), 1);
        drop(env);
        // One build in flight covers the target.
        assert!(!handler.should_build_more(&node.paths, now));
        assert!(!handler.urgent_build(&node.paths, now));

        // Confirm the build; the path counts as ready.
        let canonical = handler.path_keys()[0];
        node.paths
            .get_path_mut(&canonical)
            .unwrap()
            .mark_established(now);
        handler.handle_path_built(canonical);
        assert_eq!(handler.building_count(), 0);
        assert_eq!(handler.ready_count(&node.paths, now), 1);
        assert!(!handler.should_build_more(&node.paths, now));
    }

    #[test]
    fn dead_path_is_rebuilt_over_same_hops_then_abandoned() {
        let (mut node, _dht, _contacts) = seeded(6);
        let mut handler =
            PathHandler::with_default_len(HandlerId(5), "lookup", 1, PathRole::General);

        let mut env = handler_env(&mut node);
        assert_eq!(handler.build_more(1, &mut env), 1);
        drop(env);
        let canonical = handler.path_keys()[0];
        let pivot = node.paths.get_path(&canonical).unwrap().pivot_rid();

        let mut last_rids = node.paths.get_path(&canonical).unwrap().hop_rids();
        let mut current = canonical;
        for attempt in 0..MAX_SAME_HOPS_REBUILDS {
            let mut dead = node.paths.remove_own_path(&current).unwrap();
            dead.mark_build_failed();
            let mut env = handler_env(&mut node);
            handler.handle_path_died(&dead, &mut env);
            drop(env);

            assert_eq!(
                node.paths.own_path_count(),
                1,
                "rebuild {attempt} re-registered a path"
            );
            current = handler.path_keys()[0];
            let rebuilt = node.paths.get_path(&current).unwrap();
            assert_eq!(rebuilt.hop_rids(), last_rids, "same routers reused");
            assert_eq!(rebuilt.status(), PathStatus::Building);
            last_rids = rebuilt.hop_rids();
        }

        // One death past the limit: no further rebuild for this pivot.
        let mut dead = node.paths.remove_own_path(&current).unwrap();
        dead.mark_build_failed();
        let mut env = handler_env(&mut node);
        handler.handle_path_died(&dead, &mut env);
        drop(env);
        assert_eq!(node.paths.own_path_count(), 0);
        assert!(!handler.owns_path(&current));
        assert_eq!(handler.ready_count(&node.paths, node.now), 0);
        let _ = pivot;
    }

    #[test]
    fn tick_builds_toward_target() {
        let (mut node, _dht, _contacts) = seeded(10);
        let mut handler =
            PathHandler::with_default_len(HandlerId(6), "lookup", 3, PathRole::General);
        let mut env = handler_env(&mut node);
        handler.tick(&mut env);
        drop(env);
        assert_eq!(handler.building_count(), 3);
        assert_eq!(node.paths.own_path_count(), 3);

        // A second tick does not overshoot.
        let mut env = handler_env(&mut node);
        handler.tick(&mut env);
        drop(env);
        assert_eq!(handler.building_count(), 3);
        assert_eq!(node.paths.own_path_count(), 3);
    }
}
