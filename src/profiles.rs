//! # Router Profiles
//!
//! Lightweight per-router reputation. Counters feed two policy questions:
//! whether a router is worth handing to an exploring peer
//! (`is_bad_for_connect`) and whether we will relay toward it at all
//! (`session_allowed`). Counters decay on the cleanup tick so a router can
//! earn its way back after transient failures.

use std::collections::{HashMap, HashSet};

use tokio::time::{Duration, Instant};

use crate::identity::RouterId;

/// Connect failures, with no success since, after which a router is not
/// offered to exploring peers.
const CONNECT_FAIL_THRESHOLD: u32 = 5;

/// Counters older than this are halved on decay.
const DECAY_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default, Clone)]
struct Profile {
    connect_ok: u32,
    connect_fail: u32,
    path_ok: u32,
    path_fail: u32,
    last_update: Option<Instant>,
}

#[derive(Default)]
pub struct Profiles {
    entries: HashMap<RouterId, Profile>,
    banned: HashSet<RouterId>,
}

impl Profiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_succeeded(&mut self, rid: &RouterId, now: Instant) {
        let p = self.entries.entry(*rid).or_default();
        p.connect_ok = p.connect_ok.saturating_add(1);
        p.last_update = Some(now);
    }

    pub fn connect_failed(&mut self, rid: &RouterId, now: Instant) {
        let p = self.entries.entry(*rid).or_default();
        p.connect_fail = p.connect_fail.saturating_add(1);
        p.last_update = Some(now);
    }

    pub fn path_succeeded(&mut self, rid: &RouterId, now: Instant) {
        let p = self.entries.entry(*rid).or_default();
        p.path_ok = p.path_ok.saturating_add(1);
        p.last_update = Some(now);
    }

    pub fn path_failed(&mut self, rid: &RouterId, now: Instant) {
        let p = self.entries.entry(*rid).or_default();
        p.path_fail = p.path_fail.saturating_add(1);
        p.last_update = Some(now);
    }

    /// Routers that keep failing connects and have never succeeded are
    /// withheld from exploratory replies and hop selection.
    pub fn is_bad_for_connect(&self, rid: &RouterId) -> bool {
        match self.entries.get(rid) {
            Some(p) => p.connect_ok == 0 && p.connect_fail >= CONNECT_FAIL_THRESHOLD,
            None => false,
        }
    }

    /// Relay policy: whether we will forward lookups toward this router.
    pub fn session_allowed(&self, rid: &RouterId) -> bool {
        !self.banned.contains(rid)
    }

    pub fn ban(&mut self, rid: RouterId) {
        self.banned.insert(rid);
    }

    pub fn unban(&mut self, rid: &RouterId) {
        self.banned.remove(rid);
    }

    /// Halve stale counters so reputations are earned recently.
    pub fn decay(&mut self, now: Instant) {
        for p in self.entries.values_mut() {
            let stale = p
                .last_update
                .map(|t| now.duration_since(t) >= DECAY_INTERVAL)
                .unwrap_or(true);
            if stale {
                p.connect_ok /= 2;
                p.connect_fail /= 2;
                p.path_ok /= 2;
                p.path_fail /= 2;
                p.last_update = Some(now);
            }
        }
        self.entries.retain(|_, p| {
            p.connect_ok + p.connect_fail + p.path_ok + p.path_fail > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn repeated_connect_failures_mark_bad() {
        let mut profiles = Profiles::new();
        let rid = Keypair::generate().router_id();
        let now = Instant::now();
        assert!(!profiles.is_bad_for_connect(&rid));
        for _ in 0..CONNECT_FAIL_THRESHOLD {
            profiles.connect_failed(&rid, now);
        }
        assert!(profiles.is_bad_for_connect(&rid));
        // One success clears the verdict.
        profiles.connect_succeeded(&rid, now);
        assert!(!profiles.is_bad_for_connect(&rid));
    }

    #[test]
    fn bans_gate_sessions() {
        let mut profiles = Profiles::new();
        let rid = Keypair::generate().router_id();
        assert!(profiles.session_allowed(&rid));
        profiles.ban(rid);
        assert!(!profiles.session_allowed(&rid));
        profiles.unban(&rid);
        assert!(profiles.session_allowed(&rid));
    }

    #[test]
    fn decay_halves_stale_counters() {
        let mut profiles = Profiles::new();
        let rid = Keypair::generate().router_id();
        let t0 = Instant::now();
        for _ in 0..6 {
            profiles.connect_failed(&rid, t0);
        }
        profiles.decay(t0 + DECAY_INTERVAL);
        assert!(profiles.entries.get(&rid).unwrap().connect_fail == 3);
        // Decaying to zero drops the entry entirely.
        for i in 2..5 {
            profiles.decay(t0 + DECAY_INTERVAL * i);
        }
        assert!(profiles.entries.is_empty());
    }
}
