//! # DHT Bucket
//!
//! In-memory node storage for the DHT handler: an ordered map from
//! [`DhtKey`] to a stored node, queried by XOR distance. Two instantiations
//! exist, [`RcNode`] for router contacts and [`IsNode`] for encrypted
//! introsets; the handler owns one bucket of each.
//!
//! Nearest-N queries return keys in non-decreasing XOR distance from the
//! target; equal distances (possible only for identical keys) break by
//! lexicographic key order. Storage is a `BTreeMap`, so sweep iteration is
//! stable under same-task mutation done between sweeps.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::IteratorRandom;

use crate::identity::RouterContact;
use crate::keys::{distance_cmp, DhtKey};
use crate::service::EncryptedIntroSet;

/// A router contact stored in the DHT.
#[derive(Clone, Debug)]
pub struct RcNode {
    pub rc: RouterContact,
}

impl RcNode {
    pub fn new(rc: RouterContact) -> Self {
        Self { rc }
    }

    pub fn key(&self) -> DhtKey {
        self.rc.dht_key()
    }
}

/// An encrypted introset stored in the DHT.
#[derive(Clone, Debug)]
pub struct IsNode {
    pub introset: EncryptedIntroSet,
}

impl IsNode {
    pub fn new(introset: EncryptedIntroSet) -> Self {
        Self { introset }
    }

    pub fn key(&self) -> DhtKey {
        self.introset.location
    }
}

/// Ordered key-to-node map with XOR-nearest queries.
#[derive(Debug, Default)]
pub struct Bucket<T> {
    nodes: BTreeMap<DhtKey, T>,
}

impl<T> Bucket<T> {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Insert or replace. Idempotent for equal values.
    pub fn put(&mut self, key: DhtKey, value: T) {
        self.nodes.insert(key, value);
    }

    pub fn get(&self, key: &DhtKey) -> Option<&T> {
        self.nodes.get(key)
    }

    /// Remove; absent keys are not an error.
    pub fn del(&mut self, key: &DhtKey) {
        self.nodes.remove(key);
    }

    pub fn contains(&self, key: &DhtKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The `n` keys closest to `target` excluding `exclude`, distance
    /// ascending. The flag reports whether `n` keys were actually
    /// available after exclusion.
    pub fn get_many_nearest(
        &self,
        target: &DhtKey,
        n: usize,
        exclude: &BTreeSet<DhtKey>,
    ) -> (Vec<DhtKey>, bool) {
        if n == 0 {
            return (Vec::new(), true);
        }
        let mut candidates: Vec<DhtKey> = self
            .nodes
            .keys()
            .filter(|k| !exclude.contains(*k))
            .copied()
            .collect();
        candidates.sort_by(|a, b| {
            distance_cmp(&target.distance(a), &target.distance(b)).then_with(|| a.cmp(b))
        });
        let sufficient = candidates.len() >= n;
        candidates.truncate(n);
        (candidates, sufficient)
    }

    /// Uniform sample of `n` distinct keys, fewer if the bucket is small.
    pub fn get_many_random(&self, n: usize) -> Vec<DhtKey> {
        self.nodes
            .keys()
            .copied()
            .choose_multiple(&mut rand::thread_rng(), n)
    }

    /// Single nearest key to `target`, if any.
    pub fn find_closest(&self, target: &DhtKey) -> Option<DhtKey> {
        self.nodes
            .keys()
            .min_by(|a, b| {
                distance_cmp(&target.distance(a), &target.distance(b)).then_with(|| a.cmp(b))
            })
            .copied()
    }

    /// Keep only nodes satisfying the predicate; used by the expiry sweep.
    pub fn retain(&mut self, mut f: impl FnMut(&DhtKey, &T) -> bool) {
        self.nodes.retain(|k, v| f(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DhtKey, &T)> {
        self.nodes.iter()
    }
}
