//! # Node Database
//!
//! Persistent set of known router contacts. The in-memory map is owned by
//! the event loop; disk writes are posted through an injected disk-IO
//! queue and never run on the loop itself.
//!
//! ## Persistence layout
//!
//! One bincode file per contact (`<rid hex>.rc`) under the node-db
//! directory, plus a `manifest.idx` listing live router ids, rewritten on
//! each mutation. Loading trusts the files only as far as their expiry
//! stamp; expired contacts are skipped silently and everything else is
//! re-validated by the caller-supplied checker on the next refresh.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::seq::IteratorRandom;
use tracing::{debug, trace, warn};

use crate::identity::{now_ms, RouterContact, RouterId};
use crate::keys::{distance_cmp, DhtKey};

/// Runs a closure on a background worker. Completions that need loop state
/// must re-enter through `Router::call_soon`.
pub type DiskIoQueue = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Validates a contact (signature, structure, freshness) before admission.
pub type RcChecker = Arc<dyn Fn(&RouterContact) -> bool + Send + Sync>;

/// Index file listing live router ids.
const MANIFEST_NAME: &str = "manifest.idx";

/// File suffix for serialized contacts.
const RC_SUFFIX: &str = "rc";

pub struct NodeDb {
    dir: PathBuf,
    entries: HashMap<RouterId, RouterContact>,
    disk: DiskIoQueue,
    checker: RcChecker,
}

impl NodeDb {
    pub fn new(dir: PathBuf, disk: DiskIoQueue, checker: RcChecker) -> Self {
        Self {
            dir,
            entries: HashMap::new(),
            disk,
            checker,
        }
    }

    /// Read every persisted contact, silently dropping expired ones.
    /// Called once at setup, before the event loop starts.
    pub fn load_all(&mut self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create node-db dir {}", self.dir.display()))?;

        let now = now_ms();
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read node-db dir {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RC_SUFFIX) {
                continue;
            }
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable rc file, skipping");
                    continue;
                }
            };
            let rc: RouterContact = match crate::messages::deserialize_bounded(&bytes) {
                Ok(rc) => rc,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "corrupt rc file, skipping");
                    continue;
                }
            };
            if rc.is_expired(now) {
                trace!(rid = %rc.rid, "skipping expired rc on load");
                continue;
            }
            self.entries.insert(rc.rid, rc);
            loaded += 1;
        }
        debug!(loaded, dir = %self.dir.display(), "node db loaded");
        Ok(loaded)
    }

    pub fn get(&self, id: &RouterId) -> Option<&RouterContact> {
        self.entries.get(id)
    }

    pub fn has(&self, id: &RouterId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Contact whose key is XOR-nearest to `key`, ties broken by
    /// lexicographic key order.
    pub fn find_closest_to(&self, key: &DhtKey) -> Option<&RouterContact> {
        self.entries.values().min_by(|a, b| {
            let da = key.distance(&a.dht_key());
            let db = key.distance(&b.dht_key());
            distance_cmp(&da, &db).then_with(|| a.dht_key().cmp(&b.dht_key()))
        })
    }

    /// Uniform sample of up to `n` contacts passing `filter`.
    pub fn sample(
        &self,
        n: usize,
        filter: impl Fn(&RouterContact) -> bool,
    ) -> Vec<RouterContact> {
        self.entries
            .values()
            .filter(|rc| filter(rc))
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), n)
    }

    /// Validate and insert a contact, queuing the disk write. Returns
    /// whether the contact was admitted.
    pub fn put_rc_async(&mut self, rc: RouterContact) -> bool {
        if !(self.checker)(&rc) {
            debug!(rid = %rc.rid, "node db rejected contact");
            return false;
        }
        let path = self.rc_path(&rc.rid);
        let bytes = match bincode::serialize(&rc) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(rid = %rc.rid, error = %err, "failed to serialize contact");
                return false;
            }
        };
        self.entries.insert(rc.rid, rc);
        let manifest = self.manifest_snapshot();
        let manifest_path = self.dir.join(MANIFEST_NAME);
        (self.disk)(Box::new(move || {
            if let Err(err) = write_atomic(&path, &bytes) {
                warn!(path = %path.display(), error = %err, "rc disk write failed");
            }
            if let Err(err) = write_atomic(&manifest_path, manifest.as_bytes()) {
                warn!(path = %manifest_path.display(), error = %err, "manifest write failed");
            }
        }));
        true
    }

    /// Remove from memory and queue the file removal.
    pub fn del_async(&mut self, id: &RouterId) {
        if self.entries.remove(id).is_none() {
            return;
        }
        let path = self.rc_path(id);
        let manifest = self.manifest_snapshot();
        let manifest_path = self.dir.join(MANIFEST_NAME);
        (self.disk)(Box::new(move || {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "rc file removal failed");
                }
            }
            if let Err(err) = write_atomic(&manifest_path, manifest.as_bytes()) {
                warn!(path = %manifest_path.display(), error = %err, "manifest write failed");
            }
        }));
    }

    /// Drop expired contacts from memory and disk.
    pub fn remove_expired(&mut self, now: u64) -> usize {
        let expired: Vec<RouterId> = self
            .entries
            .values()
            .filter(|rc| rc.is_expired(now))
            .map(|rc| rc.rid)
            .collect();
        for rid in &expired {
            self.del_async(rid);
        }
        expired.len()
    }

    fn rc_path(&self, id: &RouterId) -> PathBuf {
        self.dir.join(format!("{}.{}", id.to_hex(), RC_SUFFIX))
    }

    fn manifest_snapshot(&self) -> String {
        let mut lines: Vec<String> = self.entries.keys().map(|rid| rid.to_hex()).collect();
        lines.sort();
        lines.join("\n")
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::sync::atomic::{AtomicU64, Ordering};

    static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("umbra-nodedb-{}-{}", std::process::id(), n))
    }

    /// Runs disk jobs inline so tests observe writes immediately.
    fn inline_disk() -> DiskIoQueue {
        Arc::new(|job: Box<dyn FnOnce() + Send>| job())
    }

    fn accepting_checker() -> RcChecker {
        Arc::new(|rc: &RouterContact| rc.verify().is_ok())
    }

    fn db(dir: PathBuf) -> NodeDb {
        let mut db = NodeDb::new(dir, inline_disk(), accepting_checker());
        db.load_all().unwrap();
        db
    }

    fn contact() -> RouterContact {
        Keypair::generate().create_contact(vec!["127.0.0.1:7100".into()], [1u8; 32], false)
    }

    #[test]
    fn put_then_get_and_has() {
        let mut db = db(test_dir());
        let rc = contact();
        assert!(db.put_rc_async(rc.clone()));
        assert!(db.has(&rc.rid));
        assert_eq!(db.get(&rc.rid), Some(&rc));
    }

    #[test]
    fn rejected_contact_is_not_stored() {
        let mut db = db(test_dir());
        let mut rc = contact();
        rc.signature[0] ^= 1;
        assert!(!db.put_rc_async(rc.clone()));
        assert!(!db.has(&rc.rid));
    }

    #[test]
    fn persisted_contacts_survive_reload() {
        let dir = test_dir();
        let rc = contact();
        {
            let mut db = db(dir.clone());
            assert!(db.put_rc_async(rc.clone()));
        }
        let db2 = db(dir);
        assert_eq!(db2.get(&rc.rid), Some(&rc));
    }

    #[test]
    fn expired_contacts_are_skipped_on_load() {
        let dir = test_dir();
        let mut rc = contact();
        {
            let mut db = db(dir.clone());
            assert!(db.put_rc_async(rc.clone()));
            // Rewrite the stored file with an expired copy, bypassing the
            // checker, to simulate expiry while the node was down.
            rc.expires_at = 1;
            rc.issued_at = 0;
            let path = dir.join(format!("{}.rc", rc.rid.to_hex()));
            std::fs::write(&path, bincode::serialize(&rc).unwrap()).unwrap();
        }
        let db2 = db(dir);
        assert!(!db2.has(&rc.rid));
    }

    #[test]
    fn del_removes_memory_and_disk() {
        let dir = test_dir();
        let mut db = db(dir.clone());
        let rc = contact();
        db.put_rc_async(rc.clone());
        db.del_async(&rc.rid);
        assert!(!db.has(&rc.rid));
        assert!(!dir.join(format!("{}.rc", rc.rid.to_hex())).exists());
    }

    #[test]
    fn find_closest_to_picks_minimum_distance() {
        let mut db = db(test_dir());
        let contacts: Vec<RouterContact> = (0..8).map(|_| contact()).collect();
        for rc in &contacts {
            db.put_rc_async(rc.clone());
        }
        let target = DhtKey::random();
        let expected = contacts
            .iter()
            .min_by(|a, b| {
                distance_cmp(
                    &target.distance(&a.dht_key()),
                    &target.distance(&b.dht_key()),
                )
            })
            .unwrap();
        assert_eq!(db.find_closest_to(&target).unwrap().rid, expected.rid);
    }

    #[test]
    fn sample_respects_filter_and_count() {
        let mut db = db(test_dir());
        for _ in 0..6 {
            db.put_rc_async(contact());
        }
        let sample = db.sample(4, |_| true);
        assert_eq!(sample.len(), 4);
        let none = db.sample(4, |_| false);
        assert!(none.is_empty());
    }
}
