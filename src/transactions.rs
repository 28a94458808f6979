//! # Pending DHT Transactions
//!
//! Turns request/response wire pairs into asynchronous lookups. A
//! transaction is keyed by its [`TxOwner`], the `(peer key, txid)` pair of
//! the wire exchange, and carries the original asker, the lookup target,
//! accumulated values and a deadline. The DHT handler owns three tables,
//! one per lookup category (router / introset / explore).
//!
//! ## Job model
//!
//! Behavior lives in a [`TxJob`] implementation per lookup kind:
//! `start` emits the wire request, `on_values` digests a reply and decides
//! whether the transaction is finished, `send_reply` delivers the final
//! result to the asker (a local callback, a path, or a remote peer).
//! Jobs receive the handler environment as an explicit parameter instead
//! of holding a back-reference; follow-up lookups are queued on the
//! environment and drained by the handler after the table call returns,
//! which keeps re-entrant table access impossible by construction.
//!
//! A transaction is complete once its reply has been sent (success or
//! timeout); completion always removes it from the table, and replies for
//! unknown owners are dropped.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::{trace, warn};

use crate::dht::DhtEnv;
use crate::identity::RouterContact;
use crate::keys::DhtKey;
use crate::service::EncryptedIntroSet;

/// Result of a lookup delivered through a completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// The lookup resolved empty.
    NotFound,
    /// The transaction expired before a usable reply arrived.
    Timeout,
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound => write!(f, "not found"),
            LookupError::Timeout => write!(f, "lookup timed out"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Completion handler for router lookups.
pub type RouterLookupHandler =
    Box<dyn FnOnce(Result<Vec<RouterContact>, LookupError>) + Send>;

/// Completion handler for introset lookups.
pub type IntroSetLookupHandler =
    Box<dyn FnOnce(Result<EncryptedIntroSet, LookupError>) + Send>;

/// Identity of one wire exchange: the remote peer and the transaction id
/// used on that link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxOwner {
    pub peer: DhtKey,
    pub txid: u64,
}

impl TxOwner {
    pub fn new(peer: DhtKey, txid: u64) -> Self {
        Self { peer, txid }
    }
}

/// What a job decided after digesting one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStep {
    /// The reply finished the lookup; `send_reply` fires next.
    Complete,
    /// More replies are expected before the deadline.
    Pending,
}

/// One lookup kind's behavior. `V` is the value type the category
/// accumulates (contacts, introsets, or bare router ids).
pub trait TxJob<V>: Send {
    /// Emit the wire request for this transaction.
    fn start(&mut self, owner: &TxOwner, env: &mut DhtEnv<'_>);

    /// Digest one batch of reply values (already appended to the
    /// transaction's accumulator).
    fn on_values(&mut self, values: &[V], env: &mut DhtEnv<'_>) -> TxStep;

    /// Deliver the final result. `timed_out` is set when the deadline
    /// passed without any value arriving.
    fn send_reply(&mut self, found: &[V], timed_out: bool, env: &mut DhtEnv<'_>);
}

/// An in-flight transaction.
pub struct PendingTx<V> {
    pub owner: TxOwner,
    pub asker: TxOwner,
    pub target: DhtKey,
    pub started: Instant,
    pub attempts: u32,
    pub found: Vec<V>,
    pub deadline: Instant,
    job: Box<dyn TxJob<V>>,
}

/// One category's table of in-flight transactions.
pub struct PendingTable<V> {
    txs: HashMap<TxOwner, PendingTx<V>>,
    default_timeout: Duration,
}

impl<V: Clone + PartialEq> PendingTable<V> {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            txs: HashMap::new(),
            default_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, owner: &TxOwner) -> bool {
        self.txs.contains_key(owner)
    }

    /// True iff any live transaction is after this target.
    pub fn has_lookup_for(&self, target: &DhtKey) -> bool {
        self.txs.values().any(|tx| tx.target == *target)
    }

    /// Owners of every live transaction, in no particular order.
    pub fn owners(&self) -> Vec<TxOwner> {
        self.txs.keys().copied().collect()
    }

    pub fn target_of(&self, owner: &TxOwner) -> Option<DhtKey> {
        self.txs.get(owner).map(|tx| tx.target)
    }

    pub fn attempts_of(&self, owner: &TxOwner) -> Option<u32> {
        self.txs.get(owner).map(|tx| tx.attempts)
    }

    /// Move a live transaction to a new wire owner and re-dispatch it:
    /// used when an iterative hint points at a closer peer. The deadline
    /// restarts and the attempt counter grows.
    pub fn reissue(&mut self, owner: &TxOwner, new_owner: TxOwner, env: &mut DhtEnv<'_>) -> bool {
        let Some(mut tx) = self.txs.remove(owner) else {
            return false;
        };
        tx.owner = new_owner;
        tx.attempts += 1;
        tx.deadline = env.now + self.default_timeout;
        tx.job.start(&new_owner, env);
        if self.txs.insert(new_owner, tx).is_some() {
            warn!(txid = new_owner.txid, "txid collision replaced a pending lookup");
        }
        true
    }

    /// Create a transaction and dispatch its wire request. A duplicate
    /// owner means a txid collision; the old transaction is replaced and
    /// the event logged loudly.
    pub fn new_tx(
        &mut self,
        owner: TxOwner,
        asker: TxOwner,
        target: DhtKey,
        mut job: Box<dyn TxJob<V>>,
        timeout: Option<Duration>,
        env: &mut DhtEnv<'_>,
    ) {
        job.start(&owner, env);
        let now = env.now;
        let tx = PendingTx {
            owner,
            asker,
            target,
            started: now,
            attempts: 1,
            found: Vec::new(),
            deadline: now + timeout.unwrap_or(self.default_timeout),
            job,
        };
        if self.txs.insert(owner, tx).is_some() {
            warn!(txid = owner.txid, "txid collision replaced a pending lookup");
        }
    }

    /// Deliver reply values to the owning transaction. Returns whether a
    /// live transaction matched; late and unknown replies are ignored.
    pub fn on_reply(&mut self, owner: &TxOwner, values: Vec<V>, env: &mut DhtEnv<'_>) -> bool {
        let Some(mut tx) = self.txs.remove(owner) else {
            trace!(txid = owner.txid, "reply for unknown or completed tx, ignoring");
            return false;
        };
        for value in &values {
            if !tx.found.contains(value) {
                tx.found.push(value.clone());
            }
        }
        match tx.job.on_values(&values, env) {
            TxStep::Complete => {
                tx.job.send_reply(&tx.found, false, env);
            }
            TxStep::Pending => {
                self.txs.insert(*owner, tx);
            }
        }
        true
    }

    /// Remove transactions whose deadline passed, invoking their reply
    /// with whatever was found; an empty accumulator reports a timeout.
    pub fn expire(&mut self, now: Instant, env: &mut DhtEnv<'_>) {
        let expired: Vec<TxOwner> = self
            .txs
            .values()
            .filter(|tx| now >= tx.deadline)
            .map(|tx| tx.owner)
            .collect();
        for owner in expired {
            if let Some(mut tx) = self.txs.remove(&owner) {
                trace!(
                    txid = owner.txid,
                    asker_txid = tx.asker.txid,
                    attempts = tx.attempts,
                    elapsed_ms = now.duration_since(tx.started).as_millis() as u64,
                    found = tx.found.len(),
                    "tx expired"
                );
                let timed_out = tx.found.is_empty();
                let found = std::mem::take(&mut tx.found);
                tx.job.send_reply(&found, timed_out, env);
            }
        }
    }
}

/// Router lookup table: accumulates full contacts.
pub type PendingRouterLookups = PendingTable<RouterContact>;

/// Introset lookup table: accumulates encrypted introsets.
pub type PendingIntroSetLookups = PendingTable<EncryptedIntroSet>;

/// Exploration table: accumulates bare router ids.
pub type PendingExploreLookups = PendingTable<crate::identity::RouterId>;
