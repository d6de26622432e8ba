//! Typed access to the coordination store.
//!
//! The store itself is an external, strongly-consistent KV service
//! supporting atomic multi-key transactions and blocking watches (in
//! production, something Consul-shaped). This crate defines the trait
//! the rest of the core depends on ([`KvStore`]) plus an in-memory
//! implementation ([`InMemoryKvStore`]) suitable for tests and
//! single-node deployments, and the host-pool label management that
//! demonstrates the lock/read/diff/write pattern over it.

pub mod events;
pub mod hostpool;
mod memory;
pub mod paths;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryKvStore;

/// Error type for coordination-store operations.
///
/// Only two of the taxonomy's kinds are native to this layer: everything
/// else (malformed paths, unresolved references, ...) is raised by callers
/// interpreting the bytes this layer hands back. The layer itself never
/// retries; callers decide whether `TransientStore` is worth retrying.
#[derive(Debug, Error)]
pub enum KvError {
    /// KV read/write timeout or the store reported a 5xx-equivalent.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// A transaction's compare-and-swap precondition did not hold.
    #[error("transaction failed: {0}")]
    TxnFailed(String),

    /// An advisory lock was revoked while the caller still held it.
    #[error("lock lost on key {key}")]
    LockLost { key: String },
}

/// A single key/value pair as returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Monotonic per-key version, bumped on every write. Used as the CAS
    /// index and as the watch cursor.
    pub index: u64,
}

/// One operation in an atomic multi-key transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Unconditional set.
    Put { key: String, value: Vec<u8> },
    /// Set only if the key's current index equals `index` (0 means "must
    /// not exist").
    Cas {
        key: String,
        value: Vec<u8>,
        index: u64,
    },
    Delete { key: String },
}

/// A held advisory lock. Dropping it without calling [`release`](LockHandle::release)
/// still releases the underlying session, but callers that need to observe
/// loss mid-critical-section should poll [`is_lost`](LockHandle::is_lost).
pub struct LockHandle {
    pub key: String,
    lost: tokio::sync::watch::Receiver<bool>,
    releaser: Box<dyn FnOnce() + Send>,
}

impl LockHandle {
    pub fn new(
        key: String,
        lost: tokio::sync::watch::Receiver<bool>,
        releaser: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            key,
            lost,
            releaser,
        }
    }

    /// True once the lock has been revoked (e.g. session expiry, a
    /// competing holder forcing release). Callers mid-update must check
    /// this before committing a write gated on the lock.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    pub fn release(self) {
        (self.releaser)();
    }
}

/// The operations the rest of the core consumes from the coordination
/// store (§4.1). Every write to a versioned key must be observable by a
/// subsequent read within the same session.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError>;

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, KvError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), KvError>;

    /// Apply every op or none. Ops are evaluated in order against a single
    /// consistent view; a failed `Cas` aborts the whole transaction.
    async fn transact(&self, ops: Vec<TxnOp>) -> Result<(), KvError>;

    /// Block until `prefix` changes past `after_index`, then return the
    /// new high-water index together with the current contents. An
    /// `after_index` of 0 returns immediately with the current state.
    async fn watch_prefix(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<(u64, Vec<KvPair>), KvError>;

    /// Acquire a named advisory lock, waiting up to `max_wait` for any
    /// existing holder to release it.
    async fn lock(&self, key: &str, holder: &str, max_wait: Duration)
        -> Result<LockHandle, KvError>;
}
