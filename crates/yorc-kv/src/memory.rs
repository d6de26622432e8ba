//! In-memory [`KvStore`] used by tests and single-node deployments.
//!
//! Every write bumps a global monotonic index; `watch_prefix` blocks on a
//! [`tokio::sync::Notify`] until some key under the prefix advances past
//! the caller's cursor. Locks are held in a small table keyed by lock
//! name; a lost-lock watch channel lets a holder notice forced revocation
//! (exposed via [`InMemoryKvStore::revoke_lock`], used by tests that
//! exercise the `lock-lost` path).

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};

use crate::{KvError, KvPair, KvStore, LockHandle, TxnOp};

struct LockTable {
    held: parking_lot::Mutex<HashMap<String, bool>>,
    wake: Notify,
    lost: DashMap<String, watch::Sender<bool>>,
}

impl LockTable {
    fn new() -> Self {
        Self {
            held: parking_lot::Mutex::new(HashMap::new()),
            wake: Notify::new(),
            lost: DashMap::new(),
        }
    }

    fn try_acquire(&self, key: &str) -> bool {
        let mut held = self.held.lock();
        if *held.get(key).unwrap_or(&false) {
            false
        } else {
            held.insert(key.to_string(), true);
            true
        }
    }

    fn release(&self, key: &str) {
        self.held.lock().insert(key.to_string(), false);
        self.lost.remove(key);
        self.wake.notify_waiters();
    }

    /// Forcibly takes the lock away from its current holder, as would
    /// happen on session expiry. The holder's `LockHandle::is_lost`
    /// flips to true on its next poll.
    pub fn revoke(&self, key: &str) {
        if let Some((_, tx)) = self.lost.remove(key) {
            let _ = tx.send(true);
        }
        self.held.lock().insert(key.to_string(), false);
        self.wake.notify_waiters();
    }
}

pub struct InMemoryKvStore {
    data: DashMap<String, KvPair>,
    index: AtomicU64,
    change: Notify,
    locks: Arc<LockTable>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            index: AtomicU64::new(0),
            change: Notify::new(),
            locks: Arc::new(LockTable::new()),
        }
    }

    /// See [`LockTable::revoke`].
    pub fn revoke_lock(&self, key: &str) {
        self.locks.revoke(key);
    }

    fn next_index(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn put_raw(&self, key: &str, value: Vec<u8>) -> u64 {
        let idx = self.next_index();
        self.data.insert(
            key.to_string(),
            KvPair {
                key: key.to_string(),
                value,
                index: idx,
            },
        );
        idx
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError> {
        Ok(self.data.get(key).map(|e| e.value().clone()))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, KvError> {
        let mut out: Vec<KvPair> = self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.put_raw(key, value);
        self.change.notify_waiters();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.data.remove(key);
        self.index.fetch_add(1, Ordering::SeqCst);
        self.change.notify_waiters();
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), KvError> {
        self.data.retain(|k, _| !k.starts_with(prefix));
        self.index.fetch_add(1, Ordering::SeqCst);
        self.change.notify_waiters();
        Ok(())
    }

    async fn transact(&self, ops: Vec<TxnOp>) -> Result<(), KvError> {
        // Validate every CAS precondition against the current state before
        // mutating anything, so the transaction is all-or-nothing.
        for op in &ops {
            if let TxnOp::Cas { key, index, .. } = op {
                let current = self.data.get(key).map(|e| e.index).unwrap_or(0);
                if current != *index {
                    return Err(KvError::TxnFailed(format!(
                        "cas mismatch on {key}: expected index {index}, found {current}"
                    )));
                }
            }
        }
        for op in ops {
            match op {
                TxnOp::Put { key, value } | TxnOp::Cas { key, value, .. } => {
                    self.put_raw(&key, value);
                }
                TxnOp::Delete { key } => {
                    self.data.remove(&key);
                }
            }
        }
        self.index.fetch_add(1, Ordering::SeqCst);
        self.change.notify_waiters();
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<(u64, Vec<KvPair>), KvError> {
        loop {
            let matches = self.list_by_prefix(prefix).await?;
            let high_water = matches.iter().map(|p| p.index).max().unwrap_or(0);
            if after_index == 0 || high_water > after_index {
                return Ok((high_water, matches));
            }
            self.change.notified().await;
        }
    }

    async fn lock(
        &self,
        key: &str,
        _holder: &str,
        max_wait: Duration,
    ) -> Result<LockHandle, KvError> {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.locks.try_acquire(key) {
                let (tx, rx) = watch::channel(false);
                self.locks.lost.insert(key.to_string(), tx);
                let locks = self.locks.clone();
                let release_key = key.to_string();
                return Ok(LockHandle::new(
                    key.to_string(),
                    rx,
                    Box::new(move || locks.release(&release_key)),
                ));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KvError::TransientStore(format!(
                    "timed out waiting for lock {key}"
                )));
            }
            tokio::select! {
                _ = self.locks.wake.notified() => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(KvError::TransientStore(format!(
                        "timed out waiting for lock {key}"
                    )));
                }
            }
        }
    }
}
