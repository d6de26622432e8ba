//! Host-pool label management.
//!
//! Demonstrates the concurrency pattern named in §5: *lock → read-labels →
//! compute diff → atomic-write labels*, with the lock acquired as a named
//! advisory lock on `hostname` and a bounded `max_wait`. Losing the lock
//! mid-update (observed via [`LockHandle::is_lost`]) aborts with
//! `lock-lost` rather than writing a partial result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::{paths, KvError, KvStore, TxnOp};

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HostPoolError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] KvError),

    #[error("lock lost while updating labels on host {0}")]
    LockLost(String),
}

pub struct HostPool<S: KvStore> {
    store: Arc<S>,
}

impl<S: KvStore> HostPool<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn ensure_host_exists(&self, location: &str, hostname: &str) -> Result<(), HostPoolError> {
        let status_key = format!("{}/status", paths::hosts_pool_host_prefix(location, hostname));
        if self.store.get(&status_key).await?.is_none() {
            return Err(HostPoolError::BadRequest(format!(
                "host {hostname} does not exist in location {location}"
            )));
        }
        Ok(())
    }

    pub async fn get_labels(
        &self,
        location: &str,
        hostname: &str,
    ) -> Result<HashMap<String, String>, HostPoolError> {
        if location.is_empty() {
            return Err(HostPoolError::BadRequest(r#""locationName" missing"#.into()));
        }
        if hostname.is_empty() {
            return Err(HostPoolError::BadRequest(r#""hostname" missing"#.into()));
        }
        self.ensure_host_exists(location, hostname).await?;
        let prefix = format!("{}/labels/", paths::hosts_pool_host_prefix(location, hostname));
        let pairs = self.store.list_by_prefix(&prefix).await?;
        Ok(pairs
            .into_iter()
            .map(|p| {
                let key = p.key.trim_start_matches(&prefix).to_string();
                (key, String::from_utf8_lossy(&p.value).to_string())
            })
            .collect())
    }

    /// Merges `labels` into the host's existing labels. Every key,
    /// including `host.resource.*` counts, is overwritten outright: the
    /// original adjusts those for outstanding allocations, a subsystem
    /// this pool doesn't carry, so with none outstanding the write wins.
    pub async fn add_labels(
        &self,
        location: &str,
        hostname: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), HostPoolError> {
        if hostname.is_empty() {
            return Err(HostPoolError::BadRequest(r#""hostname" missing"#.into()));
        }
        if labels.is_empty() {
            return Ok(());
        }
        for k in labels.keys() {
            if k.is_empty() {
                return Err(HostPoolError::BadRequest("empty labels are not allowed".into()));
            }
        }

        let lock_key = format!("{}/labels", paths::hosts_pool_host_prefix(location, hostname));
        let lock = self
            .store
            .lock(&lock_key, "labels addition", DEFAULT_MAX_WAIT)
            .await?;

        self.ensure_host_exists(location, hostname).await?;
        let existing = self.get_labels_unlocked(location, hostname).await?;
        if lock.is_lost() {
            return Err(HostPoolError::LockLost(hostname.to_string()));
        }

        let merged = merge_labels(&existing, &labels);
        let ops = put_label_ops(location, hostname, &merged);
        lock.release();
        self.store.transact(ops).await?;
        Ok(())
    }

    pub async fn remove_labels(
        &self,
        location: &str,
        hostname: &str,
        labels: Vec<String>,
    ) -> Result<(), HostPoolError> {
        if location.is_empty() {
            return Err(HostPoolError::BadRequest(r#""locationName" missing"#.into()));
        }
        if hostname.is_empty() {
            return Err(HostPoolError::BadRequest(r#""hostname" missing"#.into()));
        }
        if labels.is_empty() {
            return Ok(());
        }
        for v in &labels {
            if v.is_empty() {
                return Err(HostPoolError::BadRequest("empty labels are not allowed".into()));
            }
        }

        let lock_key = format!("{}/labels", paths::hosts_pool_host_prefix(location, hostname));
        let lock = self
            .store
            .lock(&lock_key, "labels remove", DEFAULT_MAX_WAIT)
            .await?;

        self.ensure_host_exists(location, hostname).await?;
        if lock.is_lost() {
            return Err(HostPoolError::LockLost(hostname.to_string()));
        }

        let ops = labels
            .into_iter()
            .map(|label| TxnOp::Delete {
                key: paths::hosts_pool_label(location, hostname, &label),
            })
            .collect();
        lock.release();
        self.store.transact(ops).await?;
        Ok(())
    }

    async fn get_labels_unlocked(
        &self,
        location: &str,
        hostname: &str,
    ) -> Result<HashMap<String, String>, HostPoolError> {
        let prefix = format!("{}/labels/", paths::hosts_pool_host_prefix(location, hostname));
        let pairs = self.store.list_by_prefix(&prefix).await?;
        Ok(pairs
            .into_iter()
            .map(|p| {
                let key = p.key.trim_start_matches(&prefix).to_string();
                (key, String::from_utf8_lossy(&p.value).to_string())
            })
            .collect())
    }
}

fn merge_labels(
    existing: &HashMap<String, String>,
    diff: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = existing.clone();
    for (k, v) in diff {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn put_label_ops(location: &str, hostname: &str, labels: &HashMap<String, String>) -> Vec<TxnOp> {
    labels
        .iter()
        .map(|(k, v)| TxnOp::Put {
            key: paths::hosts_pool_label(location, hostname, k),
            value: v.clone().into_bytes(),
        })
        .collect()
}
