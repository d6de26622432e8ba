//! Monitoring supervisor (§4.7): owns one ticking task per [`CheckSpec`].
//!
//! Each check carries a single `CancellationToken` (§9 design note:
//! collapse the ad-hoc status-mutex/stop-flag/close-once-channel trio
//! into one primitive) plus a `tokio::sync::Mutex` serializing
//! concurrent `start`/`stop` calls on the same check id, matching the
//! original's `stopLock`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use yorc_attributes::{notifier::Notifier, AttributeError, AttributeResolver};
use yorc_kv::events::{Event, EventKind, EventLevel, EventPublisher};
use yorc_kv::{paths, KvError, KvStore};
use yorc_topology::{CheckStatus, NodeState};

use crate::check::{probe, CheckSpec};

#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error("check {0} is already running")]
    AlreadyRunning(String),
}

/// `None` means stopped; `Some` holds the token for the currently
/// running tick loop. Guarded by its own mutex so `start`/`stop` race
/// safely instead of needing a separate status flag.
struct CheckHandle {
    running: tokio::sync::Mutex<Option<CancellationToken>>,
}

/// Runs every registered [`CheckSpec`] on its own interval, writing
/// status transitions to the coordination store and cascading them
/// into node-state attribute changes (§4.7).
pub struct MonitoringSupervisor<S: KvStore> {
    store: Arc<S>,
    events: Arc<dyn EventPublisher>,
    http_client: reqwest::Client,
    checks: DashMap<String, Arc<CheckHandle>>,
}

impl<S: KvStore + 'static> MonitoringSupervisor<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            events,
            http_client: reqwest::Client::new(),
            checks: DashMap::new(),
        }
    }

    /// Registers `spec`, marks it as existing in the store, and spawns
    /// its ticking loop. Idempotent per check id: a second `start` for
    /// a still-running check is a no-op error, matching `stop`'s
    /// idempotence on the other side of the lifecycle.
    pub async fn start(self: &Arc<Self>, spec: CheckSpec) -> Result<(), MonitoringError> {
        let check_id = spec.check_id();
        if self.checks.get(&check_id).is_none() {
            self.checks.insert(
                check_id.clone(),
                Arc::new(CheckHandle {
                    running: tokio::sync::Mutex::new(None),
                }),
            );
        }
        let handle = self.checks.get(&check_id).expect("just inserted").clone();

        let mut running = handle.running.lock().await;
        if running.is_some() {
            return Err(MonitoringError::AlreadyRunning(check_id));
        }

        self.store
            .put(&paths::monitoring_report_status(&check_id), status_bytes(CheckStatus::Passing))
            .await?;

        let cancel = CancellationToken::new();
        let supervisor = self.clone();
        let run_cancel = cancel.clone();
        let run_spec = spec.clone();
        tokio::spawn(async move {
            supervisor.run(run_spec, run_cancel).await;
        });
        *running = Some(cancel);
        Ok(())
    }

    /// Idempotent: stopping an already-stopped (or never-started) check
    /// id is a no-op (§4.7 "Stop is idempotent").
    pub async fn stop(&self, check_id: &str) {
        let Some(handle) = self.checks.get(check_id).map(|h| h.clone()) else {
            return;
        };
        let mut running = handle.running.lock().await;
        if let Some(cancel) = running.take() {
            cancel.cancel();
        }
    }

    async fn run(self: Arc<Self>, spec: CheckSpec, cancel: CancellationToken) {
        let check_id = spec.check_id();
        let mut ticker = tokio::time::interval(spec.interval);
        let mut last_status: Option<CheckStatus> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(check_id = %check_id, "stopped running check");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let status = probe(&spec, &self.http_client).await;
            if last_status == Some(status) {
                continue;
            }
            last_status = Some(status);
            if let Err(e) = self.on_transition(&spec, status).await {
                tracing::warn!(check_id = %check_id, "failed to record check transition: {e}");
            }
        }
    }

    /// §4.7: on a status transition, re-verify the check still exists
    /// (it may have been removed concurrently), write the new status,
    /// publish a log, and feed a node-state transition.
    async fn on_transition(&self, spec: &CheckSpec, status: CheckStatus) -> Result<(), MonitoringError> {
        let check_id = spec.check_id();
        if self.store.get(&paths::monitoring_report_status(&check_id)).await?.is_none() {
            return Ok(());
        }

        self.store
            .put(&paths::monitoring_report_status(&check_id), status_bytes(status))
            .await?;

        let (level, message) = match status {
            CheckStatus::Passing => (EventLevel::Info, "monitoring check is back to normal".to_string()),
            CheckStatus::Critical => (EventLevel::Error, "monitoring check returned a failure".to_string()),
            CheckStatus::Warning => (EventLevel::Warn, "monitoring check returned a warning".to_string()),
        };
        self.events
            .publish(Event {
                timestamp: chrono::Utc::now(),
                level,
                deployment: spec.deployment_id.clone(),
                node: Some(spec.node.clone()),
                instance: Some(spec.instance.clone()),
                interface: None,
                operation: None,
                message,
                kind: EventKind::CheckStatus {
                    check_id: check_id.clone(),
                    status: to_event_status(status).to_string(),
                },
            })
            .await;

        let node_state = match status {
            CheckStatus::Passing => NodeState::Started,
            CheckStatus::Critical | CheckStatus::Warning => NodeState::Error,
        };
        self.apply_node_state(spec, node_state).await
    }

    async fn apply_node_state(&self, spec: &CheckSpec, state: NodeState) -> Result<(), MonitoringError> {
        let key = paths::node_instance_attribute(&spec.deployment_id, &spec.node, &spec.instance, "state");
        self.store.put(&key, state.to_string().into_bytes()).await?;

        self.events
            .publish(Event {
                timestamp: chrono::Utc::now(),
                level: EventLevel::Info,
                deployment: spec.deployment_id.clone(),
                node: Some(spec.node.clone()),
                instance: Some(spec.instance.clone()),
                interface: None,
                operation: None,
                message: format!("{}/{} is now {}", spec.node, spec.instance, state),
                kind: EventKind::InstanceStateChange { state: state.to_string() },
            })
            .await;

        let resolver = AttributeResolver::new(self.store.clone(), spec.deployment_id.clone(), self.events.clone());
        resolver
            .notify_value_change(&Notifier::Attribute {
                node: spec.node.clone(),
                instance: spec.instance.clone(),
                capability: None,
                attribute: "state".to_string(),
            })
            .await?;
        Ok(())
    }
}

fn status_bytes(status: CheckStatus) -> Vec<u8> {
    to_event_status(status).as_bytes().to_vec()
}

fn to_event_status(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Passing => "PASSING",
        CheckStatus::Warning => "WARNING",
        CheckStatus::Critical => "CRITICAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yorc_kv::events::RecordingEventPublisher;
    use yorc_kv::InMemoryKvStore;

    fn tcp_spec(port: u16, interval_ms: u64) -> CheckSpec {
        CheckSpec {
            deployment_id: "dep1".into(),
            node: "Web".into(),
            instance: "0".into(),
            check_type: yorc_topology::CheckType::Tcp,
            interval: Duration::from_millis(interval_ms),
            target: crate::check::CheckTarget::Tcp {
                address: "127.0.0.1".into(),
                port,
            },
        }
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let store = Arc::new(InMemoryKvStore::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let supervisor = Arc::new(MonitoringSupervisor::new(store, events));
        supervisor.stop("dep1:Web:0").await;
    }

    #[tokio::test]
    async fn unreachable_tcp_target_transitions_to_critical() {
        let store = Arc::new(InMemoryKvStore::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let supervisor = Arc::new(MonitoringSupervisor::new(store.clone(), events.clone()));
        let spec = tcp_spec(1, 20);
        let check_id = spec.check_id();
        supervisor.clone().start(spec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop(&check_id).await;

        let pair = store.get(&paths::monitoring_report_status(&check_id)).await.unwrap();
        assert!(pair.is_some());
        assert_eq!(String::from_utf8_lossy(&pair.unwrap().value), "CRITICAL");

        let state = store
            .get(&paths::node_instance_attribute("dep1", "Web", "0", "state"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&state.value), "error");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let store = Arc::new(InMemoryKvStore::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let supervisor = Arc::new(MonitoringSupervisor::new(store, events));
        let spec = tcp_spec(1, 1000);
        let check_id = spec.check_id();
        supervisor.clone().start(spec.clone()).await.unwrap();
        let err = supervisor.start(spec).await.unwrap_err();
        assert!(matches!(err, MonitoringError::AlreadyRunning(_)));
        supervisor.stop(&check_id).await;
    }
}
