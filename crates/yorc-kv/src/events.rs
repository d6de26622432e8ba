//! Structured event records (§6) and the publisher interface the core
//! emits them through. The actual sink (log aggregator, message bus) is
//! an external collaborator; [`LoggingEventPublisher`] is the one
//! implementation carried here, emitting through `tracing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    AttributeValueChange { attribute: String, value: String, status: AttributeChangeStatus },
    InstanceStateChange { state: String },
    WorkflowStepStatus { task_id: String, step_name: String, status: String },
    CheckStatus { check_id: String, status: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeChangeStatus {
    Default,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub deployment: String,
    pub node: Option<String>,
    pub instance: Option<String>,
    pub interface: Option<String>,
    pub operation: Option<String>,
    pub message: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event);
}

/// Emits events through `tracing`, at a level mirroring [`EventLevel`].
pub struct LoggingEventPublisher;

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: Event) {
        match event.level {
            EventLevel::Debug => tracing::debug!(deployment = %event.deployment, node = ?event.node, "{}", event.message),
            EventLevel::Info => tracing::info!(deployment = %event.deployment, node = ?event.node, "{}", event.message),
            EventLevel::Warn => tracing::warn!(deployment = %event.deployment, node = ?event.node, "{}", event.message),
            EventLevel::Error => tracing::error!(deployment = %event.deployment, node = ?event.node, "{}", event.message),
        }
    }
}

/// Discards every event. Useful for tests that only care about store
/// side effects.
pub struct NullEventPublisher;

#[async_trait]
impl EventPublisher for NullEventPublisher {
    async fn publish(&self, _event: Event) {}
}

/// Buffers every published event in memory, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}
