//! External collaborators the executor dispatches activities to (§1:
//! "the infrastructure provisioners... are external collaborators,
//! defined only by the interfaces the core consumes").
//!
//! This crate carries only the traits plus small in-memory registries
//! keyed by the strings the algorithm dispatches on (node type,
//! implementation artifact); real driver adapters are out of scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::OperationHost;

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("delegate execution failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation execution failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ArtifactResolverError {
    #[error("artifact resolution failed: {0}")]
    Failed(String),
}

/// Invoked as `(task, deployment, node, op)` (§4.6.4).
#[async_trait]
pub trait DelegateExecutor: Send + Sync {
    async fn execute(
        &self,
        task_id: &str,
        deployment_id: &str,
        node: &str,
        operation: &str,
    ) -> Result<(), DelegateError>;
}

/// Result of dispatching a `call-operation` activity: either the
/// operation already ran to completion, or the executor returned an
/// async action the scheduler must poll at `interval` until it settles
/// (§4.6.4).
pub enum ExecutionOutcome {
    Sync,
    Async {
        action: Box<dyn crate::scheduler::AsyncAction>,
        interval: Duration,
    },
}

#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        task_id: &str,
        deployment_id: &str,
        node: &str,
        operation: &str,
        artifact: &str,
    ) -> Result<ExecutionOutcome, OperationError>;
}

/// Resolves the implementation artifact for an operation on a node,
/// considering the step's `target_relationship` / `operation_host`
/// (§4.6.4). `Ok(None)` means the operation is not implemented — the
/// step silently skips the activity (§7 `not-implemented`).
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(
        &self,
        node: &str,
        target_relationship: Option<&str>,
        operation_host: OperationHost,
        operation: &str,
    ) -> Result<Option<String>, ArtifactResolverError>;
}

/// Registry of [`DelegateExecutor`]s keyed by node type.
#[derive(Default, Clone)]
pub struct DelegateRegistry {
    executors: HashMap<String, Arc<dyn DelegateExecutor>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: impl Into<String>, executor: Arc<dyn DelegateExecutor>) {
        self.executors.insert(node_type.into(), executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn DelegateExecutor>> {
        self.executors.get(node_type).cloned()
    }
}

/// Registry of [`OperationExecutor`]s keyed by implementation artifact
/// type (e.g. `"script"`, `"ansible-playbook"`).
#[derive(Default, Clone)]
pub struct OperationRegistry {
    executors: HashMap<String, Arc<dyn OperationExecutor>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, artifact_type: impl Into<String>, executor: Arc<dyn OperationExecutor>) {
        self.executors.insert(artifact_type.into(), executor);
    }

    pub fn get(&self, artifact_type: &str) -> Option<Arc<dyn OperationExecutor>> {
        self.executors.get(artifact_type).cloned()
    }
}

/// A fixed node-type→artifact table, sufficient for tests and
/// single-node runs; a real deployment would resolve artifacts from the
/// (out of scope) topology parser's interface definitions.
#[derive(Default, Clone)]
pub struct StaticArtifactResolver {
    artifacts: HashMap<(String, String), String>,
}

impl StaticArtifactResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, node: impl Into<String>, operation: impl Into<String>, artifact: impl Into<String>) -> Self {
        self.artifacts.insert((node.into(), operation.into()), artifact.into());
        self
    }
}

#[async_trait]
impl ArtifactResolver for StaticArtifactResolver {
    async fn resolve(
        &self,
        node: &str,
        _target_relationship: Option<&str>,
        _operation_host: OperationHost,
        operation: &str,
    ) -> Result<Option<String>, ArtifactResolverError> {
        Ok(self
            .artifacts
            .get(&(node.to_string(), operation.to_lowercase()))
            .cloned())
    }
}
