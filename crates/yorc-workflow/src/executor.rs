//! Workflow Executor (§4.6): a parallel scheduler over the materialized
//! DAG. A step becomes runnable once every predecessor reaches `DONE`;
//! there is no global lock, only the per-step coordination-store write
//! that records its status transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use yorc_attributes::{notifier::Notifier, AttributeError, AttributeResolver};
use yorc_kv::events::{Event, EventKind, EventLevel, EventPublisher};
use yorc_kv::{paths, KvError, KvStore, TxnOp};
use yorc_topology::{TopologyError, TopologyStore};

use crate::builder::{WorkflowBuildError, WorkflowBuilder};
use crate::hooks::{run_post_hooks, run_pre_hooks, ActivityHook, ActivityHookContext};
use crate::model::{Activity, ActivityKind, OperationHost, Step, TaskContext, TaskType, WorkflowDag};
use crate::registry::{
    ArtifactResolver, ArtifactResolverError, DelegateError, DelegateRegistry, ExecutionOutcome,
    OperationError, OperationRegistry,
};
use crate::scheduler::{ActivityScheduler, AsyncActionRegistration};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error(transparent)]
    Build(#[from] WorkflowBuildError),

    #[error(transparent)]
    Delegate(#[from] DelegateError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    ArtifactResolution(#[from] ArtifactResolverError),

    #[error("no delegate executor registered for node type {0}")]
    NoDelegateForType(String),

    #[error("no operation executor registered for artifact {0}")]
    NoExecutorForArtifact(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("requirement index {0} is malformed")]
    MalformedRequirementIndex(String),

    #[error("malformed task record for {0}: {1}")]
    MalformedTaskRecord(String, String),

    #[error("async operation failed: {0}")]
    AsyncActionFailed(String),

    #[error("scheduler dropped the completion channel")]
    SchedulerDropped,

    #[error("inline sub-workflow {0} did not complete successfully")]
    InlineWorkflowFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Done,
    Error,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistedStepStatus {
    Running,
    Done,
    Error,
    Canceled,
}

impl PersistedStepStatus {
    fn as_str(self) -> &'static str {
        match self {
            PersistedStepStatus::Running => "running",
            PersistedStepStatus::Done => "done",
            PersistedStepStatus::Error => "error",
            PersistedStepStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// `WfStepGracefulTerminationTimeout` (§4.6.3, §6 Configuration).
    pub graceful_termination_timeout: Duration,
    /// Bounds how many steps run their activities concurrently across
    /// every task this executor drives (§4.6.1 "a parallel scheduler
    /// over a worker pool", §6 `YORC_EXECUTOR_MAX_CONCURRENCY`). Steps
    /// merely waiting on predecessors don't hold a permit.
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            graceful_termination_timeout: Duration::from_secs(300),
            max_concurrency: 16,
        }
    }
}

/// Runs workflow DAGs (§4.6). Always used behind an `Arc` since steps
/// run as independently spawned tasks and `inline` activities recurse
/// into a fresh sub-task.
pub struct WorkflowExecutor<S: KvStore> {
    store: Arc<S>,
    events: Arc<dyn EventPublisher>,
    delegates: DelegateRegistry,
    operations: OperationRegistry,
    artifact_resolver: Arc<dyn ArtifactResolver>,
    scheduler: Arc<dyn ActivityScheduler>,
    hooks: Vec<Arc<dyn ActivityHook>>,
    config: ExecutorConfig,
    worker_pool: Arc<Semaphore>,
}

impl<S: KvStore + 'static> WorkflowExecutor<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn EventPublisher>,
        artifact_resolver: Arc<dyn ArtifactResolver>,
        scheduler: Arc<dyn ActivityScheduler>,
        config: ExecutorConfig,
    ) -> Self {
        let worker_pool = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            store,
            events,
            delegates: DelegateRegistry::new(),
            operations: OperationRegistry::new(),
            artifact_resolver,
            scheduler,
            hooks: Vec::new(),
            config,
            worker_pool,
        }
    }

    pub fn register_delegate(&mut self, node_type: impl Into<String>, executor: Arc<dyn crate::registry::DelegateExecutor>) {
        self.delegates.register(node_type, executor);
    }

    pub fn register_operation(&mut self, artifact_type: impl Into<String>, executor: Arc<dyn crate::registry::OperationExecutor>) {
        self.operations.register(artifact_type, executor);
    }

    pub fn add_hook(&mut self, hook: Arc<dyn ActivityHook>) {
        self.hooks.push(hook);
    }

    /// Runs every step of `dag` to completion, respecting `cancel` and
    /// each sibling's graceful termination window. Returns the task's
    /// final aggregate status (§3 Task lifecycle).
    pub async fn run_task(
        self: &Arc<Self>,
        dag: Arc<WorkflowDag>,
        task: Arc<TaskContext>,
        cancel: CancellationToken,
    ) -> Result<yorc_topology::TaskStatus, ExecutorError> {
        let mut senders = std::collections::HashMap::new();
        let mut receivers = std::collections::HashMap::new();
        for name in dag.all_step_names() {
            let (tx, rx) = watch::channel(None::<StepOutcome>);
            senders.insert(name.clone(), tx);
            receivers.insert(name, rx);
        }
        let (failed_tx, failed_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(senders.len());
        for (name, tx) in senders {
            let step = dag.steps.get(&name).expect("name came from dag").clone();
            let preds = dag
                .predecessors_of(&name)
                .into_iter()
                .map(|p| receivers.get(&p).expect("predecessor exists").clone())
                .collect::<Vec<_>>();
            let executor = self.clone();
            let task = task.clone();
            let cancel = cancel.clone();
            let failed_tx = failed_tx.clone();
            let failed_rx = failed_rx.clone();
            handles.push(tokio::spawn(async move {
                run_step(executor, step, task, preds, tx, failed_tx, failed_rx, cancel).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await.expect("step task panicked"));
        }

        let status = if outcomes.iter().any(|o| *o == StepOutcome::Error) {
            yorc_topology::TaskStatus::Failed
        } else if outcomes.iter().any(|o| *o == StepOutcome::Canceled) {
            yorc_topology::TaskStatus::Canceled
        } else {
            yorc_topology::TaskStatus::Done
        };
        self.store
            .put(
                &paths::task(&task.task_id),
                serde_json::to_vec(&TaskRecord {
                    task_id: task.task_id.clone(),
                    deployment_id: task.deployment_id.clone(),
                    workflow_name: task.workflow_name.clone(),
                    status,
                })
                .expect("TaskRecord is always serializable"),
            )
            .await?;
        Ok(status)
    }

    /// Reads back the persisted outcome of a task submitted via
    /// [`run_task`](Self::run_task). `None` if the task id is unknown.
    pub async fn task_status(&self, task_id: &str) -> Result<Option<TaskRecord>, ExecutorError> {
        let Some(pair) = self.store.get(&paths::task(task_id)).await? else {
            return Ok(None);
        };
        let record: TaskRecord = serde_json::from_slice(&pair.value)
            .map_err(|e| ExecutorError::MalformedTaskRecord(task_id.to_string(), e.to_string()))?;
        Ok(Some(record))
    }

    async fn is_runnable(&self, step: &Step, task: &TaskContext) -> Result<bool, ExecutorError> {
        let status_key = paths::workflow_step_status(&task.task_id, &step.name);
        if let Some(pair) = self.store.get(&status_key).await? {
            if String::from_utf8_lossy(&pair.value) == "done" {
                return Ok(false);
            }
        }
        if !matches!(task.task_type, TaskType::ScaleOut | TaskType::ScaleIn) {
            return Ok(true);
        }
        let effective = self.effective_node(step, task).await?;
        Ok(task.affected_nodes.contains(&effective))
    }

    /// The node a step's activities actually operate against, resolving
    /// the `TARGET`/`add_source`/`remove_source`/`source_changed`
    /// redirect to the relationship target via the requirement index
    /// (§4.6.2, §4.6.4). Every other case is the step's own node.
    async fn effective_node(&self, step: &Step, task: &TaskContext) -> Result<String, ExecutorError> {
        let operation_name = step.activities.iter().find_map(|a| match &a.kind {
            ActivityKind::CallOperation { operation } => Some(operation.to_lowercase()),
            _ => None,
        });
        let target_like = matches!(step.operation_host, OperationHost::Target)
            || matches!(operation_name.as_deref(), Some("add_source") | Some("remove_source") | Some("source_changed"));
        if !target_like {
            return Ok(step.node.clone());
        }
        let idx_raw = step
            .requirement_index
            .as_ref()
            .ok_or_else(|| ExecutorError::MalformedRequirementIndex("missing".to_string()))?;
        let idx: usize = idx_raw
            .parse()
            .map_err(|_| ExecutorError::MalformedRequirementIndex(idx_raw.clone()))?;
        let topology = TopologyStore::new(self.store.clone(), task.deployment_id.clone());
        let template = topology
            .get_node_template(&step.node)
            .await?
            .ok_or_else(|| ExecutorError::NodeNotFound(step.node.clone()))?;
        let req = template
            .requirements
            .get(idx)
            .ok_or_else(|| ExecutorError::MalformedRequirementIndex(idx_raw.clone()))?;
        req.node
            .clone()
            .ok_or_else(|| ExecutorError::NodeNotFound(format!("{}#{idx}", step.node)))
    }

    async fn persist_step_status(&self, task: &TaskContext, step: &Step, status: PersistedStepStatus) -> Result<(), ExecutorError> {
        self.store
            .transact(vec![TxnOp::Put {
                key: paths::workflow_step_status(&task.task_id, &step.name),
                value: status.as_str().as_bytes().to_vec(),
            }])
            .await?;
        self.events
            .publish(Event {
                timestamp: chrono::Utc::now(),
                level: EventLevel::Info,
                deployment: task.deployment_id.clone(),
                node: Some(step.node.clone()),
                instance: None,
                interface: None,
                operation: None,
                message: format!("step {} is now {}", step.name, status.as_str()),
                kind: EventKind::WorkflowStepStatus {
                    task_id: task.task_id.clone(),
                    step_name: step.name.clone(),
                    status: status.as_str().to_string(),
                },
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub deployment_id: String,
    pub workflow_name: String,
    pub status: yorc_topology::TaskStatus,
}

#[allow(clippy::too_many_arguments)]
async fn run_step<S: KvStore + 'static>(
    executor: Arc<WorkflowExecutor<S>>,
    step: Arc<Step>,
    task: Arc<TaskContext>,
    mut preds: Vec<watch::Receiver<Option<StepOutcome>>>,
    tx: watch::Sender<Option<StepOutcome>>,
    failed_tx: watch::Sender<bool>,
    failed_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> StepOutcome {
    let mut pred_outcomes = Vec::with_capacity(preds.len());
    for rx in &mut preds {
        loop {
            if let Some(outcome) = *rx.borrow() {
                pred_outcomes.push(outcome);
                break;
            }
            if rx.changed().await.is_err() {
                pred_outcomes.push(StepOutcome::Canceled);
                break;
            }
        }
    }

    let outcome = if pred_outcomes
        .iter()
        .any(|o| matches!(o, StepOutcome::Error | StepOutcome::Canceled))
    {
        StepOutcome::Canceled
    } else if cancel.is_cancelled() {
        StepOutcome::Canceled
    } else {
        match executor.is_runnable(&step, &task).await {
            Ok(true) => execute_step(&executor, &step, &task, failed_rx, cancel.clone()).await,
            Ok(false) => {
                let _ = executor.persist_step_status(&task, &step, PersistedStepStatus::Done).await;
                StepOutcome::Done
            }
            Err(e) => {
                tracing::error!(step = %step.name, "failed to evaluate runnability: {e}");
                let _ = executor.persist_step_status(&task, &step, PersistedStepStatus::Error).await;
                StepOutcome::Error
            }
        }
    };

    if outcome == StepOutcome::Error {
        let _ = failed_tx.send(true);
    }
    let _ = tx.send(Some(outcome));
    outcome
}

async fn execute_step<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
    mut failed_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> StepOutcome {
    let _ = executor.persist_step_status(task, step, PersistedStepStatus::Running).await;

    let grace = async {
        let _ = failed_rx.wait_for(|v| *v).await;
        tokio::time::sleep(executor.config.graceful_termination_timeout).await;
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = executor.persist_step_status(task, step, PersistedStepStatus::Canceled).await;
            StepOutcome::Canceled
        }
        result = run_activities_with_permit(executor, step, task) => {
            match result {
                Ok(()) => {
                    let _ = executor.persist_step_status(task, step, PersistedStepStatus::Done).await;
                    StepOutcome::Done
                }
                Err(e) => {
                    tracing::error!(step = %step.name, "step failed: {e}");
                    let _ = executor.persist_step_status(task, step, PersistedStepStatus::Error).await;
                    StepOutcome::Error
                }
            }
        }
        _ = grace => {
            tracing::warn!(step = %step.name, "graceful termination window elapsed");
            let _ = executor.persist_step_status(task, step, PersistedStepStatus::Error).await;
            StepOutcome::Error
        }
    }
}

/// Acquires a worker-pool permit before running the step's activities
/// and holds it for their duration, bounding how many steps execute
/// concurrently across the whole executor (§4.6.1).
async fn run_activities_with_permit<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
) -> Result<(), ExecutorError> {
    let _permit = executor
        .worker_pool
        .acquire()
        .await
        .expect("worker pool semaphore is never closed");
    run_activities(executor, step, task).await
}

async fn run_activities<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
) -> Result<(), ExecutorError> {
    for activity in &step.activities {
        if let Err(e) = dispatch_activity(executor, step, task, activity).await {
            if task.bypass_errors {
                tracing::warn!(step = %step.name, "activity failed, bypassing: {e}");
                continue;
            }
            return Err(e);
        }
    }
    Ok(())
}

async fn dispatch_activity<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
    activity: &Activity,
) -> Result<(), ExecutorError> {
    let hook_ctx = ActivityHookContext {
        task_id: task.task_id.clone(),
        deployment_id: task.deployment_id.clone(),
        step_name: step.name.clone(),
        node: step.node.clone(),
    };
    run_pre_hooks(&executor.hooks, &hook_ctx).await;
    let result = match &activity.kind {
        ActivityKind::Delegate { operation } => dispatch_delegate(executor, step, task, operation).await,
        ActivityKind::SetState { state } => dispatch_set_state(executor, step, task, state).await,
        ActivityKind::CallOperation { operation } => dispatch_call_operation(executor, step, task, operation).await,
        ActivityKind::Inline { workflow } => dispatch_inline(executor, step, task, workflow).await,
    };
    run_post_hooks(&executor.hooks, &hook_ctx).await;
    result
}

async fn dispatch_delegate<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
    operation: &str,
) -> Result<(), ExecutorError> {
    let topology = TopologyStore::new(executor.store.clone(), task.deployment_id.clone());
    let template = topology
        .get_node_template(&step.node)
        .await?
        .ok_or_else(|| ExecutorError::NodeNotFound(step.node.clone()))?;
    let delegate = executor
        .delegates
        .get(&template.type_name)
        .ok_or_else(|| ExecutorError::NoDelegateForType(template.type_name.clone()))?;

    let span = tracing::info_span!(
        "executor.delegate",
        deployment = %task.deployment_id,
        node_type = %template.type_name,
        operation = %operation
    );
    let start = Instant::now();
    let result = delegate
        .execute(&task.task_id, &task.deployment_id, &step.node, operation)
        .instrument(span)
        .await;
    let elapsed_ms = start.elapsed().as_millis();
    match result {
        Ok(()) => {
            tracing::info!(counter = "executor.delegate.successes", node_type = %template.type_name, operation, elapsed_ms, "delegate succeeded");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(counter = "executor.delegate.failures", node_type = %template.type_name, operation, elapsed_ms, "delegate failed: {e}");
            Err(ExecutorError::Delegate(e))
        }
    }
}

async fn dispatch_set_state<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
    state: &str,
) -> Result<(), ExecutorError> {
    let topology = TopologyStore::new(executor.store.clone(), task.deployment_id.clone());
    let instances = topology.instances_of(&step.node).await?;
    if instances.is_empty() {
        return Ok(());
    }
    let ops = instances
        .iter()
        .map(|instance| TxnOp::Put {
            key: paths::node_instance_attribute(&task.deployment_id, &step.node, instance, "state"),
            value: state.as_bytes().to_vec(),
        })
        .collect();
    executor.store.transact(ops).await?;

    for instance in &instances {
        executor
            .events
            .publish(Event {
                timestamp: chrono::Utc::now(),
                level: EventLevel::Info,
                deployment: task.deployment_id.clone(),
                node: Some(step.node.clone()),
                instance: Some(instance.clone()),
                interface: None,
                operation: None,
                message: format!("{}/{} is now {}", step.node, instance, state),
                kind: EventKind::InstanceStateChange { state: state.to_string() },
            })
            .await;
    }

    let resolver = AttributeResolver::new(executor.store.clone(), task.deployment_id.clone(), executor.events.clone());
    for instance in &instances {
        resolver
            .notify_value_change(&Notifier::Attribute {
                node: step.node.clone(),
                instance: instance.clone(),
                capability: None,
                attribute: "state".to_string(),
            })
            .await?;
    }
    Ok(())
}

async fn dispatch_call_operation<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
    operation: &str,
) -> Result<(), ExecutorError> {
    let effective_node = executor.effective_node(step, task).await?;
    let artifact = executor
        .artifact_resolver
        .resolve(&effective_node, step.target_relationship.as_deref(), step.operation_host, operation)
        .await?;
    let Some(artifact) = artifact else {
        tracing::debug!(step = %step.name, operation, "operation not implemented, skipping");
        return Ok(());
    };
    let op_executor = executor
        .operations
        .get(&artifact)
        .ok_or_else(|| ExecutorError::NoExecutorForArtifact(artifact.clone()))?;

    match op_executor
        .execute(&task.task_id, &task.deployment_id, &effective_node, operation, &artifact)
        .await?
    {
        ExecutionOutcome::Sync => Ok(()),
        ExecutionOutcome::Async { action, interval } => {
            let (tx, rx) = oneshot::channel();
            let registration = AsyncActionRegistration {
                deployment: task.deployment_id.clone(),
                task: task.task_id.clone(),
                execution: uuid::Uuid::now_v7().to_string(),
                workflow: task.workflow_name.clone(),
                step: step.name.clone(),
                node: effective_node.clone(),
                operation: operation.to_string(),
            };
            executor.scheduler.schedule(registration, interval, action, tx).await;
            rx.await
                .map_err(|_| ExecutorError::SchedulerDropped)?
                .map_err(ExecutorError::AsyncActionFailed)
        }
    }
}

async fn dispatch_inline<S: KvStore + 'static>(
    executor: &Arc<WorkflowExecutor<S>>,
    step: &Arc<Step>,
    task: &Arc<TaskContext>,
    workflow_name: &str,
) -> Result<(), ExecutorError> {
    let builder = WorkflowBuilder::new(executor.store.clone(), task.deployment_id.clone());
    let sub_dag = Arc::new(builder.build(workflow_name).await?);
    let sub_task = Arc::new(TaskContext {
        task_id: format!("{}/{}/{}", task.task_id, step.name, workflow_name),
        deployment_id: task.deployment_id.clone(),
        workflow_name: workflow_name.to_string(),
        task_type: task.task_type,
        affected_nodes: task.affected_nodes.clone(),
        bypass_errors: task.bypass_errors,
    });
    executor
        .run_task(sub_dag, sub_task.clone(), CancellationToken::new())
        .await?;
    let record = executor
        .store
        .get(&paths::task(&sub_task.task_id))
        .await?
        .ok_or_else(|| ExecutorError::InlineWorkflowFailed(workflow_name.to_string()))?;
    let record: TaskRecord = serde_json::from_slice(&record.value)
        .map_err(|_| ExecutorError::InlineWorkflowFailed(workflow_name.to_string()))?;
    if record.status == yorc_topology::TaskStatus::Done {
        Ok(())
    } else {
        Err(ExecutorError::InlineWorkflowFailed(workflow_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use yorc_kv::events::RecordingEventPublisher;
    use yorc_kv::InMemoryKvStore;
    use yorc_topology::{NodeTemplate, TopologyStore};

    use crate::registry::{DelegateExecutor, StaticArtifactResolver};
    use crate::scheduler::TickingScheduler;

    struct CountingDelegate {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DelegateExecutor for CountingDelegate {
        async fn execute(&self, _task_id: &str, _deployment_id: &str, _node: &str, _operation: &str) -> Result<(), DelegateError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingDelegate;

    #[async_trait]
    impl DelegateExecutor for FailingDelegate {
        async fn execute(&self, _task_id: &str, _deployment_id: &str, _node: &str, _operation: &str) -> Result<(), DelegateError> {
            Err(DelegateError::Failed("boom".to_string()))
        }
    }

    fn linear_dag(step_a: Step, step_b: Step) -> WorkflowDag {
        let mut steps = HashMap::new();
        let a = Arc::new(step_a);
        let b = Arc::new(step_b);
        steps.insert(a.name.clone(), a.clone());
        steps.insert(b.name.clone(), b.clone());
        WorkflowDag {
            name: "install".to_string(),
            roots: vec![a],
            steps,
        }
    }

    fn delegate_step(name: &str, node: &str, next: Vec<String>) -> Step {
        Step {
            name: name.to_string(),
            node: node.to_string(),
            operation_host: OperationHost::SelfHost,
            target_relationship: None,
            requirement_index: None,
            activities: vec![Activity {
                kind: ActivityKind::Delegate {
                    operation: "install".to_string(),
                },
            }],
            next,
        }
    }

    fn task_context(task_id: &str, task_type: TaskType, affected_nodes: HashSet<String>) -> TaskContext {
        TaskContext {
            task_id: task_id.to_string(),
            deployment_id: "dep1".to_string(),
            workflow_name: "install".to_string(),
            task_type,
            affected_nodes,
            bypass_errors: false,
        }
    }

    fn new_executor(
        store: Arc<InMemoryKvStore>,
        delegate: Arc<dyn DelegateExecutor>,
    ) -> Arc<WorkflowExecutor<InMemoryKvStore>> {
        let mut executor = WorkflowExecutor::new(
            store,
            Arc::new(RecordingEventPublisher::new()),
            Arc::new(StaticArtifactResolver::new()),
            Arc::new(TickingScheduler::new()),
            ExecutorConfig {
                graceful_termination_timeout: Duration::from_millis(50),
                max_concurrency: 4,
            },
        );
        executor.register_delegate("Compute", delegate);
        Arc::new(executor)
    }

    async fn put_compute_node(store: &Arc<InMemoryKvStore>, node: &str) {
        let topology = TopologyStore::new(store.clone(), "dep1");
        topology
            .put_node_template(&NodeTemplate {
                name: node.to_string(),
                type_name: "Compute".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn linear_workflow_runs_both_steps_to_done() {
        let store = Arc::new(InMemoryKvStore::new());
        put_compute_node(&store, "A").await;
        put_compute_node(&store, "B").await;
        let delegate = Arc::new(CountingDelegate {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let executor = new_executor(store.clone(), delegate.clone());

        let dag = Arc::new(linear_dag(
            delegate_step("step_a", "A", vec!["step_b".to_string()]),
            delegate_step("step_b", "B", vec![]),
        ));
        let task = Arc::new(task_context("t1", TaskType::Deploy, HashSet::new()));

        let status = executor.run_task(dag, task.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, yorc_topology::TaskStatus::Done);
        assert_eq!(delegate.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        let record = executor.task_status(&task.task_id).await.unwrap().unwrap();
        assert_eq!(record.status, yorc_topology::TaskStatus::Done);

        let status_b = store
            .get(&paths::workflow_step_status(&task.task_id, "step_b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&status_b.value), "done");
    }

    #[tokio::test]
    async fn step_failure_cancels_downstream_and_fails_task() {
        let store = Arc::new(InMemoryKvStore::new());
        put_compute_node(&store, "A").await;
        put_compute_node(&store, "B").await;
        let executor = new_executor(store.clone(), Arc::new(FailingDelegate));

        let dag = Arc::new(linear_dag(
            delegate_step("step_a", "A", vec!["step_b".to_string()]),
            delegate_step("step_b", "B", vec![]),
        ));
        let task = Arc::new(task_context("t2", TaskType::Deploy, HashSet::new()));

        let status = executor.run_task(dag, task.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, yorc_topology::TaskStatus::Failed);

        let status_b = store
            .get(&paths::workflow_step_status(&task.task_id, "step_b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&status_b.value), "canceled");
    }

    #[tokio::test]
    async fn scale_out_skips_steps_for_unaffected_nodes() {
        let store = Arc::new(InMemoryKvStore::new());
        put_compute_node(&store, "A").await;
        put_compute_node(&store, "B").await;
        let delegate = Arc::new(CountingDelegate {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let executor = new_executor(store.clone(), delegate.clone());

        let dag = Arc::new(linear_dag(delegate_step("step_a", "A", vec![]), delegate_step("step_b", "B", vec![])));
        let affected: HashSet<String> = ["B".to_string()].into_iter().collect();
        let task = Arc::new(task_context("t3", TaskType::ScaleOut, affected));

        let status = executor.run_task(dag, task.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(status, yorc_topology::TaskStatus::Done);
        // Only the step on the affected node actually ran its delegate.
        assert_eq!(delegate.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let status_a = store
            .get(&paths::workflow_step_status(&task.task_id, "step_a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&status_a.value), "done");
    }

    #[tokio::test]
    async fn pre_cancelled_task_marks_steps_canceled() {
        let store = Arc::new(InMemoryKvStore::new());
        put_compute_node(&store, "A").await;
        let delegate = Arc::new(CountingDelegate {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let executor = new_executor(store.clone(), delegate.clone());

        let dag = Arc::new(linear_dag(delegate_step("step_a", "A", vec![]), delegate_step("step_never", "A", vec![])));
        let task = Arc::new(task_context("t4", TaskType::Deploy, HashSet::new()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let status = executor.run_task(dag, task, cancel).await.unwrap();
        assert_eq!(status, yorc_topology::TaskStatus::Canceled);
        assert_eq!(delegate.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_state_activity_writes_instance_attribute() {
        let store = Arc::new(InMemoryKvStore::new());
        store
            .put(&paths::node_instance_attribute("dep1", "App", "0", "state"), b"initial".to_vec())
            .await
            .unwrap();
        let delegate = Arc::new(CountingDelegate {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let executor = new_executor(store.clone(), delegate);

        let step = Step {
            name: "set_started".to_string(),
            node: "App".to_string(),
            operation_host: OperationHost::SelfHost,
            target_relationship: None,
            requirement_index: None,
            activities: vec![Activity {
                kind: ActivityKind::SetState {
                    state: "started".to_string(),
                },
            }],
            next: vec![],
        };
        let mut steps = HashMap::new();
        let step = Arc::new(step);
        steps.insert(step.name.clone(), step.clone());
        let dag = Arc::new(WorkflowDag {
            name: "install".to_string(),
            roots: vec![step],
            steps,
        });
        let task = Arc::new(task_context("t5", TaskType::Deploy, HashSet::new()));

        let status = executor.run_task(dag, task, CancellationToken::new()).await.unwrap();
        assert_eq!(status, yorc_topology::TaskStatus::Done);

        let attr = store
            .get(&paths::node_instance_attribute("dep1", "App", "0", "state"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&attr.value), "started");
    }

    #[tokio::test]
    async fn graceful_termination_times_out_sibling_after_failure() {
        let store = Arc::new(InMemoryKvStore::new());
        let topology = TopologyStore::new(store.clone(), "dep1");
        topology
            .put_node_template(&NodeTemplate {
                name: "A".to_string(),
                type_name: "ComputeFail".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        topology
            .put_node_template(&NodeTemplate {
                name: "B".to_string(),
                type_name: "ComputeSlow".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        struct SlowDelegate;
        #[async_trait]
        impl DelegateExecutor for SlowDelegate {
            async fn execute(&self, _task_id: &str, _deployment_id: &str, _node: &str, _operation: &str) -> Result<(), DelegateError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let mut executor = WorkflowExecutor::new(
            store.clone(),
            Arc::new(RecordingEventPublisher::new()),
            Arc::new(StaticArtifactResolver::new()),
            Arc::new(TickingScheduler::new()),
            ExecutorConfig {
                graceful_termination_timeout: Duration::from_millis(20),
                max_concurrency: 4,
            },
        );
        executor.register_delegate("ComputeFail", Arc::new(FailingDelegate));
        executor.register_delegate("ComputeSlow", Arc::new(SlowDelegate));
        let executor = Arc::new(executor);

        // Two independent roots: one fails immediately, the other would
        // run forever without the graceful-termination window.
        let mut steps = HashMap::new();
        let failing = Arc::new(delegate_step("step_fail", "A", vec![]));
        let slow = Arc::new(delegate_step("step_slow", "B", vec![]));
        steps.insert(failing.name.clone(), failing.clone());
        steps.insert(slow.name.clone(), slow.clone());
        let dag = Arc::new(WorkflowDag {
            name: "install".to_string(),
            roots: vec![failing, slow],
            steps,
        });
        let task = Arc::new(task_context("t6", TaskType::Deploy, HashSet::new()));

        let status = tokio::time::timeout(Duration::from_secs(2), executor.run_task(dag, task.clone(), CancellationToken::new()))
            .await
            .expect("graceful termination should cut the slow step short")
            .unwrap();
        assert_eq!(status, yorc_topology::TaskStatus::Failed);

        let status_slow = store
            .get(&paths::workflow_step_status(&task.task_id, "step_slow"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&status_slow.value), "error");
    }
}
