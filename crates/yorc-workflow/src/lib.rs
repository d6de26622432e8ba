//! Workflow materialization and execution (§3–§4.6): turns a stored
//! workflow definition into a DAG of steps and runs it, gating each
//! step on its predecessors and cascading attribute notifications as
//! activities mutate state.

pub mod builder;
pub mod executor;
pub mod hooks;
pub mod model;
pub mod registry;
pub mod scheduler;

pub use builder::{WorkflowBuildError, WorkflowBuilder};
pub use executor::{ExecutorConfig, ExecutorError, TaskRecord, WorkflowExecutor};
pub use hooks::{ActivityHook, ActivityHookContext, HookError};
pub use model::{Activity, ActivityKind, OperationHost, Step, TaskContext, WorkflowDag};
pub use registry::{
    ArtifactResolver, ArtifactResolverError, DelegateError, DelegateExecutor, DelegateRegistry,
    ExecutionOutcome, OperationError, OperationExecutor, OperationRegistry, StaticArtifactResolver,
};
pub use scheduler::{ActivityScheduler, AsyncAction, AsyncActionRegistration, AsyncPollOutcome, TickingScheduler};
