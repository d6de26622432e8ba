//! Workflow definition records (§3, §4.5) and the materialized DAG.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use yorc_topology::{CheckStatus, CheckType, NodeState, TaskStatus, TaskType};

/// `SELF | HOST | SOURCE | TARGET`, the host a step's activities
/// operate against. Defaults to `SELF` (§3 SPEC_FULL supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationHost {
    #[default]
    #[serde(rename = "SELF")]
    SelfHost,
    Host,
    Source,
    Target,
}

/// One activity within a step (§1, §4.6.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    /// Delegate provisioning to an executor selected by the target
    /// node's type.
    Delegate { operation: String },
    /// Write a new lifecycle state to every instance of the target node.
    SetState { state: String },
    /// Invoke a named interface operation via its implementation artifact.
    CallOperation { operation: String },
    /// Recursively register `workflow` as a sub-task of the current task.
    Inline { workflow: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityKind,
}

/// One node of a workflow DAG (§3 "Step Run State" owner, §4.5).
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub node: String,
    pub operation_host: OperationHost,
    /// Relationship type the step's activities operate in the context
    /// of, when applicable (SPEC_FULL §3 supplement).
    pub target_relationship: Option<String>,
    /// Requirement index used to resolve the relationship target node
    /// when `operation_host` (or the operation name) redirects dispatch
    /// there (§4.6.2, §4.6.4).
    pub requirement_index: Option<String>,
    pub activities: Vec<Activity>,
    pub next: Vec<String>,
}

/// The materialized DAG a [`super::builder::WorkflowBuilder`] produces:
/// arena-like storage (§9 design note) so tearing it down is just
/// dropping the map, no parent-pointer cleanup.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    pub name: String,
    pub roots: Vec<Arc<Step>>,
    pub steps: HashMap<String, Arc<Step>>,
}

impl WorkflowDag {
    /// Steps with no incoming edge other than the declared roots; used
    /// by the executor to seed the initial runnable set and to detect a
    /// step's predecessors.
    pub fn predecessors_of(&self, step_name: &str) -> Vec<String> {
        self.steps
            .values()
            .filter(|s| s.next.iter().any(|n| n == step_name))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn all_step_names(&self) -> HashSet<String> {
        self.steps.keys().cloned().collect()
    }
}

/// A running instantiation of a workflow over a deployment (§3 "Task").
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub deployment_id: String,
    pub workflow_name: String,
    pub task_type: TaskType,
    /// Nodes whose instance count is changing, for `scale-out`/`scale-in`
    /// step filtering (§4.6.2). Ignored for other task types.
    pub affected_nodes: HashSet<String>,
    /// §7: an `executor-failure` is logged WARN and the step continues
    /// rather than becoming `ERROR` when this is set.
    pub bypass_errors: bool,
}
