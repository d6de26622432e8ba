//! Workflow Builder (§4.5): materializes a stored workflow definition
//! into a [`WorkflowDag`].
//!
//! Step definitions live under `topology/workflows/<name>/steps/<step>/...`
//! (§6 key layout, extended by SPEC_FULL with `requirement_index`); the
//! root set lives alongside them. A step reachable from two parents is
//! built once and shared via `Arc`, matching the original's `visitedMap`
//! in `readWorkFlowFromConsul`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use yorc_kv::{paths, KvError, KvStore};

use crate::model::{Activity, ActivityKind, OperationHost, Step, WorkflowDag};

#[derive(Debug, Error)]
pub enum WorkflowBuildError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("malformed workflow: {0}")]
    Malformed(String),
}

pub struct WorkflowBuilder<S: KvStore> {
    store: Arc<S>,
    deployment_id: String,
}

impl<S: KvStore> WorkflowBuilder<S> {
    pub fn new(store: Arc<S>, deployment_id: impl Into<String>) -> Self {
        Self {
            store,
            deployment_id: deployment_id.into(),
        }
    }

    pub async fn build(&self, workflow_name: &str) -> Result<WorkflowDag, WorkflowBuildError> {
        let roots_key = paths::workflow_roots(&self.deployment_id, workflow_name);
        let roots_raw = self
            .store
            .get(&roots_key)
            .await?
            .ok_or_else(|| WorkflowBuildError::Malformed(format!("workflow {workflow_name} has no roots")))?;
        let root_names: Vec<String> = serde_json::from_slice(&roots_raw.value)
            .map_err(|e| WorkflowBuildError::Malformed(format!("malformed roots list: {e}")))?;
        if root_names.is_empty() {
            return Err(WorkflowBuildError::Malformed(format!(
                "workflow {workflow_name} declares zero root steps"
            )));
        }

        let mut visited: HashMap<String, Arc<Step>> = HashMap::new();
        let mut roots = Vec::with_capacity(root_names.len());
        for name in &root_names {
            roots.push(self.materialize(workflow_name, name, &mut visited).await?);
        }

        // Validate every `next` edge points at a step that actually exists.
        for step in visited.values() {
            for target in &step.next {
                if !visited.contains_key(target) {
                    return Err(WorkflowBuildError::Malformed(format!(
                        "step {} has a next edge to undefined step {target}",
                        step.name
                    )));
                }
            }
        }

        Ok(WorkflowDag {
            name: workflow_name.to_string(),
            roots,
            steps: visited,
        })
    }

    /// Builds `step_name` and everything reachable from it, memoizing by
    /// name so a step shared by multiple parents is materialized once.
    #[async_recursion::async_recursion]
    async fn materialize(
        &self,
        workflow_name: &str,
        step_name: &str,
        visited: &mut HashMap<String, Arc<Step>>,
    ) -> Result<Arc<Step>, WorkflowBuildError>
    where
        S: 'async_recursion,
    {
        if let Some(existing) = visited.get(step_name) {
            return Ok(existing.clone());
        }

        let node = self
            .read_string(&paths::workflow_step_node(&self.deployment_id, workflow_name, step_name))
            .await?
            .ok_or_else(|| WorkflowBuildError::Malformed(format!("step {step_name} has no node")))?;

        let operation_host = match self
            .read_string(&paths::workflow_step_operation_host(
                &self.deployment_id,
                workflow_name,
                step_name,
            ))
            .await?
            .as_deref()
        {
            None | Some("SELF") => OperationHost::SelfHost,
            Some("HOST") => OperationHost::Host,
            Some("SOURCE") => OperationHost::Source,
            Some("TARGET") => OperationHost::Target,
            Some(other) => {
                return Err(WorkflowBuildError::Malformed(format!(
                    "step {step_name} has unknown operation_host {other:?}"
                )))
            }
        };

        let target_relationship = self
            .read_string(&paths::workflow_step_target_relationship(
                &self.deployment_id,
                workflow_name,
                step_name,
            ))
            .await?;
        let requirement_index = self
            .read_string(&paths::workflow_step_requirement_index(
                &self.deployment_id,
                workflow_name,
                step_name,
            ))
            .await?;

        let activities = self.read_activities(workflow_name, step_name).await?;
        if activities.is_empty() {
            return Err(WorkflowBuildError::Malformed(format!(
                "step {step_name} has zero activities"
            )));
        }

        let next = self.read_next(workflow_name, step_name).await?;

        // Insert a placeholder before recursing into `next` so a cycle
        // back to this step (malformed, but shouldn't hang the builder)
        // resolves to the in-progress Arc rather than looping forever.
        let step = Arc::new(Step {
            name: step_name.to_string(),
            node,
            operation_host,
            target_relationship,
            requirement_index,
            activities,
            next: next.clone(),
        });
        visited.insert(step_name.to_string(), step.clone());

        for child in &next {
            self.materialize(workflow_name, child, visited).await?;
        }

        Ok(step)
    }

    async fn read_activities(
        &self,
        workflow_name: &str,
        step_name: &str,
    ) -> Result<Vec<Activity>, WorkflowBuildError> {
        let prefix = paths::workflow_step_activity_prefix(&self.deployment_id, workflow_name, step_name);
        let mut pairs = self.store.list_by_prefix(&prefix).await?;
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        pairs
            .into_iter()
            .map(|pair| {
                let kind: ActivityKind = serde_json::from_slice(&pair.value).map_err(|e| {
                    WorkflowBuildError::Malformed(format!(
                        "step {step_name} has an unrecognized activity at {}: {e}",
                        pair.key
                    ))
                })?;
                Ok(Activity { kind })
            })
            .collect()
    }

    async fn read_next(&self, workflow_name: &str, step_name: &str) -> Result<Vec<String>, WorkflowBuildError> {
        let prefix = paths::workflow_step_next_prefix(&self.deployment_id, workflow_name, step_name);
        let mut pairs = self.store.list_by_prefix(&prefix).await?;
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs
            .into_iter()
            .map(|pair| String::from_utf8_lossy(&pair.value).into_owned())
            .collect())
    }

    async fn read_string(&self, key: &str) -> Result<Option<String>, WorkflowBuildError> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|pair| String::from_utf8_lossy(&pair.value).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yorc_kv::InMemoryKvStore;

    async fn put(store: &InMemoryKvStore, key: &str, value: &str) {
        store.put(key, value.as_bytes().to_vec()).await.unwrap();
    }

    async fn seed_linear_workflow(store: &InMemoryKvStore) {
        put(store, &paths::workflow_roots("dep1", "install"), r#"["step1"]"#).await;
        put(store, &paths::workflow_step_node("dep1", "install", "step1"), "Web").await;
        put(
            store,
            &format!("{}0", paths::workflow_step_activity_prefix("dep1", "install", "step1")),
            r#"{"kind":"set_state","state":"creating"}"#,
        )
        .await;
        put(
            store,
            &format!("{}0", paths::workflow_step_next_prefix("dep1", "install", "step1")),
            "step2",
        )
        .await;
        put(store, &paths::workflow_step_node("dep1", "install", "step2"), "Web").await;
        put(
            store,
            &format!("{}0", paths::workflow_step_activity_prefix("dep1", "install", "step2")),
            r#"{"kind":"set_state","state":"created"}"#,
        )
        .await;
    }

    #[tokio::test]
    async fn builds_linear_dag() {
        let store = Arc::new(InMemoryKvStore::new());
        seed_linear_workflow(&store).await;
        let builder = WorkflowBuilder::new(store, "dep1");
        let dag = builder.build("install").await.unwrap();
        assert_eq!(dag.roots.len(), 1);
        assert_eq!(dag.roots[0].name, "step1");
        assert_eq!(dag.steps.len(), 2);
        assert_eq!(dag.predecessors_of("step2"), vec!["step1".to_string()]);
    }

    #[tokio::test]
    async fn shared_step_is_materialized_once() {
        let store = Arc::new(InMemoryKvStore::new());
        put(&store, &paths::workflow_roots("dep1", "wf"), r#"["a", "b"]"#).await;
        for name in ["a", "b"] {
            put(&store, &paths::workflow_step_node("dep1", "wf", name), "Web").await;
            put(
                &store,
                &format!("{}0", paths::workflow_step_activity_prefix("dep1", "wf", name)),
                r#"{"kind":"set_state","state":"created"}"#,
            )
            .await;
            put(
                &store,
                &format!("{}0", paths::workflow_step_next_prefix("dep1", "wf", name)),
                "shared",
            )
            .await;
        }
        put(&store, &paths::workflow_step_node("dep1", "wf", "shared"), "Web").await;
        put(
            &store,
            &format!("{}0", paths::workflow_step_activity_prefix("dep1", "wf", "shared")),
            r#"{"kind":"set_state","state":"started"}"#,
        )
        .await;

        let dag = WorkflowBuilder::new(store, "dep1").build("wf").await.unwrap();
        assert_eq!(dag.steps.len(), 3);
        let mut preds = dag.predecessors_of("shared");
        preds.sort();
        assert_eq!(preds, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn zero_activities_is_malformed() {
        let store = Arc::new(InMemoryKvStore::new());
        put(&store, &paths::workflow_roots("dep1", "wf"), r#"["step1"]"#).await;
        put(&store, &paths::workflow_step_node("dep1", "wf", "step1"), "Web").await;
        let err = WorkflowBuilder::new(store, "dep1").build("wf").await.unwrap_err();
        assert!(matches!(err, WorkflowBuildError::Malformed(_)));
    }

    #[tokio::test]
    async fn next_edge_to_missing_step_is_malformed() {
        let store = Arc::new(InMemoryKvStore::new());
        put(&store, &paths::workflow_roots("dep1", "wf"), r#"["step1"]"#).await;
        put(&store, &paths::workflow_step_node("dep1", "wf", "step1"), "Web").await;
        put(
            &store,
            &format!("{}0", paths::workflow_step_activity_prefix("dep1", "wf", "step1")),
            r#"{"kind":"set_state","state":"created"}"#,
        )
        .await;
        put(
            &store,
            &format!("{}0", paths::workflow_step_next_prefix("dep1", "wf", "step1")),
            "ghost",
        )
        .await;
        let err = WorkflowBuilder::new(store, "dep1").build("wf").await.unwrap_err();
        assert!(matches!(err, WorkflowBuildError::Malformed(_)));
    }

    #[tokio::test]
    async fn missing_node_is_malformed() {
        let store = Arc::new(InMemoryKvStore::new());
        put(&store, &paths::workflow_roots("dep1", "wf"), r#"["step1"]"#).await;
        let err = WorkflowBuilder::new(store, "dep1").build("wf").await.unwrap_err();
        assert!(matches!(err, WorkflowBuildError::Malformed(_)));
    }
}
