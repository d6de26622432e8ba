//! Admin HTTP surface (SPEC_FULL §10): health/readiness plus enough of
//! a task API to drive the workflow executor end-to-end. Deliberately
//! thin — no `utoipa` annotations, no update/cancel/list routes; the
//! REST surface itself is out of scope (spec.md §1), this exists only
//! to exercise the core.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use yorc_topology::{TaskStatus, TaskType};
use yorc_workflow::{TaskContext, TaskRecord, WorkflowBuilder};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/deployments/:deployment_id/tasks", post(submit_task))
        .route("/deployments/:deployment_id/tasks/:task_id", get(get_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready as soon as the process is up: the in-memory store has no
/// external connection to wait on.
async fn readyz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    workflow_name: String,
    #[serde(default)]
    task_type: Option<TaskType>,
    #[serde(default)]
    affected_nodes: Vec<String>,
    #[serde(default)]
    bypass_errors: bool,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: String,
}

async fn submit_task(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), (StatusCode, String)> {
    let builder = WorkflowBuilder::new(state.store.clone(), deployment_id.clone());
    let dag = builder
        .build(&req.workflow_name)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let task = Arc::new(TaskContext {
        task_id: Uuid::now_v7().to_string(),
        deployment_id,
        workflow_name: req.workflow_name,
        task_type: req.task_type.unwrap_or(TaskType::Custom),
        affected_nodes: req.affected_nodes.into_iter().collect::<HashSet<_>>(),
        bypass_errors: req.bypass_errors,
    });
    let task_id = task.task_id.clone();
    let spawned_task_id = task_id.clone();

    let executor = state.executor.clone();
    let dag = Arc::new(dag);
    tokio::spawn(async move {
        if let Err(e) = executor.run_task(dag, task, CancellationToken::new()).await {
            tracing::error!(task_id = %spawned_task_id, "task execution failed: {e}");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(SubmitTaskResponse { task_id })))
}

#[derive(Debug, Serialize)]
struct TaskStatusResponse {
    task_id: String,
    deployment_id: String,
    workflow_name: String,
    status: TaskStatus,
}

impl From<TaskRecord> for TaskStatusResponse {
    fn from(r: TaskRecord) -> Self {
        Self {
            task_id: r.task_id,
            deployment_id: r.deployment_id,
            workflow_name: r.workflow_name,
            status: r.status,
        }
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path((_deployment_id, task_id)): Path<(String, String)>,
) -> Result<Json<TaskStatusResponse>, StatusCode> {
    match state.executor.task_status(&task_id).await {
        Ok(Some(record)) => Ok(Json(record.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(task_id = %task_id, "failed to read task status: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
