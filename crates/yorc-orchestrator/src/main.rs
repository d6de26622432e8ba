//! Single-node orchestrator binary (SPEC_FULL §10): wires the library
//! crates over one shared in-memory coordination store and exposes a
//! minimal admin surface to drive them. Almost all logic lives in the
//! library crates; this binary is wiring, not a feature surface.

mod config;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use yorc_kv::events::{EventPublisher, LoggingEventPublisher};
use yorc_kv::InMemoryKvStore;
use yorc_monitoring::MonitoringSupervisor;
use yorc_workflow::{StaticArtifactResolver, TickingScheduler, WorkflowExecutor};

use config::Configuration;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InMemoryKvStore>,
    pub executor: Arc<WorkflowExecutor<InMemoryKvStore>>,
    #[allow(dead_code)]
    pub monitoring: Arc<MonitoringSupervisor<InMemoryKvStore>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yorc_orchestrator=info,yorc_workflow=info,yorc_monitoring=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Configuration::from_env();
    tracing::info!(?config, "yorc-orchestrator starting");

    let store = Arc::new(InMemoryKvStore::new());
    let events: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher::new());

    let executor = Arc::new(WorkflowExecutor::new(
        store.clone(),
        events.clone(),
        Arc::new(StaticArtifactResolver::new()),
        Arc::new(TickingScheduler::new()),
        config.executor_config(),
    ));

    let monitoring = Arc::new(MonitoringSupervisor::new(store.clone(), events.clone()));

    let state = AppState {
        store,
        executor,
        monitoring,
    };

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
