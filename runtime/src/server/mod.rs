//! REST API server for scriptbox

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Router};
use config_loader::ServiceConfig;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{self, AuthState};
use crate::executions::{self, DockerEngine, ExecutionService, RunStore};
use crate::scripts::{self, ScriptStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub scripts: ScriptStore,
    pub executions: ExecutionService,
    pub auth: AuthState,
}

impl AppState {
    /// Wire stores and the Docker Engine client from a validated config.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let languages = Arc::new(config.languages.clone());
        let scripts = ScriptStore::open(config.data_dir.clone(), Arc::clone(&languages))
            .context("opening script store")?;
        let runs = RunStore::open(config.data_dir.join("executions.json"))
            .context("opening run store")?;
        let runtime = DockerEngine::connect(&config.docker_host)
            .context("configuring docker engine client")?;

        let executions = ExecutionService::new(
            Arc::new(scripts.clone()),
            Arc::new(runs),
            Arc::new(runtime),
            languages,
        );

        Ok(Self {
            scripts,
            executions,
            auth: AuthState::new(config.users.clone()),
        })
    }
}

/// Create the REST API application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .merge(scripts::routes())
        .merge(executions::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(auth::routes())
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_check() -> &'static str {
    "OK"
}

/// Start the REST API server
pub async fn serve(addr: &str, state: AppState) -> Result<()> {
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Scriptbox API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested; in-flight executions stay recorded as running");
    }
}
