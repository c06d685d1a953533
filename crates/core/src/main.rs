use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;

use altec_common::ids::WorkerId;
use altec_common::model::{TaskKey, TaskKind, TaskStatus};
use altec_core::adapters::{HttpModelAdapter, MockAdapter, ModelAdapter};
use altec_core::admission::{run_reclaim_sweeper, AdmissionGuard, SubmitOutcome};
use altec_core::circuit_breaker::CircuitBreakerRegistry;
use altec_core::config::{self, CoreConfig};
use altec_core::credentials::{CredentialIssuer, JwtCredentialIssuer};
use altec_core::executor::phases::build_registry;
use altec_core::executor::pipeline::PipelineRegistry;
use altec_core::executor::SegmentedExecutor;
use altec_core::policy::InputDescriptor;
use altec_core::progress::TaskView;
use altec_core::state_store::{HybridStateStore, PostgresTaskStore, RedisLockStore, StateStore};

/// Shared application state accessible from axum handlers.
struct AppState {
    store: Arc<dyn StateStore>,
    admission: Arc<AdmissionGuard>,
    registry: Arc<PipelineRegistry>,
    issuer: Arc<dyn CredentialIssuer>,
    metrics_handle: PrometheusHandle,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("ALTEC starting");

    let config_dir = std::env::var("ALTEC_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let core_config: CoreConfig = match config::load_config(&config_dir) {
        Ok(config) => {
            tracing::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| core_config.system.store.postgres_url.clone());
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| core_config.system.store.redis_url.clone());

    let tasks = match PostgresTaskStore::connect(&database_url, core_config.system.store.max_postgres_connections).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            std::process::exit(1);
        }
    };

    if let Err(e) = tasks.migrate().await {
        tracing::error!(error = %e, "Failed to run PostgreSQL migrations");
        std::process::exit(1);
    }

    let locks = match RedisLockStore::connect(&redis_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to Redis");
            std::process::exit(1);
        }
    };

    tracing::info!("All databases connected and initialized");

    let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(
        &core_config.system.store.circuit_breaker,
        &core_config.system.store.circuit_breaker,
    ));

    let store: Arc<dyn StateStore> = Arc::new(HybridStateStore::new(
        tasks,
        locks,
        Arc::clone(&circuit_breakers.postgres),
        Arc::clone(&circuit_breakers.redis),
    ));

    let adapter: Arc<dyn ModelAdapter> = match &core_config.system.execution.model_adapter_base_url {
        Some(base_url) => {
            tracing::info!(base_url, "Dispatching model calls over HTTP");
            Arc::new(HttpModelAdapter::new(
                base_url.clone(),
                Arc::clone(&circuit_breakers.model_adapter),
            ))
        }
        None => {
            tracing::warn!("No model_adapter_base_url configured — running against the in-process mock adapter");
            Arc::new(MockAdapter::new())
        }
    };

    let registry = Arc::new(build_registry(adapter, core_config.system.retry.model_adapter.clone()));

    let executor = Arc::new(SegmentedExecutor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        core_config.system.execution.default_deadline_multiplier,
        core_config.system.progress.clone(),
    ));

    let worker_id = WorkerId::new(format!(
        "{}-{}",
        core_config.system.server.worker_id_prefix,
        std::process::id()
    ));

    let admission = Arc::new(AdmissionGuard::new(
        Arc::clone(&store),
        executor,
        core_config.system.policy.clone(),
        core_config.system.admission.clone(),
        worker_id,
    ));

    // Reclaim sweeper: a periodic background pass over expired locks (§4.2).
    {
        let store = Arc::clone(&store);
        let admission_config = core_config.system.admission.clone();
        tokio::spawn(run_reclaim_sweeper(store, admission_config));
    }

    let signing_key = std::env::var("SESSION_SIGNING_KEY").unwrap_or_else(|_| {
        tracing::warn!("SESSION_SIGNING_KEY not set, using an insecure development default");
        "altec-dev-signing-key-do-not-use-in-production".to_string()
    });
    let issuer: Arc<dyn CredentialIssuer> = Arc::new(JwtCredentialIssuer::new(
        signing_key.as_bytes(),
        chrono::Duration::minutes(30),
    ));

    // Spawn circuit breaker metrics reporter.
    {
        let cbs = Arc::clone(&circuit_breakers);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(30);
            loop {
                tokio::time::sleep(interval).await;
                cbs.report_metrics();
            }
        });
    }

    let state = Arc::new(AppState {
        store,
        admission,
        registry,
        issuer,
        metrics_handle,
        circuit_breakers,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/tasks", post(submit_handler))
        .route("/tasks/{kind}/{resource_id}", get(poll_handler))
        .route("/tasks/{kind}/{resource_id}/cancel", post(cancel_handler))
        .with_state(state);

    let port: u16 = std::env::var("ALTEC_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind TCP listener");

    tracing::info!(port = port, "ALTEC listening");

    axum::serve(listener, app).await.expect("HTTP server error");
}

/// Health check endpoint. Checks Postgres and Redis reachability through the store.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let status = if store_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = serde_json::json!({
        "status": if store_ok { "healthy" } else { "unhealthy" },
        "services": { "state_store": if store_ok { "healthy" } else { "unhealthy" } },
    });
    (status, Json(body))
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

#[derive(Deserialize)]
struct SubmitRequest {
    kind: String,
    resource_id: String,
    #[serde(default)]
    descriptor: InputDescriptor,
}

/// `POST /tasks` — the external `submit` interface from §6.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> impl IntoResponse {
    let Some(kind) = TaskKind::parse(&req.kind) else {
        let body = serde_json::json!({ "error": "invalid_kind", "kind": req.kind });
        return (StatusCode::BAD_REQUEST, Json(body));
    };

    let key = TaskKey::new(kind, req.resource_id);
    match state.admission.submit(key, req.descriptor).await {
        Ok(SubmitOutcome::Started { task_id }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": task_id.to_string(), "outcome": "started" })),
        ),
        Ok(SubmitOutcome::Attached { task_id, current_status }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "task_id": task_id.to_string(),
                "outcome": "attached",
                "current_status": current_status,
            })),
        ),
        Ok(SubmitOutcome::SkippedRecentSuccess { task_id, result_ref }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "task_id": task_id.to_string(),
                "outcome": "skipped_recent_success",
                "result_ref": result_ref,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.kind(), "message": e.to_string() })),
        ),
    }
}

/// `GET /tasks/{kind}/{resource_id}` — the external `poll` interface from §6, serving
/// the `TaskView` read model plus C6's optional `refresh` field.
async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, resource_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(kind) = TaskKind::parse(&kind) else {
        let body = serde_json::json!({ "error": "invalid_kind", "kind": kind });
        return (StatusCode::BAD_REQUEST, Json(body));
    };
    let key = TaskKey::new(kind, resource_id);

    let task = match state.store.load_task(&key).await {
        Ok(task) => task,
        Err(_) => {
            let body = serde_json::json!({ "error": "not_found" });
            return (StatusCode::NOT_FOUND, Json(body));
        }
    };

    let incoming_expiry = headers
        .get("x-session-token")
        .and_then(|v| v.to_str().ok())
        .and_then(|token| state.issuer.decode_expiry(token));

    let view = TaskView::build(&task, &state.registry, state.issuer.as_ref(), incoming_expiry);
    (StatusCode::OK, Json(serde_json::to_value(&view).unwrap_or_default()))
}

/// `POST /tasks/{kind}/{resource_id}/cancel` — the external `cancel` interface from §6.
async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, resource_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(kind) = TaskKind::parse(&kind) else {
        let body = serde_json::json!({ "error": "invalid_kind", "kind": kind });
        return (StatusCode::BAD_REQUEST, Json(body));
    };
    let key = TaskKey::new(kind, resource_id);

    let task = match state.store.load_task(&key).await {
        Ok(task) => task,
        Err(_) => {
            let body = serde_json::json!({ "error": "not_found" });
            return (StatusCode::NOT_FOUND, Json(body));
        }
    };

    if task.status.is_terminal() || task.status == TaskStatus::Abandoned {
        return (StatusCode::OK, Json(serde_json::json!({ "outcome": "already_terminal" })));
    }

    match state.admission.request_cancel(&key).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "outcome": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.kind(), "message": e.to_string() })),
        ),
    }
}
