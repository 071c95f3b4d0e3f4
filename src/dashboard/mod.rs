use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::{Coordinator, SubmitTarget};
use crate::protocol::PROTOCOL_VERSION;

#[derive(Clone)]
pub struct DashboardState {
    pub coordinator: Arc<Coordinator>,
}

/// One configured environment, keyed by its config name in the response map.
#[derive(Serialize)]
struct EnvironmentResponse {
    name: String,
    language: String,
    command: String,
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

#[derive(Deserialize)]
struct BuildRequestBody {
    environment: String,
    #[serde(default, rename = "selectedServer")]
    selected_server: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/workers", get(workers_handler))
        .route("/api/environments", get(environments_handler))
        .route("/api/version", get(version_handler))
        .route("/api/build", post(build_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.coordinator.worker_status().await)
}

async fn environments_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let environments: BTreeMap<String, EnvironmentResponse> = state
        .coordinator
        .config()
        .build
        .environments
        .iter()
        .map(|(key, env)| {
            (
                key.clone(),
                EnvironmentResponse {
                    name: key.clone(),
                    language: env.name.clone(),
                    command: env.command.clone(),
                },
            )
        })
        .collect();

    Json(environments)
}

async fn version_handler() -> impl IntoResponse {
    Json(VersionResponse {
        version: PROTOCOL_VERSION,
    })
}

async fn build_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<BuildRequestBody>,
) -> Response {
    let target = match payload.selected_server.filter(|s| !s.is_empty()) {
        Some(addr) => SubmitTarget::Address(addr),
        None => SubmitTarget::Any,
    };

    match state
        .coordinator
        .submit_build(&payload.environment, target)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if e.is_precondition() {
                tracing::debug!(environment = %payload.environment, error = %e, "Build request rejected");
            } else {
                tracing::warn!(environment = %payload.environment, error = %e, "Build request failed");
            }
            (
                status,
                Json(ErrorResponse {
                    success: false,
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
