use crate::application::decider::Decider;
use crate::application::engine::DispatchEngine;
use crate::application::registry::{DiscoveryFailure, ToolRegistry};
use crate::types::{
    CatalogServer, DispatchErrorKind, DispatchResult, ErrorDetail, ParameterSpec, ToolDescriptor,
};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub(crate) struct ServerState<D: Decider> {
    engine: Arc<DispatchEngine<D>>,
    registry: Arc<ToolRegistry>,
}

impl<D: Decider> ServerState<D> {
    pub(crate) fn new(engine: Arc<DispatchEngine<D>>, registry: Arc<ToolRegistry>) -> Self {
        Self { engine, registry }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(dispatch_handler, catalog_handler, health_handler, refresh_handler),
    components(
        schemas(
            DispatchRequest,
            DispatchResult,
            ErrorDetail,
            ErrorResponse,
            CatalogResponse,
            CatalogServer,
            ToolDescriptor,
            ParameterSpec,
            HealthResponse,
            RefreshResponse,
            DiscoveryFailure
        )
    ),
    tags(
        (name = "dispatch", description = "Route a request to the best available tool"),
        (name = "catalog", description = "Introspection over the discovered tool catalog")
    )
)]
struct ApiDoc;

pub async fn serve<D>(
    engine: Arc<DispatchEngine<D>>,
    registry: Arc<ToolRegistry>,
    addr: SocketAddr,
) -> Result<(), ServerError>
where
    D: Decider + 'static,
{
    let api = ApiDoc::openapi();
    info!(%addr, "Binding REST server");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let state = Arc::new(ServerState::new(engine, registry));
    let app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", api))
        .route("/dispatch", post(dispatch_handler::<D>))
        .route("/catalog", get(catalog_handler::<D>))
        .route("/health", get(health_handler::<D>))
        .route("/refresh", post(refresh_handler::<D>))
        .layer(cors)
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "REST server ready to accept connections");

    axum::serve(listener, app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}

#[derive(Debug, Deserialize, ToSchema)]
struct DispatchRequest {
    message: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
}

#[utoipa::path(
    post,
    path = "/dispatch",
    tag = "dispatch",
    request_body = DispatchRequest,
    responses(
        (status = 200, description = "Request was dispatched; check errorDetail for tool failures", body = DispatchResult),
        (status = 400, description = "Message was empty", body = ErrorResponse),
        (status = 503, description = "No tools are available", body = DispatchResult)
    )
)]
async fn dispatch_handler<D: Decider>(
    State(state): State<Arc<ServerState<D>>>,
    Json(payload): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchResult>), (StatusCode, Json<ErrorResponse>)> {
    if payload.message.trim().is_empty() {
        error!("Rejecting /dispatch request due to empty message");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "message cannot be empty".to_string(),
            }),
        ));
    }

    info!("Received /dispatch request");
    let result = state.engine.dispatch(&payload.message).await;

    let status = match &result.error {
        Some(detail) if detail.kind == DispatchErrorKind::RegistryEmpty => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::OK,
    };
    Ok((status, Json(result)))
}

#[derive(Debug, Serialize, ToSchema)]
struct CatalogResponse {
    servers: usize,
    total_tools: usize,
    tools: Vec<CatalogServer>,
}

#[utoipa::path(
    get,
    path = "/catalog",
    tag = "catalog",
    responses(
        (status = 200, description = "Currently discovered tools, grouped by server", body = CatalogResponse)
    )
)]
async fn catalog_handler<D: Decider>(
    State(state): State<Arc<ServerState<D>>>,
) -> Json<CatalogResponse> {
    let snapshot = state.registry.snapshot();
    debug!(tool_count = snapshot.tool_count(), "Serving /catalog request");
    Json(CatalogResponse {
        servers: snapshot.servers().len(),
        total_tools: snapshot.tool_count(),
        tools: snapshot.servers().to_vec(),
    })
}

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
    servers_configured: usize,
    tools_loaded: usize,
    last_discovery: Option<DateTime<Utc>>,
    discovery_failures: Vec<DiscoveryFailure>,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "catalog",
    responses(
        (status = 200, description = "Service health and catalog freshness", body = HealthResponse)
    )
)]
async fn health_handler<D: Decider>(
    State(state): State<Arc<ServerState<D>>>,
) -> Json<HealthResponse> {
    let snapshot = state.registry.snapshot();
    let status = if snapshot.is_empty() {
        "unhealthy"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status,
        servers_configured: state.registry.server_count(),
        tools_loaded: snapshot.tool_count(),
        last_discovery: snapshot.rebuilt_at(),
        discovery_failures: snapshot.failures().to_vec(),
    })
}

#[derive(Debug, Serialize, ToSchema)]
struct RefreshResponse {
    tools_loaded: usize,
    failures: Vec<DiscoveryFailure>,
}

#[utoipa::path(
    post,
    path = "/refresh",
    tag = "catalog",
    responses(
        (status = 200, description = "Catalog rebuilt from all configured servers", body = RefreshResponse)
    )
)]
async fn refresh_handler<D: Decider>(
    State(state): State<Arc<ServerState<D>>>,
) -> Json<RefreshResponse> {
    info!("Received /refresh request");
    let (tools_loaded, failures) = state.registry.rebuild().await;
    Json(RefreshResponse {
        tools_loaded,
        failures,
    })
}
