// ./api/src/main.rs
mod config;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::get,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use application::{ReadError, StoreError, SyncAdapter, SyncError, SyncMethod, SyncOutcome};
use crate::config::ServerConfig;
use domain::{DomainError, Entity};
use infrastructure::InMemoryDocumentStore;

/// Shared handler state.
#[derive(Clone)]
struct AppState {
    adapter: Arc<SyncAdapter>,
}

// Application entry point
#[tokio::main]
async fn main() {
    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // --- Dependency Injection ---
    let store = Arc::new(InMemoryDocumentStore::new(config.database.clone()));
    let adapter = Arc::new(SyncAdapter::new(store));
    info!(database = %config.database, "Document store initialized.");

    // --- Bootstrap (fatal on failure) ---
    if let Err(e) = adapter.bootstrap().await {
        error!("Failed to bootstrap document store: {}", e);
        std::process::exit(1);
    }
    info!("Document store bootstrapped.");

    let app = router(AppState { adapter });
    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server starting on {}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Server listening on {}", addr);
            listener
        }
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/models/:model_type",
            get(list_models_handler).post(create_model_handler),
        )
        .route(
            "/models/:model_type/:id",
            get(get_model_handler)
                .put(update_model_handler)
                .delete(delete_model_handler),
        )
        .with_state(state)
}

// --- API Handlers ---

async fn health_check() -> impl IntoResponse {
    info!("Health check endpoint called");
    (StatusCode::OK, "OK")
}

/// Handler for listing every model of a type (GET /models/:model_type).
async fn list_models_handler(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
) -> Response {
    info!(model_type = %model_type, "Received request to list models");
    let entity = Entity::new(model_type.as_str());
    match state.adapter.sync(SyncMethod::ReadAll, entity).await {
        Ok(outcome) => outcome_response(StatusCode::OK, outcome),
        Err(e) => {
            error!(model_type = %model_type, "Failed to list models via handler: {}", e);
            map_sync_error_to_response(e)
        }
    }
}

/// Handler for reading one model (GET /models/:model_type/:id).
async fn get_model_handler(
    State(state): State<AppState>,
    Path((model_type, id)): Path<(String, String)>,
) -> Response {
    info!(model_type = %model_type, id = %id, "Received request to read model");
    let entity = Entity::new(model_type.as_str()).with_id(id.as_str());
    match state.adapter.sync(SyncMethod::Read, entity).await {
        Ok(outcome) => outcome_response(StatusCode::OK, outcome),
        Err(e) => {
            error!(model_type = %model_type, id = %id, "Failed to read model via handler: {}", e);
            map_sync_error_to_response(e)
        }
    }
}

/// Handler for creating a model (POST /models/:model_type). The body's `id`
/// names the model.
async fn create_model_handler(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    info!(model_type = %model_type, "Received request to create model");
    let entity = match Entity::from_json(model_type.as_str(), body) {
        Ok(entity) => entity,
        Err(e) => return map_domain_error_to_response(e),
    };
    match state.adapter.sync(SyncMethod::Create, entity).await {
        Ok(outcome) => outcome_response(StatusCode::CREATED, outcome),
        Err(e) => {
            error!(model_type = %model_type, "Failed to create model via handler: {}", e);
            map_sync_error_to_response(e)
        }
    }
}

/// Handler for updating a model (PUT /models/:model_type/:id). The path id wins
/// over any `id` in the body.
async fn update_model_handler(
    State(state): State<AppState>,
    Path((model_type, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    info!(model_type = %model_type, id = %id, "Received request to update model");
    let entity = match Entity::from_json(model_type.as_str(), body) {
        Ok(entity) => entity.with_id(id.as_str()),
        Err(e) => return map_domain_error_to_response(e),
    };
    match state.adapter.sync(SyncMethod::Update, entity).await {
        Ok(outcome) => outcome_response(StatusCode::OK, outcome),
        Err(e) => {
            error!(model_type = %model_type, id = %id, "Failed to update model via handler: {}", e);
            map_sync_error_to_response(e)
        }
    }
}

/// Handler for deleting a model (DELETE /models/:model_type/:id).
async fn delete_model_handler(
    State(state): State<AppState>,
    Path((model_type, id)): Path<(String, String)>,
) -> Response {
    info!(model_type = %model_type, id = %id, "Received request to delete model");
    let entity = Entity::new(model_type.as_str()).with_id(id.as_str());
    match state.adapter.sync(SyncMethod::Delete, entity).await {
        Ok(_) => {
            info!(model_type = %model_type, id = %id, "Model deleted successfully via handler");
            (StatusCode::NO_CONTENT, "").into_response()
        }
        Err(e) => {
            error!(model_type = %model_type, id = %id, "Failed to delete model via handler: {}", e);
            map_sync_error_to_response(e)
        }
    }
}

fn outcome_response(status: StatusCode, outcome: SyncOutcome) -> Response {
    match outcome {
        SyncOutcome::Document(document) => (status, JsonResponse(document)).into_response(),
        SyncOutcome::Documents(documents) => (status, JsonResponse(documents)).into_response(),
        SyncOutcome::Entity(entity) => {
            (status, JsonResponse(entity.attributes().clone())).into_response()
        }
    }
}

/// Status code and body for an adapter error.
fn sync_error_status(err: &SyncError) -> (StatusCode, String) {
    match err {
        SyncError::Read(ReadError::Model) => (StatusCode::NOT_FOUND, err.to_string()),
        SyncError::Read(ReadError::Collection) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        SyncError::MissingId { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        SyncError::Write(StoreError::Conflict(_))
        | SyncError::Delete {
            source: StoreError::Conflict(_),
        } => (StatusCode::CONFLICT, err.to_string()),
        SyncError::Delete { .. } => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        SyncError::Write(_) | SyncError::Bootstrap { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An internal server error occurred".to_string(),
        ),
    }
}

fn map_sync_error_to_response(err: SyncError) -> Response {
    sync_error_status(&err).into_response()
}

fn map_domain_error_to_response(err: DomainError) -> Response {
    warn!("Rejected model body: {}", err);
    (StatusCode::BAD_REQUEST, err.to_string()).into_response()
}
