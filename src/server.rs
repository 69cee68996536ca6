//! HTTP API for the map client and the assistant.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/severity-maps` | dNBR, RdNBR, RBR and severity tile URLs |
//! | `POST` | `/severity-stats` | Hectares per severity class |
//! | `POST` | `/severity` | Index change per rolling window since a fire |
//! | `POST` | `/timeseries` | Regional index mean per image |
//! | `POST` | `/composite-image` | Mean index composite tile URL |
//! | `POST` | `/image-list` | Image ids in the pre and post windows |
//! | `POST` | `/download` | GeoTIFF export of one severity layer |
//! | `POST` | `/burned-areas` | Burned-area polygons (ICNF / EFFIS) for a year |
//! | `POST` | `/mapper` | Burned-area feature under a point |
//! | `POST` | `/chat` | Retrieval-augmented assistant reply |
//! | `GET`  | `/rag/status` | Corpus readiness and statistics |
//! | `POST` | `/rag/init` | Re-ingest the corpus and reload the cache |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "missing parameter: satellite" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `no_images` (404),
//! `engine_unavailable` (503), `internal` (500), `upstream` (502, downloads only).
//! `/chat` answers 200 with a fallback reply whenever the request itself is valid.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for the browser client.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use severus_core::embedding::EmbeddingProvider;
use severus_core::engine::{Engine, EngineError};

use crate::analysis::{
    AnalysisError, BurnedAreasRequest, DownloadRequest, GeoService, IndexWindowRequest,
    MapperRequest, SeverityRequest, TrajectoryRequest,
};
use crate::chat::{ChatError, ChatRequest, ChatService, CompletionClient};
use crate::config::Config;
use crate::corpus::{CorpusStats, DocumentCache, Retriever};
use crate::embedding::create_provider;
use crate::gee::RestEngine;
use crate::ingest::{run_ingest, IngestOptions};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when no imagery engine is configured; geospatial routes answer 503.
    pub geo: Option<Arc<GeoService>>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatService>,
    /// Serializes `/rag/init` runs.
    pub ingest_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    /// Wire the services for `config` around an engine and an embedding provider.
    pub fn new(
        config: Config,
        engine: Option<Arc<dyn Engine>>,
        provider: Arc<dyn EmbeddingProvider>,
        completion: CompletionClient,
    ) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(DocumentCache::new(&config.rag.cache_path));
        let retriever = Arc::new(Retriever::new(&config, cache, provider));
        let chat = Arc::new(ChatService::new(
            retriever.clone(),
            completion,
            config.chat.clone(),
            config.rag.min_similarity,
        ));
        let geo = engine.map(|engine| Arc::new(GeoService::new(engine, config.earth_engine.clone())));
        Self {
            config,
            geo,
            retriever,
            chat,
            ingest_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn geo(&self) -> Result<&GeoService, AppError> {
        self.geo.as_deref().ok_or_else(|| AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "engine_unavailable".to_string(),
            message: "Earth Engine is not configured".to_string(),
        })
    }
}

/// Starts the HTTP server on `[server].bind`.
///
/// The Earth Engine client is optional: without `earth_engine.project` the
/// assistant still works and the geospatial routes answer 503.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    severus_core::catalog::validate_catalog()?;

    let engine: Option<Arc<dyn Engine>> = match RestEngine::new(&config.earth_engine) {
        Ok(engine) => Some(Arc::new(engine)),
        Err(e) => {
            tracing::warn!(error = %e, "geospatial endpoints disabled");
            None
        }
    };
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
    let completion = CompletionClient::new(&config.chat)?;
    let state = AppState::new(config.clone(), engine, provider, completion);

    // Warm the cache; a missing file only disables retrieval until /rag/init.
    match state.retriever.cache().documents().await {
        Ok(docs) => tracing::info!(chunks = docs.len(), "corpus ready"),
        Err(e) => tracing::warn!(error = %e, "corpus not loaded"),
    }

    let bind_addr = config.server.bind.clone();
    let app = build_router(state);

    println!("Severus listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The full router with CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/severity-maps", post(handle_severity_maps))
        .route("/severity-stats", post(handle_severity_stats))
        .route("/severity", post(handle_severity))
        .route("/timeseries", post(handle_timeseries))
        .route("/composite-image", post(handle_composite_image))
        .route("/image-list", post(handle_image_list))
        .route("/download", post(handle_download))
        .route("/burned-areas", post(handle_burned_areas))
        .route("/mapper", post(handle_mapper))
        .route("/chat", post(handle_chat))
        .route("/rag/status", get(handle_rag_status))
        .route("/rag/init", post(handle_rag_init))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: code.to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<AnalysisError> for AppError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::InvalidInput(msg) => bad_request(msg),
            AnalysisError::NotFound(msg) => not_found("not_found", msg),
            AnalysisError::Engine(EngineError::NoImagesInRange { start, end }) => not_found(
                "no_images",
                format!("Nenhuma imagem disponível entre {} e {}", start, end),
            ),
            AnalysisError::Engine(EngineError::InvalidExpression(msg)) => bad_request(msg),
            AnalysisError::Engine(e) => {
                tracing::error!(error = %e, "imagery engine failure");
                internal("Erro no servidor ao consultar o Earth Engine")
            }
        }
    }
}

/// Parse the JSON body, reporting malformed input as 400.
fn body<T: DeserializeOwned>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Geospatial ============

async fn handle_severity_maps(
    State(state): State<AppState>,
    payload: Result<Json<SeverityRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    Ok(Json(state.geo()?.severity_maps(&req).await?).into_response())
}

async fn handle_severity_stats(
    State(state): State<AppState>,
    payload: Result<Json<SeverityRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    Ok(Json(state.geo()?.severity_stats(&req).await?).into_response())
}

async fn handle_severity(
    State(state): State<AppState>,
    payload: Result<Json<TrajectoryRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    let trajectory = state.geo()?.severity_trajectory(&req).await?;
    Ok(Json(json!({ "data": trajectory })).into_response())
}

async fn handle_timeseries(
    State(state): State<AppState>,
    payload: Result<Json<IndexWindowRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    let points = state.geo()?.timeseries(&req).await?;
    Ok(Json(json!({ "data": points })).into_response())
}

async fn handle_composite_image(
    State(state): State<AppState>,
    payload: Result<Json<IndexWindowRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    let tile_url = state.geo()?.composite_image(&req).await?;
    Ok(Json(json!({ "tileUrl": tile_url })).into_response())
}

async fn handle_image_list(
    State(state): State<AppState>,
    payload: Result<Json<SeverityRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    Ok(Json(state.geo()?.image_list(&req).await?).into_response())
}

/// Streams the GeoTIFF; engine failures surface as 502.
async fn handle_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    let download = match state.geo()?.download(&req).await {
        Ok(download) => download,
        Err(AnalysisError::Engine(
            e @ (EngineError::Upstream { .. } | EngineError::Transport(_) | EngineError::Decode(_)),
        )) => {
            tracing::error!(error = %e, "GeoTIFF export failed");
            return Err(AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "upstream".to_string(),
                message: "Earth Engine error".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/tiff")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download.filename),
        )
        .body(Body::from_stream(download.stream))
        .map_err(|e| internal(e.to_string()))
}

async fn handle_burned_areas(
    State(state): State<AppState>,
    payload: Result<Json<BurnedAreasRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = body(payload)?;
    Ok(Json(state.geo()?.burned_areas(&req).await?))
}

async fn handle_mapper(
    State(state): State<AppState>,
    payload: Result<Json<MapperRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let req = body(payload)?;
    Ok(Json(state.geo()?.mapper(&req).await?))
}

// ============ POST /chat ============

async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let req = body(payload)?;
    match state.chat.answer(&req.messages).await {
        Ok(response) => Ok(Json(response).into_response()),
        Err(e @ ChatError::InvalidRequest) => Err(bad_request(e.to_string())),
    }
}

// ============ /rag ============

#[derive(Serialize)]
struct RagStatusResponse {
    ready: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<CorpusStats>,
    timestamp: String,
}

async fn handle_rag_status(State(state): State<AppState>) -> Json<RagStatusResponse> {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let response = match state.retriever.cache().stats().await {
        Ok(stats) => RagStatusResponse {
            ready: stats.total_chunks > 0 && stats.has_embeddings,
            message: if stats.has_embeddings {
                "Sistema RAG operacional".to_string()
            } else {
                "Documentos carregados sem embeddings".to_string()
            },
            stats: Some(stats),
            timestamp,
        },
        Err(e) => RagStatusResponse {
            ready: false,
            message: format!("Sistema RAG indisponível: {}", e),
            stats: None,
            timestamp,
        },
    };
    Json(response)
}

async fn handle_rag_init(State(state): State<AppState>) -> Result<Response, AppError> {
    let _guard = state.ingest_lock.lock().await;
    let provider = state.retriever.provider().clone();

    let (report, docs) = run_ingest(&state.config, provider.as_ref(), IngestOptions::default())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "corpus ingestion failed");
            internal(format!("Falha ao inicializar o sistema RAG: {}", e))
        })?;
    state.retriever.cache().replace(docs);

    Ok(Json(json!({
        "success": true,
        "message": "Sistema RAG inicializado",
        "report": report,
    }))
    .into_response())
}
