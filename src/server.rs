use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use burn::backend::NdArray;
use clap::Parser;
use serde_json::json;
use thiserror::Error;
use tower_http::{
    cors::CorsLayer,
    services::ServeDir,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing_core::{Level, LevelFilter};
use tracing_subscriber::{prelude::*, registry};

use crate::inference::{InferenceError, LoadError, Prediction, Predictor};

/// Backend used to run inference in the service.
pub type ServeBackend = NdArray<f32>;

const INDEX_TEMPLATE: &str = "index.html";
const UPLOAD_FIELD: &str = "file";

pub const DEFAULT_ADDRESS: &str = "0.0.0.0:8000";
pub const DEFAULT_ARTIFACT: &str = "artifacts/model.mpk";
pub const DEFAULT_TEMPLATES: &str = "templates";
pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Serve handwritten digit predictions over HTTP")]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: SocketAddr,
    /// Model artifact written by the `train` binary.
    #[arg(long, default_value = DEFAULT_ARTIFACT)]
    pub artifact: PathBuf,
    /// Directory holding `index.html`.
    #[arg(long, default_value = DEFAULT_TEMPLATES)]
    pub templates: PathBuf,
    /// Directory served under `/static`.
    #[arg(long, default_value = DEFAULT_STATIC_DIR)]
    pub static_dir: PathBuf,
    /// Largest accepted request body, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    /// The configuration `serve` runs with when no flag is given.
    fn default() -> Self {
        Self::parse_from(["serve"])
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error("server stopped unexpectedly: {0}")]
    Serve(#[source] std::io::Error),
}

/// Errors returned to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Error processing image: {0}")]
    Image(String),
    #[error("upload exceeds {0} bytes")]
    TooLarge(usize),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Image(_) => (StatusCode::BAD_REQUEST, json!({ "detail": self.to_string() })),
            ApiError::TooLarge(_) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "detail": self.to_string() }),
            ),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": self.to_string() })),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": self.to_string() }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        ApiError::Image(err.to_string())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::Image(rejection.body_text())
    }
}

#[derive(Clone)]
struct AppState {
    predictor: Arc<Predictor<ServeBackend>>,
    templates: Arc<PathBuf>,
    max_upload_bytes: usize,
}

/// Builds the service routes around an already loaded predictor.
pub fn router(config: &ServerConfig, predictor: Predictor<ServeBackend>) -> Router {
    let state = AppState {
        predictor: Arc::new(predictor),
        templates: Arc::new(config.templates.clone()),
        max_upload_bytes: config.max_upload_bytes,
    };

    Router::new()
        .route("/", get(home))
        .route("/predict/", post(predict))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Loads the model artifact, then serves until Ctrl-C.
///
/// A missing or unreadable artifact is reported before the listener is bound.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let predictor = Predictor::<ServeBackend>::load(&config.artifact, Default::default())?;
    let app = router(&config, predictor);

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .map_err(|source| ServerError::Bind {
            address: config.address,
            source,
        })?;
    log::info!("Serving digit predictions on http://{}", config.address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)
}

/// Installs the console logger used by the service.
pub fn install_logger() {
    let layer = tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO);

    if registry().with(layer).try_init().is_err() {
        log::warn!("A global logger is already installed");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("Unable to listen for the shutdown signal: {err}");
        std::future::pending::<()>().await;
    }

    log::info!("Shutting down");
}

async fn home(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let index = state.templates.join(INDEX_TEMPLATE);

    match tokio::fs::read_to_string(&index).await {
        Ok(page) => Ok(Html(page)),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(ApiError::NotFound(format!(
            "{INDEX_TEMPLATE} not found in {}",
            index.display()
        ))),
        Err(err) => Err(ApiError::Internal(format!(
            "failed to read {}: {err}",
            index.display()
        ))),
    }
}

async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let bytes = read_upload(multipart?)
        .await
        .map_err(|err| upload_error(err, state.max_upload_bytes))?
        .ok_or_else(|| ApiError::Image(format!("missing `{UPLOAD_FIELD}` upload")))?;
    let predictor = state.predictor.clone();

    // The forward pass is CPU bound.
    let prediction = tokio::task::spawn_blocking(move || predictor.predict(&bytes))
        .await
        .map_err(|err| ApiError::Internal(format!("inference task failed: {err}")))??;
    log::debug!("Predicted digit {}", prediction.predicted_digit);

    Ok(Json(prediction))
}

/// Returns the content of the `file` field, or of the first uploaded file when no field has
/// that name.
async fn read_upload(mut multipart: Multipart) -> Result<Option<Bytes>, MultipartError> {
    let mut fallback = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(UPLOAD_FIELD) {
            return field.bytes().await.map(Some);
        }
        if fallback.is_none() && field.file_name().is_some() {
            fallback = Some(field.bytes().await?);
        }
    }

    Ok(fallback)
}

fn upload_error(err: MultipartError, max_upload_bytes: usize) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::TooLarge(max_upload_bytes)
    } else {
        ApiError::Image(err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_documented_defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.address, DEFAULT_ADDRESS.parse::<SocketAddr>().unwrap());
        assert_eq!(config.artifact, PathBuf::from(DEFAULT_ARTIFACT));
        assert_eq!(config.templates, PathBuf::from(DEFAULT_TEMPLATES));
        assert_eq!(config.static_dir, PathBuf::from(DEFAULT_STATIC_DIR));
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn cli_overrides_paths() {
        let config = ServerConfig::parse_from([
            "serve",
            "--artifact",
            "/tmp/model.mpk",
            "--address",
            "127.0.0.1:9000",
        ]);

        assert_eq!(config.artifact, PathBuf::from("/tmp/model.mpk"));
        assert_eq!(config.address.port(), 9000);
    }

    #[test]
    fn image_errors_map_to_bad_request() {
        let response = ApiError::Image("bad bytes".into()).into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_upload_maps_to_payload_too_large() {
        let err = ApiError::TooLarge(1024);

        assert_eq!(err.to_string(), "upload exceeds 1024 bytes");
        assert_eq!(err.into_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn startup_errors_read_as_messages() {
        let err = ServerError::from(LoadError::ArtifactMissing(PathBuf::from("a/model.mpk")));

        assert_eq!(
            err.to_string(),
            "Model file 'a/model.mpk' not found. Ensure it's in the correct directory."
        );
    }

    #[test]
    fn missing_page_maps_to_not_found() {
        let response = ApiError::NotFound("index.html not found".into()).into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_fails_before_binding_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            artifact: dir.path().join("model.mpk"),
            // Binding this would fail too: the artifact check must come first.
            address: SocketAddr::from(([255, 255, 255, 255], 1)),
            ..Default::default()
        };

        let result = run(config).await;

        assert!(matches!(
            result,
            Err(ServerError::Load(LoadError::ArtifactMissing(_)))
        ));
    }
}
