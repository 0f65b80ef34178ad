//! HTTP surface: upload images, get detections and a rendered preview back.
//!
//! | Route | Body |
//! |-------|------|
//! | `POST /analyze` | multipart, one or more `files` parts → [`AnalyzeResponse`] |
//! | `GET /health` | [`HealthResponse`] |
//! | `GET /temp/{filename}` | a rendered artifact, or 404 |
//!
//! Handlers get the [`ServiceContext`] through axum `State`; the model is
//! loaded once before the listener binds.

use crate::context::ServiceContext;
use crate::document::analyze_files;
use crate::output::{AnalyzeResponse, HealthResponse};
use crate::pipeline::artifact::{locate_artifact, ArtifactFormat};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ServiceContext>,
}

impl ApiState {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }
}

/// Build the router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/analyze", post(analyze))
        .route("/health", get(health))
        .route("/temp/{filename}", get(temp_artifact))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state)).await
}

async fn analyze(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed multipart body: {e}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read '{filename}': {e}")))?;
        files.push((filename, bytes.to_vec()));
    }

    if files.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No files uploaded".to_string()));
    }
    debug!("Analyzing {} uploaded file(s)", files.len());

    let results = analyze_files(&state.ctx, files).await;
    Ok(Json(AnalyzeResponse { results }))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        model_loaded: true,
        device: state.ctx.model().device().to_string(),
    })
}

async fn temp_artifact(
    State(state): State<ApiState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let not_found = || (StatusCode::NOT_FOUND, format!("Artifact not found: {filename}"));
    let path = locate_artifact(&state.ctx.config().output_dir, &filename).ok_or_else(not_found)?;
    let bytes = tokio::fs::read(&path).await.map_err(|_| not_found())?;

    let content_type = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ArtifactFormat::from_extension)
        .map_or("application/octet-stream", |f| f.content_type());
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::{DetectionModel, ModelError, PredictOptions, RawPrediction};
    use crate::pipeline::batch::Device;
    use image::RgbImage;

    struct Idle;

    impl DetectionModel for Idle {
        fn predict(
            &self,
            batch: &[&RgbImage],
            _opts: &PredictOptions,
        ) -> Result<Vec<RawPrediction>, ModelError> {
            Ok(vec![RawPrediction::Empty; batch.len()])
        }

        fn device(&self) -> Device {
            Device::Cuda
        }
    }

    async fn spawn_server(output_dir: &std::path::Path) -> String {
        let config = PipelineConfig::builder()
            .output_dir(output_dir)
            .build()
            .unwrap();
        let state = ApiState::new(Arc::new(ServiceContext::new(Arc::new(Idle), config)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_reports_device() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_server(dir.path()).await;
        let text = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let body: HealthResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(body.status, "healthy");
        assert!(body.model_loaded);
        assert_eq!(body.device, "cuda");
    }

    #[tokio::test]
    async fn temp_serves_artifacts_and_404s_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scan")).unwrap();
        std::fs::write(dir.path().join("scan").join("scan-1.png"), b"png-bytes").unwrap();
        let base = spawn_server(dir.path()).await;

        let ok = reqwest::get(format!("{base}/temp/scan-1.png")).await.unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
        assert_eq!(ok.headers()["content-type"], "image/png");
        assert_eq!(ok.bytes().await.unwrap().as_ref(), b"png-bytes");

        let missing = reqwest::get(format!("{base}/temp/scan-2.png")).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let sneaky = reqwest::get(format!("{base}/temp/..%2Fsecret-1.png")).await.unwrap();
        assert_eq!(sneaky.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
