//! HTTP surface: health, encoding status and encode requests
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::PipelineError;
use crate::pipeline::{EncodeSubmission, MediaStatus, Pipeline};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use cinecore_types::{MediaId, ProfileId};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Body of `POST /media/{id}/encode`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncodeRequest {
    /// Empty means every active profile
    #[serde(default)]
    pub profiles: Vec<ProfileId>,
    #[serde(default)]
    pub force: bool,
}

/// Error body returned by the API
#[derive(Debug)]
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::MediaNotFound(_) | PipelineError::ProfileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::Config(_) | PipelineError::Types(_) => StatusCode::BAD_REQUEST,
            PipelineError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// HTTP server of the worker binary
pub struct ApiServer {
    port: u16,
    pipeline: Pipeline,
}

impl ApiServer {
    pub fn new(port: u16, pipeline: Pipeline) -> Self {
        Self { port, pipeline }
    }

    pub fn router(pipeline: Pipeline) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/health", get(health_check))
            .route("/media/:id/encodings", get(media_encodings))
            .route("/media/:id/encode", post(encode_media))
            .with_state(pipeline)
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn start(self) -> anyhow::Result<()> {
        let app = Self::router(self.pipeline);

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP server to {}: {}", addr, e))?;

        info!(port = self.port, "HTTP server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn health_check(State(pipeline): State<Pipeline>) -> (StatusCode, Json<serde_json::Value>) {
    let queue_connected = pipeline.queue().is_connected().await;
    let status = if queue_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if queue_connected { "ok" } else { "degraded" },
        "service": "media-processor",
        "worker": pipeline.worker_name(),
        "queue": pipeline.queue().client_type(),
        "queue_connected": queue_connected,
        "running_processes": pipeline.processes().len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (status, Json(body))
}

/// `GET /media/{id}/encodings`
pub async fn media_encodings(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
) -> Result<Json<MediaStatus>, ApiError> {
    let status = pipeline.media_status(&MediaId::new(id)).await?;
    Ok(Json(status))
}

/// `POST /media/{id}/encode`
pub async fn encode_media(
    State(pipeline): State<Pipeline>,
    Path(id): Path<String>,
    Json(request): Json<EncodeRequest>,
) -> Result<(StatusCode, Json<EncodeSubmission>), ApiError> {
    let media_id = MediaId::new(id);
    info!(media_id = %media_id, profiles = ?request.profiles, force = request.force, "Encode requested");
    let submission = pipeline
        .encode(&media_id, &request.profiles, request.force)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal (Ctrl+C) received");
        },
        _ = terminate => {
            info!("Shutdown signal (SIGTERM) received");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobStore, MemoryJobStore};
    use cinecore_config::PipelineConfig;
    use cinecore_types::{MediaType, SourceMedia};
    use std::sync::Arc;
    use task_queue_client::MemoryTaskQueue;

    fn pipeline(store: Arc<MemoryJobStore>) -> Pipeline {
        Pipeline::new(
            PipelineConfig::default(),
            store,
            Arc::new(MemoryTaskQueue::new()),
        )
    }

    #[tokio::test]
    async fn test_unknown_media_is_not_found() {
        let p = pipeline(Arc::new(MemoryJobStore::new()));
        let err = media_encodings(State(p), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_encode_request_for_non_video_queues_nothing() {
        let store = Arc::new(MemoryJobStore::new());
        let mut media = SourceMedia::new(MediaId::from("a1"), "/media/a1/song.mp3");
        media.media_type = MediaType::Audio;
        store.save_media(&media).await.unwrap();

        let p = pipeline(store);
        let (status, Json(submission)) = encode_media(
            State(p),
            Path("a1".to_string()),
            Json(EncodeRequest::default()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(submission.queued.is_empty());
        assert!(submission.chunk_task.is_none());
    }

    #[test]
    fn test_encode_request_defaults() {
        let request: EncodeRequest = serde_json::from_str("{}").unwrap();
        assert!(request.profiles.is_empty());
        assert!(!request.force);
        let request: EncodeRequest =
            serde_json::from_str(r#"{"profiles": [1, 2], "force": true}"#).unwrap();
        assert_eq!(request.profiles, vec![1, 2]);
        assert!(request.force);
    }
}
