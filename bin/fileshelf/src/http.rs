//! HTTP adapter: slug downloads and criteria listings

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use fileshelf_common::{Error, FileRecord, FileRef};
use fileshelf_files::{Criteria, FileService};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

type AppState = Arc<FileService>;

/// Maps a fileshelf error onto an HTTP status with a JSON body
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "status": status.as_u16(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    /// Criteria as a JSON document
    q: Option<String>,
}

/// Build the router; `prefix` must start with `/`
pub fn router(files: AppState, prefix: &str) -> Router {
    let prefix = prefix.trim_end_matches('/');
    Router::new()
        .route("/health", get(health_check))
        .route("/files", get(list_files))
        .route(&format!("{prefix}/{{*slug}}"), get(download))
        .layer(TraceLayer::new_for_http())
        .with_state(files)
}

async fn health_check(State(files): State<AppState>) -> Response {
    let readiness = files.coordinator().readiness();
    let body = serde_json::json!({
        "status": "healthy",
        "mode": files.coordinator().mode().to_string(),
        "readiness": format!("{readiness:?}"),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn download(
    State(files): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    debug!(%slug, "download");
    let record = files.get(FileRef::Slug(slug), true).await?;
    let disposition = format!("attachment; filename=\"{}\"", header_filename(&record.slug));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        record.data.unwrap_or_default(),
    )
        .into_response())
}

/// Quote-safe filename for `Content-Disposition`
fn header_filename(slug: &str) -> String {
    slug.chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect()
}

async fn list_files(
    State(files): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FileRecord>>, ApiError> {
    let criteria = match params.q.as_deref() {
        Some(json) => serde_json::from_str::<Criteria>(json)
            .map_err(|e| Error::invalid_input(format!("invalid criteria: {e}")))?,
        None => Criteria::all(),
    };
    Ok(Json(files.list(&criteria).await?))
}
