//! HTTP handlers for the `/image` resource — the submission + status +
//! download surface described in the external interfaces section.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::services::coordinator::MAX_SOURCE_SIZE;
use crate::store::meta::{Metadata, Status};
use crate::AppState;

/// `POST /image` — admits a new upload and fires its job asynchronously.
///
/// The request body is the raw image bytes; `Content-Type` must be
/// `image/jpeg` or `image/png` and `Content-Length` must not exceed 8 MiB.
/// Responds `201 Created` with `Location: /image/<id>/source` as soon as
/// admission completes — the transform itself runs in the background.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<Response> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    if content_length > MAX_SOURCE_SIZE {
        // Reject before the body is read — P8 requires no disk writes for
        // an oversize upload.
        return Err(AppError::BadRequest(
            "upload is larger than 8MB".to_string(),
        ));
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let source_name = headers
        .get("X-Guetzli-Img-Name")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    // Cap the actual read one byte past the limit so a client that lies
    // about Content-Length (or omits it) cannot exceed it either.
    let data: Bytes = axum::body::to_bytes(body, (MAX_SOURCE_SIZE + 1) as usize)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;

    if data.len() as u64 > MAX_SOURCE_SIZE {
        return Err(AppError::BadRequest(
            "upload is larger than 8MB".to_string(),
        ));
    }

    let declared_size = data.len() as u64;
    let content_id = state
        .coordinator
        .submit(data.to_vec(), declared_size, &mime_type, source_name)
        .await?;

    let location = format!("/image/{content_id}/source");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        (),
    )
        .into_response())
}

/// `GET /image` — lists every known content id.
pub async fn list(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let ids = state.coordinator.store().list_content_ids().await?;
    Ok(Json(json!({ "ids": ids })))
}

/// `GET /image/{id}/meta` — the entry's current status and measurements.
pub async fn meta(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let record = state.coordinator.get_meta(&id).await?;
    Ok(Json(meta_to_json(&record)))
}

fn meta_to_json(record: &Metadata) -> serde_json::Value {
    let mut source = serde_json::Map::new();
    source.insert("mime".to_string(), json!(record.source_type.mime()));
    if let Some(name) = record.source_name.as_deref().filter(|n| !n.is_empty()) {
        source.insert("name".to_string(), json!(name));
    }
    if record.source_quality > 0 {
        source.insert("qualitylevel".to_string(), json!(record.source_quality));
    }
    if record.source_size > 0 {
        source.insert("size".to_string(), json!(record.source_size));
    }

    let mut body = json!({
        "contentId": record.content_id,
        "status": record.status.to_string(),
        "source": source,
    });

    if record.status == Status::Transformed {
        if let (Some(q), Some(s)) = (record.target_quality, record.target_size) {
            body["target"] = json!({ "qualitylevel": q, "size": s });
        }
    }

    body
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub download: Option<String>,
}

fn wants_download(params: &DownloadParams) -> bool {
    matches!(
        params.download.as_deref().map(|s| s.to_ascii_lowercase()).as_deref(),
        Some("yes") | Some("true") | Some("y") | Some("t")
    )
}

/// `GET /image/{id}/source` — the originally uploaded bytes.
pub async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> AppResult<Response> {
    let record = state.coordinator.get_meta(&id).await?;
    let bytes = state.coordinator.get_source(&id).await?;

    let mut response = (
        [(header::CONTENT_TYPE, record.source_type.mime().to_string())],
        bytes,
    )
        .into_response();

    if wants_download(&params) {
        let filename = record.source_name.clone().unwrap_or_default();
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\"").parse().unwrap(),
        );
    }

    Ok(response)
}

/// `GET /image/{id}/target` — the recompressed output. `404` until the
/// entry reaches `transformed` (P9).
pub async fn get_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> AppResult<Response> {
    let bytes = state.coordinator.get_target(&id).await?;

    let mut response = ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response();

    if wants_download(&params) {
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"target.jpg\"".parse().unwrap(),
        );
    }

    Ok(response)
}
