//! HTTP handlers for uploads, downloads and transfer listings.
//! Upload and download bodies are streamed, never buffered whole, and all
//! lifecycle decisions are delegated to `RelayService`.

use crate::{
    errors::AppError,
    models::{page::Page, transfer::TransferRecord},
    services::{
        error::ValidationError,
        relay::{RelayService, StagedFile, UploadReceipt},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::{fmt::Write as _, io};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_EXPIRATION_HOURS: i64 = 24;

/// Set on downloads of capped transfers, counting this one as used.
pub const DOWNLOADS_REMAINING: HeaderName = HeaderName::from_static("x-downloads-remaining");

/// Upload settings; accepted as query params or as multipart text fields.
/// Form fields win over query params.
#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub expiration_hours: Option<i64>,
    pub max_downloads: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExpiringQuery {
    pub limit: Option<usize>,
    pub within_hours: Option<i64>,
    pub cursor: Option<String>,
}

/// `POST /api/upload` (multipart: `file`, `expiration_hours`, `max_downloads`).
///
/// Fields may come in any order. The file part is spooled to a temp file
/// until the whole form has been read, so the settings that follow it still
/// apply.
pub async fn upload_file(
    State(relay): State<RelayService>,
    Query(mut params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, AppError> {
    let mut staged: Option<StagedFile> = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if staged.is_some() {
                    return Err(ValidationError::InvalidField {
                        field: "file",
                        reason: "sent more than once".into(),
                    }
                    .into());
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                let body = field.map(|chunk| chunk.map_err(io::Error::other)).boxed();
                staged = Some(
                    relay
                        .stage_upload(&file_name, content_type.as_deref(), body)
                        .await?,
                );
            }
            "expiration_hours" => {
                if let Some(hours) = parse_field("expiration_hours", &field.text().await?)? {
                    params.expiration_hours = Some(hours);
                }
            }
            "max_downloads" => {
                if let Some(max) = parse_field("max_downloads", &field.text().await?)? {
                    params.max_downloads = Some(max);
                }
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let staged = staged.ok_or(ValidationError::MissingField("file"))?;
    let receipt = relay
        .upload_staged(
            staged,
            params.expiration_hours.unwrap_or(DEFAULT_EXPIRATION_HOURS),
            params.max_downloads,
        )
        .await?;
    Ok(Json(receipt))
}

/// `GET /api/download/{transfer_id}`: counts the download, then streams.
pub async fn download_file(
    State(relay): State<RelayService>,
    Path(transfer_id): Path<String>,
) -> Result<Response, AppError> {
    let transfer_id = parse_transfer_id(&transfer_id)?;
    let (record, stream) = relay.download(transfer_id).await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &record);
    Ok(response)
}

/// `GET /api/transfers/{transfer_id}`
pub async fn get_transfer(
    State(relay): State<RelayService>,
    Path(transfer_id): Path<String>,
) -> Result<Json<TransferRecord>, AppError> {
    let transfer_id = parse_transfer_id(&transfer_id)?;
    Ok(Json(relay.get(transfer_id).await?))
}

/// `DELETE /api/transfers/{transfer_id}`: idempotent.
pub async fn delete_transfer(
    State(relay): State<RelayService>,
    Path(transfer_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let transfer_id = parse_transfer_id(&transfer_id)?;
    relay.purge(transfer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/recent?limit=&cursor=`
pub async fn recent_uploads(
    State(relay): State<RelayService>,
    Query(q): Query<RecentQuery>,
) -> Result<Json<Page<TransferRecord>>, AppError> {
    let page = relay.recent(q.limit, q.cursor.as_deref()).await?;
    Ok(Json(page))
}

/// `GET /api/expiring?limit=&within_hours=&cursor=`
pub async fn expiring_uploads(
    State(relay): State<RelayService>,
    Query(q): Query<ExpiringQuery>,
) -> Result<Json<Page<TransferRecord>>, AppError> {
    let page = relay
        .expiring_soon(q.limit, q.within_hours, q.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

/// Parse an optional numeric form field; blank means unset.
fn parse_field(field: &'static str, raw: &str) -> Result<Option<i64>, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<i64>()
        .map(Some)
        .map_err(|err| ValidationError::InvalidField {
            field,
            reason: err.to_string(),
        })
}

/// Malformed ids cannot name a transfer, so they are reported as not found.
fn parse_transfer_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::new(StatusCode::NOT_FOUND, format!("transfer `{raw}` not found")))
}

fn set_download_headers(headers: &mut HeaderMap, record: &TransferRecord) {
    let content_type = record
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&record.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&content_disposition(&record.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    if let Some(remaining) = record.downloads_remaining() {
        headers.insert(DOWNLOADS_REMAINING, HeaderValue::from(remaining));
    }
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// percent-encoded in `filename*`.
fn content_disposition(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let fallback: String = base
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let fallback = if fallback.trim().is_empty() {
        "download".to_string()
    } else {
        fallback
    };

    let mut encoded = String::with_capacity(base.len());
    for byte in base.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
