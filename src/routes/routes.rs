//! Defines routes for the transfer relay API.
//!
//! ## Structure
//! - **Transfers**
//!   - `POST   /api/upload`: multipart upload (`file`, `expiration_hours`, `max_downloads`)
//!   - `GET    /api/download/{transfer_id}`: stream the file, counting the download
//!   - `GET    /api/transfers/{transfer_id}`: transfer metadata
//!   - `DELETE /api/transfers/{transfer_id}`: purge a transfer
//!
//! - **Listings**
//!   - `GET    /api/recent`: newest committed uploads
//!   - `GET    /api/expiring`: uploads expiring soon
//!
//! - **Probes**: `/health`, `/healthz`, `/readyz`

use crate::{
    handlers::{
        health_handlers::{health, healthz, readyz},
        transfer_handlers::{
            delete_transfer, download_file, expiring_uploads, get_transfer, recent_uploads,
            upload_file,
        },
    },
    services::relay::RelayService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Headroom on top of the file size limit for multipart framing and the
/// text fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router for every relay endpoint.
///
/// The request body limit is only a coarse guard; the exact file size
/// limit is enforced while streaming into the object store.
pub fn routes(max_file_size: u64) -> Router<RelayService> {
    let body_limit = usize::try_from(max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/upload",
            post(upload_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/download/{transfer_id}", get(download_file))
        .route(
            "/api/transfers/{transfer_id}",
            get(get_transfer).delete(delete_transfer),
        )
        .route("/api/recent", get(recent_uploads))
        .route("/api/expiring", get(expiring_uploads))
}
