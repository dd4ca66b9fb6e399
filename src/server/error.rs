/// Mapping from anchor failures to HTTP responses.
///
/// Every failure body has the same shape:
/// `{"success": false, "error": "...", "txHash": "0x..."}`, where `txHash`
/// is present only when the ledger already holds a transaction the caller
/// can re-query.
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::{AnchorError, LedgerError, UploadError};

/// Error response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Rejection type shared by all handlers.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// HTTP status for an anchor failure.
pub fn status_for(err: &AnchorError) -> StatusCode {
    match err {
        AnchorError::Validation(_) | AnchorError::Upload(UploadError::Permanent(_)) => {
            StatusCode::BAD_REQUEST
        }
        AnchorError::NotFound(_) | AnchorError::Ledger(LedgerError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        AnchorError::Upload(UploadError::Transient(_))
        | AnchorError::Ledger(LedgerError::Transient(_)) => StatusCode::BAD_GATEWAY,
        AnchorError::Ledger(LedgerError::Timeout { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        AnchorError::Cancelled => StatusCode::CONFLICT,
        AnchorError::Ledger(LedgerError::Reverted { .. })
        | AnchorError::Parse { .. }
        | AnchorError::HashMismatch { .. }
        | AnchorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(err: &AnchorError) -> ApiError {
    let status = status_for(err);
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        error!(error = %err, "Request failed");
    }

    (
        status,
        Json(ErrorResponse {
            success: false,
            error: err.to_string(),
            tx_hash: err.tx_hash().map(ToString::to_string),
        }),
    )
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            success: false,
            error: message.into(),
            tx_hash: None,
        }),
    )
}
