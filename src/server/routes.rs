/// REST API routes for content-anchor.
///
/// Handlers validate their request schema before anything is uploaded or
/// submitted, then hand off to the orchestrator. An anchor request runs in
/// its own task; if the client disconnects before it is submitted, the
/// operation is cancelled.
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, head, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{api_error, bad_request, ApiError, ErrorResponse};
use super::AppState;
use crate::anchor::{
    AnchorOutcome, AnchorRequest, CancelOutcome, ContentReference, ContentSource,
    OperationHandle, RecordId, TransactionStatus, TxHash,
};
use crate::error::AnchorError;
use crate::metadata::{
    parse_attributes, ImageUpload, MetadataDocument, MetadataFields, PublishedContent,
};

// ─── Health ──────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// HEAD /ping
async fn ping() -> StatusCode {
    StatusCode::OK
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ping", head(ping))
        .route("/health", get(health))
}

// ─── Anchoring ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintRequest {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    metadata_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvolveRequest {
    #[serde(default)]
    metadata_uri: Option<String>,
}

/// Confirmed mint or evolve.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnchorResponse {
    success: bool,
    tx_hash: String,
    token_id: String,
    metadata_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<MetadataDocument>,
}

impl From<AnchorOutcome> for AnchorResponse {
    fn from(outcome: AnchorOutcome) -> Self {
        let published = outcome.published;
        Self {
            success: true,
            tx_hash: outcome.tx_hash.to_string(),
            token_id: outcome.record_id.to_string(),
            metadata_uri: outcome.reference.to_string(),
            image_cid: published.as_ref().map(|p| p.image.cid().to_string()),
            metadata_cid: published.as_ref().map(|p| p.metadata_uri.cid().to_string()),
            metadata: published.map(|p| p.metadata),
        }
    }
}

/// Cancels the operation if the request future is dropped before it
/// settles, which is what happens when the client goes away.
struct CancelOnDrop(OperationHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.0.state().is_terminal() {
            return;
        }
        let outcome = self.0.cancel();
        if outcome != CancelOutcome::AlreadySettled {
            debug!(operation_id = %self.0.id(), ?outcome, "Client went away, cancelling operation");
        }
    }
}

async fn run_operation(state: &AppState, request: AnchorRequest) -> Result<AnchorOutcome, ApiError> {
    let handle = state.orchestrator.submit(request);
    let _cancel = CancelOnDrop(handle.clone());
    handle.wait().await.map_err(|e| api_error(&e))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_owner(raw: &str) -> Result<Address, ApiError> {
    Address::from_str(raw.trim())
        .map_err(|_| bad_request(format!("'{raw}' is not a valid address")))
}

fn parse_reference(raw: &str) -> Result<ContentReference, ApiError> {
    ContentReference::parse(raw.trim()).map_err(|e| api_error(&e))
}

fn parse_record_id(raw: &str) -> Result<RecordId, ApiError> {
    raw.parse().map_err(|e: AnchorError| api_error(&e))
}

/// POST /mint: Create a record pointing at an existing reference.
async fn mint(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MintRequest>, JsonRejection>,
) -> Result<Json<AnchorResponse>, ApiError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let (Some(to), Some(metadata_uri)) = (non_blank(req.to), non_blank(req.metadata_uri)) else {
        return Err(bad_request("to and metadataUri are required"));
    };

    let request = AnchorRequest::Create {
        owner: parse_owner(&to)?,
        content: ContentSource::Reference(parse_reference(&metadata_uri)?),
    };

    let outcome = run_operation(&state, request).await?;
    Ok(Json(outcome.into()))
}

/// POST /evolve/{tokenId}: Point an existing record at a new reference.
async fn evolve(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
    body: Result<Json<EvolveRequest>, JsonRejection>,
) -> Result<Json<AnchorResponse>, ApiError> {
    let record_id = parse_record_id(&token_id)?;
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let Some(metadata_uri) = non_blank(req.metadata_uri) else {
        return Err(bad_request("metadataUri is required"));
    };

    let request = AnchorRequest::Update {
        record_id,
        content: ContentSource::Reference(parse_reference(&metadata_uri)?),
    };

    let outcome = run_operation(&state, request).await?;
    Ok(Json(outcome.into()))
}

/// POST /mint-image: Upload an image, publish its metadata and mint it.
async fn mint_image(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<AnchorResponse>, ApiError> {
    let multipart = multipart.map_err(|e| bad_request(e.body_text()))?;
    let mut form = read_form(multipart).await?;

    let Some(to) = non_blank(form.to.take()) else {
        return Err(bad_request("to is required"));
    };
    let owner = parse_owner(&to)?;
    let upload = form.into_upload().map_err(|e| api_error(&e))?;

    let request = AnchorRequest::Create {
        owner,
        content: ContentSource::Upload(upload),
    };

    let outcome = run_operation(&state, request).await?;
    Ok(Json(outcome.into()))
}

pub fn anchor_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/mint", post(mint))
        .route("/evolve/{token_id}", post(evolve))
        .route("/mint-image", post(mint_image))
}

// ─── Content ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    image_cid: String,
    metadata_cid: String,
    metadata_uri: String,
    metadata: MetadataDocument,
}

impl From<PublishedContent> for UploadResponse {
    fn from(published: PublishedContent) -> Self {
        Self {
            success: true,
            image_cid: published.image.cid().to_string(),
            metadata_cid: published.metadata_uri.cid().to_string(),
            metadata_uri: published.metadata_uri.to_string(),
            metadata: published.metadata,
        }
    }
}

/// Multipart fields accepted by the upload endpoints.
#[derive(Default)]
struct UploadForm {
    file: Option<(String, Vec<u8>)>,
    name: Option<String>,
    description: Option<String>,
    attributes: Option<String>,
    to: Option<String>,
}

impl UploadForm {
    fn into_upload(self) -> Result<ImageUpload, AnchorError> {
        let attributes = parse_attributes(self.attributes.as_deref())?;
        let (filename, bytes) = self
            .file
            .ok_or_else(|| AnchorError::Validation("file is required".into()))?;

        let upload = ImageUpload {
            bytes,
            filename,
            fields: MetadataFields {
                name: self.name.unwrap_or_default(),
                description: self.description.unwrap_or_default(),
                attributes,
            },
        };
        upload.validate()?;
        Ok(upload)
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    (
        err.status(),
        Json(ErrorResponse {
            success: false,
            error: err.body_text(),
            tx_hash: None,
        }),
    )
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                form.file = Some((filename, bytes.to_vec()));
            }
            "name" => form.name = Some(field.text().await.map_err(multipart_error)?),
            "description" => form.description = Some(field.text().await.map_err(multipart_error)?),
            "attributes" => form.attributes = Some(field.text().await.map_err(multipart_error)?),
            "to" => form.to = Some(field.text().await.map_err(multipart_error)?),
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(form)
}

/// POST /upload-image: Upload an image and its metadata document.
async fn upload_image(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let multipart = multipart.map_err(|e| bad_request(e.body_text()))?;
    let upload = read_form(multipart)
        .await?
        .into_upload()
        .map_err(|e| api_error(&e))?;

    let published = state
        .orchestrator
        .publish(&upload)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(published.into()))
}

pub fn content_routes() -> Router<Arc<AppState>> {
    Router::new().route("/upload-image", post(upload_image))
}

// ─── Queries ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    success: bool,
    token_id: String,
    uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResponse {
    success: bool,
    tx_hash: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_id: Option<String>,
}

/// GET /token/{tokenId}: Current reference of a record.
async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<TokenResponse>, ApiError> {
    let record_id = parse_record_id(&token_id)?;
    let reference = state
        .orchestrator
        .read_reference(record_id)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(TokenResponse {
        success: true,
        token_id: record_id.to_string(),
        uri: reference.to_string(),
    }))
}

/// GET /tx/{txHash}: Re-query a submitted transaction.
async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(tx_hash): Path<String>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let tx_hash: TxHash = tx_hash.parse().map_err(|e: AnchorError| api_error(&e))?;
    let status = state
        .orchestrator
        .transaction_status(tx_hash)
        .await
        .map_err(|e| api_error(&e))?;

    let (status, block_number, token_id) = match status {
        TransactionStatus::Pending => ("pending", None, None),
        TransactionStatus::Confirmed {
            block_number,
            record_id,
        } => (
            "confirmed",
            Some(block_number),
            record_id.map(|id| id.to_string()),
        ),
        TransactionStatus::Reverted { block_number } => ("reverted", Some(block_number), None),
    };

    Ok(Json(TransactionResponse {
        success: true,
        tx_hash: tx_hash.to_string(),
        status,
        block_number,
        token_id,
    }))
}

pub fn query_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/token/{token_id}", get(get_token))
        .route("/tx/{tx_hash}", get(get_transaction))
}
