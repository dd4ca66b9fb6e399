/// Token metadata documents.
///
/// A metadata document is the JSON object a token URI resolves to. It
/// ties together:
/// - a display name and description
/// - the content reference of the uploaded image
/// - an attribute set (JSON array of traits, or an object)
///
/// The serialized form is what the content store assigns an identifier to,
/// and that identifier's URI is what gets anchored on the ledger.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::anchor::ContentReference;
use crate::error::{AnchorError, Result};

/// ERC-721 style metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub name: String,
    pub description: String,
    /// Reference to the uploaded image (e.g., `ipfs://<cid>`).
    pub image: String,
    /// Array of trait objects, or a free-form object.
    pub attributes: Value,
}

/// Descriptive fields supplied alongside an image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataFields {
    pub name: String,
    pub description: String,
    pub attributes: Value,
}

/// Image bytes plus the fields that describe them.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub fields: MetadataFields,
}

/// Content that has been uploaded and is ready to anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedContent {
    pub image: ContentReference,
    pub metadata_uri: ContentReference,
    pub metadata: MetadataDocument,
}

impl MetadataDocument {
    /// Build the document for an uploaded image.
    pub fn assemble(image: &ContentReference, fields: &MetadataFields) -> Self {
        Self {
            name: fields.name.clone(),
            description: fields.description.clone(),
            image: image.to_string(),
            attributes: fields.attributes.clone(),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| AnchorError::Internal(format!("Metadata serialization failed: {e}")))
    }
}

/// Parse the `attributes` form field.
///
/// Clients send attributes as a JSON-encoded string. Missing or blank input
/// yields an empty array; anything other than an array or object is
/// rejected before any upload starts.
pub fn parse_attributes(raw: Option<&str>) -> Result<Value> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(Value::Array(vec![])),
        Some(raw) => raw,
    };

    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AnchorError::Validation(format!("attributes must be valid JSON: {e}")))?;

    match value {
        Value::Array(_) | Value::Object(_) => Ok(value),
        _ => Err(AnchorError::Validation(
            "attributes must be a JSON array or object".into(),
        )),
    }
}

impl ImageUpload {
    /// Reject uploads that cannot produce a usable document.
    pub fn validate(&self) -> Result<()> {
        if self.bytes.is_empty() {
            return Err(AnchorError::Validation("file is required".into()));
        }
        if self.filename.trim().is_empty() {
            return Err(AnchorError::Validation("file name is required".into()));
        }
        Ok(())
    }
}
