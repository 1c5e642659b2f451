//! Batch document uploads into per-type buckets.
//!
//! Every document in a batch is decoded, size-checked and stored on its own;
//! one failure never prevents the others. The caller always gets the full
//! per-document result map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::clients::storage::{BlobStore, PutObject};
use crate::models::{
    AuditAction, BusinessType, EncodedDocument, NewAuditLogEntry, StoredDocument,
};
use crate::store::{bounded, RequestStore};

const DEFAULT_EXTENSION: &str = "jpg";
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";
const CACHE_CONTROL: &str = "3600";
const SUFFIX_LEN: usize = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("invalid document type '{0}'")]
    InvalidDocumentType(String),

    #[error("could not decode document: {0}")]
    Decode(String),

    #[error("document is empty")]
    Empty,

    #[error("document exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// Detail is logged, not returned.
    #[error("upload to storage failed")]
    Storage(String),
}

/// Raw document bytes as received on either wire convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryPayload {
    Bytes(Vec<u8>),
    /// Base64 text, optionally wrapped in a `data:` URL.
    Base64(String),
}

impl BinaryPayload {
    /// Upper bound on the decoded size, without decoding.
    fn decoded_len_hint(&self) -> usize {
        match self {
            BinaryPayload::Bytes(bytes) => bytes.len(),
            BinaryPayload::Base64(text) => strip_data_url(text).1.len() / 4 * 3,
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, UploadError> {
        match self {
            BinaryPayload::Bytes(bytes) => Ok(bytes),
            BinaryPayload::Base64(text) => {
                let (_, encoded) = strip_data_url(&text);
                let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
                base64::engine::general_purpose::STANDARD
                    .decode(compact.as_bytes())
                    .map_err(|e| UploadError::Decode(e.to_string()))
            }
        }
    }
}

/// Splits `data:<mime>;base64,<payload>` into its mime type and payload.
fn strip_data_url(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim();
    match trimmed.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((meta, payload)) => {
            let mime = meta.split(';').next().filter(|m| !m.is_empty());
            (mime, payload)
        }
        None => (None, trimmed),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPayload {
    pub payload: BinaryPayload,
    pub extension: Option<String>,
    pub mime_type: Option<String>,
}

impl From<EncodedDocument> for DocumentPayload {
    fn from(doc: EncodedDocument) -> Self {
        let mime_type = doc
            .mime_type
            .or_else(|| strip_data_url(&doc.data).0.map(str::to_string));
        Self {
            payload: BinaryPayload::Base64(doc.data),
            extension: doc.extension,
            mime_type,
        }
    }
}

/// Destination bucket and key folder for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    Business(BusinessType),
    ProductImages,
}

impl UploadTarget {
    pub fn bucket(self) -> &'static str {
        match self {
            UploadTarget::Business(BusinessType::Restaurant) => "restaurant-documents",
            UploadTarget::Business(BusinessType::Supermarket) => "supermarket-documents",
            UploadTarget::Business(BusinessType::Pharmacy) => "pharmacy-documents",
            UploadTarget::Business(BusinessType::Clinic) => "clinic-documents",
            UploadTarget::Business(BusinessType::Courier) => "courier-documents",
            UploadTarget::Business(BusinessType::Driver) => "driver-documents",
            UploadTarget::ProductImages => "product-images",
        }
    }

    pub fn bucket_key(self) -> &'static str {
        match self {
            UploadTarget::Business(kind) => kind.as_str(),
            UploadTarget::ProductImages => "products",
        }
    }
}

/// Outcome for one document: `{success, fileName, url}` or `{success: false, error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentResult {
    fn stored(doc: &StoredDocument) -> Self {
        Self {
            success: true,
            file_name: Some(doc.path.clone()),
            url: Some(doc.url.clone()),
            error: None,
        }
    }

    fn failed(err: &UploadError) -> Self {
        Self {
            success: false,
            file_name: None,
            url: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub results: BTreeMap<String, DocumentResult>,
    /// Descriptors of the documents that were stored.
    pub stored: BTreeMap<String, StoredDocument>,
}

impl UploadReport {
    pub fn failed_count(&self) -> usize {
        self.results.values().filter(|r| !r.success).count()
    }
}

#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<dyn RequestStore>,
    blobs: Arc<dyn BlobStore>,
    call_timeout: Duration,
    max_document_bytes: usize,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn RequestStore>,
        blobs: Arc<dyn BlobStore>,
        call_timeout: Duration,
        max_document_bytes: usize,
    ) -> Self {
        Self {
            store,
            blobs,
            call_timeout,
            max_document_bytes,
        }
    }

    /// Uploads every document of the batch independently.
    ///
    /// With `attach`, stored descriptors are merged into that request's
    /// `documents` map after the batch. Attachment and the audit entry are
    /// best-effort.
    pub async fn upload_batch(
        &self,
        user_id: Uuid,
        target: UploadTarget,
        documents: BTreeMap<String, DocumentPayload>,
        attach: Option<(BusinessType, Uuid)>,
    ) -> UploadReport {
        let uploads = documents.into_iter().map(|(doc_type, doc)| async move {
            let outcome = self.upload_one(user_id, target, &doc_type, doc).await;
            (doc_type, outcome)
        });
        let outcomes = futures_util::future::join_all(uploads).await;

        let mut report = UploadReport::default();
        for (doc_type, outcome) in outcomes {
            match outcome {
                Ok(stored) => {
                    report.results.insert(doc_type.clone(), DocumentResult::stored(&stored));
                    report.stored.insert(doc_type, stored);
                }
                Err(err) => {
                    if let UploadError::Storage(detail) = &err {
                        log::warn!("Upload of '{doc_type}' for {user_id} failed: {detail}");
                    }
                    report.results.insert(doc_type, DocumentResult::failed(&err));
                }
            }
        }

        log::info!(
            "Uploaded {}/{} documents to {} for {}",
            report.stored.len(),
            report.results.len(),
            target.bucket(),
            user_id
        );

        if let Some((kind, request_id)) = attach {
            if !report.stored.is_empty() {
                if let Err(err) = bounded(
                    self.call_timeout,
                    "attach documents",
                    self.store.attach_documents(kind, request_id, &report.stored),
                )
                .await
                {
                    log::warn!("Could not attach documents to request {request_id}: {err}");
                }
            }
        }

        self.record_audit(user_id, target, attach, &report)
            .await;
        report
    }

    async fn upload_one(
        &self,
        user_id: Uuid,
        target: UploadTarget,
        doc_type: &str,
        doc: DocumentPayload,
    ) -> Result<StoredDocument, UploadError> {
        if !is_safe_doc_type(doc_type) {
            return Err(UploadError::InvalidDocumentType(doc_type.to_string()));
        }
        if doc.payload.decoded_len_hint() > self.max_document_bytes + 2 {
            return Err(UploadError::TooLarge {
                limit: self.max_document_bytes,
            });
        }

        let bytes = doc.payload.into_bytes()?;
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if bytes.len() > self.max_document_bytes {
            return Err(UploadError::TooLarge {
                limit: self.max_document_bytes,
            });
        }

        let path = object_key(user_id, target, doc_type, doc.extension.as_deref());
        let content_type = doc
            .mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let bucket = target.bucket();

        bounded(
            self.call_timeout,
            "storage upload",
            self.blobs.put_object(PutObject {
                bucket,
                path: &path,
                bytes,
                content_type: &content_type,
                cache_control: CACHE_CONTROL,
            }),
        )
        .await
        .map_err(|e| UploadError::Storage(e.to_string()))?;

        Ok(StoredDocument {
            bucket: bucket.to_string(),
            url: self.blobs.public_url(bucket, &path),
            path,
            content_type,
            uploaded_at: Utc::now(),
        })
    }

    async fn record_audit(
        &self,
        user_id: Uuid,
        target: UploadTarget,
        attach: Option<(BusinessType, Uuid)>,
        report: &UploadReport,
    ) {
        let entry = NewAuditLogEntry::by(user_id, AuditAction::DocumentsUploaded);
        let entry = match attach {
            Some((kind, request_id)) => entry.on_record(kind.table_name(), request_id),
            None => entry.on_table(target.bucket()),
        };
        let entry = entry.with_new(json!({
            "bucket": target.bucket(),
            "attempted": report.results.keys().collect::<Vec<_>>(),
            "files": report.stored.values().map(|d| d.path.as_str()).collect::<Vec<_>>(),
            "failed": report.failed_count(),
        }));

        if let Err(err) =
            bounded(self.call_timeout, "append audit entry", self.store.append_audit(entry)).await
        {
            log::warn!("Upload audit entry for {user_id} not written: {err}");
        }
    }
}

fn is_safe_doc_type(doc_type: &str) -> bool {
    let trimmed = doc_type.trim();
    !trimmed.is_empty()
        && !trimmed.contains('/')
        && !trimmed.contains('\\')
        && !trimmed.contains("..")
}

/// `{user_id}/{bucket_key}/{doc_type}_{timestamp_ms}_{random}.{ext}`
fn object_key(user_id: Uuid, target: UploadTarget, doc_type: &str, extension: Option<&str>) -> String {
    let extension = extension
        .map(|ext| {
            ext.trim_start_matches('.')
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!(
        "{}/{}/{}_{}_{}.{}",
        user_id,
        target.bucket_key(),
        doc_type.trim(),
        Utc::now().timestamp_millis(),
        suffix,
        extension
    )
}
