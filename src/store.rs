//! Persistence seam for requests, profiles, audit entries and notifications.
//!
//! The Postgres implementation lives in [`crate::database`]; tests use an
//! in-memory store with the same contract.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{
    BusinessRequest, BusinessType, NewAuditLogEntry, NewBusinessRequest, NewNotification,
    Notification, ProfileRole, RequestFilter, RequestPage, RequestStatus, RequestWithOwner,
    StoredDocument, UserProfile,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The row changed since it was read.
    #[error("version mismatch on {table} {id}")]
    VersionConflict { table: &'static str, id: Uuid },

    #[error("{0} not found")]
    Missing(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A validated status change, applied atomically together with the optional promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub business_type: BusinessType,
    pub request_id: Uuid,
    pub expected_version: i64,
    pub new_status: RequestStatus,
    /// `None` keeps the stored notes.
    pub review_notes: Option<String>,
    pub reviewed_by: Uuid,
    pub reviewed_at: DateTime<Utc>,
    /// Owner whose profile becomes `role = business_type, status = active`.
    pub promote_owner: Option<Uuid>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError>;

    async fn get_request(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<Option<BusinessRequest>, StoreError>;

    async fn get_request_with_owner(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<Option<RequestWithOwner>, StoreError>;

    async fn insert_request(&self, request: NewBusinessRequest)
        -> Result<BusinessRequest, StoreError>;

    async fn list_requests(&self, filter: &RequestFilter) -> Result<RequestPage, StoreError>;

    /// Writes the request row and, when requested, the owner promotion in one transaction.
    async fn apply_transition(
        &self,
        transition: &StatusTransition,
    ) -> Result<BusinessRequest, StoreError>;

    /// Merges descriptors into the request's `documents` map.
    async fn attach_documents(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
        documents: &BTreeMap<String, StoredDocument>,
    ) -> Result<(), StoreError>;

    async fn set_profile_role(
        &self,
        user_id: Uuid,
        role: ProfileRole,
    ) -> Result<UserProfile, StoreError>;

    async fn append_audit(&self, entry: NewAuditLogEntry) -> Result<(), StoreError>;

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, StoreError>;

    async fn push_tokens_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError>;
}

/// Runs an external call under `limit`; timeouts and failures become dependency errors.
pub async fn bounded<T, E, F>(limit: Duration, context: &'static str, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ServiceError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ServiceError::dependency(
            context,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } => ServiceError::StaleWrite,
            StoreError::Missing(what) => ServiceError::NotFound(what),
            StoreError::Database(sqlx::Error::RowNotFound) => {
                ServiceError::NotFound("Resource".into())
            }
            other => ServiceError::dependency("store", other),
        }
    }
}
