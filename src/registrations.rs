//! Request submission and read access.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::ServiceError;
use crate::models::{
    AuditAction, BusinessDetails, BusinessRequest, BusinessType, ListRequestsQuery,
    NewAuditLogEntry, NewBusinessRequest, RequestFilter, RequestStatus, RequestWithOwner,
    SubmitRequestBody, UserProfile,
};
use crate::store::{bounded, RequestStore};
use crate::uploads::{DocumentPayload, DocumentResult, UploadCoordinator, UploadTarget};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub request: BusinessRequest,
    pub documents: BTreeMap<String, DocumentResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestListing {
    pub requests: Vec<BusinessRequest>,
    pub pagination: Pagination,
}

pub fn parse_business_type(value: &str) -> Result<BusinessType, ServiceError> {
    value
        .parse()
        .map_err(|_| ServiceError::InvalidBusinessType(value.to_string()))
}

#[derive(Clone)]
pub struct RegistrationService {
    store: Arc<dyn RequestStore>,
    uploads: UploadCoordinator,
    call_timeout: Duration,
}

impl RegistrationService {
    pub fn new(
        store: Arc<dyn RequestStore>,
        uploads: UploadCoordinator,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            uploads,
            call_timeout,
        }
    }

    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, ServiceError> {
        bounded(self.call_timeout, "load profile", self.store.get_profile(user_id)).await
    }

    /// Creates a pending request and uploads any inline documents into the type's bucket.
    pub async fn submit(&self, body: SubmitRequestBody) -> Result<SubmitOutcome, ServiceError> {
        let business_type = parse_business_type(&body.business_type)?;
        body.validate()?;

        let details = BusinessDetails::parse(business_type, body.details)
            .map_err(|e| ServiceError::Validation(format!("details: {e}")))?;
        details.validate()?;

        if self.profile(body.user_id).await?.is_none() {
            return Err(ServiceError::NotFound("User".into()));
        }

        let created = bounded(
            self.call_timeout,
            "insert request",
            self.store.insert_request(NewBusinessRequest {
                id: Uuid::new_v4(),
                user_id: body.user_id,
                business_name: body.business_name.trim().to_string(),
                contact_phone: body.contact_phone,
                contact_email: body.contact_email,
                address: body.address,
                details,
                created_at: Utc::now(),
            }),
        )
        .await?;

        log::info!(
            "Request {} submitted by {} as {}",
            created.id,
            created.user_id,
            business_type
        );

        let entry = NewAuditLogEntry::by(created.user_id, AuditAction::RequestSubmitted)
            .on_record(business_type.table_name(), created.id)
            .with_new(json!({
                "status": created.status,
                "business_name": created.business_name,
            }));
        if let Err(err) =
            bounded(self.call_timeout, "append audit entry", self.store.append_audit(entry)).await
        {
            log::warn!("Submission audit for {} not written: {err}", created.id);
        }

        if body.documents.is_empty() {
            return Ok(SubmitOutcome {
                request: created,
                documents: BTreeMap::new(),
            });
        }

        let documents: BTreeMap<String, DocumentPayload> = body
            .documents
            .into_iter()
            .map(|(doc_type, doc)| (doc_type, doc.into()))
            .collect();
        let report = self
            .uploads
            .upload_batch(
                created.user_id,
                UploadTarget::Business(business_type),
                documents,
                Some((business_type, created.id)),
            )
            .await;

        let request = match bounded(
            self.call_timeout,
            "reload request",
            self.store.get_request(business_type, created.id),
        )
        .await
        {
            Ok(Some(request)) => request,
            _ => created,
        };

        Ok(SubmitOutcome {
            request,
            documents: report.results,
        })
    }

    /// Lists requests visible to `actor_id`.
    ///
    /// Without `admin_view` only the actor's own requests are listed.
    pub async fn list(
        &self,
        actor_id: Uuid,
        query: ListRequestsQuery,
    ) -> Result<RequestListing, ServiceError> {
        let actor = self.profile(actor_id).await?.ok_or(ServiceError::Forbidden)?;

        let user_id = if query.admin_view {
            if !actor.is_admin() {
                return Err(ServiceError::Forbidden);
            }
            query.user_id
        } else {
            match query.user_id {
                Some(user_id) if user_id != actor.id => return Err(ServiceError::Forbidden),
                _ => Some(actor.id),
            }
        };

        let business_type = query
            .business_type
            .as_deref()
            .map(parse_business_type)
            .transpose()?;
        let status = query
            .status
            .as_deref()
            .map(|s| {
                s.parse::<RequestStatus>()
                    .map_err(|_| ServiceError::InvalidStatus(s.to_string()))
            })
            .transpose()?;

        let page = query.page.unwrap_or(1).max(1);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| ServiceError::Validation(format!("page {page} is out of range")))?;
        let filter = RequestFilter {
            user_id,
            business_type,
            status,
            limit,
            offset,
        };

        let found = bounded(
            self.call_timeout,
            "list requests",
            self.store.list_requests(&filter),
        )
        .await?;

        Ok(RequestListing {
            requests: found.requests,
            pagination: Pagination {
                page,
                limit,
                total: found.total,
            },
        })
    }

    /// One request with owner fields. Visible to its owner and to admins; hidden otherwise.
    pub async fn get(
        &self,
        actor_id: Uuid,
        business_type: &str,
        request_id: Uuid,
    ) -> Result<RequestWithOwner, ServiceError> {
        let actor = self.profile(actor_id).await?.ok_or(ServiceError::Forbidden)?;
        let business_type = parse_business_type(business_type)?;

        let found = bounded(
            self.call_timeout,
            "load request",
            self.store.get_request_with_owner(business_type, request_id),
        )
        .await?;

        match found {
            Some(request) if actor.is_admin() || request.request.user_id == actor.id => {
                Ok(request)
            }
            _ => Err(ServiceError::NotFound("Request".into())),
        }
    }
}
