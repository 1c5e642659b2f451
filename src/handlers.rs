use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actix_multipart::{Field, Multipart};
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt;
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

use crate::accounts;
use crate::auth;
use crate::clients::push::{PushGateway, PushMessage, PushTarget};
use crate::clients::storage::BlobStore;
use crate::config::{LimitsConfig, SecurityConfig};
use crate::error::ServiceError;
use crate::lifecycle::RequestLifecycle;
use crate::models::{
    ApiResponse, BusinessType, ChangeAccountTypeRequest, ListRequestsQuery, PushSendRequest,
    SubmitRequestBody, UpdateRequestStatusRequest, UploadDocumentsBody,
};
use crate::registrations::{parse_business_type, RegistrationService};
use crate::store::{bounded, RequestStore};
use crate::uploads::{BinaryPayload, DocumentPayload, DocumentResult, UploadCoordinator, UploadTarget};

/// Shared handler state.
pub struct AppState {
    pub lifecycle: RequestLifecycle,
    pub registrations: RegistrationService,
    pub uploads: UploadCoordinator,
    pub store: Arc<dyn RequestStore>,
    pub push: Arc<dyn PushGateway>,
    pub security: SecurityConfig,
    pub call_timeout: Duration,
    pub max_document_bytes: usize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RequestStore>,
        blobs: Arc<dyn BlobStore>,
        push: Arc<dyn PushGateway>,
        security: SecurityConfig,
        limits: &LimitsConfig,
    ) -> Self {
        let call_timeout = limits.external_call_timeout;
        let uploads = UploadCoordinator::new(
            store.clone(),
            blobs,
            call_timeout,
            limits.max_document_bytes,
        );
        Self {
            lifecycle: RequestLifecycle::new(store.clone(), push.clone(), call_timeout),
            registrations: RegistrationService::new(store.clone(), uploads.clone(), call_timeout),
            uploads,
            store,
            push,
            security,
            call_timeout,
            max_document_bytes: limits.max_document_bytes,
        }
    }

    /// Largest JSON body accepted: a handful of base64 documents at the size limit.
    fn json_body_limit(&self) -> usize {
        self.max_document_bytes.saturating_mul(8)
    }
}

/// Registers every route. Known paths answer 405 to other methods.
pub fn configure(cfg: &mut web::ServiceConfig, json_limit: usize) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(json_limit)
            .error_handler(|err, _| ServiceError::Validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _| ServiceError::Validation(err.to_string()).into()),
    )
    .app_data(
        web::PathConfig::default()
            .error_handler(|err, _| ServiceError::Validation(err.to_string()).into()),
    )
    .service(resource("/health").route(web::get().to(health_check)))
    .service(resource("/admin/update-request-status").route(web::put().to(update_request_status)))
    .service(resource("/admin/change-account-type").route(web::post().to(change_account_type)))
    .service(resource("/business/get-requests").route(web::get().to(get_requests)))
    .service(
        resource("/business/requests/{business_type}/{request_id}")
            .route(web::get().to(get_request)),
    )
    .service(resource("/business/submit-request").route(web::post().to(submit_request)))
    .service(resource("/upload-documents").route(web::post().to(upload_documents)))
    .service(
        resource("/upload-courier-documents").route(web::post().to(upload_courier_documents)),
    )
    .service(
        resource("/upload-pharmacy-documents").route(web::post().to(upload_pharmacy_documents)),
    )
    .service(resource("/upload-product-images").route(web::post().to(upload_product_images)))
    .service(resource("/push/send").route(web::post().to(push_send)));
}

fn resource(path: &str) -> actix_web::Resource {
    web::resource(path).default_service(web::to(method_not_allowed))
}

async fn method_not_allowed() -> Result<HttpResponse, ServiceError> {
    Err(ServiceError::MethodNotAllowed)
}

/// Fallback for unknown paths.
pub async fn route_not_found() -> Result<HttpResponse, ServiceError> {
    Err(ServiceError::NotFound("Route".into()))
}

// ============================================================================
// HEALTH CHECK
// ============================================================================

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "luxbyte-registration-service",
        "timestamp": chrono::Utc::now()
    }))
}

// ============================================================================
// REQUEST LIFECYCLE
// ============================================================================

pub async fn update_request_status(
    state: web::Data<AppState>,
    payload: web::Json<UpdateRequestStatusRequest>,
) -> Result<HttpResponse, ServiceError> {
    let outcome = state.lifecycle.transition(payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(outcome)))
}

pub async fn get_requests(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<ListRequestsQuery>,
) -> Result<HttpResponse, ServiceError> {
    let actor_id = auth::actor_id(&req)?;
    let listing = state.registrations.list(actor_id, query.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(listing)))
}

pub async fn get_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, Uuid)>,
) -> Result<HttpResponse, ServiceError> {
    let actor_id = auth::actor_id(&req)?;
    let (business_type, request_id) = path.into_inner();
    let request = state
        .registrations
        .get(actor_id, &business_type, request_id)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "request": request }))))
}

pub async fn submit_request(
    state: web::Data<AppState>,
    payload: web::Json<SubmitRequestBody>,
) -> Result<HttpResponse, ServiceError> {
    let outcome = state.registrations.submit(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success(outcome)))
}

// ============================================================================
// DOCUMENT UPLOADS
// ============================================================================

/// Upload body after normalizing either wire convention.
#[derive(Debug)]
struct UploadForm {
    user_id: Uuid,
    business_type: Option<String>,
    request_id: Option<Uuid>,
    documents: BTreeMap<String, DocumentPayload>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    results: BTreeMap<String, DocumentResult>,
    uploaded: usize,
    failed: usize,
}

fn is_multipart(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
}

async fn read_upload_form(
    req: &HttpRequest,
    payload: web::Payload,
    state: &AppState,
) -> Result<UploadForm, ServiceError> {
    if is_multipart(req) {
        return read_multipart(
            Multipart::new(req.headers(), payload),
            state.max_document_bytes,
            state.json_body_limit(),
        )
        .await;
    }

    let bytes = payload
        .to_bytes_limited(state.json_body_limit())
        .await
        .map_err(|_| ServiceError::Validation("request body too large".into()))?
        .map_err(|e| ServiceError::Validation(e.to_string()))?;
    let body: UploadDocumentsBody = serde_json::from_slice(&bytes)
        .map_err(|e| ServiceError::Validation(format!("Json deserialize error: {e}")))?;

    Ok(UploadForm {
        user_id: body.user_id,
        business_type: body.business_type,
        request_id: body.request_id,
        documents: body
            .documents
            .into_iter()
            .map(|(doc_type, doc)| (doc_type, doc.into()))
            .collect(),
    })
}

/// File parts become documents keyed by field name; text parts carry the ids.
///
/// Buffered file bytes across all parts are capped at `total_limit`.
async fn read_multipart(
    mut multipart: Multipart,
    max_document_bytes: usize,
    total_limit: usize,
) -> Result<UploadForm, ServiceError> {
    let mut buffered = 0usize;
    let mut user_id = None;
    let mut business_type = None;
    let mut request_id = None;
    let mut documents = BTreeMap::new();

    while let Some(field) = multipart.try_next().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        match filename {
            Some(filename) => {
                let mime_type = field.content_type().map(|m| m.essence_str().to_string());
                let extension = filename.rsplit_once('.').map(|(_, ext)| ext.to_string());
                let bytes = read_field(field, max_document_bytes.saturating_add(1)).await?;
                buffered = buffered.saturating_add(bytes.len());
                if buffered > total_limit {
                    return Err(ServiceError::Validation("request body too large".into()));
                }
                documents.insert(
                    name,
                    DocumentPayload {
                        payload: BinaryPayload::Bytes(bytes),
                        extension,
                        mime_type,
                    },
                );
            }
            None => {
                let bytes = read_field(field, 1024).await?;
                let value = String::from_utf8_lossy(&bytes).trim().to_string();
                match name.as_str() {
                    "userId" | "user_id" => user_id = Some(parse_uuid_field(&name, &value)?),
                    "businessType" | "business_type" => business_type = Some(value),
                    "requestId" | "request_id" => {
                        request_id = Some(parse_uuid_field(&name, &value)?)
                    }
                    other => log::debug!("Ignoring multipart field '{other}'"),
                }
            }
        }
    }

    Ok(UploadForm {
        user_id: user_id.ok_or_else(|| ServiceError::Validation("userId is required".into()))?,
        business_type,
        request_id,
        documents,
    })
}

/// Reads at most `keep` bytes of a part and drains the rest.
async fn read_field(mut field: Field, keep: usize) -> Result<Vec<u8>, ServiceError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.try_next().await.map_err(multipart_error)? {
        let room = keep.saturating_sub(bytes.len());
        bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(bytes)
}

fn parse_uuid_field(name: &str, value: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(value).map_err(|_| ServiceError::Validation(format!("{name} must be a UUID")))
}

fn multipart_error(err: actix_multipart::MultipartError) -> ServiceError {
    ServiceError::Validation(format!("multipart: {err}"))
}

/// Confirms `request_id` belongs to `user_id` before documents are attached to it.
async fn attachment(
    state: &AppState,
    user_id: Uuid,
    business_type: BusinessType,
    request_id: Option<Uuid>,
) -> Result<Option<(BusinessType, Uuid)>, ServiceError> {
    let Some(request_id) = request_id else {
        return Ok(None);
    };
    let request = bounded(
        state.call_timeout,
        "load request",
        state.store.get_request(business_type, request_id),
    )
    .await?;
    match request {
        Some(request) if request.user_id == user_id => Ok(Some((business_type, request_id))),
        _ => Err(ServiceError::NotFound("Request".into())),
    }
}

async fn run_upload(
    state: &AppState,
    form: UploadForm,
    target: UploadTarget,
    attach: Option<(BusinessType, Uuid)>,
) -> Result<HttpResponse, ServiceError> {
    if form.documents.is_empty() {
        return Err(ServiceError::Validation("no documents provided".into()));
    }

    let report = state
        .uploads
        .upload_batch(form.user_id, target, form.documents, attach)
        .await;
    let failed = report.failed_count();
    let response = UploadResponse {
        uploaded: report.results.len() - failed,
        failed,
        results: report.results,
    };
    Ok(HttpResponse::Ok().json(ApiResponse::success(response)))
}

pub async fn upload_documents(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Payload,
) -> Result<HttpResponse, ServiceError> {
    let form = read_upload_form(&req, payload, &state).await?;
    let raw_type = form
        .business_type
        .clone()
        .ok_or_else(|| ServiceError::Validation("business_type is required".into()))?;
    let business_type = parse_business_type(&raw_type)?;
    let attach = attachment(&state, form.user_id, business_type, form.request_id).await?;
    run_upload(&state, form, UploadTarget::Business(business_type), attach).await
}

async fn upload_for_type(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Payload,
    business_type: BusinessType,
) -> Result<HttpResponse, ServiceError> {
    let form = read_upload_form(&req, payload, &state).await?;
    let attach = attachment(&state, form.user_id, business_type, form.request_id).await?;
    run_upload(&state, form, UploadTarget::Business(business_type), attach).await
}

pub async fn upload_courier_documents(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Payload,
) -> Result<HttpResponse, ServiceError> {
    upload_for_type(req, state, payload, BusinessType::Courier).await
}

pub async fn upload_pharmacy_documents(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Payload,
) -> Result<HttpResponse, ServiceError> {
    upload_for_type(req, state, payload, BusinessType::Pharmacy).await
}

pub async fn upload_product_images(
    req: HttpRequest,
    state: web::Data<AppState>,
    payload: web::Payload,
) -> Result<HttpResponse, ServiceError> {
    let form = read_upload_form(&req, payload, &state).await?;
    run_upload(&state, form, UploadTarget::ProductImages, None).await
}

// ============================================================================
// ADMIN OPERATIONS
// ============================================================================

pub async fn change_account_type(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ServiceError> {
    auth::require_admin_key(&req, &state.security)?;
    auth::verify_body_signature(&req, &body, &state.security)?;

    let command: ChangeAccountTypeRequest = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::Validation(format!("Json deserialize error: {e}")))?;
    let change = accounts::change_account_type(&state.store, state.call_timeout, command).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(change)))
}

pub async fn push_send(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ServiceError> {
    auth::require_admin_key(&req, &state.security)?;

    let request: PushSendRequest = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::Validation(format!("Json deserialize error: {e}")))?;
    request.validate()?;

    let target = match (request.tokens, request.user_id, request.topic) {
        (Some(tokens), None, None) if !tokens.is_empty() => PushTarget::Tokens(tokens),
        (None, Some(user_id), None) => {
            let tokens = bounded(
                state.call_timeout,
                "load push tokens",
                state.store.push_tokens_for_user(user_id),
            )
            .await?;
            if tokens.is_empty() {
                return Err(ServiceError::NotFound("Push tokens".into()));
            }
            PushTarget::Tokens(tokens)
        }
        (None, None, Some(topic)) if !topic.trim().is_empty() => PushTarget::Topic(topic),
        _ => {
            return Err(ServiceError::Validation(
                "exactly one of tokens, userId or topic is required".into(),
            ))
        }
    };

    let message = PushMessage {
        title: request.title,
        body: request.body,
        data: request.data,
    };
    let report = bounded(
        state.call_timeout,
        "push notification",
        state.push.send(&target, &message),
    )
    .await?;

    log::info!("Push sent: {} delivered, {} failed", report.sent, report.failed);
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}

/// JSON body limit to pass to [`configure`].
pub fn json_limit(state: &AppState) -> usize {
    state.json_body_limit()
}
