use std::sync::atomic::{AtomicBool, Ordering};

use actix_web::{http::header, http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::models::{BusinessType, ProfileRole, RequestStatus};

static VERBOSE_ERRORS: AtomicBool = AtomicBool::new(false);

/// Include internal error messages in `details`. Only enabled outside production.
pub fn set_verbose_errors(enabled: bool) {
    VERBOSE_ERRORS.store(enabled, Ordering::Relaxed);
}

fn verbose_errors() -> bool {
    VERBOSE_ERRORS.load(Ordering::Relaxed)
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid business type: {0}")]
    InvalidBusinessType(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid account type: {0}")]
    InvalidAccountType(String),

    /// Missing or wrong shared secret / signature.
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated actor lacks the required role.
    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {message}")]
    Conflict { message: String, current_value: String },

    #[error("Request was modified concurrently")]
    StaleWrite,

    #[error("Rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{context}: {message}")]
    Dependency {
        context: &'static str,
        message: String,
    },
}

impl ServiceError {
    pub fn dependency(context: &'static str, err: impl std::fmt::Display) -> Self {
        ServiceError::Dependency {
            context,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_types: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_statuses: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_account_types: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ErrorBody {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            valid_types: None,
            valid_statuses: None,
            valid_account_types: None,
            current_value: None,
            retry_after: None,
        }
    }

    fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_)
            | ServiceError::InvalidBusinessType(_)
            | ServiceError::InvalidStatus(_)
            | ServiceError::InvalidAccountType(_)
            | ServiceError::Conflict { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::StaleWrite => StatusCode::CONFLICT,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::Dependency { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ServiceError::Validation(msg) => ErrorBody::new("Validation failed").details(msg.clone()),
            ServiceError::InvalidBusinessType(value) => ErrorBody {
                valid_types: Some(BusinessType::valid_values()),
                ..ErrorBody::new("Invalid business type").details(format!("'{value}' is not a supported business type"))
            },
            ServiceError::InvalidStatus(value) => ErrorBody {
                valid_statuses: Some(RequestStatus::valid_values()),
                ..ErrorBody::new("Invalid status").details(format!("'{value}' is not a supported status"))
            },
            ServiceError::InvalidAccountType(value) => ErrorBody {
                valid_account_types: Some(ProfileRole::valid_values()),
                ..ErrorBody::new("Invalid account type").details(format!("'{value}' is not a supported account type"))
            },
            ServiceError::Unauthorized | ServiceError::Forbidden => ErrorBody::new("Unauthorized"),
            ServiceError::NotFound(what) => ErrorBody::new(format!("{what} not found")),
            ServiceError::Conflict {
                message,
                current_value,
            } => ErrorBody {
                current_value: Some(current_value.clone()),
                ..ErrorBody::new(message.clone())
            },
            ServiceError::StaleWrite => ErrorBody::new("Request was modified concurrently")
                .details("Reload the request and retry the update"),
            ServiceError::RateLimited { retry_after_secs } => ErrorBody {
                retry_after: Some(*retry_after_secs),
                ..ErrorBody::new("Too many requests")
            },
            ServiceError::MethodNotAllowed => ErrorBody::new("Method not allowed"),
            ServiceError::Dependency { context, message } => {
                log::error!("{context}: {message}");
                let body = ErrorBody::new("Internal server error");
                if verbose_errors() {
                    body.details(format!("{context}: {message}"))
                } else {
                    body
                }
            }
        };

        let mut response = HttpResponse::build(self.status_code());
        if let ServiceError::RateLimited { retry_after_secs } = self {
            response.insert_header((header::RETRY_AFTER, retry_after_secs.to_string()));
        }
        response.json(body)
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .keys()
            .map(|field| field.to_string())
            .collect();
        fields.sort();
        ServiceError::Validation(format!("invalid fields: {}", fields.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use serde_json::Value;

    async fn body_json(err: ServiceError) -> (StatusCode, Value) {
        let response = err.error_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[actix_web::test]
    async fn invalid_business_type_lists_valid_types() {
        let (status, body) = body_json(ServiceError::InvalidBusinessType("bakery".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["valid_types"],
            serde_json::json!(["restaurant", "supermarket", "pharmacy", "clinic", "courier", "driver"])
        );
    }

    #[actix_web::test]
    async fn permission_errors_carry_no_details() {
        let (status, body) = body_json(ServiceError::Forbidden).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, serde_json::json!({"error": "Unauthorized"}));

        let (status, _) = body_json(ServiceError::Unauthorized).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn dependency_details_hidden_by_default() {
        let (status, body) =
            body_json(ServiceError::dependency("store", "password authentication failed")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.get("details").is_none());
    }

    #[actix_web::test]
    async fn conflict_reports_current_value() {
        let (status, body) = body_json(ServiceError::Conflict {
            message: "Account type unchanged".into(),
            current_value: "driver".into(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["current_value"], "driver");
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = ServiceError::RateLimited { retry_after_secs: 7 }.error_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[test]
    fn stale_write_is_conflict_status() {
        assert_eq!(ServiceError::StaleWrite.status_code(), StatusCode::CONFLICT);
    }
}
