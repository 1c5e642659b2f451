//! Caller identification and shared-secret checks for admin endpoints.

use actix_web::HttpRequest;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::error::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const ACTOR_HEADER: &str = "X-Actor-Id";
pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";
pub const SIGNATURE_HEADER: &str = "X-Signature";

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller id from `X-Actor-Id`; missing or malformed ids are unauthorized.
pub fn actor_id(req: &HttpRequest) -> Result<Uuid, ServiceError> {
    header(req, ACTOR_HEADER)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(ServiceError::Unauthorized)
}

/// Checks `X-Admin-Key` against the configured secret. No secret configured means no access.
pub fn require_admin_key(req: &HttpRequest, security: &SecurityConfig) -> Result<(), ServiceError> {
    let expected = security
        .admin_secret_key
        .as_deref()
        .ok_or(ServiceError::Unauthorized)?;
    let provided = header(req, ADMIN_KEY_HEADER).ok_or(ServiceError::Unauthorized)?;

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        log::warn!("Rejected admin key on {}", req.path());
        Err(ServiceError::Unauthorized)
    }
}

/// Verifies `X-Signature: sha256=<hex>` over `body` when a signing secret is configured.
pub fn verify_body_signature(
    req: &HttpRequest,
    body: &[u8],
    security: &SecurityConfig,
) -> Result<(), ServiceError> {
    let Some(secret) = security.account_type_signing_secret.as_deref() else {
        return Ok(());
    };
    let signature = header(req, SIGNATURE_HEADER)
        .and_then(|value| value.strip_prefix("sha256="))
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(ServiceError::Unauthorized)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::dependency("signature", e))?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| {
        log::warn!("Rejected body signature on {}", req.path());
        ServiceError::Unauthorized
    })
}

/// `sha256=<hex>` signature of `body`, as callers are expected to send it.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::dependency("signature", e))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn security(admin_key: Option<&str>, signing: Option<&str>) -> SecurityConfig {
        SecurityConfig {
            admin_secret_key: admin_key.map(str::to_string),
            account_type_signing_secret: signing.map(str::to_string),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn actor_header_must_be_a_uuid() {
        let id = Uuid::new_v4();
        let req = TestRequest::default()
            .insert_header((ACTOR_HEADER, id.to_string()))
            .to_http_request();
        assert_eq!(actor_id(&req).unwrap(), id);

        let bad = TestRequest::default()
            .insert_header((ACTOR_HEADER, "admin"))
            .to_http_request();
        assert!(matches!(actor_id(&bad), Err(ServiceError::Unauthorized)));
    }

    #[test]
    fn admin_key_is_required_and_compared() {
        let config = security(Some("s3cret"), None);
        let ok = TestRequest::default()
            .insert_header((ADMIN_KEY_HEADER, "s3cret"))
            .to_http_request();
        assert!(require_admin_key(&ok, &config).is_ok());

        let wrong = TestRequest::default()
            .insert_header((ADMIN_KEY_HEADER, "s3creT"))
            .to_http_request();
        assert!(require_admin_key(&wrong, &config).is_err());

        let unconfigured = security(None, None);
        assert!(require_admin_key(&ok, &unconfigured).is_err());
    }

    #[test]
    fn body_signature_is_checked_when_configured() {
        let body = br#"{"user_id":"00000000-0000-0000-0000-000000000000","account_type":"driver"}"#;
        let config = security(Some("k"), Some("signing-secret"));
        let signature = sign_body("signing-secret", body).unwrap();

        let signed = TestRequest::default()
            .insert_header((SIGNATURE_HEADER, signature.clone()))
            .to_http_request();
        assert!(verify_body_signature(&signed, body, &config).is_ok());
        assert!(verify_body_signature(&signed, b"tampered", &config).is_err());

        let unsigned = TestRequest::default().to_http_request();
        assert!(verify_body_signature(&unsigned, body, &config).is_err());
        assert!(verify_body_signature(&unsigned, body, &security(Some("k"), None)).is_ok());
    }
}
