//! Per-client request rate limiting.
//!
//! Limits are kept in process memory, so each instance counts on its own.

use std::num::NonZeroU32;

use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};

use crate::error::ServiceError;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    per_minute: u32,
}

impl ClientRateLimiter {
    /// A limit of zero is treated as one request per minute.
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            per_minute,
        }
    }

    /// `Err(retry_after_secs)` once `client` has used up its quota.
    pub fn check(&self, client: &str) -> Result<(), u64> {
        match self.limiter.check_key(&client.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(wait.as_secs().max(1))
            }
        }
    }

    /// Drops state for clients whose quota has fully replenished.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }
}

impl std::fmt::Debug for ClientRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRateLimiter")
            .field("per_minute", &self.per_minute)
            .field("tracked_clients", &self.limiter.len())
            .finish()
    }
}

fn client_key(req: &ServiceRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rejects requests over quota with 429 and `Retry-After`.
///
/// Passes everything through when no [`ClientRateLimiter`] is registered as app data.
pub async fn rate_limit(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    if let Some(limiter) = req.app_data::<web::Data<ClientRateLimiter>>() {
        let client = client_key(&req);
        if let Err(retry_after_secs) = limiter.check(&client) {
            log::warn!(
                "Rate limit of {}/min exceeded by {client} on {}",
                limiter.per_minute(),
                req.path()
            );
            return Err(ServiceError::RateLimited { retry_after_secs }.into());
        }
    }

    next.call(req).await
}
