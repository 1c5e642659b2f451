//! Admin status transitions on registration requests.
//!
//! A transition is authorized, validated and written first. The owner's role
//! promotion on approval is part of that write. The audit entry and the
//! owner notification follow as independent best-effort side effects: their
//! failures are logged and reported in [`SideEffects`], never returned as errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::clients::push::{PushGateway, PushMessage, PushTarget};
use crate::error::ServiceError;
use crate::models::{
    AuditAction, BusinessRequest, BusinessType, NewAuditLogEntry, NewNotification,
    NotificationKind, RequestStatus, RequestWithOwner, UpdateRequestStatusRequest, UserProfile,
};
use crate::store::{bounded, RequestStore, StatusTransition};

/// Which best-effort steps completed after the primary write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SideEffects {
    pub audit_logged: bool,
    pub notification_created: bool,
    pub push_delivered: usize,
    pub role_promoted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub request: RequestWithOwner,
    pub side_effects: SideEffects,
}

#[derive(Clone)]
pub struct RequestLifecycle {
    store: Arc<dyn RequestStore>,
    push: Arc<dyn PushGateway>,
    call_timeout: Duration,
}

impl RequestLifecycle {
    pub fn new(
        store: Arc<dyn RequestStore>,
        push: Arc<dyn PushGateway>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            push,
            call_timeout,
        }
    }

    /// Loads `actor_id` and fails with `Forbidden` unless it is an admin.
    pub async fn require_admin(&self, actor_id: Uuid) -> Result<UserProfile, ServiceError> {
        let profile = bounded(
            self.call_timeout,
            "load actor profile",
            self.store.get_profile(actor_id),
        )
        .await?;

        match profile {
            Some(profile) if profile.is_admin() => Ok(profile),
            _ => {
                log::warn!("Rejected admin action from non-admin actor {actor_id}");
                Err(ServiceError::Forbidden)
            }
        }
    }

    pub async fn transition(
        &self,
        command: UpdateRequestStatusRequest,
    ) -> Result<TransitionOutcome, ServiceError> {
        // Authorization comes first so unauthorized callers learn nothing about requests.
        let admin = self.require_admin(command.admin_user_id).await?;

        let business_type: BusinessType = command
            .business_type
            .parse()
            .map_err(|_| ServiceError::InvalidBusinessType(command.business_type.clone()))?;
        let new_status: RequestStatus = command
            .status
            .parse()
            .map_err(|_| ServiceError::InvalidStatus(command.status.clone()))?;

        let current = bounded(
            self.call_timeout,
            "load request",
            self.store.get_request(business_type, command.request_id),
        )
        .await?
        .ok_or_else(|| ServiceError::NotFound("Request".into()))?;

        let promote_owner = (new_status == RequestStatus::Approved).then_some(current.user_id);
        let transition = StatusTransition {
            business_type,
            request_id: current.id,
            expected_version: current.version,
            new_status,
            review_notes: command.review_notes,
            reviewed_by: admin.id,
            reviewed_at: Utc::now(),
            promote_owner,
        };

        let updated = bounded(
            self.call_timeout,
            "update request status",
            self.store.apply_transition(&transition),
        )
        .await?;

        log::info!(
            "Request {} ({}) moved {} -> {} by {}",
            updated.id,
            business_type,
            current.status,
            updated.status,
            admin.id
        );

        let (audit_logged, (notification_created, push_delivered)) = futures_util::join!(
            self.record_audit(admin.id, &current, &updated),
            self.notify_owner(&updated),
        );

        let side_effects = SideEffects {
            audit_logged,
            notification_created,
            push_delivered,
            role_promoted: promote_owner.is_some(),
        };

        let request = match bounded(
            self.call_timeout,
            "reload request",
            self.store.get_request_with_owner(business_type, updated.id),
        )
        .await
        {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => {
                log::warn!("Could not reload request {} after transition", updated.id);
                RequestWithOwner {
                    request: updated,
                    owner: None,
                }
            }
        };

        Ok(TransitionOutcome {
            request,
            side_effects,
        })
    }

    async fn record_audit(
        &self,
        admin_id: Uuid,
        before: &BusinessRequest,
        after: &BusinessRequest,
    ) -> bool {
        let entry = NewAuditLogEntry::by(admin_id, AuditAction::RequestStatusUpdated)
            .on_record(after.business_type.table_name(), after.id)
            .with_old(json!({ "status": before.status }))
            .with_new(json!({
                "status": after.status,
                "review_notes": after.review_notes,
            }));

        match bounded(self.call_timeout, "append audit entry", self.store.append_audit(entry)).await
        {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Audit entry for request {} not written: {err}", after.id);
                false
            }
        }
    }

    /// Writes the feed notification, then pushes it to the owner's devices.
    async fn notify_owner(&self, request: &BusinessRequest) -> (bool, usize) {
        let notification = compose_notification(request);
        let push_message = PushMessage {
            title: notification.title.clone(),
            body: notification.message.clone(),
            data: HashMap::from([
                ("type".to_string(), "request_status".to_string()),
                ("request_id".to_string(), request.id.to_string()),
                ("business_type".to_string(), request.business_type.to_string()),
                ("status".to_string(), request.status.to_string()),
            ]),
        };

        if let Err(err) = bounded(
            self.call_timeout,
            "insert notification",
            self.store.insert_notification(notification),
        )
        .await
        {
            log::warn!("Notification for request {} not written: {err}", request.id);
            return (false, 0);
        }

        let tokens = match bounded(
            self.call_timeout,
            "load push tokens",
            self.store.push_tokens_for_user(request.user_id),
        )
        .await
        {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => return (true, 0),
            Err(err) => {
                log::warn!("Push tokens for {} unavailable: {err}", request.user_id);
                return (true, 0);
            }
        };

        let target = PushTarget::Tokens(tokens);
        match bounded(
            self.call_timeout,
            "push notification",
            self.push.send(&target, &push_message),
        )
        .await
        {
            Ok(report) => (true, report.sent),
            Err(err) => {
                log::warn!("Push for request {} not delivered: {err}", request.id);
                (true, 0)
            }
        }
    }
}

/// Owner-facing copy for a request's current status.
pub fn compose_notification(request: &BusinessRequest) -> NewNotification {
    let kind_label = request.business_type.as_str();
    let (title, message, kind) = match request.status {
        RequestStatus::Approved => (
            "Registration approved".to_string(),
            format!(
                "Congratulations! Your {kind_label} registration \"{}\" has been accepted. You can now access your dashboard.",
                request.business_name
            ),
            NotificationKind::Success,
        ),
        RequestStatus::Rejected => {
            let mut message = format!(
                "Your {kind_label} registration \"{}\" has been rejected.",
                request.business_name
            );
            if let Some(notes) = request.review_notes.as_deref().filter(|n| !n.trim().is_empty()) {
                message.push_str(&format!(" Reason: {notes}"));
            }
            ("Registration rejected".to_string(), message, NotificationKind::Error)
        }
        other => (
            "Registration status updated".to_string(),
            format!(
                "Your {kind_label} registration \"{}\" is now {}.",
                request.business_name,
                other.as_str().replace('_', " ")
            ),
            NotificationKind::Info,
        ),
    };

    NewNotification {
        user_id: request.user_id,
        title,
        message,
        kind,
        data: json!({
            "request_id": request.id,
            "business_type": request.business_type,
            "status": request.status,
            "review_notes": request.review_notes,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProfileRole, ProfileStatus};
    use crate::testing::{MemoryStore, RecordingPush};

    struct Harness {
        store: Arc<MemoryStore>,
        push: Arc<RecordingPush>,
        lifecycle: RequestLifecycle,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let push = Arc::new(RecordingPush::default());
        let lifecycle =
            RequestLifecycle::new(store.clone(), push.clone(), Duration::from_secs(2));
        Harness {
            store,
            push,
            lifecycle,
        }
    }

    fn command(
        request_id: Uuid,
        business_type: &str,
        status: &str,
        notes: Option<&str>,
        admin: Uuid,
    ) -> UpdateRequestStatusRequest {
        UpdateRequestStatusRequest {
            request_id,
            business_type: business_type.to_string(),
            status: status.to_string(),
            review_notes: notes.map(str::to_string),
            admin_user_id: admin,
        }
    }

    #[tokio::test]
    async fn non_admin_is_rejected_before_request_lookup() {
        let h = harness();
        let customer = h.store.add_profile(ProfileRole::Customer);

        let result = h
            .lifecycle
            .transition(command(Uuid::new_v4(), "restaurant", "approved", None, customer))
            .await;
        assert!(matches!(result, Err(ServiceError::Forbidden)));

        let unknown = h
            .lifecycle
            .transition(command(Uuid::new_v4(), "bakery", "approved", None, Uuid::new_v4()))
            .await;
        assert!(matches!(unknown, Err(ServiceError::Forbidden)));
    }

    #[tokio::test]
    async fn unknown_enum_values_are_validation_errors() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);

        let bad_type = h
            .lifecycle
            .transition(command(Uuid::new_v4(), "bakery", "approved", None, admin))
            .await;
        assert!(matches!(bad_type, Err(ServiceError::InvalidBusinessType(t)) if t == "bakery"));

        let bad_status = h
            .lifecycle
            .transition(command(Uuid::new_v4(), "clinic", "archived", None, admin))
            .await;
        assert!(matches!(bad_status, Err(ServiceError::InvalidStatus(s)) if s == "archived"));
    }

    #[tokio::test]
    async fn missing_request_is_not_found() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let result = h
            .lifecycle
            .transition(command(Uuid::new_v4(), "clinic", "approved", None, admin))
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn omitted_notes_keep_previous_notes() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        let request = h.store.add_request(owner, BusinessType::Pharmacy);

        h.lifecycle
            .transition(command(request.id, "pharmacy", "under_review", Some("License scan is blurry"), admin))
            .await
            .unwrap();
        let outcome = h
            .lifecycle
            .transition(command(request.id, "pharmacy", "rejected", None, admin))
            .await
            .unwrap();

        assert_eq!(
            outcome.request.request.review_notes.as_deref(),
            Some("License scan is blurry")
        );
        assert_eq!(outcome.request.request.status, RequestStatus::Rejected);
        assert_eq!(outcome.request.request.version, 2);
    }

    #[tokio::test]
    async fn only_approval_promotes_the_owner() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        let request = h.store.add_request(owner, BusinessType::Courier);

        for status in ["under_review", "rejected", "pending"] {
            let outcome = h
                .lifecycle
                .transition(command(request.id, "courier", status, None, admin))
                .await
                .unwrap();
            assert!(!outcome.side_effects.role_promoted);
            let profile = h.store.profile(owner).unwrap();
            assert_eq!(profile.role, ProfileRole::Customer);
            assert_eq!(profile.status, ProfileStatus::Pending);
        }

        let outcome = h
            .lifecycle
            .transition(command(request.id, "courier", "approved", None, admin))
            .await
            .unwrap();
        assert!(outcome.side_effects.role_promoted);
        let profile = h.store.profile(owner).unwrap();
        assert_eq!(profile.role, ProfileRole::Courier);
        assert_eq!(profile.status, ProfileStatus::Active);
        assert_eq!(outcome.request.owner.unwrap().role, ProfileRole::Courier);
    }

    #[tokio::test]
    async fn each_transition_appends_one_accurate_audit_entry() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        let first = h.store.add_request(owner, BusinessType::Restaurant);
        let second = h.store.add_request(owner, BusinessType::Driver);

        let steps = [
            (first.id, "restaurant", "under_review", "pending"),
            (second.id, "driver", "rejected", "pending"),
            (first.id, "restaurant", "approved", "under_review"),
            (first.id, "restaurant", "approved", "approved"),
        ];
        for (id, kind, status, _) in steps {
            h.lifecycle
                .transition(command(id, kind, status, None, admin))
                .await
                .unwrap();
        }

        let entries: Vec<_> = h
            .store
            .audit_entries()
            .into_iter()
            .filter(|e| e.action == "REQUEST_STATUS_UPDATED")
            .collect();
        assert_eq!(entries.len(), steps.len());
        for (entry, (id, kind, new, old)) in entries.iter().zip(steps) {
            assert_eq!(entry.user_id, Some(admin));
            assert_eq!(entry.table_name, format!("{kind}_requests"));
            assert_eq!(entry.record_id, Some(id.to_string()));
            assert_eq!(entry.old_values.as_ref().unwrap()["status"], old);
            assert_eq!(entry.new_values.as_ref().unwrap()["status"], new);
        }
    }

    #[tokio::test]
    async fn side_effect_failures_do_not_fail_the_transition() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        let request = h.store.add_request(owner, BusinessType::Clinic);
        h.store.fail_audit(true);
        h.store.fail_notifications(true);

        let outcome = h
            .lifecycle
            .transition(command(request.id, "clinic", "approved", None, admin))
            .await
            .unwrap();

        assert!(!outcome.side_effects.audit_logged);
        assert!(!outcome.side_effects.notification_created);
        assert_eq!(outcome.request.request.status, RequestStatus::Approved);
        assert_eq!(h.store.profile(owner).unwrap().role, ProfileRole::Clinic);
    }

    #[tokio::test]
    async fn primary_write_failure_aborts_without_side_effects() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        let request = h.store.add_request(owner, BusinessType::Supermarket);
        h.store.fail_transitions(true);

        let result = h
            .lifecycle
            .transition(command(request.id, "supermarket", "approved", None, admin))
            .await;

        assert!(matches!(result, Err(ServiceError::Dependency { .. })));
        assert!(h.store.audit_entries().is_empty());
        assert!(h.store.notifications().is_empty());
        assert_eq!(h.store.profile(owner).unwrap().role, ProfileRole::Customer);
        assert_eq!(
            h.store.request(BusinessType::Supermarket, request.id).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn stale_version_is_reported_as_conflict() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        let request = h.store.add_request(owner, BusinessType::Pharmacy);
        h.store.bump_version_on_next_transition();

        let result = h
            .lifecycle
            .transition(command(request.id, "pharmacy", "approved", None, admin))
            .await;
        assert!(matches!(result, Err(ServiceError::StaleWrite)));
        assert_eq!(h.store.profile(owner).unwrap().role, ProfileRole::Customer);
    }

    #[tokio::test]
    async fn owner_gets_notification_and_push() {
        let h = harness();
        let admin = h.store.add_profile(ProfileRole::Admin);
        let owner = h.store.add_profile(ProfileRole::Customer);
        h.store.register_token(owner, "device-token-1");
        let request = h.store.add_request(owner, BusinessType::Restaurant);

        let outcome = h
            .lifecycle
            .transition(command(request.id, "restaurant", "rejected", Some("Missing tax card"), admin))
            .await
            .unwrap();

        assert_eq!(outcome.side_effects.push_delivered, 1);
        let notifications = h.store.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].user_id, owner);
        assert_eq!(notifications[0].kind, NotificationKind::Error);
        assert!(notifications[0].message.contains("Reason: Missing tax card"));

        let sent = h.push.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PushTarget::Tokens(vec!["device-token-1".into()]));
        assert_eq!(sent[0].1.data["status"], "rejected");
    }

    #[test]
    fn notification_copy_follows_status() {
        let store = MemoryStore::new();
        let owner = store.add_profile(ProfileRole::Customer);
        let mut request = store.add_request(owner, BusinessType::Driver);

        request.status = RequestStatus::Approved;
        let approved = compose_notification(&request);
        assert_eq!(approved.kind, NotificationKind::Success);
        assert!(approved.message.contains("accepted"));

        request.status = RequestStatus::UnderReview;
        let info = compose_notification(&request);
        assert_eq!(info.kind, NotificationKind::Info);
        assert!(info.message.contains("under review"));
        assert_eq!(info.data["status"], "under_review");

        request.status = RequestStatus::Rejected;
        request.review_notes = None;
        let rejected = compose_notification(&request);
        assert_eq!(rejected.kind, NotificationKind::Error);
        assert!(!rejected.message.contains("Reason"));
    }
}
