//! Explicit account-type changes by operators.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{AuditAction, ChangeAccountTypeRequest, NewAuditLogEntry, ProfileRole};
use crate::store::{bounded, RequestStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountTypeChange {
    pub user_id: Uuid,
    pub previous_account_type: ProfileRole,
    pub account_type: ProfileRole,
}

/// Sets a profile's role. Callers are authenticated by shared secret before this runs.
pub async fn change_account_type(
    store: &Arc<dyn RequestStore>,
    call_timeout: Duration,
    command: ChangeAccountTypeRequest,
) -> Result<AccountTypeChange, ServiceError> {
    let role: ProfileRole = command
        .account_type
        .parse()
        .map_err(|_| ServiceError::InvalidAccountType(command.account_type.clone()))?;

    let profile = bounded(call_timeout, "load profile", store.get_profile(command.user_id))
        .await?
        .ok_or_else(|| ServiceError::NotFound("User".into()))?;

    if profile.role == role {
        return Err(ServiceError::Conflict {
            message: "Account type is already set to this value".into(),
            current_value: role.to_string(),
        });
    }

    let updated = bounded(
        call_timeout,
        "update account type",
        store.set_profile_role(profile.id, role),
    )
    .await?;

    log::info!(
        "Account type of {} changed {} -> {}",
        updated.id,
        profile.role,
        updated.role
    );

    // No actor identity on this path; the entry is attributed to the target profile.
    let entry = NewAuditLogEntry::by(updated.id, AuditAction::AccountTypeChanged)
        .on_record("profiles", updated.id)
        .with_old(json!({ "role": profile.role }))
        .with_new(json!({ "role": updated.role }));
    if let Err(err) = bounded(call_timeout, "append audit entry", store.append_audit(entry)).await {
        log::warn!("Account type audit for {} not written: {err}", updated.id);
    }

    Ok(AccountTypeChange {
        user_id: updated.id,
        previous_account_type: profile.role,
        account_type: updated.role,
    })
}
