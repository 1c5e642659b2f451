//! In-memory implementations of the store, blob and push seams for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::clients::push::{PushError, PushGateway, PushMessage, PushReport, PushTarget};
use crate::clients::storage::{BlobError, BlobStore, PutObject};
use crate::models::{
    AuditLogEntry, BusinessDetails, BusinessRequest, BusinessType, ClinicDetails, CourierDetails,
    DriverDetails, NewAuditLogEntry, NewBusinessRequest, NewNotification, Notification, OwnerSummary,
    PharmacyDetails, ProfileRole, ProfileStatus, RequestFilter, RequestPage, RequestStatus,
    RequestWithOwner, RestaurantDetails, StoredDocument, SupermarketDetails, UserProfile,
};
use crate::store::{RequestStore, StatusTransition, StoreError};

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<Uuid, UserProfile>,
    requests: HashMap<(BusinessType, Uuid), BusinessRequest>,
    audit: Vec<AuditLogEntry>,
    notifications: Vec<Notification>,
    tokens: HashMap<Uuid, Vec<String>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_audit: AtomicBool,
    fail_notifications: AtomicBool,
    fail_transitions: AtomicBool,
    race_next_transition: AtomicBool,
}

pub fn sample_details(kind: BusinessType) -> BusinessDetails {
    match kind {
        BusinessType::Restaurant => BusinessDetails::Restaurant(RestaurantDetails {
            cuisine_type: "Levantine".into(),
            seating_capacity: Some(40),
            opening_hours: Some("10:00-23:00".into()),
            offers_delivery: true,
        }),
        BusinessType::Supermarket => BusinessDetails::Supermarket(SupermarketDetails {
            store_size: Some("medium".into()),
            branch_count: Some(2),
            offers_delivery: false,
        }),
        BusinessType::Pharmacy => BusinessDetails::Pharmacy(PharmacyDetails {
            license_number: "PH-20931".into(),
            pharmacist_name: "Mona Adel".into(),
            open_24_hours: false,
        }),
        BusinessType::Clinic => BusinessDetails::Clinic(ClinicDetails {
            specialty: "Dermatology".into(),
            license_number: "CL-5521".into(),
            doctor_count: Some(3),
        }),
        BusinessType::Courier => BusinessDetails::Courier(CourierDetails {
            vehicle_type: "motorcycle".into(),
            coverage_area: Some("Nasr City".into()),
        }),
        BusinessType::Driver => BusinessDetails::Driver(DriverDetails {
            license_number: "DL-778812".into(),
            vehicle_model: "Hyundai Elantra".into(),
            plate_number: "ABC-123".into(),
        }),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_profile(&self, role: ProfileRole) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let status = if role == ProfileRole::Customer {
            ProfileStatus::Pending
        } else {
            ProfileStatus::Active
        };
        let profile = UserProfile {
            id,
            full_name: Some(format!("User {}", &id.to_string()[..8])),
            email: Some(format!("{}@example.com", &id.to_string()[..8])),
            phone: None,
            role,
            status,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().profiles.insert(id, profile);
        id
    }

    /// Seeds a pending request; successive calls get increasing `created_at`.
    pub fn add_request(&self, owner: Uuid, kind: BusinessType) -> BusinessRequest {
        let mut state = self.state.lock().unwrap();
        let created_at = Utc::now() + ChronoDuration::milliseconds(state.requests.len() as i64);
        let request = BusinessRequest {
            id: Uuid::new_v4(),
            business_type: kind,
            user_id: owner,
            business_name: format!("Test {kind}"),
            contact_phone: Some("+201000000000".into()),
            contact_email: None,
            address: None,
            details: sample_details(kind),
            documents: BTreeMap::new(),
            status: RequestStatus::Pending,
            review_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            version: 0,
            created_at,
            updated_at: created_at,
        };
        state.requests.insert((kind, request.id), request.clone());
        request
    }

    pub fn register_token(&self, user_id: Uuid, token: &str) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .entry(user_id)
            .or_default()
            .push(token.to_string());
    }

    pub fn profile(&self, id: Uuid) -> Option<UserProfile> {
        self.state.lock().unwrap().profiles.get(&id).cloned()
    }

    pub fn request(&self, kind: BusinessType, id: Uuid) -> Option<BusinessRequest> {
        self.state.lock().unwrap().requests.get(&(kind, id)).cloned()
    }

    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.state.lock().unwrap().audit.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().unwrap().notifications.clone()
    }

    pub fn fail_audit(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }

    pub fn fail_transitions(&self, fail: bool) {
        self.fail_transitions.store(fail, Ordering::SeqCst);
    }

    /// Simulates a concurrent writer landing between read and write.
    pub fn bump_version_on_next_transition(&self) {
        self.race_next_transition.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.profile(user_id))
    }

    async fn get_request(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<Option<BusinessRequest>, StoreError> {
        Ok(self.request(business_type, request_id))
    }

    async fn get_request_with_owner(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<Option<RequestWithOwner>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .requests
            .get(&(business_type, request_id))
            .map(|request| RequestWithOwner {
                owner: state
                    .profiles
                    .get(&request.user_id)
                    .map(owner_summary),
                request: request.clone(),
            }))
    }

    async fn insert_request(
        &self,
        request: NewBusinessRequest,
    ) -> Result<BusinessRequest, StoreError> {
        let kind = request.business_type();
        let stored = BusinessRequest {
            id: request.id,
            business_type: kind,
            user_id: request.user_id,
            business_name: request.business_name,
            contact_phone: request.contact_phone,
            contact_email: request.contact_email,
            address: request.address,
            details: request.details,
            documents: BTreeMap::new(),
            status: RequestStatus::Pending,
            review_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            version: 0,
            created_at: request.created_at,
            updated_at: request.created_at,
        };
        self.state
            .lock()
            .unwrap()
            .requests
            .insert((kind, stored.id), stored.clone());
        Ok(stored)
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<RequestPage, StoreError> {
        let state = self.state.lock().unwrap();
        let mut matching: Vec<BusinessRequest> = state
            .requests
            .values()
            .filter(|r| filter.user_id.map_or(true, |id| r.user_id == id))
            .filter(|r| filter.business_type.map_or(true, |k| r.business_type == k))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let requests = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();
        Ok(RequestPage { requests, total })
    }

    async fn apply_transition(
        &self,
        transition: &StatusTransition,
    ) -> Result<BusinessRequest, StoreError> {
        if self.fail_transitions.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }

        let mut state = self.state.lock().unwrap();
        let key = (transition.business_type, transition.request_id);
        let request = state
            .requests
            .get_mut(&key)
            .ok_or_else(|| StoreError::Missing("Request".into()))?;

        if self.race_next_transition.swap(false, Ordering::SeqCst) {
            request.version += 1;
        }
        if request.version != transition.expected_version {
            return Err(StoreError::VersionConflict {
                table: transition.business_type.table_name(),
                id: transition.request_id,
            });
        }

        request.status = transition.new_status;
        if let Some(notes) = &transition.review_notes {
            request.review_notes = Some(notes.clone());
        }
        request.reviewed_by = Some(transition.reviewed_by);
        request.reviewed_at = Some(transition.reviewed_at);
        request.version += 1;
        request.updated_at = Utc::now();
        let updated = request.clone();

        if let Some(owner) = transition.promote_owner {
            if let Some(profile) = state.profiles.get_mut(&owner) {
                profile.role = transition.business_type.into();
                profile.status = ProfileStatus::Active;
                profile.updated_at = Utc::now();
            }
        }

        Ok(updated)
    }

    async fn attach_documents(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
        documents: &BTreeMap<String, StoredDocument>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let request = state
            .requests
            .get_mut(&(business_type, request_id))
            .ok_or_else(|| StoreError::Missing("Request".into()))?;
        request
            .documents
            .extend(documents.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn set_profile_role(
        &self,
        user_id: Uuid,
        role: ProfileRole,
    ) -> Result<UserProfile, StoreError> {
        let mut state = self.state.lock().unwrap();
        let profile = state
            .profiles
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::Missing("User".into()))?;
        profile.role = role;
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }

    async fn append_audit(&self, entry: NewAuditLogEntry) -> Result<(), StoreError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit table locked".into()));
        }
        self.state.lock().unwrap().audit.push(AuditLogEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            action: entry.action.as_str().to_string(),
            table_name: entry.table_name,
            record_id: entry.record_id,
            old_values: entry.old_values,
            new_values: entry.new_values,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, StoreError> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("notifications unavailable".into()));
        }
        let stored = Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            title: notification.title,
            message: notification.message,
            kind: notification.kind,
            data: notification.data,
            is_read: false,
            created_at: Utc::now(),
        };
        self.state.lock().unwrap().notifications.push(stored.clone());
        Ok(stored)
    }

    async fn push_tokens_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tokens
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Blob store that keeps objects in memory and can reject chosen paths.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), (Vec<u8>, String)>>,
    reject_paths_containing: Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_paths_containing(&self, marker: &str) {
        self.reject_paths_containing
            .lock()
            .unwrap()
            .push(marker.to_string());
    }

    /// `(bucket, path, content_type, len)` for every stored object.
    pub fn objects(&self) -> Vec<(String, String, String, usize)> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|((bucket, path), (bytes, content_type))| {
                (bucket.clone(), path.clone(), content_type.clone(), bytes.len())
            })
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_object(&self, object: PutObject<'_>) -> Result<(), BlobError> {
        let rejected = self
            .reject_paths_containing
            .lock()
            .unwrap()
            .iter()
            .any(|marker| object.path.contains(marker.as_str()));
        if rejected {
            return Err(BlobError::Rejected {
                status: 500,
                message: "upstream write failed".into(),
            });
        }

        let key = (object.bucket.to_string(), object.path.to_string());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(BlobError::Rejected {
                status: 409,
                message: "The resource already exists".into(),
            });
        }
        objects.insert(key, (object.bytes, object.content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://blobs.test/public/{bucket}/{path}")
    }
}

/// Push gateway that records every send.
#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<(PushTarget, PushMessage)>>,
}

impl RecordingPush {
    pub fn sent(&self) -> Vec<(PushTarget, PushMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn send(
        &self,
        target: &PushTarget,
        message: &PushMessage,
    ) -> Result<PushReport, PushError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.clone(), message.clone()));
        let sent = match target {
            PushTarget::Tokens(tokens) => tokens.len(),
            PushTarget::Topic(_) => 1,
        };
        Ok(PushReport {
            sent,
            ..PushReport::default()
        })
    }
}

fn owner_summary(profile: &UserProfile) -> OwnerSummary {
    OwnerSummary {
        full_name: profile.full_name.clone(),
        email: profile.email.clone(),
        phone: profile.phone.clone(),
        role: profile.role,
    }
}
