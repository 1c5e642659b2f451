use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

// ============================================================================
// ENUMS
// ============================================================================

/// Registrant category. Each variant owns a request table and a document bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(type_name = "business_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    Restaurant,
    Supermarket,
    Pharmacy,
    Clinic,
    Courier,
    Driver,
}

impl BusinessType {
    pub const ALL: [BusinessType; 6] = [
        BusinessType::Restaurant,
        BusinessType::Supermarket,
        BusinessType::Pharmacy,
        BusinessType::Clinic,
        BusinessType::Courier,
        BusinessType::Driver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BusinessType::Restaurant => "restaurant",
            BusinessType::Supermarket => "supermarket",
            BusinessType::Pharmacy => "pharmacy",
            BusinessType::Clinic => "clinic",
            BusinessType::Courier => "courier",
            BusinessType::Driver => "driver",
        }
    }

    /// Physical table holding this type's requests.
    pub fn table_name(self) -> &'static str {
        match self {
            BusinessType::Restaurant => "restaurant_requests",
            BusinessType::Supermarket => "supermarket_requests",
            BusinessType::Pharmacy => "pharmacy_requests",
            BusinessType::Clinic => "clinic_requests",
            BusinessType::Courier => "courier_requests",
            BusinessType::Driver => "driver_requests",
        }
    }

    pub fn valid_values() -> Vec<&'static str> {
        Self::ALL.iter().map(|kind| kind.as_str()).collect()
    }
}

impl fmt::Display for BusinessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusinessType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownVariant(value.to_string()))
    }
}

/// Review status of a registration request (also a Postgres enum)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "request_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    UnderReview,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Pending,
        RequestStatus::Approved,
        RequestStatus::Rejected,
        RequestStatus::UnderReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::UnderReview => "under_review",
        }
    }

    pub fn valid_values() -> Vec<&'static str> {
        Self::ALL.iter().map(|status| status.as_str()).collect()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownVariant(value.to_string()))
    }
}

/// Returned when text does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct UnknownVariant(pub String);

/// Account type tag carried by a profile
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "account_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProfileRole {
    Customer,
    Admin,
    Restaurant,
    Supermarket,
    Pharmacy,
    Clinic,
    Courier,
    Driver,
}

impl ProfileRole {
    pub const ALL: [ProfileRole; 8] = [
        ProfileRole::Customer,
        ProfileRole::Admin,
        ProfileRole::Restaurant,
        ProfileRole::Supermarket,
        ProfileRole::Pharmacy,
        ProfileRole::Clinic,
        ProfileRole::Courier,
        ProfileRole::Driver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileRole::Customer => "customer",
            ProfileRole::Admin => "admin",
            ProfileRole::Restaurant => "restaurant",
            ProfileRole::Supermarket => "supermarket",
            ProfileRole::Pharmacy => "pharmacy",
            ProfileRole::Clinic => "clinic",
            ProfileRole::Courier => "courier",
            ProfileRole::Driver => "driver",
        }
    }

    pub fn valid_values() -> Vec<&'static str> {
        Self::ALL.iter().map(|role| role.as_str()).collect()
    }
}

impl From<BusinessType> for ProfileRole {
    fn from(kind: BusinessType) -> Self {
        match kind {
            BusinessType::Restaurant => ProfileRole::Restaurant,
            BusinessType::Supermarket => ProfileRole::Supermarket,
            BusinessType::Pharmacy => ProfileRole::Pharmacy,
            BusinessType::Clinic => ProfileRole::Clinic,
            BusinessType::Courier => ProfileRole::Courier,
            BusinessType::Driver => ProfileRole::Driver,
        }
    }
}

impl fmt::Display for ProfileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileRole {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == value)
            .ok_or_else(|| UnknownVariant(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "profile_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Pending,
    Active,
    Suspended,
}

/// Severity tag of an in-app notification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "notification_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
}

/// Symbolic audit actions written by this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    RequestSubmitted,
    RequestStatusUpdated,
    DocumentsUploaded,
    AccountTypeChanged,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::RequestSubmitted => "REQUEST_SUBMITTED",
            AuditAction::RequestStatusUpdated => "REQUEST_STATUS_UPDATED",
            AuditAction::DocumentsUploaded => "DOCUMENTS_UPLOADED",
            AuditAction::AccountTypeChanged => "ACCOUNT_TYPE_CHANGED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// BUSINESS DETAILS (per-type attribute schemas)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RestaurantDetails {
    #[validate(length(min = 2, max = 80))]
    pub cuisine_type: String,
    #[validate(range(min = 1, max = 5000))]
    pub seating_capacity: Option<u32>,
    pub opening_hours: Option<String>,
    #[serde(default)]
    pub offers_delivery: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SupermarketDetails {
    pub store_size: Option<String>,
    #[validate(range(min = 1, max = 1000))]
    pub branch_count: Option<u32>,
    #[serde(default)]
    pub offers_delivery: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PharmacyDetails {
    #[validate(length(min = 3, max = 64))]
    pub license_number: String,
    #[validate(length(min = 3, max = 120))]
    pub pharmacist_name: String,
    #[serde(default)]
    pub open_24_hours: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ClinicDetails {
    #[validate(length(min = 2, max = 80))]
    pub specialty: String,
    #[validate(length(min = 3, max = 64))]
    pub license_number: String,
    #[validate(range(min = 1, max = 500))]
    pub doctor_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CourierDetails {
    #[validate(length(min = 2, max = 40))]
    pub vehicle_type: String,
    pub coverage_area: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DriverDetails {
    #[validate(length(min = 3, max = 64))]
    pub license_number: String,
    #[validate(length(min = 2, max = 80))]
    pub vehicle_model: String,
    #[validate(length(min = 2, max = 16))]
    pub plate_number: String,
}

/// Type-specific attributes of a request; the variant always matches the owning table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusinessDetails {
    Restaurant(RestaurantDetails),
    Supermarket(SupermarketDetails),
    Pharmacy(PharmacyDetails),
    Clinic(ClinicDetails),
    Courier(CourierDetails),
    Driver(DriverDetails),
}

impl BusinessDetails {
    /// Decode `value` with the schema of `kind`.
    pub fn parse(kind: BusinessType, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            BusinessType::Restaurant => Self::Restaurant(serde_json::from_value(value)?),
            BusinessType::Supermarket => Self::Supermarket(serde_json::from_value(value)?),
            BusinessType::Pharmacy => Self::Pharmacy(serde_json::from_value(value)?),
            BusinessType::Clinic => Self::Clinic(serde_json::from_value(value)?),
            BusinessType::Courier => Self::Courier(serde_json::from_value(value)?),
            BusinessType::Driver => Self::Driver(serde_json::from_value(value)?),
        })
    }

    pub fn business_type(&self) -> BusinessType {
        match self {
            Self::Restaurant(_) => BusinessType::Restaurant,
            Self::Supermarket(_) => BusinessType::Supermarket,
            Self::Pharmacy(_) => BusinessType::Pharmacy,
            Self::Clinic(_) => BusinessType::Clinic,
            Self::Courier(_) => BusinessType::Courier,
            Self::Driver(_) => BusinessType::Driver,
        }
    }

    pub fn validate(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            Self::Restaurant(details) => details.validate(),
            Self::Supermarket(details) => details.validate(),
            Self::Pharmacy(details) => details.validate(),
            Self::Clinic(details) => details.validate(),
            Self::Courier(details) => details.validate(),
            Self::Driver(details) => details.validate(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// BUSINESS REQUESTS
// ============================================================================

/// Descriptor of one stored verification document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Registration request as stored in its `<type>_requests` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusinessRequest {
    pub id: Uuid,
    pub business_type: BusinessType,
    pub user_id: Uuid,
    pub business_name: String,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub details: BusinessDetails,
    pub documents: BTreeMap<String, StoredDocument>,
    pub status: RequestStatus,
    pub review_notes: Option<String>,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Helper struct used when inserting a new request
#[derive(Debug, Clone)]
pub struct NewBusinessRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub business_name: String,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub details: BusinessDetails,
    pub created_at: DateTime<Utc>,
}

impl NewBusinessRequest {
    pub fn business_type(&self) -> BusinessType {
        self.details.business_type()
    }
}

/// Display fields of the request owner, joined onto reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OwnerSummary {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: ProfileRole,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestWithOwner {
    #[serde(flatten)]
    pub request: BusinessRequest,
    pub owner: Option<OwnerSummary>,
}

/// Filters for paginated request listings
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub user_id: Option<Uuid>,
    pub business_type: Option<BusinessType>,
    pub status: Option<RequestStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestPage {
    pub requests: Vec<BusinessRequest>,
    pub total: i64,
}

// ============================================================================
// PROFILES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: ProfileRole,
    pub status: ProfileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role == ProfileRole::Admin
    }
}

// ============================================================================
// AUDIT LOG & NOTIFICATIONS
// ============================================================================

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub table_name: String,
    pub record_id: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Audit entry waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditLogEntry {
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub table_name: String,
    pub record_id: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
}

impl NewAuditLogEntry {
    pub fn by(user_id: Uuid, action: AuditAction) -> Self {
        Self {
            user_id: Some(user_id),
            action,
            table_name: String::new(),
            record_id: None,
            old_values: None,
            new_values: None,
        }
    }

    pub fn on_record(mut self, table_name: impl Into<String>, record_id: impl ToString) -> Self {
        self.table_name = table_name.into();
        self.record_id = Some(record_id.to_string());
        self
    }

    pub fn on_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_old(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn with_new(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }
}

/// In-app notification feed row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub data: Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub data: Value,
}

// ============================================================================
// API PAYLOADS
// ============================================================================

/// Success envelope: `{ "success": true, ...data }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Body of `PUT /admin/update-request-status`.
///
/// Enum fields stay as text so they are validated after the actor is authorized.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequestStatusRequest {
    pub request_id: Uuid,
    pub business_type: String,
    pub status: String,
    pub review_notes: Option<String>,
    pub admin_user_id: Uuid,
}

/// Query string of `GET /business/get-requests`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRequestsQuery {
    pub user_id: Option<Uuid>,
    pub business_type: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub admin_view: bool,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// One document as sent in the JSON (base64) upload convention
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedDocument {
    #[serde(alias = "base64", alias = "file")]
    pub data: String,
    pub extension: Option<String>,
    #[serde(alias = "mime_type", alias = "contentType")]
    pub mime_type: Option<String>,
}

/// Body of `POST /business/submit-request`
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitRequestBody {
    pub user_id: Uuid,
    pub business_type: String,
    #[validate(length(min = 2, max = 120))]
    pub business_name: String,
    #[validate(length(min = 6, max = 32))]
    pub contact_phone: Option<String>,
    #[validate(email)]
    pub contact_email: Option<String>,
    #[validate(length(min = 5, max = 300))]
    pub address: Option<String>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub documents: HashMap<String, EncodedDocument>,
}

/// Body of the JSON upload endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDocumentsBody {
    #[serde(alias = "user_id")]
    pub user_id: Uuid,
    #[serde(alias = "business_type")]
    pub business_type: Option<String>,
    #[serde(alias = "request_id")]
    pub request_id: Option<Uuid>,
    pub documents: HashMap<String, EncodedDocument>,
}

/// Body of `POST /admin/change-account-type`
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeAccountTypeRequest {
    pub user_id: Uuid,
    pub account_type: String,
}

/// Body of `POST /push/send`
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PushSendRequest {
    pub tokens: Option<Vec<String>>,
    pub user_id: Option<Uuid>,
    pub topic: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 2000))]
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}
