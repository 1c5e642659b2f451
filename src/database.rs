use std::{borrow::Cow, collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    types::Json,
    Connection, Executor, PgPool, Postgres, QueryBuilder,
};
use uuid::Uuid;

use crate::models::{
    BusinessDetails, BusinessRequest, BusinessType, NewAuditLogEntry, NewBusinessRequest,
    NewNotification, Notification, OwnerSummary, ProfileRole, RequestFilter, RequestPage,
    RequestStatus, RequestWithOwner, StoredDocument, UserProfile,
};
use crate::store::{RequestStore, StatusTransition, StoreError};

const REQUEST_COLUMNS: &str = r#"
    id,
    business_type,
    user_id,
    business_name,
    contact_phone,
    contact_email,
    address,
    details,
    documents,
    status,
    review_notes,
    reviewed_by,
    reviewed_at,
    version,
    created_at,
    updated_at
"#;

const PROFILE_COLUMNS: &str =
    "id, full_name, email, phone, role, status, created_at, updated_at";

/// Unified read-only view over every `<type>_requests` table.
const ALL_REQUESTS_VIEW: &str = "all_business_requests";

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    business_type: BusinessType,
    user_id: Uuid,
    business_name: String,
    contact_phone: Option<String>,
    contact_email: Option<String>,
    address: Option<String>,
    details: Value,
    documents: Json<BTreeMap<String, StoredDocument>>,
    status: RequestStatus,
    review_notes: Option<String>,
    reviewed_by: Option<Uuid>,
    reviewed_at: Option<chrono::DateTime<chrono::Utc>>,
    version: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<RequestRow> for BusinessRequest {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let details = BusinessDetails::parse(row.business_type, row.details)
            .map_err(|err| StoreError::Database(sqlx::Error::Decode(Box::new(err))))?;

        Ok(BusinessRequest {
            id: row.id,
            business_type: row.business_type,
            user_id: row.user_id,
            business_name: row.business_name,
            contact_phone: row.contact_phone,
            contact_email: row.contact_email,
            address: row.address,
            details,
            documents: row.documents.0,
            status: row.status,
            review_notes: row.review_notes,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RequestOwnerRow {
    #[sqlx(flatten)]
    request: RequestRow,
    owner_full_name: Option<String>,
    owner_email: Option<String>,
    owner_phone: Option<String>,
    owner_role: Option<ProfileRole>,
}

impl RequestOwnerRow {
    fn into_request_with_owner(self) -> Result<RequestWithOwner, StoreError> {
        let owner = self.owner_role.map(|role| OwnerSummary {
            full_name: self.owner_full_name,
            email: self.owner_email,
            phone: self.owner_phone,
            role,
        });
        Ok(RequestWithOwner {
            request: self.request.try_into()?,
            owner,
        })
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(600)))
            .test_before_acquire(true);

        let pool = match options.clone().connect(database_url).await {
            Ok(pool) => pool,
            Err(sqlx::Error::Database(db_err)) if db_err.code() == Some(Cow::Borrowed("3D000")) => {
                log::info!("Database missing, attempting to create it");
                create_database_if_missing(database_url).await?;
                options.connect(database_url).await?
            }
            Err(err) => return Err(err),
        };

        // Run embedded migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn request_exists(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let sql = format!("SELECT 1 FROM {} WHERE id = $1", business_type.table_name());
        let row: Option<(i32,)> = sqlx::query_as(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a RequestFilter) {
    builder.push(" WHERE TRUE");
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status);
    }
}

#[async_trait]
impl RequestStore for Database {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1");
        let profile = sqlx::query_as::<_, UserProfile>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    async fn get_request(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<Option<BusinessRequest>, StoreError> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM {} WHERE id = $1",
            business_type.table_name()
        );
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BusinessRequest::try_from).transpose()
    }

    async fn get_request_with_owner(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
    ) -> Result<Option<RequestWithOwner>, StoreError> {
        let sql = format!(
            r#"
            SELECT
                r.id,
                r.business_type,
                r.user_id,
                r.business_name,
                r.contact_phone,
                r.contact_email,
                r.address,
                r.details,
                r.documents,
                r.status,
                r.review_notes,
                r.reviewed_by,
                r.reviewed_at,
                r.version,
                r.created_at,
                r.updated_at,
                p.full_name AS owner_full_name,
                p.email AS owner_email,
                p.phone AS owner_phone,
                p.role AS owner_role
            FROM {} r
            LEFT JOIN profiles p ON p.id = r.user_id
            WHERE r.id = $1
            "#,
            business_type.table_name()
        );
        let row = sqlx::query_as::<_, RequestOwnerRow>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RequestOwnerRow::into_request_with_owner).transpose()
    }

    async fn insert_request(
        &self,
        request: NewBusinessRequest,
    ) -> Result<BusinessRequest, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                id,
                user_id,
                business_name,
                contact_phone,
                contact_email,
                address,
                details,
                documents,
                status,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, '{{}}'::jsonb, 'pending', $8, $8)
            RETURNING {REQUEST_COLUMNS}
            "#,
            request.business_type().table_name()
        );

        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(request.id)
            .bind(request.user_id)
            .bind(&request.business_name)
            .bind(&request.contact_phone)
            .bind(&request.contact_email)
            .bind(&request.address)
            .bind(request.details.to_value())
            .bind(request.created_at)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<RequestPage, StoreError> {
        let source = filter
            .business_type
            .map(BusinessType::table_name)
            .unwrap_or(ALL_REQUESTS_VIEW);

        let mut count = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {source}"));
        push_filters(&mut count, filter);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut page =
            QueryBuilder::<Postgres>::new(format!("SELECT {REQUEST_COLUMNS} FROM {source}"));
        push_filters(&mut page, filter);
        page.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows: Vec<RequestRow> = page.build_query_as().fetch_all(&self.pool).await?;
        let requests = rows
            .into_iter()
            .map(BusinessRequest::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RequestPage { requests, total })
    }

    async fn apply_transition(
        &self,
        transition: &StatusTransition,
    ) -> Result<BusinessRequest, StoreError> {
        let table = transition.business_type.table_name();
        let mut tx = self.pool.begin().await?;

        let updated = {
            let sql = format!(
                r#"
                UPDATE {table}
                SET
                    status = $2,
                    review_notes = COALESCE($3, review_notes),
                    reviewed_by = $4,
                    reviewed_at = $5,
                    updated_at = $5,
                    version = version + 1
                WHERE id = $1 AND version = $6
                RETURNING {REQUEST_COLUMNS}
                "#
            );
            let conn = &mut *tx;
            sqlx::query_as::<_, RequestRow>(&sql)
                .bind(transition.request_id)
                .bind(transition.new_status)
                .bind(transition.review_notes.as_deref())
                .bind(transition.reviewed_by)
                .bind(transition.reviewed_at)
                .bind(transition.expected_version)
                .fetch_optional(conn)
                .await?
        };

        let Some(updated) = updated else {
            tx.rollback().await?;
            return if self
                .request_exists(transition.business_type, transition.request_id)
                .await?
            {
                Err(StoreError::VersionConflict {
                    table,
                    id: transition.request_id,
                })
            } else {
                Err(StoreError::Missing("Request".into()))
            };
        };

        if let Some(owner_id) = transition.promote_owner {
            let conn = &mut *tx;
            let result = sqlx::query(
                r#"
                UPDATE profiles
                SET role = $2, status = 'active', updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(owner_id)
            .bind(ProfileRole::from(transition.business_type))
            .execute(conn)
            .await?;

            if result.rows_affected() == 0 {
                log::warn!(
                    "Approved {} request {} but owner profile {} does not exist",
                    transition.business_type,
                    transition.request_id,
                    owner_id
                );
            }
        }

        tx.commit().await?;

        updated.try_into()
    }

    async fn attach_documents(
        &self,
        business_type: BusinessType,
        request_id: Uuid,
        documents: &BTreeMap<String, StoredDocument>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET documents = documents || $2, updated_at = NOW()
            WHERE id = $1
            "#,
            business_type.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(request_id)
            .bind(Json(documents))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing("Request".into()));
        }
        Ok(())
    }

    async fn set_profile_role(
        &self,
        user_id: Uuid,
        role: ProfileRole,
    ) -> Result<UserProfile, StoreError> {
        let sql = format!(
            r#"
            UPDATE profiles
            SET role = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {PROFILE_COLUMNS}
            "#
        );
        sqlx::query_as::<_, UserProfile>(&sql)
            .bind(user_id)
            .bind(role)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::Missing("Profile".into()))
    }

    async fn append_audit(&self, entry: NewAuditLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                user_id,
                action,
                table_name,
                record_id,
                old_values,
                new_values
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.table_name)
        .bind(&entry.record_id)
        .bind(&entry.old_values)
        .bind(&entry.new_values)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, StoreError> {
        let record = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (user_id, title, message, type, data)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, title, message, type, data, is_read, created_at
            "#,
        )
        .bind(notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind)
        .bind(&notification.data)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn push_tokens_for_user(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let tokens: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT token
            FROM push_tokens
            WHERE user_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens.into_iter().map(|(token,)| token).collect())
    }
}

async fn create_database_if_missing(database_url: &str) -> Result<(), sqlx::Error> {
    let options: PgConnectOptions = database_url.parse()?;
    let database_name = options
        .get_database()
        .map(|name| name.to_string())
        .unwrap_or_else(|| "postgres".to_string());

    // Already targeting the maintenance database.
    if database_name.eq_ignore_ascii_case("postgres") {
        return Ok(());
    }

    let maintenance_options = options.clone().database("postgres");

    let mut connection = sqlx::postgres::PgConnection::connect_with(&maintenance_options).await?;

    let escaped_name = database_name.replace('"', "\"\"");
    let create_stmt = format!("CREATE DATABASE \"{}\"", escaped_name);

    match connection.execute(create_stmt.as_str()).await {
        Ok(_) => {
            log::info!("Created database '{}'", database_name);
            Ok(())
        }
        Err(sqlx::Error::Database(db_err)) if db_err.code() == Some(Cow::Borrowed("42P04")) => {
            log::info!("Database '{}' already exists", database_name);
            Ok(())
        }
        Err(err) => Err(err),
    }
}
