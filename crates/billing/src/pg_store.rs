//! Postgres-backed record and identity stores

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;
use wplib_shared::{PlanLimits, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::store::{
    AccountRecord, BillingStore, IdentityStore, LocalPlan, RecordMetadata, SubscriptionRecord,
    SubscriptionState, UserProfile,
};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, user_name, user_email, plan_id, price_id, \
     plan_label, stripe_customer_id, stripe_subscription_id, status, current_period_start, \
     current_period_end, never_expires, metadata, updated_at";

const LOCAL_PLAN_COLUMNS: &str = "id, label, name, description, sites_limit, library_limit, \
     storage_limit, never_expires, catalog_product_id, catalog_price_ids";

/// Row type for the subscriptions table
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    user_name: Option<String>,
    user_email: Option<String>,
    plan_id: String,
    price_id: Option<String>,
    plan_label: Option<String>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    never_expires: bool,
    metadata: Json<RecordMetadata>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let status = row
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Database(format!("subscription {}: {}", row.id, e)))?;

        Ok(SubscriptionRecord {
            id: row.id,
            state: SubscriptionState {
                user_id: row.user_id,
                user_name: row.user_name,
                user_email: row.user_email,
                plan_id: row.plan_id,
                price_id: row.price_id,
                plan_label: row.plan_label,
                stripe_customer_id: row.stripe_customer_id,
                stripe_subscription_id: row.stripe_subscription_id,
                status,
                current_period_start: row.current_period_start,
                current_period_end: row.current_period_end,
                never_expires: row.never_expires,
                metadata: row.metadata.0,
            },
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    user_id: Uuid,
    stripe_customer_id: Option<String>,
    current_plan: Option<String>,
    updated_at: OffsetDateTime,
}

impl From<AccountRow> for AccountRecord {
    fn from(row: AccountRow) -> Self {
        AccountRecord {
            user_id: row.user_id,
            stripe_customer_id: row.stripe_customer_id,
            current_plan: row.current_plan,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LocalPlanRow {
    id: Uuid,
    label: String,
    name: String,
    description: Option<String>,
    sites_limit: Option<i32>,
    library_limit: Option<i32>,
    storage_limit: Option<i32>,
    never_expires: bool,
    catalog_product_id: Option<String>,
    catalog_price_ids: Vec<String>,
}

/// Negative limits in the table mean "unset"
fn limit(value: Option<i32>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

impl From<LocalPlanRow> for LocalPlan {
    fn from(row: LocalPlanRow) -> Self {
        LocalPlan {
            id: row.id,
            label: row.label,
            name: row.name,
            description: row.description,
            limits: PlanLimits {
                sites: limit(row.sites_limit),
                library: limit(row.library_limit),
                storage: limit(row.storage_limit),
            },
            never_expires: row.never_expires,
            catalog_product_id: row.catalog_product_id,
            catalog_price_ids: row.catalog_price_ids,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: Option<String>,
    email: String,
    labels: Vec<String>,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        UserProfile {
            id: row.id,
            name: row.name,
            email: row.email,
            labels: row.labels,
        }
    }
}

/// One unique-constraint violation is a conflict, not a database failure
fn map_write_error(err: sqlx::Error, what: &str) -> BillingError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return BillingError::Conflict(format!("{} already exists", what));
        }
    }
    BillingError::from(err)
}

/// Postgres implementation of both store ports
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn find_subscription_by_provider_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!("SELECT {} FROM subscriptions WHERE user_id = $1", SUBSCRIPTION_COLUMNS);
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn insert_subscription(
        &self,
        state: &SubscriptionState,
    ) -> BillingResult<SubscriptionRecord> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, user_name, user_email, plan_id, price_id, plan_label,
                stripe_customer_id, stripe_subscription_id, status, current_period_start,
                current_period_end, never_expires, metadata, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: SubscriptionRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(state.user_id)
            .bind(&state.user_name)
            .bind(&state.user_email)
            .bind(&state.plan_id)
            .bind(&state.price_id)
            .bind(&state.plan_label)
            .bind(&state.stripe_customer_id)
            .bind(&state.stripe_subscription_id)
            .bind(state.status.as_str())
            .bind(state.current_period_start)
            .bind(state.current_period_end)
            .bind(state.never_expires)
            .bind(Json(&state.metadata))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_write_error(e, &format!("Subscription record for user {}", state.user_id)))?;

        SubscriptionRecord::try_from(row)
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<SubscriptionRecord> {
        let sql = format!(
            r#"
            UPDATE subscriptions SET
                user_id = $2,
                user_name = $3,
                user_email = $4,
                plan_id = $5,
                price_id = $6,
                plan_label = $7,
                stripe_customer_id = $8,
                stripe_subscription_id = $9,
                status = $10,
                current_period_start = $11,
                current_period_end = $12,
                never_expires = $13,
                metadata = $14,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(state.user_id)
            .bind(&state.user_name)
            .bind(&state.user_email)
            .bind(&state.plan_id)
            .bind(&state.price_id)
            .bind(&state.plan_label)
            .bind(&state.stripe_customer_id)
            .bind(&state.stripe_subscription_id)
            .bind(state.status.as_str())
            .bind(state.current_period_start)
            .bind(state.current_period_end)
            .bind(state.never_expires)
            .bind(Json(&state.metadata))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_write_error(e, &format!("Subscription record {}", id)))?;

        row.map(SubscriptionRecord::try_from)
            .transpose()?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription record {}", id)))
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions ORDER BY updated_at DESC",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SubscriptionRecord::try_from)
            .collect()
    }

    async fn list_subscriptions_by_label(
        &self,
        plan_label: &str,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE plan_label = $1 ORDER BY updated_at DESC",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(plan_label)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SubscriptionRecord::try_from)
            .collect()
    }

    async fn get_account(&self, user_id: Uuid) -> BillingResult<Option<AccountRecord>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT user_id, stripe_customer_id, current_plan, updated_at
            FROM accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AccountRecord::from))
    }

    async fn upsert_account(
        &self,
        user_id: Uuid,
        stripe_customer_id: Option<&str>,
        current_plan: Option<&str>,
    ) -> BillingResult<AccountRecord> {
        let row: AccountRow = sqlx::query_as(
            r#"
            INSERT INTO accounts (user_id, stripe_customer_id, current_plan, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, accounts.stripe_customer_id),
                current_plan = EXCLUDED.current_plan,
                updated_at = NOW()
            RETURNING user_id, stripe_customer_id, current_plan, updated_at
            "#,
        )
        .bind(user_id)
        .bind(stripe_customer_id)
        .bind(current_plan)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list_accounts(&self) -> BillingResult<Vec<AccountRecord>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            "SELECT user_id, stripe_customer_id, current_plan, updated_at FROM accounts",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AccountRecord::from).collect())
    }

    async fn get_local_plan(&self, id: Uuid) -> BillingResult<Option<LocalPlan>> {
        let sql = format!("SELECT {} FROM local_plans WHERE id = $1", LOCAL_PLAN_COLUMNS);
        let row: Option<LocalPlanRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(LocalPlan::from))
    }

    async fn set_local_plan_catalog_ids(
        &self,
        id: Uuid,
        product_id: &str,
        price_ids: &[String],
    ) -> BillingResult<LocalPlan> {
        let sql = format!(
            r#"
            UPDATE local_plans
            SET catalog_product_id = $2, catalog_price_ids = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            LOCAL_PLAN_COLUMNS
        );
        let row: Option<LocalPlanRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(product_id)
            .bind(price_ids)
            .fetch_optional(&self.pool)
            .await?;

        row.map(LocalPlan::from)
            .ok_or_else(|| BillingError::NotFound(format!("Local plan {}", id)))
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, name, email, labels FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(UserProfile::from))
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, name, email, labels
            FROM users
            WHERE LOWER(email) = LOWER($1)
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserProfile::from))
    }

    async fn set_labels(&self, user_id: Uuid, labels: &[String]) -> BillingResult<()> {
        let result = sqlx::query("UPDATE users SET labels = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(labels)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("User {}", user_id)));
        }
        Ok(())
    }
}
