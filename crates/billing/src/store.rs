//! Local record store ports
//!
//! Subscription Records, Account Records and Local Plans live behind
//! [`BillingStore`]; user identities and their entitlement labels behind
//! [`IdentityStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use wplib_shared::{PlanLimits, SubscriptionStatus, ADMIN_LABEL};

use crate::error::BillingResult;

/// Where a record's plan came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    #[default]
    Catalog,
    Local,
}

/// Typed view of the record's JSON metadata column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordMetadata {
    pub limits: PlanLimits,
    pub source: RecordSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub cancel_at_period_end: bool,
}

/// Everything the Synchronizer overwrites on a Subscription Record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    pub user_id: Uuid,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    /// Catalog product id, or the Local Plan id
    pub plan_id: String,
    pub price_id: Option<String>,
    /// `None` once the subscription is canceled
    pub plan_label: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub never_expires: bool,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: SubscriptionState,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRecord {
    pub user_id: Uuid,
    pub stripe_customer_id: Option<String>,
    pub current_plan: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Administrator-authored plan with no billing-provider price
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalPlan {
    pub id: Uuid,
    pub label: String,
    pub name: String,
    pub description: Option<String>,
    pub limits: PlanLimits,
    pub never_expires: bool,
    /// Set once the plan has been migrated into the catalog
    pub catalog_product_id: Option<String>,
    pub catalog_price_ids: Vec<String>,
}

impl LocalPlan {
    /// Product and prices both published. A product without prices is a
    /// migration that stopped part way and can be resumed.
    pub fn is_migrated(&self) -> bool {
        self.catalog_product_id.is_some() && !self.catalog_price_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: String,
    pub labels: Vec<String>,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.labels.iter().any(|l| l == ADMIN_LABEL)
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn find_subscription_by_provider_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn insert_subscription(
        &self,
        state: &SubscriptionState,
    ) -> BillingResult<SubscriptionRecord>;

    /// Overwrite every field of an existing record
    async fn update_subscription(
        &self,
        id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<SubscriptionRecord>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn list_subscriptions_by_label(
        &self,
        plan_label: &str,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn get_account(&self, user_id: Uuid) -> BillingResult<Option<AccountRecord>>;

    /// Create or update the account's plan pointer. A `None` customer id
    /// leaves the stored one untouched.
    async fn upsert_account(
        &self,
        user_id: Uuid,
        stripe_customer_id: Option<&str>,
        current_plan: Option<&str>,
    ) -> BillingResult<AccountRecord>;

    async fn list_accounts(&self) -> BillingResult<Vec<AccountRecord>>;

    async fn get_local_plan(&self, id: Uuid) -> BillingResult<Option<LocalPlan>>;

    async fn set_local_plan_catalog_ids(
        &self,
        id: Uuid,
        product_id: &str,
        price_ids: &[String],
    ) -> BillingResult<LocalPlan>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>>;

    /// Case-insensitive email lookup
    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>>;

    /// Replace the user's whole label set
    async fn set_labels(&self, user_id: Uuid, labels: &[String]) -> BillingResult<()>;
}
