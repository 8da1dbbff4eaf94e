//! Billing provider port
//!
//! Everything the engine asks of the billing provider goes through
//! [`BillingProvider`]. Implementations hand back normalized domain types;
//! wire shapes never leak past the adapter.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;
use wplib_shared::SubscriptionStatus;

use crate::catalog::{BillingInterval, CatalogPrice, CatalogProduct};
use crate::error::BillingResult;

/// Metadata key carrying the local user id on provider objects
pub const METADATA_USER_ID: &str = "user_id";
/// Key written by the previous identity backend; read-only
pub const LEGACY_METADATA_USER_ID: &str = "appwrite_user_id";
/// Metadata key carrying the entitlement label the checkout was created for
pub const METADATA_PLAN_LABEL: &str = "plan_label";
pub const METADATA_PRICE_ID: &str = "price_id";

/// Read the local user id out of provider metadata
pub fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get(METADATA_USER_ID)
        .or_else(|| metadata.get(LEGACY_METADATA_USER_ID))
        .and_then(|id| Uuid::parse_str(id.trim()).ok())
}

/// A subscription as the billing provider sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub items: Vec<ProviderSubscriptionItem>,
    pub metadata: HashMap<String, String>,
    pub schedule_id: Option<String>,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSubscriptionItem {
    pub id: String,
    pub price_id: String,
}

impl ProviderSubscription {
    /// The item whose price determines the plan
    pub fn primary_item(&self) -> Option<&ProviderSubscriptionItem> {
        self.items.first()
    }

    pub fn price_id(&self) -> Option<&str> {
        self.primary_item().map(|item| item.price_id.as_str())
    }

    pub fn user_id(&self) -> Option<Uuid> {
        user_id_from_metadata(&self.metadata)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One page of a provider listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub has_more: bool,
}

/// A phase of a subscription schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulePhase {
    pub price_id: String,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSchedule {
    pub id: String,
    pub subscription_id: Option<String>,
    /// Bounds of the phase in effect right now
    pub current_phase: Option<PhaseWindow>,
    pub phases: Vec<SchedulePhase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseWindow {
    pub start_date: i64,
    pub end_date: i64,
}

/// Proration behavior applied to an in-place price change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationMode {
    /// Prorate and invoice the difference right away
    AlwaysInvoice,
    CreateProrations,
    None,
}

#[derive(Debug, Clone)]
pub struct InvoicePreviewRequest {
    pub customer_id: String,
    pub subscription_id: String,
    pub item_id: String,
    pub new_price_id: String,
    /// Proration cut-over instant (epoch seconds)
    pub proration_date: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoicePreview {
    /// Minor currency units
    pub amount_due: i64,
    pub currency: String,
    pub next_payment_date: Option<i64>,
    pub lines: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceLine {
    pub description: Option<String>,
    pub amount: i64,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Copied onto both the session and the subscription it creates
    pub metadata: HashMap<String, String>,
}

/// A provider-hosted page the caller is redirected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostedSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub email: String,
    pub name: Option<String>,
    pub user_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewPrice {
    pub product_id: String,
    pub currency: String,
    pub unit_amount: i64,
    pub interval: BillingInterval,
    pub interval_count: u32,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    // Catalog
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<CatalogPrice>;
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<CatalogProduct>;
    async fn list_active_prices(&self) -> BillingResult<Vec<CatalogPrice>>;
    async fn create_product(&self, product: &NewProduct) -> BillingResult<CatalogProduct>;
    async fn create_price(&self, price: &NewPrice) -> BillingResult<CatalogPrice>;

    // Customers
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer>;
    async fn create_customer(&self, customer: &NewCustomer) -> BillingResult<ProviderCustomer>;

    // Subscriptions
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// List subscriptions in every status, newest first
    async fn list_subscriptions(
        &self,
        starting_after: Option<&str>,
    ) -> BillingResult<Page<ProviderSubscription>>;

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        proration: ProrationMode,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription>;

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription>;

    // Subscription schedules
    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSchedule>;
    async fn retrieve_schedule(&self, schedule_id: &str) -> BillingResult<SubscriptionSchedule>;
    async fn update_schedule_phases(
        &self,
        schedule_id: &str,
        phases: &[SchedulePhase],
    ) -> BillingResult<SubscriptionSchedule>;
    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()>;

    // Invoices
    async fn preview_invoice(&self, request: &InvoicePreviewRequest)
        -> BillingResult<InvoicePreview>;

    // Hosted pages
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<HostedSession>;
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<HostedSession>;
}
