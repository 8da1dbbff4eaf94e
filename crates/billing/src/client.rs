//! Stripe client configuration and the live [`BillingProvider`]
//!
//! Catalog reads and writes, customers, subscription listing and updates go
//! through `async-stripe`. Schedules, invoice previews and hosted sessions
//! are raw form-encoded REST decoded through the wire shapes, as is the
//! single-subscription read shared with webhook decoding.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CreateCustomer, CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval,
    CreateProduct, Currency, Customer, IdOrCreate, ListPrices, ListSubscriptions, Price, Product,
    RecurringInterval, Subscription, SubscriptionStatusFilter, UpdateSubscription,
    UpdateSubscriptionItems,
};
use wplib_shared::SubscriptionStatus;

use crate::catalog::{BillingInterval, CatalogPrice, CatalogProduct, Recurrence};
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CheckoutRequest, HostedSession, InvoicePreview, InvoicePreviewRequest,
    NewCustomer, NewPrice, NewProduct, Page, ProrationMode, ProviderCustomer,
    ProviderSubscription, ProviderSubscriptionItem, SchedulePhase, SubscriptionSchedule,
    METADATA_USER_ID,
};
use crate::webhooks::DEFAULT_TOLERANCE_SECS;
use crate::wire::{WireErrorBody, WireInvoice, WireSchedule, WireSession, WireSubscription};

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const LIST_LIMIT: u64 = 100;

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Scheme and host, without `/v1`
    pub api_base: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
    pub webhook_tolerance_secs: i64,
}

/// Where hosted pages send the customer back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingUrls {
    pub success_url: String,
    pub cancel_url: String,
    pub portal_return_url: String,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{} not set", key)))
        };
        let or_default = |key: &str, default: &str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let webhook_tolerance_secs = match get("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                BillingError::Config(format!("STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {}", raw))
            })?,
            None => DEFAULT_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            api_base: or_default("STRIPE_API_BASE", DEFAULT_API_BASE),
            checkout_success_url: or_default(
                "BILLING_SUCCESS_URL",
                "http://localhost:3000/billing?checkout=success",
            ),
            checkout_cancel_url: or_default(
                "BILLING_CANCEL_URL",
                "http://localhost:3000/billing?checkout=canceled",
            ),
            portal_return_url: or_default("BILLING_PORTAL_RETURN_URL", "http://localhost:3000/billing"),
            webhook_tolerance_secs,
        })
    }

    pub fn urls(&self) -> BillingUrls {
        BillingUrls {
            success_url: self.checkout_success_url.clone(),
            cancel_url: self.checkout_cancel_url.clone(),
            portal_return_url: self.portal_return_url.clone(),
        }
    }
}

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    http: reqwest::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::from_url(config.api_base.as_str(), config.secret_key.clone());
        Self {
            inner,
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> BillingResult<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;
        decode(path, response).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;
        decode(path, response).await
    }

    fn subscription_id(id: &str) -> BillingResult<stripe::SubscriptionId> {
        id.parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID {}: {}", id, e)))
    }

    fn price_id(id: &str) -> BillingResult<stripe::PriceId> {
        id.parse::<stripe::PriceId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid price ID {}: {}", id, e)))
    }

    fn product_id(id: &str) -> BillingResult<stripe::ProductId> {
        id.parse::<stripe::ProductId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid product ID {}: {}", id, e)))
    }

    fn customer_id(id: &str) -> BillingResult<stripe::CustomerId> {
        id.parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID {}: {}", id, e)))
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> BillingResult<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|e| {
            BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e))
        });
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<WireErrorBody>(&body)
        .ok()
        .and_then(|b| b.error.message)
        .unwrap_or(body);

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BillingError::NotFound(message));
    }

    tracing::error!(status = %status, path = %path, error = %message, "Stripe API request failed");
    Err(BillingError::StripeApi(format!("Stripe API error ({}): {}", status, message)))
}

/// 404s from the typed client become `NotFound` like the raw ones do
fn from_stripe_error(err: stripe::StripeError) -> BillingError {
    if let stripe::StripeError::Stripe(request) = &err {
        if request.http_status == 404 {
            return BillingError::NotFound(
                request
                    .message
                    .clone()
                    .unwrap_or_else(|| "resource missing".to_string()),
            );
        }
    }
    BillingError::Stripe(err)
}

fn push_metadata(form: &mut Vec<(String, String)>, prefix: &str, metadata: &HashMap<String, String>) {
    let mut entries: Vec<_> = metadata.iter().collect();
    entries.sort();
    for (key, value) in entries {
        form.push((format!("{}[{}]", prefix, key), value.clone()));
    }
}

fn schedule_phase_form(phases: &[SchedulePhase]) -> Vec<(String, String)> {
    let mut form = vec![
        ("end_behavior".to_string(), "release".to_string()),
        ("proration_behavior".to_string(), "none".to_string()),
    ];
    for (i, phase) in phases.iter().enumerate() {
        form.push((format!("phases[{}][items][0][price]", i), phase.price_id.clone()));
        form.push((format!("phases[{}][items][0][quantity]", i), "1".to_string()));
        // Later phases start where the previous one ends
        if i == 0 {
            if let Some(start) = phase.start_date {
                form.push((format!("phases[{}][start_date]", i), start.to_string()));
            }
        }
        if let Some(end) = phase.end_date {
            form.push((format!("phases[{}][end_date]", i), end.to_string()));
        }
    }
    form
}

fn proration_behavior(mode: ProrationMode) -> SubscriptionProrationBehavior {
    match mode {
        ProrationMode::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
        ProrationMode::CreateProrations => SubscriptionProrationBehavior::CreateProrations,
        ProrationMode::None => SubscriptionProrationBehavior::None,
    }
}

fn stripe_currency(code: &str) -> BillingResult<Currency> {
    code.trim()
        .to_lowercase()
        .parse::<Currency>()
        .map_err(|_| BillingError::InvalidInput(format!("Unsupported currency: {}", code)))
}

fn recurring_interval(interval: BillingInterval) -> CreatePriceRecurringInterval {
    match interval {
        BillingInterval::Day => CreatePriceRecurringInterval::Day,
        BillingInterval::Week => CreatePriceRecurringInterval::Week,
        BillingInterval::Month => CreatePriceRecurringInterval::Month,
        BillingInterval::Year => CreatePriceRecurringInterval::Year,
    }
}

fn from_stripe_price(price: Price) -> BillingResult<CatalogPrice> {
    let product_id = match &price.product {
        Some(stripe::Expandable::Id(id)) => id.to_string(),
        Some(stripe::Expandable::Object(product)) => product.id.to_string(),
        None => {
            return Err(BillingError::StripeApi(format!(
                "Price {} has no product",
                price.id
            )))
        }
    };

    let recurrence = price.recurring.as_ref().map(|recurring| Recurrence {
        interval: match recurring.interval {
            RecurringInterval::Day => BillingInterval::Day,
            RecurringInterval::Week => BillingInterval::Week,
            RecurringInterval::Month => BillingInterval::Month,
            RecurringInterval::Year => BillingInterval::Year,
        },
        interval_count: u32::try_from(recurring.interval_count).unwrap_or(u32::MAX),
    });

    Ok(CatalogPrice {
        id: price.id.to_string(),
        product_id,
        currency: price.currency.map(|c| c.to_string()).unwrap_or_default(),
        // Tiered and custom-amount prices carry no unit amount
        unit_amount: price.unit_amount.unwrap_or(0),
        recurrence,
        active: price.active.unwrap_or(false),
        metadata: price.metadata.unwrap_or_default(),
    })
}

fn from_stripe_product(product: Product) -> CatalogProduct {
    CatalogProduct {
        id: product.id.to_string(),
        name: product.name.unwrap_or_default(),
        description: product.description,
        active: product.active.unwrap_or(false),
        metadata: product.metadata.unwrap_or_default(),
    }
}

fn from_stripe_customer(customer: Customer) -> ProviderCustomer {
    ProviderCustomer {
        id: customer.id.to_string(),
        email: customer.email,
        name: customer.name,
        metadata: customer.metadata.unwrap_or_default(),
    }
}

/// Normalize a typed subscription into the provider-neutral shape
fn from_stripe_subscription(subscription: Subscription) -> ProviderSubscription {
    use stripe::SubscriptionStatus as StripeSubStatus;

    let status = match subscription.status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    };

    let customer_id = match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    let schedule_id = subscription.schedule.as_ref().map(|schedule| match schedule {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(schedule) => schedule.id.to_string(),
    });

    let items = subscription
        .items
        .data
        .iter()
        .filter_map(|item| {
            item.price.as_ref().map(|price| ProviderSubscriptionItem {
                id: item.id.to_string(),
                price_id: price.id.to_string(),
            })
        })
        .collect();

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_id,
        status,
        current_period_start: Some(subscription.current_period_start).filter(|t| *t > 0),
        current_period_end: Some(subscription.current_period_end).filter(|t| *t > 0),
        items,
        metadata: subscription.metadata.clone(),
        schedule_id,
        cancel_at_period_end: subscription.cancel_at_period_end,
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<CatalogPrice> {
        let price = Price::retrieve(&self.inner, &Self::price_id(price_id)?, &[])
            .await
            .map_err(from_stripe_error)?;
        from_stripe_price(price)
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<CatalogProduct> {
        let product = Product::retrieve(&self.inner, &Self::product_id(product_id)?, &[])
            .await
            .map_err(from_stripe_error)?;
        Ok(from_stripe_product(product))
    }

    async fn list_active_prices(&self) -> BillingResult<Vec<CatalogPrice>> {
        let mut prices = Vec::new();
        let mut cursor: Option<stripe::PriceId> = None;
        loop {
            let params = ListPrices {
                active: Some(true),
                limit: Some(LIST_LIMIT),
                starting_after: cursor.take(),
                ..Default::default()
            };
            let page = Price::list(&self.inner, &params)
                .await
                .map_err(from_stripe_error)?;
            cursor = page.data.last().map(|p| p.id.clone());
            for price in page.data {
                prices.push(from_stripe_price(price)?);
            }
            if !page.has_more || cursor.is_none() {
                break;
            }
        }
        Ok(prices)
    }

    async fn create_product(&self, product: &NewProduct) -> BillingResult<CatalogProduct> {
        let mut params = CreateProduct::new(&product.name);
        params.description = product.description.as_deref().filter(|d| !d.is_empty());
        params.metadata = Some(product.metadata.clone());

        let created = Product::create(&self.inner, params)
            .await
            .map_err(from_stripe_error)?;
        tracing::info!(product_id = %created.id, name = %product.name, "Created Stripe product");
        Ok(from_stripe_product(created))
    }

    async fn create_price(&self, price: &NewPrice) -> BillingResult<CatalogPrice> {
        let mut params = CreatePrice::new(stripe_currency(&price.currency)?);
        params.product = Some(IdOrCreate::Id(price.product_id.as_str()));
        params.unit_amount = Some(price.unit_amount);
        params.recurring = Some(CreatePriceRecurring {
            interval: recurring_interval(price.interval),
            interval_count: Some(u64::from(price.interval_count.max(1))),
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        if !price.metadata.is_empty() {
            params.metadata = Some(price.metadata.clone());
        }

        let created = Price::create(&self.inner, params)
            .await
            .map_err(from_stripe_error)?;
        tracing::info!(price_id = %created.id, product_id = %price.product_id, "Created Stripe price");
        from_stripe_price(created)
    }

    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
        let customer = Customer::retrieve(&self.inner, &Self::customer_id(customer_id)?, &[])
            .await
            .map_err(from_stripe_error)?;
        Ok(from_stripe_customer(customer))
    }

    async fn create_customer(&self, customer: &NewCustomer) -> BillingResult<ProviderCustomer> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), customer.user_id.to_string());

        let params = CreateCustomer {
            email: Some(customer.email.as_str()),
            name: customer.name.as_deref(),
            metadata: Some(metadata.clone()),
            ..Default::default()
        };
        let created = Customer::create(&self.inner, params)
            .await
            .map_err(from_stripe_error)?;

        tracing::info!(
            user_id = %customer.user_id,
            customer_id = %created.id,
            "Created Stripe customer"
        );

        Ok(ProviderCustomer {
            id: created.id.to_string(),
            email: Some(customer.email.clone()),
            name: customer.name.clone(),
            metadata,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let wire: WireSubscription = self
            .get(&format!("subscriptions/{}", subscription_id), &[])
            .await?;
        ProviderSubscription::try_from(wire)
    }

    async fn list_subscriptions(
        &self,
        starting_after: Option<&str>,
    ) -> BillingResult<Page<ProviderSubscription>> {
        let params = ListSubscriptions {
            status: Some(SubscriptionStatusFilter::All),
            limit: Some(LIST_LIMIT),
            starting_after: starting_after.map(Self::subscription_id).transpose()?,
            ..Default::default()
        };
        let page = Subscription::list(&self.inner, &params)
            .await
            .map_err(from_stripe_error)?;
        Ok(Page {
            data: page.data.into_iter().map(from_stripe_subscription).collect(),
            has_more: page.has_more,
        })
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        proration: ProrationMode,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::subscription_id(subscription_id)?;
        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id.to_string()),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            metadata: (!metadata.is_empty()).then(|| metadata.clone()),
            proration_behavior: Some(proration_behavior(proration)),
            ..Default::default()
        };

        let subscription = Subscription::update(&self.inner, &sub_id, params)
            .await
            .map_err(from_stripe_error)?;
        Ok(from_stripe_subscription(subscription))
    }

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::subscription_id(subscription_id)?;
        let params = UpdateSubscription {
            metadata: Some(metadata.clone()),
            ..Default::default()
        };
        let subscription = Subscription::update(&self.inner, &sub_id, params)
            .await
            .map_err(from_stripe_error)?;
        Ok(from_stripe_subscription(subscription))
    }

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSchedule> {
        let form = vec![("from_subscription".to_string(), subscription_id.to_string())];
        let wire: WireSchedule = self.post_form("subscription_schedules", &form).await?;
        Ok(wire.into())
    }

    async fn retrieve_schedule(&self, schedule_id: &str) -> BillingResult<SubscriptionSchedule> {
        let wire: WireSchedule = self
            .get(&format!("subscription_schedules/{}", schedule_id), &[])
            .await?;
        Ok(wire.into())
    }

    async fn update_schedule_phases(
        &self,
        schedule_id: &str,
        phases: &[SchedulePhase],
    ) -> BillingResult<SubscriptionSchedule> {
        if phases.is_empty() {
            return Err(BillingError::InvalidInput(
                "A schedule needs at least one phase".to_string(),
            ));
        }
        let wire: WireSchedule = self
            .post_form(
                &format!("subscription_schedules/{}", schedule_id),
                &schedule_phase_form(phases),
            )
            .await?;
        Ok(wire.into())
    }

    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()> {
        let _: serde_json::Value = self
            .post_form(&format!("subscription_schedules/{}/release", schedule_id), &[])
            .await?;
        Ok(())
    }

    async fn preview_invoice(
        &self,
        request: &InvoicePreviewRequest,
    ) -> BillingResult<InvoicePreview> {
        // POST /invoices/create_preview replaces the deprecated GET /invoices/upcoming
        let form = vec![
            ("customer".to_string(), request.customer_id.clone()),
            ("subscription".to_string(), request.subscription_id.clone()),
            (
                "subscription_details[items][0][id]".to_string(),
                request.item_id.clone(),
            ),
            (
                "subscription_details[items][0][price]".to_string(),
                request.new_price_id.clone(),
            ),
            (
                "subscription_details[proration_behavior]".to_string(),
                "always_invoice".to_string(),
            ),
            (
                "subscription_details[proration_date]".to_string(),
                request.proration_date.to_string(),
            ),
        ];
        let wire: WireInvoice = self.post_form("invoices/create_preview", &form).await?;
        Ok(wire.into())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<HostedSession> {
        let mut form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), request.customer_id.clone()),
            ("line_items[0][price]".to_string(), request.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
        ];
        push_metadata(&mut form, "metadata", &request.metadata);
        push_metadata(&mut form, "subscription_data[metadata]", &request.metadata);

        let wire: WireSession = self.post_form("checkout/sessions", &form).await?;
        HostedSession::try_from(wire)
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<HostedSession> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        let wire: WireSession = self.post_form("billing_portal/sessions", &form).await?;
        HostedSession::try_from(wire)
    }
}
