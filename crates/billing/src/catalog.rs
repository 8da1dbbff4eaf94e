//! Price/plan catalog reader
//!
//! Resolves billing-provider prices and products into plan definitions
//! (label + limits). Every plan comparison starts here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use wplib_shared::PlanLimits;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, METADATA_PLAN_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    /// Length of one interval in months
    pub fn months(&self) -> f64 {
        match self {
            BillingInterval::Day => 1.0 / 30.0,
            BillingInterval::Week => 7.0 / 30.0,
            BillingInterval::Month => 1.0,
            BillingInterval::Year => 12.0,
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(BillingInterval::Day),
            "week" | "weekly" => Ok(BillingInterval::Week),
            "month" | "monthly" => Ok(BillingInterval::Month),
            "year" | "yearly" | "annual" => Ok(BillingInterval::Year),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown billing interval: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub interval: BillingInterval,
    pub interval_count: u32,
}

impl Recurrence {
    pub fn monthly() -> Self {
        Self {
            interval: BillingInterval::Month,
            interval_count: 1,
        }
    }

    /// Billing period length in months; never zero
    pub fn period_months(&self) -> f64 {
        self.interval.months() * f64::from(self.interval_count.max(1))
    }
}

/// A price as published in the billing provider's catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogPrice {
    pub id: String,
    pub product_id: String,
    /// Lower-cased ISO currency code
    pub currency: String,
    /// Minor currency units
    pub unit_amount: i64,
    /// `None` for one-time prices
    pub recurrence: Option<Recurrence>,
    pub active: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogProduct {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub metadata: HashMap<String, String>,
}

impl CatalogProduct {
    /// Entitlement label for subscribers of this product.
    ///
    /// Explicit `plan_label` metadata wins; otherwise the product name is
    /// slugged.
    pub fn plan_label(&self) -> String {
        self.metadata
            .get(METADATA_PLAN_LABEL)
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| label_from_name(&self.name))
    }

    pub fn limits(&self) -> PlanLimits {
        PlanLimits::from_metadata(&self.metadata)
    }
}

/// Slug a display name into a label: lower-case, whitespace runs become `-`
pub fn label_from_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// A price together with the product it belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPlan {
    pub price: CatalogPrice,
    pub product: CatalogProduct,
    pub label: String,
    pub limits: PlanLimits,
}

impl ResolvedPlan {
    pub fn new(price: CatalogPrice, product: CatalogProduct) -> Self {
        let label = product.plan_label();
        let limits = product.limits();
        Self {
            price,
            product,
            label,
            limits,
        }
    }
}

/// A catalog product with its purchasable prices, as shown to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub product_id: String,
    pub name: String,
    pub description: Option<String>,
    pub label: String,
    pub limits: PlanLimits,
    pub prices: Vec<PriceSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSummary {
    pub price_id: String,
    pub currency: String,
    pub unit_amount: i64,
    pub interval: Option<BillingInterval>,
    pub interval_count: Option<u32>,
}

impl From<&CatalogPrice> for PriceSummary {
    fn from(price: &CatalogPrice) -> Self {
        Self {
            price_id: price.id.clone(),
            currency: price.currency.clone(),
            unit_amount: price.unit_amount,
            interval: price.recurrence.map(|r| r.interval),
            interval_count: price.recurrence.map(|r| r.interval_count),
        }
    }
}

/// Reads plan definitions from the billing provider
#[derive(Clone)]
pub struct CatalogReader {
    provider: Arc<dyn BillingProvider>,
}

impl CatalogReader {
    pub fn new(provider: Arc<dyn BillingProvider>) -> Self {
        Self { provider }
    }

    pub async fn price(&self, price_id: &str) -> BillingResult<CatalogPrice> {
        if price_id.trim().is_empty() {
            return Err(BillingError::InvalidInput("Price id is required".to_string()));
        }
        self.provider.retrieve_price(price_id).await
    }

    /// Resolve a price id into the plan it sells
    pub async fn resolve(&self, price_id: &str) -> BillingResult<ResolvedPlan> {
        let price = self.price(price_id).await?;
        let product = self.provider.retrieve_product(&price.product_id).await?;

        tracing::debug!(
            price_id = %price.id,
            product_id = %product.id,
            "Resolved catalog price"
        );

        Ok(ResolvedPlan::new(price, product))
    }

    /// Active recurring plans, grouped by product
    pub async fn list_plans(&self) -> BillingResult<Vec<PlanSummary>> {
        let prices = self.provider.list_active_prices().await?;

        let mut by_product: BTreeMap<String, Vec<CatalogPrice>> = BTreeMap::new();
        for price in prices
            .into_iter()
            .filter(|p| p.active && p.recurrence.is_some())
        {
            by_product
                .entry(price.product_id.clone())
                .or_default()
                .push(price);
        }

        let mut plans = Vec::with_capacity(by_product.len());
        for (product_id, mut prices) in by_product {
            let product = self.provider.retrieve_product(&product_id).await?;
            if !product.active {
                continue;
            }
            prices.sort_by_key(|p| p.unit_amount);
            plans.push(PlanSummary {
                label: product.plan_label(),
                limits: product.limits(),
                product_id,
                name: product.name,
                description: product.description,
                prices: prices.iter().map(PriceSummary::from).collect(),
            });
        }

        Ok(plans)
    }
}
