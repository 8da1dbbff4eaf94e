//! Local plan → catalog migration
//!
//! Publishes an administrator-defined Local Plan as a provider product with
//! one price per requested billing period. One-directional. Subscribers on
//! the Local Plan stay where they are and are reported back for manual
//! follow-up: moving them needs payment details this engine never collects.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::{BillingInterval, CatalogPrice, CatalogProduct, Recurrence};
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, NewPrice, NewProduct, METADATA_PLAN_LABEL};
use crate::store::{BillingStore, LocalPlan, RecordSource};

/// Metadata key linking a catalog product back to its Local Plan
pub const METADATA_LOCAL_PLAN_ID: &str = "local_plan_id";

/// One price to create, amount in major currency units
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPrice {
    pub amount: f64,
    pub currency: String,
    pub interval: BillingInterval,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
}

fn default_interval_count() -> u32 {
    1
}

impl MigrationPrice {
    /// Minor units, rounded to the nearest cent
    pub fn unit_amount(&self) -> i64 {
        (self.amount * 100.0).round() as i64
    }

    fn validate(&self) -> BillingResult<()> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(BillingError::InvalidInput(format!(
                "Price amount must be positive, got {}",
                self.amount
            )));
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(format!(
                "Invalid currency code: {}",
                self.currency
            )));
        }
        if self.interval_count == 0 {
            return Err(BillingError::InvalidInput(
                "intervalCount must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A subscriber still on the Local Plan after migration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSubscriber {
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub local_plan: LocalPlan,
    pub product: CatalogProduct,
    pub prices: Vec<CatalogPrice>,
    pub subscribers_to_migrate: Vec<PendingSubscriber>,
}

pub struct PlanMigrator {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
}

impl PlanMigrator {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        Self { provider, store }
    }

    pub async fn migrate(
        &self,
        local_plan_id: Uuid,
        prices: &[MigrationPrice],
    ) -> BillingResult<MigrationResult> {
        if prices.is_empty() {
            return Err(BillingError::InvalidInput(
                "At least one price is required".to_string(),
            ));
        }
        for price in prices {
            price.validate()?;
        }

        let plan = self
            .store
            .get_local_plan(local_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Local plan {}", local_plan_id)))?;

        if plan.is_migrated() {
            return Err(BillingError::Conflict(format!(
                "Local plan {} was already migrated to product {}",
                plan.label,
                plan.catalog_product_id.as_deref().unwrap_or_default()
            )));
        }

        let (product, existing_prices) = match &plan.catalog_product_id {
            Some(product_id) => self.resume_product(&plan, product_id).await?,
            None => (self.publish_product(&plan).await?, Vec::new()),
        };

        let mut created = Vec::with_capacity(prices.len());
        for price in prices {
            let currency = price.currency.trim().to_lowercase();
            let recurrence = Recurrence {
                interval: price.interval,
                interval_count: price.interval_count,
            };
            if let Some(found) = existing_prices.iter().find(|p| {
                p.currency == currency
                    && p.unit_amount == price.unit_amount()
                    && p.recurrence == Some(recurrence)
                    && !created.iter().any(|c: &CatalogPrice| c.id == p.id)
            }) {
                created.push(found.clone());
                continue;
            }

            let result = self
                .provider
                .create_price(&NewPrice {
                    product_id: product.id.clone(),
                    currency,
                    unit_amount: price.unit_amount(),
                    interval: price.interval,
                    interval_count: price.interval_count,
                    metadata: Default::default(),
                })
                .await;

            match result {
                Ok(catalog_price) => created.push(catalog_price),
                Err(e) => {
                    tracing::error!(
                        local_plan_id = %plan.id,
                        product_id = %product.id,
                        created_prices = created.len(),
                        error = %e,
                        "Price creation failed; migration can be retried"
                    );
                    return Err(e);
                }
            }
        }

        let price_ids: Vec<String> = created.iter().map(|p| p.id.clone()).collect();
        let local_plan = self
            .store
            .set_local_plan_catalog_ids(plan.id, &product.id, &price_ids)
            .await?;

        let subscribers_to_migrate = self
            .store
            .list_subscriptions_by_label(&plan.label)
            .await?
            .into_iter()
            .filter(|record| record.state.metadata.source == RecordSource::Local)
            .map(|record| PendingSubscriber {
                user_id: record.state.user_id,
                user_email: record.state.user_email,
                user_name: record.state.user_name,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            local_plan_id = %plan.id,
            plan_label = %plan.label,
            product_id = %product.id,
            prices = price_ids.len(),
            pending_subscribers = subscribers_to_migrate.len(),
            "Migrated local plan to catalog"
        );

        Ok(MigrationResult {
            local_plan,
            product,
            prices: created,
            subscribers_to_migrate,
        })
    }
}

impl PlanMigrator {
    /// Create the product and link it to the Local Plan before any price
    /// exists, so a failed price leaves a resumable plan behind.
    async fn publish_product(&self, plan: &LocalPlan) -> BillingResult<CatalogProduct> {
        let mut metadata = plan.limits.to_metadata();
        metadata.insert(METADATA_PLAN_LABEL.to_string(), plan.label.clone());
        metadata.insert(METADATA_LOCAL_PLAN_ID.to_string(), plan.id.to_string());

        let product = self
            .provider
            .create_product(&NewProduct {
                name: plan.name.clone(),
                description: plan.description.clone(),
                metadata,
            })
            .await?;

        self.store
            .set_local_plan_catalog_ids(plan.id, &product.id, &[])
            .await?;
        Ok(product)
    }

    /// Pick up a product from an earlier attempt along with the prices it
    /// already carries
    async fn resume_product(
        &self,
        plan: &LocalPlan,
        product_id: &str,
    ) -> BillingResult<(CatalogProduct, Vec<CatalogPrice>)> {
        let product = self.provider.retrieve_product(product_id).await?;
        let prices: Vec<CatalogPrice> = self
            .provider
            .list_active_prices()
            .await?
            .into_iter()
            .filter(|p| p.product_id == product.id)
            .collect();

        tracing::info!(
            local_plan_id = %plan.id,
            product_id = %product.id,
            existing_prices = prices.len(),
            "Resuming interrupted local plan migration"
        );
        Ok((product, prices))
    }
}
