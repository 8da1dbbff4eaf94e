//! Proration previews
//!
//! Asks the provider what switching a subscription to another price would
//! invoice right now. Read-only.

use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, InvoicePreview, InvoicePreviewRequest};
use crate::store::BillingStore;

#[derive(Clone)]
pub struct ProrationPreviewer {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
}

impl ProrationPreviewer {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        Self { provider, store }
    }

    /// Preview on behalf of a subscriber; the subscription must be theirs
    pub async fn preview_for_user(
        &self,
        user_id: Uuid,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<InvoicePreview> {
        let recorded_owner = self
            .store
            .find_subscription_by_provider_id(subscription_id)
            .await?
            .map(|record| record.state.user_id);

        if recorded_owner != Some(user_id) {
            tracing::warn!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                "Proration preview requested for a subscription the caller does not own"
            );
            return Err(BillingError::NotFound(format!(
                "Subscription {} not found",
                subscription_id
            )));
        }

        self.preview(subscription_id, new_price_id).await
    }

    pub async fn preview(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<InvoicePreview> {
        if subscription_id.trim().is_empty() || new_price_id.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "subscriptionId and newPriceId are required".to_string(),
            ));
        }

        let subscription = self.provider.retrieve_subscription(subscription_id).await?;
        if !subscription.status.is_live() {
            return Err(BillingError::InvalidInput(format!(
                "Subscription {} is {} and cannot be changed",
                subscription_id, subscription.status
            )));
        }

        let item = subscription.primary_item().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Subscription {} has no active item",
                subscription_id
            ))
        })?;

        let request = InvoicePreviewRequest {
            customer_id: subscription.customer_id.clone(),
            subscription_id: subscription.id.clone(),
            item_id: item.id.clone(),
            new_price_id: new_price_id.to_string(),
            proration_date: OffsetDateTime::now_utc().unix_timestamp(),
        };

        let preview = self.provider.preview_invoice(&request).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            new_price_id = %new_price_id,
            amount_due = preview.amount_due,
            currency = %preview.currency,
            "Previewed proration"
        );

        Ok(preview)
    }
}
