//! Bulk subscription sync
//!
//! Re-derives every local record from the provider's subscription list.
//! Drift correction and disaster recovery; run by an administrator.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use wplib_shared::SubscriptionStatus;

use crate::catalog::CatalogReader;
use crate::error::BillingResult;
use crate::provider::{BillingProvider, ProviderSubscription, METADATA_USER_ID};
use crate::store::IdentityStore;
use crate::sync::{RecordWrite, Synchronizer};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSyncReport {
    pub synced: SyncCounts,
    /// Subscriptions that could not be mapped to a user
    pub skipped: usize,
    pub total: usize,
    pub errors: Vec<String>,
}

enum ItemResult {
    Synced(RecordWrite),
    Skipped(String),
}

pub struct BulkSync {
    provider: Arc<dyn BillingProvider>,
    identity: Arc<dyn IdentityStore>,
    catalog: CatalogReader,
    sync: Synchronizer,
}

impl BulkSync {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        identity: Arc<dyn IdentityStore>,
        sync: Synchronizer,
    ) -> Self {
        Self {
            catalog: CatalogReader::new(provider.clone()),
            provider,
            identity,
            sync,
        }
    }

    /// Sweep all subscriptions. A failure on one subscription is recorded
    /// and the sweep moves on.
    pub async fn run(&self) -> BillingResult<BulkSyncReport> {
        let mut report = BulkSyncReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = match self.provider.list_subscriptions(cursor.as_deref()).await {
                Ok(page) => page,
                // Nothing processed yet: surface the failure as is
                Err(e) if report.total == 0 => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "Subscription listing failed mid-sweep");
                    report.errors.push(format!("listing after {:?}: {}", cursor, e));
                    report.synced.errors += 1;
                    break;
                }
            };

            for subscription in &page.data {
                report.total += 1;
                match self.sync_one(subscription).await {
                    Ok(ItemResult::Synced(RecordWrite::Created)) => report.synced.created += 1,
                    Ok(ItemResult::Synced(RecordWrite::Updated)) => report.synced.updated += 1,
                    Ok(ItemResult::Synced(RecordWrite::Unchanged)) => {
                        report.synced.unchanged += 1
                    }
                    Ok(ItemResult::Synced(RecordWrite::Ignored)) => report.skipped += 1,
                    Ok(ItemResult::Skipped(reason)) => {
                        tracing::warn!(
                            subscription_id = %subscription.id,
                            reason = %reason,
                            "Skipping subscription"
                        );
                        report.skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            subscription_id = %subscription.id,
                            error = %e,
                            "Failed to sync subscription"
                        );
                        report.synced.errors += 1;
                        report.errors.push(format!("{}: {}", subscription.id, e));
                    }
                }
            }

            cursor = page.data.last().map(|s| s.id.clone());
            if !page.has_more || cursor.is_none() {
                break;
            }
        }

        tracing::info!(
            total = report.total,
            created = report.synced.created,
            updated = report.synced.updated,
            unchanged = report.synced.unchanged,
            skipped = report.skipped,
            errors = report.synced.errors,
            "Bulk sync finished"
        );

        Ok(report)
    }

    async fn sync_one(&self, subscription: &ProviderSubscription) -> BillingResult<ItemResult> {
        let user_id = match subscription.user_id() {
            Some(user_id) => user_id,
            None => match self.resolve_by_customer_email(subscription).await? {
                Some(user_id) => user_id,
                None => {
                    return Ok(ItemResult::Skipped(
                        "no user_id metadata and no user matches the customer email".to_string(),
                    ))
                }
            },
        };

        let Some(user) = self.identity.get_user(user_id).await? else {
            return Ok(ItemResult::Skipped(format!("user {} not found", user_id)));
        };

        let outcome = if subscription.status == SubscriptionStatus::Canceled {
            self.sync.sync_subscription(&user, subscription, None).await?
        } else {
            let Some(price_id) = subscription.price_id() else {
                return Ok(ItemResult::Skipped("subscription has no items".to_string()));
            };
            let plan = self.catalog.resolve(price_id).await?;
            self.sync
                .sync_subscription(&user, subscription, Some(&plan))
                .await?
        };

        Ok(ItemResult::Synced(outcome.write))
    }

    /// Match the billing customer's email against the identity store and
    /// stamp the user id onto the provider subscription for future events
    async fn resolve_by_customer_email(
        &self,
        subscription: &ProviderSubscription,
    ) -> BillingResult<Option<Uuid>> {
        let customer = self
            .provider
            .retrieve_customer(&subscription.customer_id)
            .await?;
        let Some(email) = customer.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(user) = self.identity.find_user_by_email(email).await? else {
            return Ok(None);
        };

        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), user.id.to_string());
        self.provider
            .update_subscription_metadata(&subscription.id, &metadata)
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %subscription.customer_id,
            user_id = %user.id,
            "Resolved subscription owner by customer email"
        );

        Ok(Some(user.id))
    }
}
