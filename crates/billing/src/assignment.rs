//! Manual Local Plan assignment

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::{BillingStore, IdentityStore};
use crate::sync::{SyncOutcome, Synchronizer};

pub struct PlanAssigner {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    identity: Arc<dyn IdentityStore>,
    sync: Synchronizer,
}

impl PlanAssigner {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        identity: Arc<dyn IdentityStore>,
        sync: Synchronizer,
    ) -> Self {
        Self {
            provider,
            store,
            identity,
            sync,
        }
    }

    /// Put a user on a Local Plan. Users paying through the provider must
    /// cancel there first.
    pub async fn assign(&self, user_id: Uuid, local_plan_id: Uuid) -> BillingResult<SyncOutcome> {
        let user = self
            .identity
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        let plan = self
            .store
            .get_local_plan(local_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Local plan {}", local_plan_id)))?;

        let tracked = self
            .store
            .find_subscription_by_user(user_id)
            .await?
            .and_then(|record| record.state.stripe_subscription_id);

        if let Some(subscription_id) = tracked {
            match self.provider.retrieve_subscription(&subscription_id).await {
                Ok(subscription) if subscription.status.is_live() => {
                    return Err(BillingError::Conflict(format!(
                        "User {} has a live subscription {} ({})",
                        user_id, subscription_id, subscription.status
                    )));
                }
                Ok(_) | Err(BillingError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let outcome = self.sync.sync_local(&user, &plan).await?;

        tracing::info!(
            user_id = %user_id,
            local_plan_id = %plan.id,
            plan_label = %plan.label,
            record = ?outcome.write,
            "Assigned local plan"
        );

        Ok(outcome)
    }
}
