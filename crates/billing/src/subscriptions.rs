//! Subscription management
//!
//! Plan-change requests: checkout for newcomers, immediate upgrades,
//! scheduled downgrades, and the hosted billing portal as the fallback for
//! anything the provider refuses.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use wplib_shared::SubscriptionStatus;

use crate::catalog::{CatalogReader, ResolvedPlan};
use crate::classifier::{classify, PlanChange, UpdateType};
use crate::client::BillingUrls;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CheckoutRequest, HostedSession, NewCustomer, ProrationMode,
    ProviderSubscription, SchedulePhase, METADATA_PLAN_LABEL, METADATA_PRICE_ID,
    METADATA_USER_ID,
};
use crate::store::{BillingStore, IdentityStore, UserProfile};
use crate::sync::Synchronizer;

#[derive(Debug, Clone)]
pub struct PlanChangeRequest {
    pub user_id: Uuid,
    pub price_id: String,
    pub return_url: Option<String>,
    pub update_type: Option<UpdateType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    Checkout,
    Portal,
}

/// Result of a plan-change request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlanChangeOutcome {
    /// Applied in place, or nothing to do
    #[serde(rename_all = "camelCase")]
    Changed {
        subscription_id: String,
        status: SubscriptionStatus,
    },
    /// Downgrade deferred to the end of the current period
    #[serde(rename_all = "camelCase")]
    Scheduled {
        subscription_id: String,
        status: SubscriptionStatus,
        schedule_id: String,
        effective_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Redirect {
        session_id: String,
        url: String,
        kind: RedirectKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
}

#[derive(Clone)]
pub struct SubscriptionService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    identity: Arc<dyn IdentityStore>,
    catalog: CatalogReader,
    sync: Synchronizer,
    urls: BillingUrls,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        identity: Arc<dyn IdentityStore>,
        urls: BillingUrls,
    ) -> Self {
        Self {
            catalog: CatalogReader::new(provider.clone()),
            sync: Synchronizer::new(store.clone(), identity.clone()),
            provider,
            store,
            identity,
            urls,
        }
    }

    /// Move a user to `request.price_id`.
    ///
    /// The subscription is read, classified, then written; nothing locks
    /// the subscription between the read and the write. A change landing in
    /// between (another tab, the portal) is reconciled by the next webhook or
    /// bulk sync, since both go through the same Synchronizer.
    pub async fn change_plan(
        &self,
        request: &PlanChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        if request.price_id.trim().is_empty() {
            return Err(BillingError::InvalidInput("priceId is required".to_string()));
        }

        let user = self
            .identity
            .get_user(request.user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", request.user_id)))?;

        let target = self.catalog.resolve(&request.price_id).await?;
        if !target.price.active || target.price.recurrence.is_none() {
            return Err(BillingError::InvalidInput(format!(
                "Price {} is not an active recurring price",
                target.price.id
            )));
        }

        let current = match self.live_subscription(user.id).await {
            Ok(current) => current,
            Err(e) if e.is_upstream() => {
                return self.portal_fallback(&user, None, request, e).await;
            }
            Err(e) => return Err(e),
        };

        let Some(subscription) = current else {
            return self.start_checkout(&user, &target, request).await;
        };

        match self
            .change_existing(&user, &subscription, &target, request)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_upstream() => {
                self.portal_fallback(&user, Some(&subscription.customer_id), request, e)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Open the hosted billing portal for a subscriber
    pub async fn open_portal(
        &self,
        user_id: Uuid,
        return_url: Option<&str>,
    ) -> BillingResult<HostedSession> {
        let customer_id = self.known_customer(user_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("No billing customer for user {}", user_id))
        })?;
        let return_url = return_url.unwrap_or(&self.urls.portal_return_url);
        self.provider
            .create_portal_session(&customer_id, return_url)
            .await
    }

    /// The provider subscription the user's record tracks, if still live
    async fn live_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let Some(record) = self.store.find_subscription_by_user(user_id).await? else {
            return Ok(None);
        };
        let Some(subscription_id) = record.state.stripe_subscription_id else {
            return Ok(None);
        };

        match self.provider.retrieve_subscription(&subscription_id).await {
            Ok(subscription) if subscription.status.is_live() => Ok(Some(subscription)),
            Ok(_) => Ok(None),
            Err(BillingError::NotFound(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Recorded subscription no longer exists at the provider"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn change_existing(
        &self,
        user: &UserProfile,
        subscription: &ProviderSubscription,
        target: &ResolvedPlan,
        request: &PlanChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        let item = subscription.primary_item().ok_or_else(|| {
            BillingError::Internal(format!("Subscription {} has no items", subscription.id))
        })?;

        if item.price_id == target.price.id {
            tracing::debug!(
                user_id = %user.id,
                subscription_id = %subscription.id,
                "Requested price is already active"
            );
            return Ok(PlanChangeOutcome::Changed {
                subscription_id: subscription.id.clone(),
                status: subscription.status,
            });
        }

        let current_price = self.catalog.price(&item.price_id).await?;
        match classify(&current_price, &target.price, request.update_type) {
            PlanChange::NoOp => Ok(PlanChangeOutcome::Changed {
                subscription_id: subscription.id.clone(),
                status: subscription.status,
            }),
            PlanChange::Upgrade => self.upgrade(user, subscription, &item.id, target).await,
            PlanChange::Downgrade => {
                self.schedule_downgrade(user, subscription, &item.price_id, target)
                    .await
            }
        }
    }

    async fn upgrade(
        &self,
        user: &UserProfile,
        subscription: &ProviderSubscription,
        item_id: &str,
        target: &ResolvedPlan,
    ) -> BillingResult<PlanChangeOutcome> {
        // A pending downgrade would undo the upgrade at period end. The
        // provider refuses direct updates while a schedule is attached, so
        // keep its phases to put back if the update fails.
        let released = match &subscription.schedule_id {
            Some(schedule_id) => {
                let schedule = self.provider.retrieve_schedule(schedule_id).await?;
                tracing::info!(
                    subscription_id = %subscription.id,
                    schedule_id = %schedule_id,
                    "Releasing pending schedule before upgrade"
                );
                self.provider.release_schedule(schedule_id).await?;
                Some(schedule.phases)
            }
            None => None,
        };

        let metadata = plan_metadata(user.id, target);
        let updated = match self
            .provider
            .update_subscription_price(
                &subscription.id,
                item_id,
                &target.price.id,
                ProrationMode::AlwaysInvoice,
                &metadata,
            )
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                if let Some(phases) = released {
                    self.restore_schedule(&subscription.id, &phases).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            user_id = %user.id,
            subscription_id = %updated.id,
            new_price_id = %target.price.id,
            plan_label = %target.label,
            "Upgraded subscription"
        );

        // The webhook for this change reconciles again if this write fails
        if let Err(e) = self.sync.sync_subscription(user, &updated, Some(target)).await {
            tracing::error!(
                user_id = %user.id,
                subscription_id = %updated.id,
                error = %e,
                "Failed to synchronize after upgrade"
            );
        }

        Ok(PlanChangeOutcome::Changed {
            subscription_id: updated.id,
            status: updated.status,
        })
    }

    /// Re-attach a released schedule with its previous phases. Failure here
    /// leaves the subscription unscheduled and is only logged; the caller is
    /// already returning the update error.
    async fn restore_schedule(&self, subscription_id: &str, phases: &[SchedulePhase]) {
        let restored = match self
            .provider
            .create_schedule_from_subscription(subscription_id)
            .await
        {
            Ok(schedule) => {
                self.provider
                    .update_schedule_phases(&schedule.id, phases)
                    .await
            }
            Err(e) => Err(e),
        };

        match restored {
            Ok(schedule) => tracing::warn!(
                subscription_id = %subscription_id,
                schedule_id = %schedule.id,
                "Upgrade failed; pending schedule restored"
            ),
            Err(e) => tracing::error!(
                subscription_id = %subscription_id,
                error = %e,
                "Upgrade failed and the pending schedule could not be restored"
            ),
        }
    }

    /// Rewrite the subscription's schedule to exactly two phases: the
    /// current price until period end, then the target price.
    ///
    /// The current phase is read and then overwritten without a concurrency
    /// token; a provider-side phase transition in between is lost.
    async fn schedule_downgrade(
        &self,
        user: &UserProfile,
        subscription: &ProviderSubscription,
        current_price_id: &str,
        target: &ResolvedPlan,
    ) -> BillingResult<PlanChangeOutcome> {
        let period_end = subscription.current_period_end.ok_or_else(|| {
            BillingError::Internal(format!(
                "Subscription {} has no billing period",
                subscription.id
            ))
        })?;

        let schedule = match &subscription.schedule_id {
            Some(schedule_id) => self.provider.retrieve_schedule(schedule_id).await?,
            None => {
                self.provider
                    .create_schedule_from_subscription(&subscription.id)
                    .await?
            }
        };

        let phase_start = schedule
            .current_phase
            .map(|window| window.start_date)
            .or(subscription.current_period_start)
            .ok_or_else(|| {
                BillingError::Internal(format!("Schedule {} has no current phase", schedule.id))
            })?;

        let phases = [
            SchedulePhase {
                price_id: current_price_id.to_string(),
                start_date: Some(phase_start),
                end_date: Some(period_end),
            },
            SchedulePhase {
                price_id: target.price.id.clone(),
                start_date: Some(period_end),
                end_date: None,
            },
        ];

        let updated = self
            .provider
            .update_schedule_phases(&schedule.id, &phases)
            .await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription.id,
            schedule_id = %updated.id,
            new_price_id = %target.price.id,
            effective_at = period_end,
            "Scheduled downgrade at period end"
        );

        Ok(PlanChangeOutcome::Scheduled {
            subscription_id: subscription.id.clone(),
            status: subscription.status,
            schedule_id: updated.id,
            effective_at: period_end,
        })
    }

    async fn start_checkout(
        &self,
        user: &UserProfile,
        target: &ResolvedPlan,
        request: &PlanChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        let customer_id = match self.known_customer(user.id).await? {
            Some(customer_id) => customer_id,
            None => self.create_customer(user).await?,
        };

        let checkout = CheckoutRequest {
            customer_id,
            price_id: target.price.id.clone(),
            success_url: request
                .return_url
                .clone()
                .unwrap_or_else(|| self.urls.success_url.clone()),
            cancel_url: request
                .return_url
                .clone()
                .unwrap_or_else(|| self.urls.cancel_url.clone()),
            metadata: plan_metadata(user.id, target),
        };

        let session = self.provider.create_checkout_session(&checkout).await?;

        tracing::info!(
            user_id = %user.id,
            price_id = %target.price.id,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(PlanChangeOutcome::Redirect {
            session_id: session.id,
            url: session.url,
            kind: RedirectKind::Checkout,
            warning: None,
        })
    }

    async fn portal_fallback(
        &self,
        user: &UserProfile,
        customer_id: Option<&str>,
        request: &PlanChangeRequest,
        cause: BillingError,
    ) -> BillingResult<PlanChangeOutcome> {
        let customer_id = match customer_id {
            Some(customer_id) => customer_id.to_string(),
            None => match self.known_customer(user.id).await? {
                Some(customer_id) => customer_id,
                None => return Err(cause),
            },
        };

        tracing::warn!(
            user_id = %user.id,
            price_id = %request.price_id,
            error = %cause,
            "Plan change failed at the provider, falling back to billing portal"
        );

        let return_url = request
            .return_url
            .as_deref()
            .unwrap_or(&self.urls.portal_return_url);
        let session = match self
            .provider
            .create_portal_session(&customer_id, return_url)
            .await
        {
            Ok(session) => session,
            Err(portal_err) => {
                tracing::error!(
                    user_id = %user.id,
                    error = %portal_err,
                    "Billing portal fallback failed"
                );
                return Err(cause);
            }
        };

        Ok(PlanChangeOutcome::Redirect {
            session_id: session.id,
            url: session.url,
            kind: RedirectKind::Portal,
            warning: Some(format!(
                "Plan change could not be applied; manage your subscription in the billing portal ({})",
                cause
            )),
        })
    }

    async fn known_customer(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        if let Some(customer_id) = self
            .store
            .get_account(user_id)
            .await?
            .and_then(|account| account.stripe_customer_id)
        {
            return Ok(Some(customer_id));
        }

        Ok(self
            .store
            .find_subscription_by_user(user_id)
            .await?
            .and_then(|record| record.state.stripe_customer_id))
    }

    async fn create_customer(&self, user: &UserProfile) -> BillingResult<String> {
        let customer = self
            .provider
            .create_customer(&NewCustomer {
                email: user.email.clone(),
                name: user.name.clone(),
                user_id: user.id,
            })
            .await?;

        let current_plan = self
            .store
            .get_account(user.id)
            .await?
            .and_then(|account| account.current_plan);
        self.store
            .upsert_account(user.id, Some(&customer.id), current_plan.as_deref())
            .await?;

        tracing::info!(
            user_id = %user.id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id)
    }
}

/// Metadata stamped on checkout sessions and updated subscriptions so that
/// webhooks can map them back to a user and plan
fn plan_metadata(user_id: Uuid, target: &ResolvedPlan) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_USER_ID.to_string(), user_id.to_string());
    metadata.insert(METADATA_PLAN_LABEL.to_string(), target.label.clone());
    metadata.insert(METADATA_PRICE_ID.to_string(), target.price.id.clone());
    metadata
}
