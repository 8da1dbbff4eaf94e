//! Billing state synchronizer
//!
//! The one reconciliation algorithm. Interactive plan changes, webhooks,
//! the bulk sweep and manual local-plan assignment all end up here.
//!
//! Three records are written in order:
//!
//! 1. the Subscription Record (looked up by provider subscription id, then by
//!    user id; fully overwritten, never merged),
//! 2. the Account Record's current-plan pointer,
//! 3. the user's entitlement label set (`{admin?} ∪ {plan label?}`).
//!
//! Each write compares the desired value with the stored one first, so
//! replaying a snapshot touches nothing.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use wplib_shared::{PlanLimits, SubscriptionStatus, ADMIN_LABEL};

use crate::catalog::ResolvedPlan;
use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderSubscription;
use crate::store::{
    BillingStore, IdentityStore, LocalPlan, RecordMetadata, RecordSource, SubscriptionRecord,
    SubscriptionState, UserProfile,
};

/// What happened to the Subscription Record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordWrite {
    Created,
    Updated,
    Unchanged,
    /// Stale snapshot; nothing written
    Ignored,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub write: RecordWrite,
    pub record: Option<SubscriptionRecord>,
    pub account_written: bool,
    pub labels_written: bool,
}

impl SyncOutcome {
    fn ignored(record: Option<SubscriptionRecord>) -> Self {
        Self {
            write: RecordWrite::Ignored,
            record,
            account_written: false,
            labels_written: false,
        }
    }

    /// True when nothing at all was written
    pub fn is_noop(&self) -> bool {
        matches!(self.write, RecordWrite::Unchanged | RecordWrite::Ignored)
            && !self.account_written
            && !self.labels_written
    }
}

#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn BillingStore>,
    identity: Arc<dyn IdentityStore>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn BillingStore>, identity: Arc<dyn IdentityStore>) -> Self {
        Self { store, identity }
    }

    /// Reconcile a provider subscription snapshot.
    ///
    /// `plan` is the catalog resolution of the subscription's price. It is
    /// required unless the snapshot is canceled; callers must not pass a
    /// partially resolved plan. A non-live snapshot for a subscription other
    /// than the one the record tracks is ignored.
    pub async fn sync_subscription(
        &self,
        user: &UserProfile,
        subscription: &ProviderSubscription,
        plan: Option<&ResolvedPlan>,
    ) -> BillingResult<SyncOutcome> {
        let existing = self.find_record(user, Some(&subscription.id)).await?;
        let canceled = subscription.status == SubscriptionStatus::Canceled;

        // A dead subscription never displaces the one the record tracks
        if !subscription.status.is_live() {
            if let Some(record) = &existing {
                if record.state.stripe_subscription_id.as_deref() != Some(subscription.id.as_str())
                {
                    tracing::info!(
                        user_id = %user.id,
                        subscription_id = %subscription.id,
                        tracked_subscription_id = ?record.state.stripe_subscription_id,
                        status = %subscription.status,
                        "Ignoring terminal snapshot for a subscription the record no longer tracks"
                    );
                    return Ok(SyncOutcome::ignored(existing));
                }
            }
        }

        let desired = if canceled {
            canceled_state(user, subscription, existing.as_ref())
        } else {
            let plan = plan.ok_or_else(|| {
                BillingError::Resolution(format!(
                    "Subscription {} has no resolved plan",
                    subscription.id
                ))
            })?;
            catalog_state(user, subscription, plan)
        };

        self.apply(user, existing, desired).await
    }

    /// Reconcile a subscription that the provider reports as deleted.
    /// Status is forced to canceled whatever the snapshot says.
    pub async fn sync_canceled(
        &self,
        user: &UserProfile,
        subscription: &ProviderSubscription,
    ) -> BillingResult<SyncOutcome> {
        let mut snapshot = subscription.clone();
        snapshot.status = SubscriptionStatus::Canceled;
        self.sync_subscription(user, &snapshot, None).await
    }

    /// Put a user on a Local Plan
    pub async fn sync_local(
        &self,
        user: &UserProfile,
        plan: &LocalPlan,
    ) -> BillingResult<SyncOutcome> {
        let existing = self.find_record(user, None).await?;
        let desired = SubscriptionState {
            user_id: user.id,
            user_name: user.name.clone(),
            user_email: Some(user.email.clone()),
            plan_id: plan.id.to_string(),
            price_id: None,
            plan_label: Some(plan.label.clone()),
            stripe_customer_id: existing
                .as_ref()
                .and_then(|r| r.state.stripe_customer_id.clone()),
            stripe_subscription_id: None,
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            never_expires: plan.never_expires,
            metadata: RecordMetadata {
                limits: plan.limits,
                source: RecordSource::Local,
                product_id: None,
                cancel_at_period_end: false,
            },
        };

        self.apply(user, existing, desired).await
    }

    async fn find_record(
        &self,
        user: &UserProfile,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        if let Some(subscription_id) = subscription_id {
            if let Some(record) = self
                .store
                .find_subscription_by_provider_id(subscription_id)
                .await?
            {
                if record.state.user_id != user.id {
                    return Err(BillingError::Resolution(format!(
                        "Subscription {} is recorded for user {}, not {}",
                        subscription_id, record.state.user_id, user.id
                    )));
                }
                return Ok(Some(record));
            }
        }

        self.store.find_subscription_by_user(user.id).await
    }

    async fn apply(
        &self,
        user: &UserProfile,
        existing: Option<SubscriptionRecord>,
        desired: SubscriptionState,
    ) -> BillingResult<SyncOutcome> {
        // 1. Subscription Record
        let (write, record) = match existing {
            Some(record) if record.state == desired => (RecordWrite::Unchanged, record),
            Some(record) => {
                let updated = self.store.update_subscription(record.id, &desired).await?;
                (RecordWrite::Updated, updated)
            }
            None => {
                let created = self.store.insert_subscription(&desired).await?;
                (RecordWrite::Created, created)
            }
        };

        // 2. Account pointer
        let plan = desired.plan_label.as_deref();
        let customer = desired.stripe_customer_id.as_deref();
        let account = self.store.get_account(user.id).await?;
        let account_current = account.as_ref().is_some_and(|a| {
            a.current_plan.as_deref() == plan
                && (customer.is_none() || a.stripe_customer_id.as_deref() == customer)
        });
        if !account_current {
            self.store.upsert_account(user.id, customer, plan).await?;
        }

        // 3. Entitlement labels
        let labels = entitlement_labels(&user.labels, plan);
        let current: BTreeSet<&str> = user.labels.iter().map(String::as_str).collect();
        let wanted: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
        let labels_written = current != wanted;
        if labels_written {
            self.identity.set_labels(user.id, &labels).await?;
        }

        if write != RecordWrite::Unchanged || !account_current || labels_written {
            tracing::info!(
                user_id = %user.id,
                subscription_id = ?desired.stripe_subscription_id,
                status = %desired.status,
                plan_label = ?desired.plan_label,
                record = ?write,
                account_written = !account_current,
                labels_written,
                "Billing state synchronized"
            );
        } else {
            tracing::debug!(user_id = %user.id, "Billing state already in sync");
        }

        Ok(SyncOutcome {
            write,
            record: Some(record),
            account_written: !account_current,
            labels_written,
        })
    }
}

/// `{admin label if present} ∪ {plan label}`; every other label is dropped
pub fn entitlement_labels(current: &[String], plan_label: Option<&str>) -> Vec<String> {
    let mut labels = Vec::with_capacity(2);
    if current.iter().any(|l| l == ADMIN_LABEL) {
        labels.push(ADMIN_LABEL.to_string());
    }
    if let Some(plan_label) = plan_label {
        if plan_label != ADMIN_LABEL {
            labels.push(plan_label.to_string());
        }
    }
    labels
}

fn catalog_state(
    user: &UserProfile,
    subscription: &ProviderSubscription,
    plan: &ResolvedPlan,
) -> SubscriptionState {
    SubscriptionState {
        user_id: user.id,
        user_name: user.name.clone(),
        user_email: Some(user.email.clone()),
        plan_id: plan.product.id.clone(),
        price_id: subscription.price_id().map(str::to_string),
        plan_label: Some(plan.label.clone()),
        stripe_customer_id: Some(subscription.customer_id.clone()),
        stripe_subscription_id: Some(subscription.id.clone()),
        status: subscription.status,
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        never_expires: false,
        metadata: RecordMetadata {
            limits: plan.limits,
            source: RecordSource::Catalog,
            product_id: Some(plan.product.id.clone()),
            cancel_at_period_end: subscription.cancel_at_period_end,
        },
    }
}

fn canceled_state(
    user: &UserProfile,
    subscription: &ProviderSubscription,
    existing: Option<&SubscriptionRecord>,
) -> SubscriptionState {
    // Keep pointing at the product the subscription was for when known
    let plan_id = existing
        .map(|r| r.state.plan_id.clone())
        .or_else(|| subscription.price_id().map(str::to_string))
        .unwrap_or_else(|| subscription.id.clone());

    SubscriptionState {
        user_id: user.id,
        user_name: user.name.clone(),
        user_email: Some(user.email.clone()),
        plan_id,
        price_id: subscription.price_id().map(str::to_string),
        plan_label: None,
        stripe_customer_id: Some(subscription.customer_id.clone()),
        stripe_subscription_id: Some(subscription.id.clone()),
        status: SubscriptionStatus::Canceled,
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        never_expires: false,
        metadata: RecordMetadata {
            limits: PlanLimits::default(),
            source: RecordSource::Catalog,
            product_id: None,
            cancel_at_period_end: subscription.cancel_at_period_end,
        },
    }
}
