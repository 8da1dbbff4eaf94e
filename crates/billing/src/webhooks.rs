//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, decodes the event envelope and
//! feeds subscription snapshots into the [`Synchronizer`]. Deliveries may
//! repeat; the Synchronizer makes that safe.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::CatalogReader;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    user_id_from_metadata, BillingProvider, ProviderSubscription, METADATA_PLAN_LABEL,
};
use crate::store::{BillingStore, IdentityStore, UserProfile};
use crate::sync::{RecordWrite, Synchronizer};
use crate::wire::{WireCheckoutSession, WireEvent, WireSubscription};

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// A verified webhook event
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Synced { write: RecordWrite },
    /// Handled event that could not be mapped to a user or plan
    Skipped { reason: String },
    /// Event type this handler does not act on
    Ignored,
}

pub struct WebhookHandler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    identity: Arc<dyn IdentityStore>,
    catalog: CatalogReader,
    sync: Synchronizer,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        identity: Arc<dyn IdentityStore>,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            catalog: CatalogReader::new(provider.clone()),
            sync: Synchronizer::new(store.clone(), identity.clone()),
            provider,
            store,
            identity,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
        }
    }

    /// Verify and process one delivery
    pub async fn process(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(event).await
    }

    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock, then decode the envelope.
    /// Nothing in the payload is parsed before the signature checks out.
    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        // t=timestamp,v1=signature[,v1=signature...][,v0=...]
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp,
                now,
                tolerance = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = sign_payload(&self.webhook_secret, timestamp, payload)?;
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let wire: WireEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayload(e.to_string()))?;

        Ok(WebhookEvent {
            id: wire.id,
            event_type: wire.event_type,
            created: wire.created,
            object: wire.data.object,
        })
    }

    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook"
        );

        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(&event).await?,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_updated(&event).await?
            }
            "customer.subscription.deleted" => self.handle_subscription_deleted(&event).await?,
            _ => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                WebhookOutcome::Ignored
            }
        };

        if let WebhookOutcome::Skipped { reason } = &outcome {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Webhook skipped"
            );
        }

        Ok(outcome)
    }

    async fn handle_checkout_completed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let session: WireCheckoutSession = decode(&event.object)?;
        let Some(subscription_id) = session.subscription.map(|s| s.into_id()) else {
            return Ok(skipped(format!(
                "checkout session {} created no subscription",
                session.id
            )));
        };

        let subscription = self.provider.retrieve_subscription(&subscription_id).await?;

        // Metadata is stamped at checkout creation; without it there is
        // nothing trustworthy to reconcile against
        let user_id = subscription
            .user_id()
            .or_else(|| user_id_from_metadata(&session.metadata));
        let plan_label = subscription
            .metadata
            .get(METADATA_PLAN_LABEL)
            .or_else(|| session.metadata.get(METADATA_PLAN_LABEL))
            .cloned();
        let (Some(user_id), Some(plan_label)) = (user_id, plan_label) else {
            return Ok(skipped(format!(
                "subscription {} is missing user_id or plan_label metadata",
                subscription_id
            )));
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan_label = %plan_label,
            "Checkout completed"
        );

        self.sync_snapshot(user_id, &subscription).await
    }

    async fn handle_subscription_updated(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let subscription = decode_subscription(&event.object)?;
        let Some(user_id) = self.resolve_user_id(&subscription).await? else {
            return Ok(skipped(format!(
                "subscription {} has no user_id metadata and no record",
                subscription.id
            )));
        };
        self.sync_snapshot(user_id, &subscription).await
    }

    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let subscription = decode_subscription(&event.object)?;
        let Some(user_id) = self.resolve_user_id(&subscription).await? else {
            return Ok(skipped(format!(
                "subscription {} has no user_id metadata and no record",
                subscription.id
            )));
        };
        let Some(user) = self.identity.get_user(user_id).await? else {
            return Ok(skipped(format!("user {} not found", user_id)));
        };

        let outcome = self.sync.sync_canceled(&user, &subscription).await?;
        Ok(WebhookOutcome::Synced {
            write: outcome.write,
        })
    }

    /// Resolve user and plan concurrently, then synchronize
    async fn sync_snapshot(
        &self,
        user_id: Uuid,
        subscription: &ProviderSubscription,
    ) -> BillingResult<WebhookOutcome> {
        if subscription.status == wplib_shared::SubscriptionStatus::Canceled {
            let Some(user) = self.identity.get_user(user_id).await? else {
                return Ok(skipped(format!("user {} not found", user_id)));
            };
            let outcome = self.sync.sync_canceled(&user, subscription).await?;
            return Ok(WebhookOutcome::Synced {
                write: outcome.write,
            });
        }

        let price_id = subscription.price_id().ok_or_else(|| {
            BillingError::WebhookPayload(format!("subscription {} has no items", subscription.id))
        })?;

        let (user, plan) = tokio::try_join!(
            self.identity.get_user(user_id),
            self.catalog.resolve(price_id)
        )?;
        let Some(user) = user else {
            return Ok(skipped(format!("user {} not found", user_id)));
        };

        let outcome = self
            .sync
            .sync_subscription(&user, subscription, Some(&plan))
            .await?;
        Ok(WebhookOutcome::Synced {
            write: outcome.write,
        })
    }

    async fn resolve_user_id(
        &self,
        subscription: &ProviderSubscription,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = subscription.user_id() {
            return Ok(Some(user_id));
        }
        Ok(self
            .store
            .find_subscription_by_provider_id(&subscription.id)
            .await?
            .map(|record| record.state.user_id))
    }
}

/// Lower-case hex HMAC-SHA256 of `{timestamp}.{payload}`
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn skipped(reason: String) -> WebhookOutcome {
    WebhookOutcome::Skipped { reason }
}

fn decode<T: serde::de::DeserializeOwned>(object: &serde_json::Value) -> BillingResult<T> {
    T::deserialize(object).map_err(|e| BillingError::WebhookPayload(e.to_string()))
}

fn decode_subscription(object: &serde_json::Value) -> BillingResult<ProviderSubscription> {
    let wire: WireSubscription = decode(object)?;
    ProviderSubscription::try_from(wire).map_err(|e| BillingError::WebhookPayload(e.to_string()))
}
