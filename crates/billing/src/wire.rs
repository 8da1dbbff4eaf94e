//! Stripe REST wire shapes
//!
//! Deserialization targets for the calls the typed Stripe client does not
//! cover (schedules, invoice previews, hosted sessions) and for webhook
//! payloads. Each converts into a domain type exactly once;
//! nothing outside this module branches on payload shape.

use serde::Deserialize;
use std::collections::HashMap;
use wplib_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    HostedSession, InvoiceLine, InvoicePreview, PhaseWindow, ProviderSubscription,
    ProviderSubscriptionItem, SchedulePhase, SubscriptionSchedule,
};

/// A reference that may arrive as a bare id or as an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireRef {
    Id(String),
    Object { id: String },
}

impl WireRef {
    pub(crate) fn into_id(self) -> String {
        match self {
            WireRef::Id(id) => id,
            WireRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireErrorBody {
    pub error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSubscriptionItem {
    pub id: String,
    pub price: WireRef,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSubscription {
    pub id: String,
    pub customer: WireRef,
    pub status: String,
    /// Older API versions report the period on the subscription itself,
    /// newer ones only on each item.
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    pub items: WireList<WireSubscriptionItem>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub schedule: Option<WireRef>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

impl TryFrom<WireSubscription> for ProviderSubscription {
    type Error = BillingError;

    fn try_from(wire: WireSubscription) -> BillingResult<Self> {
        let status = wire
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::StripeApi(e.to_string()))?;

        let first_item = wire.items.data.first();
        let current_period_start = wire
            .current_period_start
            .or_else(|| first_item.and_then(|item| item.current_period_start));
        let current_period_end = wire
            .current_period_end
            .or_else(|| first_item.and_then(|item| item.current_period_end));

        let items = wire
            .items
            .data
            .into_iter()
            .map(|item| ProviderSubscriptionItem {
                id: item.id,
                price_id: item.price.into_id(),
            })
            .collect();

        Ok(ProviderSubscription {
            id: wire.id,
            customer_id: wire.customer.into_id(),
            status,
            current_period_start,
            current_period_end,
            items,
            metadata: wire.metadata,
            schedule_id: wire.schedule.map(WireRef::into_id),
            cancel_at_period_end: wire.cancel_at_period_end,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePhaseItem {
    pub price: WireRef,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePhase {
    #[serde(default)]
    pub start_date: Option<i64>,
    #[serde(default)]
    pub end_date: Option<i64>,
    #[serde(default)]
    pub items: Vec<WirePhaseItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePhaseWindow {
    pub start_date: i64,
    pub end_date: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSchedule {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<WireRef>,
    #[serde(default)]
    pub current_phase: Option<WirePhaseWindow>,
    #[serde(default)]
    pub phases: Vec<WirePhase>,
}

impl From<WireSchedule> for SubscriptionSchedule {
    fn from(wire: WireSchedule) -> Self {
        let phases = wire
            .phases
            .into_iter()
            .filter_map(|phase| {
                let price_id = phase.items.into_iter().next()?.price.into_id();
                Some(SchedulePhase {
                    price_id,
                    start_date: phase.start_date,
                    end_date: phase.end_date,
                })
            })
            .collect();

        SubscriptionSchedule {
            id: wire.id,
            subscription_id: wire.subscription.map(WireRef::into_id),
            current_phase: wire.current_phase.map(|w| PhaseWindow {
                start_date: w.start_date,
                end_date: w.end_date,
            }),
            phases,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireInvoiceLine {
    #[serde(default)]
    pub description: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub period: Option<WirePeriod>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireInvoice {
    pub amount_due: i64,
    pub currency: String,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    pub lines: WireList<WireInvoiceLine>,
}

impl From<WireInvoice> for InvoicePreview {
    fn from(wire: WireInvoice) -> Self {
        InvoicePreview {
            amount_due: wire.amount_due,
            currency: wire.currency.to_lowercase(),
            next_payment_date: wire.next_payment_attempt.or(wire.period_end),
            lines: wire
                .lines
                .data
                .into_iter()
                .map(|line| InvoiceLine {
                    description: line.description,
                    amount: line.amount,
                    period_start: line.period.as_ref().map(|p| p.start),
                    period_end: line.period.as_ref().map(|p| p.end),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSession {
    pub id: String,
    pub url: Option<String>,
}

impl TryFrom<WireSession> for HostedSession {
    type Error = BillingError;

    fn try_from(wire: WireSession) -> BillingResult<Self> {
        let url = wire.url.ok_or_else(|| {
            BillingError::StripeApi(format!("Session {} has no URL", wire.id))
        })?;
        Ok(HostedSession { id: wire.id, url })
    }
}

/// Webhook event envelope
#[derive(Debug, Deserialize)]
pub(crate) struct WireEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WireEventData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEventData {
    pub object: serde_json::Value,
}

/// The part of a checkout session the webhook handler needs
#[derive(Debug, Deserialize)]
pub(crate) struct WireCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<WireRef>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
