// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries upstream response bodies
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! wplib Billing Module
//!
//! Keeps local subscription state consistent with Stripe.
//!
//! ## Features
//!
//! - **Catalog**: Read-only view of products and recurring prices
//! - **Plan Changes**: Immediate upgrades, downgrades scheduled at period end,
//!   checkout for new subscribers, portal fallback on provider errors
//! - **Proration Preview**: Invoice preview for a proposed price change
//! - **Webhooks**: Signed Stripe events reconciled into local state
//! - **Bulk Sync**: Full sweep of provider subscriptions
//! - **Local Plans**: Manual assignment and migration into the catalog
//! - **Invariants**: Consistency checks across records, accounts and labels

pub mod assignment;
pub mod bulk_sync;
pub mod catalog;
pub mod classifier;
pub mod client;
pub mod error;
pub mod invariants;
pub mod migration;
pub mod pg_store;
pub mod proration;
pub mod provider;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod webhooks;

mod wire;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod edge_case_tests;

// Assignment
pub use assignment::PlanAssigner;

// Bulk Sync
pub use bulk_sync::{BulkSync, BulkSyncReport, SyncCounts};

// Catalog
pub use catalog::{
    BillingInterval, CatalogPrice, CatalogProduct, CatalogReader, PlanSummary, PriceSummary,
    ResolvedPlan,
};

// Classifier
pub use classifier::{classify, PlanChange, UpdateType};

// Client
pub use client::{BillingUrls, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Migration
pub use migration::{MigrationPrice, MigrationResult, PendingSubscriber, PlanMigrator};

// Postgres store
pub use pg_store::PgStore;

// Proration
pub use proration::ProrationPreviewer;

// Provider
pub use provider::{BillingProvider, HostedSession, InvoiceLine, InvoicePreview};

// Store
pub use store::{
    AccountRecord, BillingStore, IdentityStore, LocalPlan, SubscriptionRecord, SubscriptionState,
    UserProfile,
};

// Subscriptions
pub use subscriptions::{PlanChangeOutcome, PlanChangeRequest, RedirectKind, SubscriptionService};

// Sync
pub use sync::{RecordWrite, SyncOutcome, Synchronizer};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;
use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: CatalogReader,
    pub previewer: ProrationPreviewer,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub bulk_sync: BulkSync,
    pub migrator: PlanMigrator,
    pub assigner: PlanAssigner,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config, backed by Stripe
    /// and Postgres
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        let provider = Arc::new(StripeClient::new(config.clone()));
        Self::with_backends(&config, provider, store.clone(), store)
    }

    /// Wire the services over arbitrary provider and store implementations
    pub fn with_backends(
        config: &StripeConfig,
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        identity: Arc<dyn IdentityStore>,
    ) -> Self {
        let sync = || Synchronizer::new(store.clone(), identity.clone());

        Self {
            catalog: CatalogReader::new(provider.clone()),
            previewer: ProrationPreviewer::new(provider.clone(), store.clone()),
            subscriptions: SubscriptionService::new(
                provider.clone(),
                store.clone(),
                identity.clone(),
                config.urls(),
            ),
            webhooks: WebhookHandler::new(
                provider.clone(),
                store.clone(),
                identity.clone(),
                config.webhook_secret.clone(),
                config.webhook_tolerance_secs,
            ),
            bulk_sync: BulkSync::new(provider.clone(), identity.clone(), sync()),
            migrator: PlanMigrator::new(provider.clone(), store.clone()),
            assigner: PlanAssigner::new(provider, store.clone(), identity.clone(), sync()),
            invariants: InvariantChecker::new(store, identity),
        }
    }
}
