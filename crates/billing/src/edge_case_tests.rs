// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! End-to-end scenarios across the mutator, webhook handler, bulk sync,
//! migration and invariant checker, all running against the in-memory
//! provider and store:
//! - Subscription lifecycle (checkout, downgrade, phase transition, cancel)
//! - Upgrades that release a pending downgrade
//! - Interactive change racing its own webhook
//! - Drift repair by bulk sync
//! - Currency mismatches

#[cfg(test)]
mod lifecycle_tests {
    use serde_json::json;
    use std::sync::Arc;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::catalog::BillingInterval;
    use crate::client::BillingUrls;
    use crate::invariants::InvariantChecker;
    use crate::provider::METADATA_PLAN_LABEL;
    use crate::subscriptions::{PlanChangeOutcome, PlanChangeRequest, RedirectKind};
    use crate::sync::RecordWrite;
    use crate::testing::{
        catalog_price, catalog_product, provider_subscription, user_profile, FakeProvider,
        MemoryStore, PERIOD_END, PERIOD_START,
    };
    use crate::webhooks::{sign_payload, WebhookHandler, WebhookOutcome, DEFAULT_TOLERANCE_SECS};
    use crate::SubscriptionService;

    const SECRET: &str = "whsec_edge";

    struct Harness {
        provider: Arc<FakeProvider>,
        store: Arc<MemoryStore>,
        subscriptions: SubscriptionService,
        webhooks: WebhookHandler,
    }

    fn harness() -> Harness {
        let provider = Arc::new(FakeProvider::new());
        provider.add_product(catalog_product("prod_basic", "Basic"));
        provider.add_product(catalog_product("prod_pro", "Pro"));
        provider.add_product(catalog_product("prod_premium", "Premium"));
        provider.add_price(catalog_price("price_n", "prod_basic", 1000, BillingInterval::Month));
        provider.add_price(catalog_price("price_m", "prod_pro", 2000, BillingInterval::Month));
        provider.add_price(catalog_price("price_o", "prod_premium", 3000, BillingInterval::Month));

        let store = Arc::new(MemoryStore::new());
        let subscriptions = SubscriptionService::new(
            provider.clone(),
            store.clone(),
            store.clone(),
            BillingUrls {
                success_url: "https://app.test/ok".to_string(),
                cancel_url: "https://app.test/cancel".to_string(),
                portal_return_url: "https://app.test/billing".to_string(),
            },
        );
        let webhooks = WebhookHandler::new(
            provider.clone(),
            store.clone(),
            store.clone(),
            SECRET,
            DEFAULT_TOLERANCE_SECS,
        );
        Harness {
            provider,
            store,
            subscriptions,
            webhooks,
        }
    }

    fn request(user_id: Uuid, price_id: &str) -> PlanChangeRequest {
        PlanChangeRequest {
            user_id,
            price_id: price_id.to_string(),
            return_url: None,
            update_type: None,
        }
    }

    fn subscription_object(
        id: &str,
        customer: &str,
        price: &str,
        status: &str,
        user_id: Uuid,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "object": "subscription",
            "customer": customer,
            "status": status,
            "current_period_start": PERIOD_START,
            "current_period_end": PERIOD_END,
            "items": {"object": "list", "data": [{
                "id": format!("si_{}", id),
                "price": {"id": price, "object": "price"}
            }]},
            "metadata": {"user_id": user_id.to_string()},
            "cancel_at_period_end": false
        })
    }

    async fn deliver(
        webhooks: &WebhookHandler,
        event_type: &str,
        object: serde_json::Value,
    ) -> WebhookOutcome {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let payload = json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": event_type,
            "created": now,
            "data": {"object": object}
        })
        .to_string();
        let signature = format!("t={},v1={}", now, sign_payload(SECRET, now, &payload).unwrap());
        webhooks.process(&payload, &signature).await.unwrap()
    }

    async fn assert_healthy(store: &Arc<MemoryStore>) {
        let summary = InvariantChecker::new(store.clone(), store.clone())
            .run()
            .await
            .unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
    }

    // =========================================================================
    // Checkout → scheduled downgrade → phase transition → cancel (replayed)
    // =========================================================================
    #[tokio::test]
    async fn test_full_subscription_lifecycle() {
        let h = harness();
        let user = h.store.add_user(user_profile("owner@example.com", &["admin"]));

        // New subscriber is sent to checkout
        let outcome = h.subscriptions.change_plan(&request(user.id, "price_m")).await.unwrap();
        assert!(matches!(
            outcome,
            PlanChangeOutcome::Redirect {
                kind: RedirectKind::Checkout,
                ..
            }
        ));
        let checkout = h.provider.checkouts().pop().unwrap();
        assert_eq!(
            checkout.metadata.get(METADATA_PLAN_LABEL).map(String::as_str),
            Some("pro")
        );
        assert!(h.store.record_for(user.id).is_none());

        // Provider creates the subscription carrying the checkout metadata
        let mut created =
            provider_subscription("sub_1", &checkout.customer_id, "price_m", user.id);
        created.metadata = checkout.metadata.clone();
        h.provider.add_subscription(created);

        let outcome = deliver(
            &h.webhooks,
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "object": "checkout.session",
                "subscription": "sub_1",
                "metadata": checkout.metadata
            }),
        )
        .await;
        assert_eq!(
            outcome,
            WebhookOutcome::Synced {
                write: RecordWrite::Created
            }
        );
        assert_eq!(h.store.labels_for(user.id), vec!["admin", "pro"]);
        assert_healthy(&h.store).await;

        // Downgrade is deferred to the period end
        let outcome = h.subscriptions.change_plan(&request(user.id, "price_n")).await.unwrap();
        let PlanChangeOutcome::Scheduled {
            schedule_id,
            effective_at,
            ..
        } = outcome
        else {
            panic!("expected a scheduled downgrade");
        };
        assert_eq!(effective_at, PERIOD_END);
        let schedule = h.provider.schedule(&schedule_id).unwrap();
        assert_eq!(schedule.phases.len(), 2);
        assert_eq!(schedule.phases[0].price_id, "price_m");
        assert_eq!(schedule.phases[0].end_date, Some(PERIOD_END));
        assert_eq!(schedule.phases[1].price_id, "price_n");
        assert_eq!(schedule.phases[1].start_date, Some(PERIOD_END));
        assert_eq!(h.store.labels_for(user.id), vec!["admin", "pro"]);

        // Phase transition arrives as a subscription update
        let outcome = deliver(
            &h.webhooks,
            "customer.subscription.updated",
            subscription_object("sub_1", &checkout.customer_id, "price_n", "active", user.id),
        )
        .await;
        assert_eq!(
            outcome,
            WebhookOutcome::Synced {
                write: RecordWrite::Updated
            }
        );
        assert_eq!(h.store.labels_for(user.id), vec!["admin", "basic"]);
        assert_eq!(
            h.store.account_for(user.id).unwrap().current_plan.as_deref(),
            Some("basic")
        );

        // Cancellation delivered twice removes the label once
        let deleted =
            subscription_object("sub_1", &checkout.customer_id, "price_n", "canceled", user.id);
        let (_, _, labels_before) = h.store.write_counts();
        deliver(&h.webhooks, "customer.subscription.deleted", deleted.clone()).await;
        let outcome = deliver(&h.webhooks, "customer.subscription.deleted", deleted).await;
        let (_, _, labels_after) = h.store.write_counts();

        assert_eq!(
            outcome,
            WebhookOutcome::Synced {
                write: RecordWrite::Unchanged
            }
        );
        assert_eq!(labels_after - labels_before, 1);
        assert_eq!(h.store.labels_for(user.id), vec!["admin"]);
        assert_eq!(h.store.account_for(user.id).unwrap().current_plan, None);
        assert_healthy(&h.store).await;
    }

    // =========================================================================
    // Upgrade after a scheduled downgrade releases the schedule first
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_cancels_pending_downgrade() {
        let h = harness();
        let user = h.store.add_user(user_profile("a@example.com", &[]));
        h.provider
            .add_subscription(provider_subscription("sub_1", "cus_1", "price_m", user.id));
        deliver(
            &h.webhooks,
            "customer.subscription.created",
            subscription_object("sub_1", "cus_1", "price_m", "active", user.id),
        )
        .await;

        let scheduled = h.subscriptions.change_plan(&request(user.id, "price_n")).await.unwrap();
        let PlanChangeOutcome::Scheduled { schedule_id, .. } = scheduled else {
            panic!("expected a scheduled downgrade");
        };

        let outcome = h.subscriptions.change_plan(&request(user.id, "price_o")).await.unwrap();
        assert!(matches!(outcome, PlanChangeOutcome::Changed { .. }));

        let calls = h.provider.calls();
        let release = calls
            .iter()
            .position(|c| c == &format!("release_schedule:{}", schedule_id))
            .unwrap();
        let update = calls
            .iter()
            .position(|c| c.starts_with("update_price:sub_1:price_o"))
            .unwrap();
        assert!(release < update);
        assert!(h.provider.schedule(&schedule_id).is_none());

        // Local state follows within the same call
        assert_eq!(h.store.labels_for(user.id), vec!["premium"]);
        assert_healthy(&h.store).await;
    }

    // =========================================================================
    // Interactive upgrade racing the webhook for the same change converges
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_and_webhook_race_converges() {
        let h = harness();
        let user = h.store.add_user(user_profile("a@example.com", &[]));
        h.provider
            .add_subscription(provider_subscription("sub_1", "cus_1", "price_n", user.id));
        deliver(
            &h.webhooks,
            "customer.subscription.created",
            subscription_object("sub_1", "cus_1", "price_n", "active", user.id),
        )
        .await;

        let upgrade = request(user.id, "price_m");
        let (changed, _) = tokio::join!(
            h.subscriptions.change_plan(&upgrade),
            deliver(
                &h.webhooks,
                "customer.subscription.updated",
                subscription_object("sub_1", "cus_1", "price_m", "active", user.id),
            )
        );
        changed.unwrap();

        let record = h.store.record_for(user.id).unwrap();
        assert_eq!(record.state.plan_label.as_deref(), Some("pro"));
        assert_eq!(record.state.price_id.as_deref(), Some("price_m"));
        assert_eq!(h.store.labels_for(user.id), vec!["pro"]);
        assert_healthy(&h.store).await;
    }

    // =========================================================================
    // Currency mismatch: immediate unless the caller says downgrade
    // =========================================================================
    #[tokio::test]
    async fn test_currency_mismatch_defaults_to_upgrade() {
        let h = harness();
        let mut eur = catalog_price("price_eur", "prod_basic", 500, BillingInterval::Month);
        eur.currency = "eur".to_string();
        h.provider.add_price(eur);

        let user = h.store.add_user(user_profile("a@example.com", &[]));
        h.provider
            .add_subscription(provider_subscription("sub_1", "cus_1", "price_m", user.id));
        deliver(
            &h.webhooks,
            "customer.subscription.created",
            subscription_object("sub_1", "cus_1", "price_m", "active", user.id),
        )
        .await;

        let outcome = h
            .subscriptions
            .change_plan(&request(user.id, "price_eur"))
            .await
            .unwrap();
        assert!(matches!(outcome, PlanChangeOutcome::Changed { .. }));
        assert!(h
            .provider
            .calls()
            .iter()
            .any(|c| c.starts_with("update_price:sub_1:price_eur")));
    }

    #[tokio::test]
    async fn test_currency_mismatch_honors_downgrade_flag() {
        let h = harness();
        let mut eur = catalog_price("price_eur", "prod_basic", 500, BillingInterval::Month);
        eur.currency = "eur".to_string();
        h.provider.add_price(eur);

        let user = h.store.add_user(user_profile("a@example.com", &[]));
        h.provider
            .add_subscription(provider_subscription("sub_1", "cus_1", "price_m", user.id));
        deliver(
            &h.webhooks,
            "customer.subscription.created",
            subscription_object("sub_1", "cus_1", "price_m", "active", user.id),
        )
        .await;

        let mut req = request(user.id, "price_eur");
        req.update_type = Some(crate::classifier::UpdateType::Downgrade);
        let outcome = h.subscriptions.change_plan(&req).await.unwrap();
        assert!(matches!(outcome, PlanChangeOutcome::Scheduled { .. }));
        assert_eq!(h.store.labels_for(user.id), vec!["pro"]);
    }

    // =========================================================================
    // Webhook for a subscription nobody owns is skipped without writes
    // =========================================================================
    #[tokio::test]
    async fn test_unowned_subscription_webhook_skipped() {
        let h = harness();
        let mut object = subscription_object("sub_x", "cus_x", "price_m", "active", Uuid::new_v4());
        object["metadata"] = json!({});

        let outcome = deliver(&h.webhooks, "customer.subscription.updated", object).await;
        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));
        assert_eq!(h.store.write_counts(), (0, 0, 0));
    }
}

#[cfg(test)]
mod repair_tests {
    use std::sync::Arc;

    use crate::assignment::PlanAssigner;
    use crate::bulk_sync::BulkSync;
    use crate::catalog::BillingInterval;
    use crate::invariants::InvariantChecker;
    use crate::migration::{MigrationPrice, PlanMigrator};
    use crate::store::{BillingStore, IdentityStore};
    use crate::sync::Synchronizer;
    use crate::testing::{
        catalog_price, catalog_product, local_plan, provider_subscription, user_profile,
        FakeProvider, MemoryStore,
    };

    // =========================================================================
    // Drifted labels and pointers are repaired by a bulk sweep
    // =========================================================================
    #[tokio::test]
    async fn test_bulk_sync_repairs_drift() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_product(catalog_product("prod_pro", "Pro"));
        provider.add_price(catalog_price("price_m", "prod_pro", 2000, BillingInterval::Month));
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone(), store.clone());
        let bulk = BulkSync::new(provider.clone(), store.clone(), sync);
        let checker = InvariantChecker::new(store.clone(), store.clone());

        let user = store.add_user(user_profile("a@example.com", &["admin"]));
        provider.add_subscription(provider_subscription("sub_1", "cus_1", "price_m", user.id));
        bulk.run().await.unwrap();
        assert!(checker.run().await.unwrap().healthy);

        // Someone edits labels and the pointer by hand
        store.set_labels(user.id, &["admin".to_string()]).await.unwrap();
        store
            .upsert_account(user.id, None, Some("legacy"))
            .await
            .unwrap();
        let summary = checker.run().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 2);

        let report = bulk.run().await.unwrap();
        assert_eq!(report.synced.unchanged, 1);
        assert!(checker.run().await.unwrap().healthy);
        assert_eq!(store.labels_for(user.id), vec!["admin", "pro"]);
    }

    // =========================================================================
    // Migration leaves local subscribers on the local plan
    // =========================================================================
    #[tokio::test]
    async fn test_migration_keeps_assigned_subscribers() {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(MemoryStore::new());
        let plan = store.add_local_plan(local_plan("partner"));
        let user = store.add_user(user_profile("a@example.com", &[]));

        let assigner = PlanAssigner::new(
            provider.clone(),
            store.clone(),
            store.clone(),
            Synchronizer::new(store.clone(), store.clone()),
        );
        assigner.assign(user.id, plan.id).await.unwrap();

        let price: MigrationPrice = serde_json::from_value(serde_json::json!({
            "amount": 9.99,
            "currency": "usd",
            "interval": "month"
        }))
        .unwrap();
        let result = PlanMigrator::new(provider.clone(), store.clone())
            .migrate(plan.id, &[price])
            .await
            .unwrap();

        assert_eq!(result.prices.len(), 1);
        assert_eq!(result.prices[0].unit_amount, 999);
        assert_eq!(result.subscribers_to_migrate.len(), 1);

        let stored = store.get_local_plan(plan.id).await.unwrap().unwrap();
        assert!(stored.is_migrated());
        assert!(!stored.catalog_price_ids.is_empty());

        let record = store.record_for(user.id).unwrap();
        assert_eq!(record.state.plan_label.as_deref(), Some("partner"));
        assert_eq!(record.state.stripe_subscription_id, None);
        assert_eq!(store.labels_for(user.id), vec!["partner"]);

        let summary = InvariantChecker::new(store.clone(), store.clone())
            .run()
            .await
            .unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
    }
}
