//! In-memory fakes for the provider and store ports

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;
use uuid::Uuid;
use wplib_shared::{PlanLimits, SubscriptionStatus};

use crate::catalog::{BillingInterval, CatalogPrice, CatalogProduct, Recurrence};
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CheckoutRequest, HostedSession, InvoiceLine, InvoicePreview,
    InvoicePreviewRequest, NewCustomer, NewPrice, NewProduct, Page, PhaseWindow,
    ProrationMode, ProviderCustomer, ProviderSubscription, ProviderSubscriptionItem,
    SchedulePhase, SubscriptionSchedule, METADATA_USER_ID,
};
use crate::store::{
    AccountRecord, BillingStore, IdentityStore, LocalPlan, SubscriptionRecord, SubscriptionState,
    UserProfile,
};

pub const PERIOD_START: i64 = 1_700_000_000;
pub const PERIOD_END: i64 = 1_702_592_000;

pub fn catalog_price(
    id: &str,
    product_id: &str,
    unit_amount: i64,
    interval: BillingInterval,
) -> CatalogPrice {
    CatalogPrice {
        id: id.to_string(),
        product_id: product_id.to_string(),
        currency: "usd".to_string(),
        unit_amount,
        recurrence: Some(Recurrence {
            interval,
            interval_count: 1,
        }),
        active: true,
        metadata: HashMap::new(),
    }
}

pub fn catalog_product(id: &str, name: &str) -> CatalogProduct {
    CatalogProduct {
        id: id.to_string(),
        name: name.to_string(),
        description: None,
        active: true,
        metadata: HashMap::new(),
    }
}

pub fn provider_subscription(
    id: &str,
    customer_id: &str,
    price_id: &str,
    user_id: Uuid,
) -> ProviderSubscription {
    let mut metadata = HashMap::new();
    metadata.insert(METADATA_USER_ID.to_string(), user_id.to_string());
    ProviderSubscription {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        status: SubscriptionStatus::Active,
        current_period_start: Some(PERIOD_START),
        current_period_end: Some(PERIOD_END),
        items: vec![ProviderSubscriptionItem {
            id: format!("si_{}", id),
            price_id: price_id.to_string(),
        }],
        metadata,
        schedule_id: None,
        cancel_at_period_end: false,
    }
}

pub fn user_profile(email: &str, labels: &[&str]) -> UserProfile {
    UserProfile {
        id: Uuid::new_v4(),
        name: Some(email.split('@').next().unwrap_or(email).to_string()),
        email: email.to_string(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

pub fn local_plan(label: &str) -> LocalPlan {
    LocalPlan {
        id: Uuid::new_v4(),
        label: label.to_string(),
        name: label.to_string(),
        description: Some(format!("{} plan", label)),
        limits: PlanLimits {
            sites: Some(5),
            library: Some(100),
            storage: None,
        },
        never_expires: true,
        catalog_product_id: None,
        catalog_price_ids: Vec::new(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn upstream_failure(operation: &str) -> BillingError {
    BillingError::StripeApi(format!("Stripe API error (500): {} failed", operation))
}

#[derive(Default)]
struct ProviderState {
    prices: HashMap<String, CatalogPrice>,
    products: HashMap<String, CatalogProduct>,
    customers: HashMap<String, ProviderCustomer>,
    subscriptions: Vec<ProviderSubscription>,
    schedules: HashMap<String, SubscriptionSchedule>,
    checkouts: Vec<CheckoutRequest>,
    calls: Vec<String>,
    next_id: usize,
}

impl ProviderState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    fn subscription_mut(&mut self, id: &str) -> BillingResult<&mut ProviderSubscription> {
        self.subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }
}

/// Billing provider double. Records every mutating call.
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    fail_mutations: AtomicBool,
    fail_catalog: AtomicBool,
    /// Per-operation budget of calls that still succeed before it fails
    failing_operations: Mutex<HashMap<String, usize>>,
    page_size: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProviderState::default()),
            fail_mutations: AtomicBool::new(false),
            fail_catalog: AtomicBool::new(false),
            failing_operations: Mutex::new(HashMap::new()),
            page_size: AtomicUsize::new(100),
        }
    }

    pub fn add_price(&self, price: CatalogPrice) {
        lock(&self.state).prices.insert(price.id.clone(), price);
    }

    pub fn add_product(&self, product: CatalogProduct) {
        lock(&self.state).products.insert(product.id.clone(), product);
    }

    pub fn add_customer(&self, customer: ProviderCustomer) {
        lock(&self.state)
            .customers
            .insert(customer.id.clone(), customer);
    }

    pub fn add_subscription(&self, subscription: ProviderSubscription) {
        lock(&self.state).subscriptions.push(subscription);
    }

    pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
        lock(&self.state)
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn schedule(&self, id: &str) -> Option<SubscriptionSchedule> {
        lock(&self.state).schedules.get(id).cloned()
    }

    pub fn products(&self) -> Vec<CatalogProduct> {
        lock(&self.state).products.values().cloned().collect()
    }

    pub fn prices_for(&self, product_id: &str) -> Vec<CatalogPrice> {
        lock(&self.state)
            .prices
            .values()
            .filter(|p| p.product_id == product_id)
            .cloned()
            .collect()
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        lock(&self.state).checkouts.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_catalog(&self, fail: bool) {
        self.fail_catalog.store(fail, Ordering::SeqCst);
    }

    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Fail `operation` once `succeed_first` more calls have gone through
    pub fn fail_operation_after(&self, operation: &str, succeed_first: usize) {
        lock(&self.failing_operations).insert(operation.to_string(), succeed_first);
    }

    pub fn clear_operation_failures(&self) {
        lock(&self.failing_operations).clear();
    }

    fn check_mutation(&self, operation: &str) -> BillingResult<()> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(upstream_failure(operation));
        }
        if let Some(remaining) = lock(&self.failing_operations).get_mut(operation) {
            if *remaining == 0 {
                return Err(upstream_failure(operation));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn check_catalog(&self, operation: &str) -> BillingResult<()> {
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(upstream_failure(operation));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<CatalogPrice> {
        self.check_catalog("retrieve_price")?;
        lock(&self.state)
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("price {}", price_id)))
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<CatalogProduct> {
        self.check_catalog("retrieve_product")?;
        lock(&self.state)
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("product {}", product_id)))
    }

    async fn list_active_prices(&self) -> BillingResult<Vec<CatalogPrice>> {
        self.check_catalog("list_prices")?;
        Ok(lock(&self.state)
            .prices
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect())
    }

    async fn create_product(&self, product: &NewProduct) -> BillingResult<CatalogProduct> {
        self.check_mutation("create_product")?;
        let mut state = lock(&self.state);
        let id = state.next_id("prod");
        let created = CatalogProduct {
            id: id.clone(),
            name: product.name.clone(),
            description: product.description.clone(),
            active: true,
            metadata: product.metadata.clone(),
        };
        state.products.insert(id.clone(), created.clone());
        state.calls.push(format!("create_product:{}", id));
        Ok(created)
    }

    async fn create_price(&self, price: &NewPrice) -> BillingResult<CatalogPrice> {
        self.check_mutation("create_price")?;
        let mut state = lock(&self.state);
        let id = state.next_id("price");
        let created = CatalogPrice {
            id: id.clone(),
            product_id: price.product_id.clone(),
            currency: price.currency.clone(),
            unit_amount: price.unit_amount,
            recurrence: Some(Recurrence {
                interval: price.interval,
                interval_count: price.interval_count,
            }),
            active: true,
            metadata: price.metadata.clone(),
        };
        state.prices.insert(id.clone(), created.clone());
        state.calls.push(format!("create_price:{}", id));
        Ok(created)
    }

    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
        lock(&self.state)
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("customer {}", customer_id)))
    }

    async fn create_customer(&self, customer: &NewCustomer) -> BillingResult<ProviderCustomer> {
        self.check_mutation("create_customer")?;
        let mut state = lock(&self.state);
        let id = state.next_id("cus");
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), customer.user_id.to_string());
        let created = ProviderCustomer {
            id: id.clone(),
            email: Some(customer.email.clone()),
            name: customer.name.clone(),
            metadata,
        };
        state.customers.insert(id.clone(), created.clone());
        state.calls.push(format!("create_customer:{}", id));
        Ok(created)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.subscription(subscription_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))
    }

    async fn list_subscriptions(
        &self,
        starting_after: Option<&str>,
    ) -> BillingResult<Page<ProviderSubscription>> {
        let page_size = self.page_size.load(Ordering::SeqCst);
        let state = lock(&self.state);
        let start = match starting_after {
            Some(cursor) => state
                .subscriptions
                .iter()
                .position(|s| s.id == cursor)
                .map(|i| i + 1)
                .unwrap_or(state.subscriptions.len()),
            None => 0,
        };
        let data: Vec<_> = state
            .subscriptions
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect();
        let has_more = start + data.len() < state.subscriptions.len();
        Ok(Page { data, has_more })
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        proration: ProrationMode,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription> {
        self.check_mutation("update_subscription_price")?;
        let mut state = lock(&self.state);
        state.calls.push(format!(
            "update_price:{}:{}:{:?}",
            subscription_id, price_id, proration
        ));
        let subscription = state.subscription_mut(subscription_id)?;
        let item = subscription
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| BillingError::NotFound(format!("item {}", item_id)))?;
        item.price_id = price_id.to_string();
        subscription
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(subscription.clone())
    }

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription> {
        self.check_mutation("update_subscription_metadata")?;
        let mut state = lock(&self.state);
        state
            .calls
            .push(format!("update_metadata:{}", subscription_id));
        let subscription = state.subscription_mut(subscription_id)?;
        subscription
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(subscription.clone())
    }

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSchedule> {
        self.check_mutation("create_schedule")?;
        let mut state = lock(&self.state);
        let schedule_id = state.next_id("sub_sched");
        let subscription = state.subscription_mut(subscription_id)?;
        if subscription.schedule_id.is_some() {
            return Err(BillingError::StripeApi(format!(
                "Stripe API error (400): subscription {} already has a schedule",
                subscription_id
            )));
        }
        subscription.schedule_id = Some(schedule_id.clone());

        let start = subscription.current_period_start.unwrap_or(0);
        let end = subscription.current_period_end.unwrap_or(0);
        let schedule = SubscriptionSchedule {
            id: schedule_id.clone(),
            subscription_id: Some(subscription_id.to_string()),
            current_phase: Some(PhaseWindow {
                start_date: start,
                end_date: end,
            }),
            phases: vec![SchedulePhase {
                price_id: subscription.price_id().unwrap_or_default().to_string(),
                start_date: Some(start),
                end_date: Some(end),
            }],
        };
        state.schedules.insert(schedule_id.clone(), schedule.clone());
        state.calls.push(format!("create_schedule:{}", subscription_id));
        Ok(schedule)
    }

    async fn retrieve_schedule(&self, schedule_id: &str) -> BillingResult<SubscriptionSchedule> {
        self.schedule(schedule_id)
            .ok_or_else(|| BillingError::NotFound(format!("schedule {}", schedule_id)))
    }

    async fn update_schedule_phases(
        &self,
        schedule_id: &str,
        phases: &[SchedulePhase],
    ) -> BillingResult<SubscriptionSchedule> {
        self.check_mutation("update_schedule")?;
        let mut state = lock(&self.state);
        state.calls.push(format!("update_schedule:{}", schedule_id));
        let schedule = state
            .schedules
            .get_mut(schedule_id)
            .ok_or_else(|| BillingError::NotFound(format!("schedule {}", schedule_id)))?;
        schedule.phases = phases.to_vec();
        Ok(schedule.clone())
    }

    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()> {
        self.check_mutation("release_schedule")?;
        let mut state = lock(&self.state);
        state.calls.push(format!("release_schedule:{}", schedule_id));
        let schedule = state
            .schedules
            .remove(schedule_id)
            .ok_or_else(|| BillingError::NotFound(format!("schedule {}", schedule_id)))?;
        if let Some(subscription_id) = schedule.subscription_id {
            state.subscription_mut(&subscription_id)?.schedule_id = None;
        }
        Ok(())
    }

    async fn preview_invoice(
        &self,
        request: &InvoicePreviewRequest,
    ) -> BillingResult<InvoicePreview> {
        let state = lock(&self.state);
        let subscription = state
            .subscriptions
            .iter()
            .find(|s| s.id == request.subscription_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", request.subscription_id))
            })?;
        let old_price = subscription
            .price_id()
            .and_then(|id| state.prices.get(id))
            .ok_or_else(|| BillingError::StripeApi("current price missing".to_string()))?;
        let new_price = state
            .prices
            .get(&request.new_price_id)
            .ok_or_else(|| BillingError::NotFound(format!("price {}", request.new_price_id)))?;

        Ok(InvoicePreview {
            amount_due: (new_price.unit_amount - old_price.unit_amount).max(0),
            currency: new_price.currency.clone(),
            next_payment_date: subscription.current_period_end,
            lines: vec![
                InvoiceLine {
                    description: Some(format!("Unused time on {}", old_price.id)),
                    amount: -old_price.unit_amount,
                    period_start: Some(request.proration_date),
                    period_end: subscription.current_period_end,
                },
                InvoiceLine {
                    description: Some(format!("Remaining time on {}", new_price.id)),
                    amount: new_price.unit_amount,
                    period_start: Some(request.proration_date),
                    period_end: subscription.current_period_end,
                },
            ],
        })
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<HostedSession> {
        self.check_mutation("create_checkout_session")?;
        let mut state = lock(&self.state);
        let id = state.next_id("cs_test");
        state.checkouts.push(request.clone());
        state.calls.push(format!("checkout:{}", request.price_id));
        Ok(HostedSession {
            url: format!("https://checkout.stripe.test/{}", id),
            id,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<HostedSession> {
        let mut state = lock(&self.state);
        let id = state.next_id("bps");
        state
            .calls
            .push(format!("portal:{}:{}", customer_id, return_url));
        Ok(HostedSession {
            url: format!("https://billing.stripe.test/{}", id),
            id,
        })
    }
}

#[derive(Default)]
struct StoreState {
    subscriptions: Vec<SubscriptionRecord>,
    accounts: HashMap<Uuid, AccountRecord>,
    local_plans: HashMap<Uuid, LocalPlan>,
    users: HashMap<Uuid, UserProfile>,
}

/// Record and identity store double with write counters
pub struct MemoryStore {
    state: Mutex<StoreState>,
    subscription_writes: AtomicUsize,
    account_writes: AtomicUsize,
    label_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            subscription_writes: AtomicUsize::new(0),
            account_writes: AtomicUsize::new(0),
            label_writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn add_user(&self, user: UserProfile) -> UserProfile {
        lock(&self.state).users.insert(user.id, user.clone());
        user
    }

    pub fn add_local_plan(&self, plan: LocalPlan) -> LocalPlan {
        lock(&self.state).local_plans.insert(plan.id, plan.clone());
        plan
    }

    /// Seed a record directly, bypassing the counters
    pub fn add_record(&self, state: SubscriptionState) -> SubscriptionRecord {
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            state,
            updated_at: OffsetDateTime::now_utc(),
        };
        lock(&self.state).subscriptions.push(record.clone());
        record
    }

    /// Seed an account directly, bypassing the counters
    pub fn add_account(&self, user_id: Uuid, customer: Option<&str>, plan: Option<&str>) {
        lock(&self.state).accounts.insert(
            user_id,
            AccountRecord {
                user_id,
                stripe_customer_id: customer.map(str::to_string),
                current_plan: plan.map(str::to_string),
                updated_at: OffsetDateTime::now_utc(),
            },
        );
    }

    pub fn user(&self, id: Uuid) -> Option<UserProfile> {
        lock(&self.state).users.get(&id).cloned()
    }

    pub fn record_for(&self, user_id: Uuid) -> Option<SubscriptionRecord> {
        lock(&self.state)
            .subscriptions
            .iter()
            .find(|r| r.state.user_id == user_id)
            .cloned()
    }

    pub fn account_for(&self, user_id: Uuid) -> Option<AccountRecord> {
        lock(&self.state).accounts.get(&user_id).cloned()
    }

    pub fn labels_for(&self, user_id: Uuid) -> Vec<String> {
        self.user(user_id).map(|u| u.labels).unwrap_or_default()
    }

    pub fn local_plan(&self, id: Uuid) -> Option<LocalPlan> {
        lock(&self.state).local_plans.get(&id).cloned()
    }

    /// (subscription, account, label) writes so far
    pub fn write_counts(&self) -> (usize, usize, usize) {
        (
            self.subscription_writes.load(Ordering::SeqCst),
            self.account_writes.load(Ordering::SeqCst),
            self.label_writes.load(Ordering::SeqCst),
        )
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> BillingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn find_subscription_by_provider_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(lock(&self.state)
            .subscriptions
            .iter()
            .find(|r| r.state.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.record_for(user_id))
    }

    async fn insert_subscription(
        &self,
        state: &SubscriptionState,
    ) -> BillingResult<SubscriptionRecord> {
        self.check_write()?;
        let mut guard = lock(&self.state);
        if guard
            .subscriptions
            .iter()
            .any(|r| r.state.user_id == state.user_id)
        {
            return Err(BillingError::Conflict(format!(
                "user {} already has a subscription record",
                state.user_id
            )));
        }
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            state: state.clone(),
            updated_at: OffsetDateTime::now_utc(),
        };
        guard.subscriptions.push(record.clone());
        self.subscription_writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<SubscriptionRecord> {
        self.check_write()?;
        let mut guard = lock(&self.state);
        let record = guard
            .subscriptions
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription record {}", id)))?;
        record.state = state.clone();
        record.updated_at = OffsetDateTime::now_utc();
        self.subscription_writes.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(lock(&self.state).subscriptions.clone())
    }

    async fn list_subscriptions_by_label(
        &self,
        plan_label: &str,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(lock(&self.state)
            .subscriptions
            .iter()
            .filter(|r| r.state.plan_label.as_deref() == Some(plan_label))
            .cloned()
            .collect())
    }

    async fn get_account(&self, user_id: Uuid) -> BillingResult<Option<AccountRecord>> {
        Ok(self.account_for(user_id))
    }

    async fn upsert_account(
        &self,
        user_id: Uuid,
        stripe_customer_id: Option<&str>,
        current_plan: Option<&str>,
    ) -> BillingResult<AccountRecord> {
        self.check_write()?;
        let mut guard = lock(&self.state);
        let account = guard.accounts.entry(user_id).or_insert_with(|| AccountRecord {
            user_id,
            stripe_customer_id: None,
            current_plan: None,
            updated_at: OffsetDateTime::now_utc(),
        });
        if let Some(customer) = stripe_customer_id {
            account.stripe_customer_id = Some(customer.to_string());
        }
        account.current_plan = current_plan.map(str::to_string);
        account.updated_at = OffsetDateTime::now_utc();
        self.account_writes.fetch_add(1, Ordering::SeqCst);
        Ok(account.clone())
    }

    async fn list_accounts(&self) -> BillingResult<Vec<AccountRecord>> {
        Ok(lock(&self.state).accounts.values().cloned().collect())
    }

    async fn get_local_plan(&self, id: Uuid) -> BillingResult<Option<LocalPlan>> {
        Ok(self.local_plan(id))
    }

    async fn set_local_plan_catalog_ids(
        &self,
        id: Uuid,
        product_id: &str,
        price_ids: &[String],
    ) -> BillingResult<LocalPlan> {
        self.check_write()?;
        let mut guard = lock(&self.state);
        let plan = guard
            .local_plans
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("local plan {}", id)))?;
        plan.catalog_product_id = Some(product_id.to_string());
        plan.catalog_price_ids = price_ids.to_vec();
        Ok(plan.clone())
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        Ok(self.user(user_id))
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>> {
        Ok(lock(&self.state)
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }

    async fn set_labels(&self, user_id: Uuid, labels: &[String]) -> BillingResult<()> {
        self.check_write()?;
        let mut guard = lock(&self.state);
        let user = guard
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        user.labels = labels.to_vec();
        self.label_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
