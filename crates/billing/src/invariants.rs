//! Billing Invariants Module
//!
//! Runnable consistency checks over the Subscription Records, Account
//! pointers and entitlement labels. Intended to run after a bulk sync or a
//! webhook replay to confirm the three stores still agree.
//!
//! Checks only read; they never repair. Repair is a bulk sync.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;
use wplib_shared::{SubscriptionStatus, ADMIN_LABEL};

use crate::error::BillingResult;
use crate::store::{AccountRecord, BillingStore, IdentityStore, SubscriptionRecord, UserProfile};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - user may be entitled to something they do not pay for
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

const SINGLE_RECORD: &str = "single_subscription_record";
const POINTER_MATCHES: &str = "account_pointer_matches_record";
const CANCELED_CLEARED: &str = "canceled_record_cleared";
const LABEL_PRESENT: &str = "entitlement_label_present";

/// Everything the checks look at, read once
struct Snapshot {
    records: Vec<SubscriptionRecord>,
    accounts: HashMap<Uuid, AccountRecord>,
    users: HashMap<Uuid, UserProfile>,
    /// Every plan label some record has granted
    plan_labels: BTreeSet<String>,
}

impl Snapshot {
    fn plan_labels_held(&self, user_id: Uuid) -> Vec<&str> {
        self.users
            .get(&user_id)
            .map(|user| {
                user.labels
                    .iter()
                    .map(String::as_str)
                    .filter(|l| *l != ADMIN_LABEL && self.plan_labels.contains(*l))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
    identity: Arc<dyn IdentityStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>, identity: Arc<dyn IdentityStore>) -> Self {
        Self { store, identity }
    }

    /// Run all invariant checks and return summary
    pub async fn run(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let snapshot = self.snapshot().await?;

        let mut violations = Vec::new();
        violations.extend(check_single_record(&snapshot));
        violations.extend(check_pointer_matches(&snapshot));
        violations.extend(check_canceled_cleared(&snapshot));
        violations.extend(check_label_present(&snapshot));

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed,
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![SINGLE_RECORD, POINTER_MATCHES, CANCELED_CLEARED, LABEL_PRESENT]
    }

    async fn snapshot(&self) -> BillingResult<Snapshot> {
        let records = self.store.list_subscriptions().await?;
        let accounts = self
            .store
            .list_accounts()
            .await?
            .into_iter()
            .map(|a| (a.user_id, a))
            .collect::<HashMap<_, _>>();

        let mut users = HashMap::new();
        for user_id in records.iter().map(|r| r.state.user_id) {
            if users.contains_key(&user_id) {
                continue;
            }
            if let Some(user) = self.identity.get_user(user_id).await? {
                users.insert(user_id, user);
            }
        }

        let plan_labels = records
            .iter()
            .filter_map(|r| r.state.plan_label.clone())
            .chain(accounts.values().filter_map(|a| a.current_plan.clone()))
            .collect();

        Ok(Snapshot {
            records,
            accounts,
            users,
            plan_labels,
        })
    }
}

/// Invariant 1: at most one Subscription Record per user
///
/// A second record makes webhook resolution ambiguous.
fn check_single_record(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    let mut by_user: HashMap<Uuid, Vec<&SubscriptionRecord>> = HashMap::new();
    for record in &snapshot.records {
        by_user.entry(record.state.user_id).or_default().push(record);
    }

    let mut violations: Vec<_> = by_user
        .into_iter()
        .filter(|(_, records)| records.len() > 1)
        .map(|(user_id, records)| InvariantViolation {
            invariant: SINGLE_RECORD.to_string(),
            user_ids: vec![user_id],
            description: format!(
                "User has {} subscription records (expected 1)",
                records.len()
            ),
            context: serde_json::json!({
                "record_ids": records.iter().map(|r| r.id).collect::<Vec<_>>(),
                "subscription_ids": records
                    .iter()
                    .map(|r| r.state.stripe_subscription_id.clone())
                    .collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect();
    violations.sort_by_key(|v| v.user_ids[0]);
    violations
}

/// Invariant 2: the account pointer names the record's plan
fn check_pointer_matches(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .records
        .iter()
        .filter(|r| r.state.status != SubscriptionStatus::Canceled)
        .filter_map(|record| {
            let pointer = snapshot
                .accounts
                .get(&record.state.user_id)
                .and_then(|a| a.current_plan.as_deref());
            if pointer == record.state.plan_label.as_deref() {
                return None;
            }
            Some(InvariantViolation {
                invariant: POINTER_MATCHES.to_string(),
                user_ids: vec![record.state.user_id],
                description: format!(
                    "Account points at {:?} but subscription record has plan {:?}",
                    pointer, record.state.plan_label
                ),
                context: serde_json::json!({
                    "account_plan": pointer,
                    "record_plan": record.state.plan_label,
                    "status": record.state.status,
                }),
                severity: ViolationSeverity::High,
            })
        })
        .collect()
}

/// Invariant 3: canceled means no pointer and no plan label anywhere
fn check_canceled_cleared(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .records
        .iter()
        .filter(|r| r.state.status == SubscriptionStatus::Canceled)
        .filter_map(|record| {
            let user_id = record.state.user_id;
            let pointer = snapshot
                .accounts
                .get(&user_id)
                .and_then(|a| a.current_plan.as_deref());
            let held = snapshot.plan_labels_held(user_id);

            if pointer.is_none() && record.state.plan_label.is_none() && held.is_empty() {
                return None;
            }
            Some(InvariantViolation {
                invariant: CANCELED_CLEARED.to_string(),
                user_ids: vec![user_id],
                description: "Canceled subscription still grants a plan".to_string(),
                context: serde_json::json!({
                    "subscription_id": record.state.stripe_subscription_id,
                    "account_plan": pointer,
                    "record_plan": record.state.plan_label,
                    "plan_labels": held,
                }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect()
}

/// Invariant 4: an entitled user carries the plan label
fn check_label_present(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .records
        .iter()
        .filter(|r| r.state.status != SubscriptionStatus::Canceled)
        .filter_map(|record| {
            let plan_label = record.state.plan_label.as_deref()?;
            let user_id = record.state.user_id;
            let labels = snapshot
                .users
                .get(&user_id)
                .map(|u| u.labels.clone())
                .unwrap_or_default();
            if labels.iter().any(|l| l == plan_label) {
                return None;
            }
            Some(InvariantViolation {
                invariant: LABEL_PRESENT.to_string(),
                user_ids: vec![user_id],
                description: format!("User is on plan '{}' but lacks the label", plan_label),
                context: serde_json::json!({
                    "plan_label": plan_label,
                    "labels": labels,
                    "user_found": snapshot.users.contains_key(&user_id),
                }),
                severity: ViolationSeverity::Medium,
            })
        })
        .collect()
}
