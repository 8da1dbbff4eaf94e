// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! wplib Background Worker
//!
//! With no arguments, runs scheduled jobs:
//! - Bulk subscription sync against Stripe (daily at 03:00 UTC)
//! - Invariant check (hourly)
//!
//! `wplib-worker sync` and `wplib-worker check` run one job once and exit;
//! `check` exits non-zero when violations are found.

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use wplib_billing::{BillingService, BulkSyncReport, InvariantCheckSummary};
use wplib_shared::create_pool;

const SYNC_SCHEDULE: &str = "0 0 3 * * *";
const CHECK_SCHEDULE: &str = "0 0 * * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Schedule,
    Sync,
    Check,
}

impl Command {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        match args.first().map(String::as_str) {
            None => Ok(Command::Schedule),
            Some("sync") => Ok(Command::Sync),
            Some("check") => Ok(Command::Check),
            Some(other) => anyhow::bail!("unknown command {:?} (expected sync or check)", other),
        }
    }
}

/// Log results of a bulk sync
fn log_sync_report(report: &BulkSyncReport) {
    info!(
        created = report.synced.created,
        updated = report.synced.updated,
        unchanged = report.synced.unchanged,
        errors = report.synced.errors,
        skipped = report.skipped,
        total = report.total,
        "Bulk sync complete"
    );
    for message in &report.errors {
        error!(error = %message, "Bulk sync item failed");
    }
}

fn log_check_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All invariants hold");
        return;
    }
    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            users = ?violation.user_ids,
            "{}",
            violation.description
        );
    }
}

async fn run_scheduler(billing: Arc<BillingService>) -> anyhow::Result<()> {
    let scheduler = JobScheduler::new().await?;

    // Job 1: Full reconciliation sweep
    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async(SYNC_SCHEDULE, move |_uuid, _l| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                info!("Running scheduled bulk sync");
                match billing.bulk_sync.run().await {
                    Ok(report) => log_sync_report(&report),
                    Err(e) => error!(error = %e, "Scheduled bulk sync failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Bulk sync (daily at 03:00 UTC)");

    // Job 2: Consistency check
    let check_billing = billing.clone();
    scheduler
        .add(Job::new_async(CHECK_SCHEDULE, move |_uuid, _l| {
            let billing = check_billing.clone();
            Box::pin(async move {
                match billing.invariants.run().await {
                    Ok(summary) => log_check_summary(&summary),
                    Err(e) => error!(error = %e, "Scheduled invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant check (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;
    info!(command = ?command, "Starting wplib Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    let billing = Arc::new(BillingService::from_env(pool)?);

    match command {
        Command::Schedule => run_scheduler(billing).await,
        Command::Sync => {
            let report = billing.bulk_sync.run().await?;
            log_sync_report(&report);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Check => {
            let summary = billing.invariants.run().await?;
            log_check_summary(&summary);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.healthy {
                anyhow::bail!("{} invariant check(s) failed", summary.checks_failed);
            }
            Ok(())
        }
    }
}
