#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! wplib shared primitives
//!
//! Types used by both the billing engine and the API surface, plus the
//! Postgres pool and schema migrations.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    PlanLimits, SubscriptionStatus, UnknownStatus, ADMIN_LABEL, LIBRARY_LIMIT_KEY,
    SITES_LIMIT_KEY, STORAGE_LIMIT_KEY,
};
