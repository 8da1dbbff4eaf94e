//! Plan-change classification
//!
//! Compares two catalog prices by monthly-equivalent cost. Every entry point
//! that needs to know "is this a downgrade" asks [`classify`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::catalog::CatalogPrice;
use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChange {
    NoOp,
    Upgrade,
    Downgrade,
}

/// Caller-supplied direction, honored only when prices cannot be compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Upgrade,
    Downgrade,
}

impl FromStr for UpdateType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upgrade" => Ok(UpdateType::Upgrade),
            "downgrade" => Ok(UpdateType::Downgrade),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown update type: {}",
                other
            ))),
        }
    }
}

/// Unit amount spread over one month of the price's billing period.
/// One-time prices count as a single month.
pub fn monthly_equivalent(price: &CatalogPrice) -> f64 {
    let months = price
        .recurrence
        .map(|r| r.period_months())
        .unwrap_or(1.0);
    price.unit_amount as f64 / months
}

pub fn classify(
    current: &CatalogPrice,
    target: &CatalogPrice,
    override_type: Option<UpdateType>,
) -> PlanChange {
    if current.id == target.id {
        return PlanChange::NoOp;
    }

    if !current.currency.eq_ignore_ascii_case(&target.currency) {
        return match override_type {
            Some(UpdateType::Downgrade) => PlanChange::Downgrade,
            _ => PlanChange::Upgrade,
        };
    }

    if monthly_equivalent(target) < monthly_equivalent(current) {
        PlanChange::Downgrade
    } else {
        PlanChange::Upgrade
    }
}
