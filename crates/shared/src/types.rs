//! Domain primitives shared across the workspace

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Entitlement label reserved for platform administrators.
///
/// It lives in the same label set as plan labels but is never touched by
/// plan transitions.
pub const ADMIN_LABEL: &str = "admin";

/// Product/plan metadata keys carrying plan limits
pub const SITES_LIMIT_KEY: &str = "sites_limit";
pub const LIBRARY_LIMIT_KEY: &str = "library_limit";
pub const STORAGE_LIMIT_KEY: &str = "storage_limit";

/// Lifecycle status of a subscription record
///
/// Mirrors the billing provider's statuses plus `ended`, which only local
/// plans reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    Canceled,
    Ended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Ended => "ended",
        }
    }

    /// Whether a subscription in this status can still be changed in place.
    /// Terminal subscriptions need a fresh checkout.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            SubscriptionStatus::Canceled
                | SubscriptionStatus::Ended
                | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown subscription status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "paused" => Ok(SubscriptionStatus::Paused),
            // Some provider payloads spell it the British way
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "ended" => Ok(SubscriptionStatus::Ended),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Plan limits attached to catalog products and local plans.
///
/// `None` means the plan does not cap that resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Number of connected WordPress sites
    pub sites: Option<u32>,
    /// Number of plugin/theme library items
    pub library: Option<u32>,
    /// Number of uploads
    pub storage: Option<u32>,
}

impl PlanLimits {
    /// Decode limits from a string metadata map.
    ///
    /// Missing or unparsable values decode as unlimited.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        let read = |key: &str| metadata.get(key).and_then(|v| v.trim().parse::<u32>().ok());
        Self {
            sites: read(SITES_LIMIT_KEY),
            library: read(LIBRARY_LIMIT_KEY),
            storage: read(STORAGE_LIMIT_KEY),
        }
    }

    /// Encode limits into metadata entries. Unlimited fields are omitted.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Some(sites) = self.sites {
            metadata.insert(SITES_LIMIT_KEY.to_string(), sites.to_string());
        }
        if let Some(library) = self.library {
            metadata.insert(LIBRARY_LIMIT_KEY.to_string(), library.to_string());
        }
        if let Some(storage) = self.storage {
            metadata.insert(STORAGE_LIMIT_KEY.to_string(), storage.to_string());
        }
        metadata
    }
}
