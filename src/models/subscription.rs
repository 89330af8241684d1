use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a purchased subscription as tracked by billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingProvisioning,
    Active,
    Failed,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingProvisioning => write!(f, "pending_provisioning"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_provisioning" => Ok(Self::PendingProvisioning),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription status: {s}")),
        }
    }
}

/// A purchased hosting product. Owned by billing; the orchestrator only
/// reads and updates `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub customer_id: i64,
    pub product_id: i64,
    pub domain: Option<String>,
    pub status: SubscriptionStatus,
}
