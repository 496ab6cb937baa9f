//! Billing vocabulary shared by every crate in the workspace.
//!
//! All enums persist as their upper-case wire names (the same spelling the
//! payment provider and the HTTP API use), so `as_str` / `FromStr` round-trip
//! through both Postgres `TEXT` columns and JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or submitted enum value is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Plan tier a clinic subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    Basic,
    Professional,
    Enterprise,
    /// Negotiated plan, priced per contract
    Custom,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Basic,
        SubscriptionTier::Professional,
        SubscriptionTier::Enterprise,
        SubscriptionTier::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Basic => "BASIC",
            SubscriptionTier::Professional => "PROFESSIONAL",
            SubscriptionTier::Enterprise => "ENTERPRISE",
            SubscriptionTier::Custom => "CUSTOM",
        }
    }

    /// Ordering used to tell upgrades from downgrades
    pub fn rank(&self) -> u8 {
        match self {
            SubscriptionTier::Basic => 1,
            SubscriptionTier::Professional => 2,
            SubscriptionTier::Enterprise => 3,
            SubscriptionTier::Custom => 4,
        }
    }

    pub fn is_upgrade_from(&self, current: SubscriptionTier) -> bool {
        self.rank() > current.rank()
    }

    pub fn is_downgrade_from(&self, current: SubscriptionTier) -> bool {
        self.rank() < current.rank()
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BASIC" => Ok(SubscriptionTier::Basic),
            "PROFESSIONAL" => Ok(SubscriptionTier::Professional),
            "ENTERPRISE" => Ok(SubscriptionTier::Enterprise),
            "CUSTOM" => Ok(SubscriptionTier::Custom),
            _ => Err(ParseEnumError::new("plan tier", s)),
        }
    }
}

/// Billing cycle of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "MONTHLY",
            BillingCycle::Yearly => "YEARLY",
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MONTHLY" => Ok(BillingCycle::Monthly),
            "YEARLY" | "ANNUAL" => Ok(BillingCycle::Yearly),
            _ => Err(ParseEnumError::new("billing cycle", s)),
        }
    }
}

/// Status of a subscription record, mirrored from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    ApprovalPending,
    Active,
    Suspended,
    /// Terminal
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::ApprovalPending => "APPROVAL_PENDING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Suspended => "SUSPENDED",
            SubscriptionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVAL_PENDING" => Ok(SubscriptionStatus::ApprovalPending),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "SUSPENDED" => Ok(SubscriptionStatus::Suspended),
            "CANCELLED" | "CANCELED" => Ok(SubscriptionStatus::Cancelled),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

/// Coarse tenant-level gate value read by access checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingStatus {
    #[default]
    PendingPayment,
    Active,
    PastDue,
    Canceled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::PendingPayment => "PENDING_PAYMENT",
            BillingStatus::Active => "ACTIVE",
            BillingStatus::PastDue => "PAST_DUE",
            BillingStatus::Canceled => "CANCELED",
        }
    }

    /// Tenant status implied by a subscription status
    pub fn for_subscription(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::ApprovalPending => BillingStatus::PendingPayment,
            SubscriptionStatus::Active => BillingStatus::Active,
            SubscriptionStatus::Suspended => BillingStatus::PastDue,
            SubscriptionStatus::Cancelled => BillingStatus::Canceled,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BillingStatus::Active)
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING_PAYMENT" => Ok(BillingStatus::PendingPayment),
            "ACTIVE" => Ok(BillingStatus::Active),
            "PAST_DUE" => Ok(BillingStatus::PastDue),
            "CANCELED" | "CANCELLED" => Ok(BillingStatus::Canceled),
            _ => Err(ParseEnumError::new("billing status", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::Professional.is_upgrade_from(SubscriptionTier::Basic));
        assert!(SubscriptionTier::Enterprise.is_upgrade_from(SubscriptionTier::Professional));
        assert!(SubscriptionTier::Basic.is_downgrade_from(SubscriptionTier::Enterprise));
        assert!(!SubscriptionTier::Basic.is_upgrade_from(SubscriptionTier::Basic));
        assert!(!SubscriptionTier::Basic.is_downgrade_from(SubscriptionTier::Basic));
    }

    #[test]
    fn test_tier_parsing_is_case_insensitive() {
        assert_eq!(
            "professional".parse::<SubscriptionTier>(),
            Ok(SubscriptionTier::Professional)
        );
        assert!("platinum".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_billing_cycle_accepts_annual_alias() {
        assert_eq!("annual".parse::<BillingCycle>(), Ok(BillingCycle::Yearly));
        assert_eq!(BillingCycle::default(), BillingCycle::Monthly);
    }

    #[test]
    fn test_billing_status_for_subscription() {
        assert_eq!(
            BillingStatus::for_subscription(SubscriptionStatus::ApprovalPending),
            BillingStatus::PendingPayment
        );
        assert_eq!(
            BillingStatus::for_subscription(SubscriptionStatus::Suspended),
            BillingStatus::PastDue
        );
        assert_eq!(
            BillingStatus::for_subscription(SubscriptionStatus::Cancelled),
            BillingStatus::Canceled
        );
    }

    #[test]
    fn test_default_billing_status_denies_access() {
        assert_eq!(BillingStatus::default(), BillingStatus::PendingPayment);
        assert!(!BillingStatus::default().is_active());
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&SubscriptionStatus::ApprovalPending).unwrap();
        assert_eq!(json, "\"APPROVAL_PENDING\"");
        let json = serde_json::to_string(&BillingStatus::PastDue).unwrap();
        assert_eq!(json, "\"PAST_DUE\"");
        let status: SubscriptionStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(status, SubscriptionStatus::Cancelled);
    }
}
