//! Billing audit trail
//!
//! Every committed subscription mutation carries one or more [`AuditEntry`]
//! rows, written in the same transaction as the record itself.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StatusChanged,
    UpgradeRequested,
    UpgradeCommitted,
    DowngradeScheduled,
    DowngradeApplied,
    CancellationRequested,
    CancellationApplied,
    ScheduledChangeCleared,
    ManualOverride,
    ProviderLinked,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::StatusChanged => "status_changed",
            AuditAction::UpgradeRequested => "upgrade_requested",
            AuditAction::UpgradeCommitted => "upgrade_committed",
            AuditAction::DowngradeScheduled => "downgrade_scheduled",
            AuditAction::DowngradeApplied => "downgrade_applied",
            AuditAction::CancellationRequested => "cancellation_requested",
            AuditAction::CancellationApplied => "cancellation_applied",
            AuditAction::ScheduledChangeCleared => "scheduled_change_cleared",
            AuditAction::ManualOverride => "manual_override",
            AuditAction::ProviderLinked => "provider_linked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let action = match value {
            "status_changed" => AuditAction::StatusChanged,
            "upgrade_requested" => AuditAction::UpgradeRequested,
            "upgrade_committed" => AuditAction::UpgradeCommitted,
            "downgrade_scheduled" => AuditAction::DowngradeScheduled,
            "downgrade_applied" => AuditAction::DowngradeApplied,
            "cancellation_requested" => AuditAction::CancellationRequested,
            "cancellation_applied" => AuditAction::CancellationApplied,
            "scheduled_change_cleared" => AuditAction::ScheduledChangeCleared,
            "manual_override" => AuditAction::ManualOverride,
            "provider_linked" => AuditAction::ProviderLinked,
            _ => return None,
        };
        Some(action)
    }
}

/// Who caused an audited change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Tenant staff acting on their own subscription
    User,
    /// Platform operator
    Admin,
    /// Payment provider webhook
    Provider,
    /// Scheduled jobs
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::Provider => "provider",
            ActorType::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(ActorType::User),
            "admin" => Some(ActorType::Admin),
            "provider" => Some(ActorType::Provider),
            "system" => Some(ActorType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub action: AuditAction,
    pub before_value: serde_json::Value,
    pub after_value: serde_json::Value,
    pub reason: Option<String>,
    /// Provider event that triggered the change, if any
    pub provider_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
pub struct AuditEntryBuilder {
    entry: AuditEntry,
}

impl AuditEntryBuilder {
    pub fn new(tenant_id: Uuid, action: AuditAction) -> Self {
        Self {
            entry: AuditEntry {
                id: Uuid::new_v4(),
                tenant_id,
                subscription_id: None,
                actor_id: None,
                actor_type: ActorType::System,
                action,
                before_value: serde_json::Value::Null,
                after_value: serde_json::Value::Null,
                reason: None,
                provider_event_id: None,
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.entry.subscription_id = Some(subscription_id);
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.entry.actor_id = Some(actor_id);
        self.entry.actor_type = actor_type;
        self
    }

    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.entry.actor_id = actor_id;
        self.entry.actor_type = actor_type;
        self
    }

    pub fn before(mut self, value: serde_json::Value) -> Self {
        self.entry.before_value = value;
        self
    }

    pub fn after(mut self, value: serde_json::Value) -> Self {
        self.entry.after_value = value;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.entry.reason = Some(reason.into());
        self
    }

    pub fn reason_opt(mut self, reason: Option<String>) -> Self {
        self.entry.reason = reason;
        self
    }

    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.entry.provider_event_id = Some(event_id.into());
        self
    }

    pub fn build(self) -> AuditEntry {
        self.entry
    }
}
