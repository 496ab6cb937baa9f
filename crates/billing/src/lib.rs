// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClinicDesk Billing Module
//!
//! Subscription billing lifecycle for clinic tenants, backed by PayPal.
//!
//! ## Features
//!
//! - **Webhooks**: Verify and idempotently apply PayPal subscription events
//! - **Plan Changes**: Upgrade (provider-confirmed), downgrade at period end,
//!   immediate or deferred cancellation, operator overrides
//! - **Access Control**: Cached tenant billing status gate, deny by default
//! - **Reconciliation**: Apply scheduled downgrades and cancellations when due
//! - **Invariants**: Read-only consistency checks over stored billing state
//!
//! Every subscription write goes through [`SubscriptionWriter`], a
//! version-checked compare-and-swap that also invalidates the tenant's
//! cached billing status before returning.

use std::sync::Arc;

pub mod access;
pub mod cache;
pub mod catalog;
pub mod error;
pub mod events;
pub mod invariants;
#[cfg(any(test, feature = "test-billing"))]
pub mod memory;
pub mod postgres;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod webhooks;
pub mod writer;


// Access
pub use access::AccessControlGate;

// Cache
pub use cache::BillingStatusCache;

// Catalog
pub use catalog::{CatalogEntry, PlanCatalog, PlanPrice};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, AuditAction, AuditEntry, AuditEntryBuilder};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Storage
#[cfg(any(test, feature = "test-billing"))]
pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;
pub use store::{
    BillingStore, EventProcessingStatus, PaymentTransaction, SubscriptionRecord, TenantBilling,
    WebhookEventRecord,
};

// Provider
pub use provider::{PayPalClient, PayPalConfig, PaymentProvider, ProviderError, WebhookHeaders};

// Reconciliation
pub use reconcile::{ReconcileSummary, ReconciliationJob};

// Subscriptions
pub use subscriptions::{
    ActorContext, ActorRole, CancellationResult, PaymentUpdateSession, ScheduledChange,
    SubscriptionService, UpgradeResult,
};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookEventKind, WebhookOutcome, WebhookProcessor};

// Writer
pub use writer::{SubscriptionWriter, WriteOutcome};

use sqlx::PgPool;

/// Main billing service that wires every component to one store, provider,
/// catalog and status cache
pub struct BillingService {
    pub access: AccessControlGate,
    pub catalog: Arc<PlanCatalog>,
    pub invariants: InvariantChecker,
    pub reconciliation: ReconciliationJob,
    pub store: Arc<dyn BillingStore>,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookProcessor,
}

impl BillingService {
    /// Create a billing service backed by Postgres and the live PayPal API,
    /// configured from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let paypal = PayPalClient::new(PayPalConfig::from_env()?)?;
        let catalog = PlanCatalog::from_env()?;
        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(paypal),
            catalog,
        ))
    }

    /// Create a billing service from explicit parts
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        catalog: PlanCatalog,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let cache = BillingStatusCache::new();
        let writer = SubscriptionWriter::new(store.clone(), cache.clone());

        Self {
            access: AccessControlGate::new(store.clone(), cache),
            catalog: catalog.clone(),
            invariants: InvariantChecker::new(store.clone()),
            reconciliation: ReconciliationJob::new(writer.clone(), catalog.clone()),
            store,
            subscriptions: SubscriptionService::new(provider.clone(), writer.clone(), catalog.clone()),
            webhooks: WebhookProcessor::new(provider, writer, catalog),
        }
    }
}
