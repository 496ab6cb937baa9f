//! Plan catalog
//!
//! Static mapping of `(tier, billing cycle)` to the provider-side plan id and
//! list price. Loaded once at startup and read-only afterwards.

use std::collections::HashMap;
use std::path::Path;

use clinicdesk_shared::{BillingCycle, SubscriptionTier};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Price of a plan in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPrice {
    pub amount_cents: i64,
    pub currency: String,
}

impl PlanPrice {
    /// Decimal string as the provider expects it ("49.00")
    pub fn to_decimal_string(&self) -> String {
        format!("{}.{:02}", self.amount_cents / 100, self.amount_cents % 100)
    }
}

/// One catalog line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    pub provider_plan_id: String,
    pub price_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    entries: HashMap<(SubscriptionTier, BillingCycle), CatalogEntry>,
    by_provider_id: HashMap<String, (SubscriptionTier, BillingCycle)>,
}

impl PlanCatalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> BillingResult<Self> {
        let mut catalog = PlanCatalog::default();

        for entry in entries {
            if entry.provider_plan_id.trim().is_empty() {
                return Err(BillingError::Config(format!(
                    "plan {} {} has an empty provider plan id",
                    entry.tier, entry.billing_cycle
                )));
            }
            if entry.price_cents < 0 {
                return Err(BillingError::Config(format!(
                    "plan {} {} has a negative price",
                    entry.tier, entry.billing_cycle
                )));
            }

            let key = (entry.tier, entry.billing_cycle);
            if let Some(existing) = catalog.by_provider_id.get(&entry.provider_plan_id) {
                if *existing != key {
                    return Err(BillingError::Config(format!(
                        "provider plan id {} is mapped to more than one plan",
                        entry.provider_plan_id
                    )));
                }
            }
            if catalog.entries.contains_key(&key) {
                return Err(BillingError::Config(format!(
                    "duplicate catalog entry for {} {}",
                    entry.tier, entry.billing_cycle
                )));
            }

            catalog
                .by_provider_id
                .insert(entry.provider_plan_id.clone(), key);
            catalog.entries.insert(key, entry);
        }

        Ok(catalog)
    }

    pub fn from_json_str(json: &str) -> BillingResult<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("invalid plan catalog JSON: {}", e)))?;
        Self::from_entries(entries)
    }

    pub fn from_file(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!(
                "failed to read plan catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Load from `PLAN_CATALOG_PATH`, or from per-plan variables of the form
    /// `PAYPAL_PLAN_<TIER>_<CYCLE>` / `PLAN_PRICE_<TIER>_<CYCLE>_CENTS`.
    pub fn from_env() -> BillingResult<Self> {
        if let Ok(path) = std::env::var("PLAN_CATALOG_PATH") {
            let catalog = Self::from_file(&path)?;
            tracing::info!(path = %path, plans = catalog.len(), "Plan catalog loaded from file");
            return Ok(catalog);
        }

        let currency = std::env::var("PLAN_CURRENCY").unwrap_or_else(|_| default_currency());
        let mut entries = Vec::new();
        for tier in SubscriptionTier::ALL {
            for cycle in [BillingCycle::Monthly, BillingCycle::Yearly] {
                let plan_var = format!("PAYPAL_PLAN_{}_{}", tier.as_str(), cycle.as_str());
                let Ok(provider_plan_id) = std::env::var(&plan_var) else {
                    continue;
                };
                let price_var = format!("PLAN_PRICE_{}_{}_CENTS", tier.as_str(), cycle.as_str());
                let price_cents = std::env::var(&price_var)
                    .map_err(|_| BillingError::Config(format!("{} must be set", price_var)))?
                    .parse::<i64>()
                    .map_err(|e| BillingError::Config(format!("{}: {}", price_var, e)))?;

                entries.push(CatalogEntry {
                    tier,
                    billing_cycle: cycle,
                    provider_plan_id,
                    price_cents,
                    currency: currency.clone(),
                });
            }
        }

        if entries.is_empty() {
            return Err(BillingError::Config(
                "no plans configured (set PLAN_CATALOG_PATH or PAYPAL_PLAN_* variables)".to_string(),
            ));
        }

        let catalog = Self::from_entries(entries)?;
        tracing::info!(plans = catalog.len(), "Plan catalog loaded from environment");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the tier is sold in any billing cycle
    pub fn tier_exists(&self, tier: SubscriptionTier) -> bool {
        self.entries.keys().any(|(t, _)| *t == tier)
    }

    pub fn entry(&self, tier: SubscriptionTier, cycle: BillingCycle) -> Option<&CatalogEntry> {
        self.entries.get(&(tier, cycle))
    }

    pub fn provider_plan_id(&self, tier: SubscriptionTier, cycle: BillingCycle) -> Option<&str> {
        self.entry(tier, cycle).map(|e| e.provider_plan_id.as_str())
    }

    pub fn price(&self, tier: SubscriptionTier, cycle: BillingCycle) -> Option<PlanPrice> {
        self.entry(tier, cycle).map(|e| PlanPrice {
            amount_cents: e.price_cents,
            currency: e.currency.clone(),
        })
    }

    /// Reverse lookup used when a webhook reports the provider's plan id
    pub fn plan_for_provider_id(
        &self,
        provider_plan_id: &str,
    ) -> Option<(SubscriptionTier, BillingCycle)> {
        self.by_provider_id.get(provider_plan_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tier: SubscriptionTier, cycle: BillingCycle, id: &str, cents: i64) -> CatalogEntry {
        CatalogEntry {
            tier,
            billing_cycle: cycle,
            provider_plan_id: id.to_string(),
            price_cents: cents,
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn test_lookup_by_tier_and_cycle() {
        let catalog = PlanCatalog::from_entries(vec![
            entry(SubscriptionTier::Basic, BillingCycle::Monthly, "P-BASIC-M", 4900),
            entry(SubscriptionTier::Basic, BillingCycle::Yearly, "P-BASIC-Y", 49000),
        ])
        .unwrap();

        assert!(catalog.tier_exists(SubscriptionTier::Basic));
        assert!(!catalog.tier_exists(SubscriptionTier::Enterprise));
        assert_eq!(
            catalog.provider_plan_id(SubscriptionTier::Basic, BillingCycle::Yearly),
            Some("P-BASIC-Y")
        );
        assert_eq!(
            catalog
                .price(SubscriptionTier::Basic, BillingCycle::Monthly)
                .unwrap()
                .to_decimal_string(),
            "49.00"
        );
        assert_eq!(
            catalog.plan_for_provider_id("P-BASIC-M"),
            Some((SubscriptionTier::Basic, BillingCycle::Monthly))
        );
        assert_eq!(catalog.plan_for_provider_id("P-UNKNOWN"), None);
    }

    #[test]
    fn test_rejects_provider_id_reused_across_plans() {
        let result = PlanCatalog::from_entries(vec![
            entry(SubscriptionTier::Basic, BillingCycle::Monthly, "P-SAME", 4900),
            entry(SubscriptionTier::Professional, BillingCycle::Monthly, "P-SAME", 9900),
        ]);
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn test_parses_json_with_default_currency() {
        let catalog = PlanCatalog::from_json_str(
            r#"[{"tier":"PROFESSIONAL","billing_cycle":"MONTHLY","provider_plan_id":"P-PRO","price_cents":9950}]"#,
        )
        .unwrap();
        let price = catalog
            .price(SubscriptionTier::Professional, BillingCycle::Monthly)
            .unwrap();
        assert_eq!(price.currency, "USD");
        assert_eq!(price.to_decimal_string(), "99.50");
    }
}
