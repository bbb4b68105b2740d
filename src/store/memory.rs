//! In-memory entitlement store.
//!
//! Reference implementation of [`EntitlementStore`] used by the test
//! suites and demos. All record state lives under one mutex, so the
//! status comparison and patch application of a conditional update are
//! atomic per store, which is a strict superset of the per-record
//! atomicity the contract requires.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

use super::{EntitlementStore, RecordPatch, UpdateOutcome};
use crate::{
    error::{ReconcileError, Result},
    event::CorrelationKey,
    model::{SubscriptionRecord, SubscriptionStatus, Tier},
};

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by user id; one record per user.
    records: HashMap<String, SubscriptionRecord>,
    /// Profile tier projection.
    tiers: HashMap<String, Tier>,
    /// Count of tier mutations, for asserting side-effect idempotency.
    tier_changes: u64,
}

/// In-memory [`EntitlementStore`].
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a subscription record and its profile tier.
    pub fn seed(&self, record: SubscriptionRecord, tier: Tier) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.tiers.insert(record.user_id.clone(), tier);
        inner.records.insert(record.user_id.clone(), record);
    }

    /// Returns a snapshot of a user's record.
    #[must_use]
    pub fn record_of(&self, user_id: &str) -> Option<SubscriptionRecord> {
        self.inner.lock().expect("store mutex poisoned").records.get(user_id).cloned()
    }

    /// Returns a user's current profile tier.
    #[must_use]
    pub fn tier_of(&self, user_id: &str) -> Option<Tier> {
        self.inner.lock().expect("store mutex poisoned").tiers.get(user_id).copied()
    }

    /// Number of tier mutations performed so far.
    ///
    /// A repeated event must not bump this a second time.
    #[must_use]
    pub fn tier_change_count(&self) -> u64 {
        self.inner.lock().expect("store mutex poisoned").tier_changes
    }

    fn set_tier(&self, user_id: &str, tier: Tier) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        match inner.tiers.get_mut(user_id) {
            Some(current) => {
                *current = tier;
                inner.tier_changes += 1;
                Ok(())
            }
            None => Err(ReconcileError::RecordNotFound(format!("profile for user {user_id}"))),
        }
    }
}

impl EntitlementStore for InMemoryStore {
    async fn find_by_correlation_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<SubscriptionRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let found = inner.records.values().find(|record| match key {
            CorrelationKey::OriginalTransactionId(id) => {
                record.original_transaction_id.as_deref() == Some(id)
            }
            CorrelationKey::PurchaseToken(token) => {
                record.store_transaction_id.as_deref() == Some(token)
            }
        });
        Ok(found.cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Option<SubscriptionRecord>> {
        Ok(self.inner.lock().expect("store mutex poisoned").records.get(user_id).cloned())
    }

    async fn insert(&self, record: SubscriptionRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.records.contains_key(&record.user_id) {
            return Err(ReconcileError::Store(format!(
                "record already exists for user {}",
                record.user_id
            )));
        }
        inner.tiers.entry(record.user_id.clone()).or_insert(Tier::Member);
        inner.records.insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn conditional_update(
        &self,
        user_id: &str,
        expected_status: SubscriptionStatus,
        patch: RecordPatch,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(record) = inner.records.get_mut(user_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if record.status != expected_status {
            return Ok(UpdateOutcome::Conflict);
        }
        patch.apply_to(record, now);
        Ok(UpdateOutcome::Updated(record.clone()))
    }

    async fn downgrade_tier(&self, user_id: &str) -> Result<()> {
        self.set_tier(user_id, Tier::Member)
    }

    async fn upgrade_tier(&self, user_id: &str) -> Result<()> {
        self.set_tier(user_id, Tier::Premium)
    }

    async fn scan_expired_active(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .records
            .values()
            .filter(|record| {
                record.status == SubscriptionStatus::Active
                    && record.expires_at.is_some_and(|expires| expires < now)
            })
            .cloned()
            .collect())
    }

    async fn scan_grace_lapsed(&self, cutoff: DateTime<Utc>) -> Result<Vec<SubscriptionRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .records
            .values()
            .filter(|record| {
                record.status == SubscriptionStatus::GracePeriod
                    && record.expires_at.is_some_and(|expires| expires < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn scan_approaching_expiry(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRecord>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .records
            .values()
            .filter(|record| {
                record.status == SubscriptionStatus::Active
                    && record.auto_renew
                    && record.expires_at.is_some_and(|expires| now < expires && expires < until)
            })
            .cloned()
            .collect())
    }
}
