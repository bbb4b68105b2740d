//! Entitlement store gateway contract.
//!
//! The reconciliation core holds no state of its own: every transition is
//! a conditional read-modify-write against one record behind this trait.
//! The conditional update is keyed on the status the caller observed when
//! deciding the transition, which is what makes concurrent webhook/sweep
//! races and duplicate deliveries safe without any in-process locking.
//!
//! A reference [`InMemoryStore`] ships for tests and demos; production
//! deployments implement this trait over their database.

mod memory;

pub use memory::InMemoryStore;

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    event::CorrelationKey,
    model::{CancellationReason, SubscriptionRecord, SubscriptionStatus},
};

/// Field-wise patch applied by [`EntitlementStore::conditional_update`].
///
/// `None` leaves a field untouched. `cancellation_reason` is doubly
/// optional: the outer `Option` is "touch or not", the inner is the new
/// value (`Some(None)` clears the reason).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    /// New status, if the transition changes it.
    pub status: Option<SubscriptionStatus>,
    /// New auto-renewal flag.
    pub auto_renew: Option<bool>,
    /// New expiry timestamp.
    pub expires_at: Option<DateTime<Utc>>,
    /// New vendor transaction id / purchase token.
    pub store_transaction_id: Option<String>,
    /// Lineage key; only honored when the record has none yet.
    pub original_transaction_id: Option<String>,
    /// Cancellation reason update (`Some(None)` clears it).
    pub cancellation_reason: Option<Option<CancellationReason>>,
}

impl RecordPatch {
    /// Whether applying this patch to `record` would change nothing
    /// observable. The reconciler uses this to turn duplicate deliveries
    /// into successful no-ops before any write or side effect happens.
    #[must_use]
    pub fn is_noop(&self, record: &SubscriptionRecord) -> bool {
        self.status.is_none_or(|s| s == record.status)
            && self.auto_renew.is_none_or(|a| a == record.auto_renew)
            && self.expires_at.is_none_or(|e| Some(e) == record.expires_at)
            && self
                .store_transaction_id
                .as_ref()
                .is_none_or(|t| Some(t) == record.store_transaction_id.as_ref())
            && self
                .original_transaction_id
                .as_ref()
                .is_none_or(|t| Some(t) == record.original_transaction_id.as_ref())
            && self
                .cancellation_reason
                .as_ref()
                .is_none_or(|r| *r == record.cancellation_reason)
    }

    /// Applies the patch to a record in place, stamping `updated_at`.
    ///
    /// `original_transaction_id` is immutable once set: a patch carrying a
    /// different lineage key leaves the stored one untouched.
    pub fn apply_to(&self, record: &mut SubscriptionRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(auto_renew) = self.auto_renew {
            record.auto_renew = auto_renew;
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = Some(expires_at);
        }
        if let Some(ref transaction_id) = self.store_transaction_id {
            record.store_transaction_id = Some(transaction_id.clone());
        }
        if let Some(ref original_id) = self.original_transaction_id
            && record.original_transaction_id.is_none()
        {
            record.original_transaction_id = Some(original_id.clone());
        }
        if let Some(ref reason) = self.cancellation_reason {
            record.cancellation_reason = *reason;
        }
        // updated_at never moves backwards even if the store clock does.
        record.updated_at = record.updated_at.max(now);
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The record matched `expected_status` and the patch was applied.
    Updated(SubscriptionRecord),
    /// The record's status no longer matches what the caller observed.
    Conflict,
    /// No record exists for the id.
    NotFound,
}

/// Read/write access to subscription records and the profile tier
/// projection.
///
/// Implementations must make [`conditional_update`] atomic per record:
/// the status comparison and the patch application happen under one
/// write, or not at all. That single guarantee carries all of the core's
/// concurrency safety; the core never takes locks of its own.
///
/// [`conditional_update`]: EntitlementStore::conditional_update
pub trait EntitlementStore: Send + Sync {
    /// Looks up the record an inbound event correlates to.
    async fn find_by_correlation_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<SubscriptionRecord>>;

    /// Looks up a user's record directly (verified-purchase path).
    async fn find_by_user(&self, user_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Inserts a fresh record. Fails if the user already has one.
    async fn insert(&self, record: SubscriptionRecord) -> Result<()>;

    /// Applies `patch` iff the record's status still equals
    /// `expected_status`, stamping `updated_at` from `now`.
    async fn conditional_update(
        &self,
        user_id: &str,
        expected_status: SubscriptionStatus,
        patch: RecordPatch,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome>;

    /// Projects the user's profile tier down to `member`.
    async fn downgrade_tier(&self, user_id: &str) -> Result<()>;

    /// Projects the user's profile tier up to `premium`.
    async fn upgrade_tier(&self, user_id: &str) -> Result<()>;

    /// Active records whose `expires_at` is strictly before `now`.
    async fn scan_expired_active(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionRecord>>;

    /// Grace-period records whose `expires_at` is strictly before
    /// `cutoff` (i.e. the grace window has fully lapsed).
    async fn scan_grace_lapsed(&self, cutoff: DateTime<Utc>) -> Result<Vec<SubscriptionRecord>>;

    /// Auto-renewing active records expiring within `(now, until)`.
    async fn scan_approaching_expiry(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SubscriptionRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: "user-1".into(),
            status: SubscriptionStatus::Active,
            auto_renew: true,
            expires_at: None,
            store_transaction_id: Some("token-1".into()),
            original_transaction_id: Some("tx-orig".into()),
            cancellation_reason: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_patch_is_noop() {
        assert!(RecordPatch::default().is_noop(&record()));
    }

    #[test]
    fn test_patch_matching_current_values_is_noop() {
        let patch = RecordPatch {
            status: Some(SubscriptionStatus::Active),
            auto_renew: Some(true),
            cancellation_reason: Some(None),
            ..RecordPatch::default()
        };
        assert!(patch.is_noop(&record()));
    }

    #[test]
    fn test_patch_changing_status_is_not_noop() {
        let patch =
            RecordPatch { status: Some(SubscriptionStatus::Expired), ..RecordPatch::default() };
        assert!(!patch.is_noop(&record()));
    }

    #[test]
    fn test_apply_to_updates_fields_and_timestamp() {
        let mut rec = record();
        let before = rec.updated_at;
        let now = before + chrono::Duration::seconds(5);

        let patch = RecordPatch {
            status: Some(SubscriptionStatus::GracePeriod),
            auto_renew: Some(false),
            ..RecordPatch::default()
        };
        patch.apply_to(&mut rec, now);

        assert_eq!(rec.status, SubscriptionStatus::GracePeriod);
        assert!(!rec.auto_renew);
        assert_eq!(rec.updated_at, now);
    }

    #[test]
    fn test_apply_to_never_rewinds_updated_at() {
        let mut rec = record();
        let before = rec.updated_at;

        let patch =
            RecordPatch { status: Some(SubscriptionStatus::Expired), ..RecordPatch::default() };
        patch.apply_to(&mut rec, before - chrono::Duration::hours(1));

        assert_eq!(rec.updated_at, before);
    }

    #[test]
    fn test_apply_to_keeps_original_transaction_id_immutable() {
        let mut rec = record();
        let patch = RecordPatch {
            original_transaction_id: Some("tx-other".into()),
            ..RecordPatch::default()
        };
        patch.apply_to(&mut rec, Utc::now());
        assert_eq!(rec.original_transaction_id.as_deref(), Some("tx-orig"));
    }

    #[test]
    fn test_apply_to_sets_original_transaction_id_when_absent() {
        let mut rec = record();
        rec.original_transaction_id = None;
        let patch = RecordPatch {
            original_transaction_id: Some("tx-new".into()),
            ..RecordPatch::default()
        };
        patch.apply_to(&mut rec, Utc::now());
        assert_eq!(rec.original_transaction_id.as_deref(), Some("tx-new"));
    }

    #[test]
    fn test_apply_to_clears_cancellation_reason() {
        let mut rec = record();
        rec.cancellation_reason = Some(CancellationReason::Refund);
        let patch = RecordPatch { cancellation_reason: Some(None), ..RecordPatch::default() };
        patch.apply_to(&mut rec, Utc::now());
        assert!(rec.cancellation_reason.is_none());
    }
}
