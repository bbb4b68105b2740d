//! Core data model for subscription entitlements.
//!
//! One [`SubscriptionRecord`] exists per user. Its `status` is the single
//! source of truth for entitlement; the profile [`Tier`] is a dependent
//! projection of it (`premium` iff the status is entitled).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription lifecycle status.
///
/// # State Machine
///
/// ```text
/// Pending ──► Active ──► GracePeriod ──► Expired
///               │  ▲          │
///               │  └──────────┘ (renewal recovers)
///               ▼
///            Canceled (refund / revoke / user cancel)
/// ```
///
/// Transitions are decided exclusively by [`crate::machine::decide`];
/// nothing else writes `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Awaiting first purchase, or parked by a vendor pause.
    Pending,
    /// Paid and entitled.
    Active,
    /// Renewal failed; entitlement preserved pending payment retry.
    GracePeriod,
    /// Lapsed on the clock or by vendor notice.
    Expired,
    /// Terminated by refund, revocation, or user cancellation.
    Canceled,
}

impl SubscriptionStatus {
    /// Whether this status grants premium entitlement.
    #[must_use]
    pub fn entitled(self) -> bool {
        matches!(self, Self::Active | Self::GracePeriod)
    }

    /// Terminality rank used by the stale-event tie-break.
    ///
    /// An out-of-order event may never move a record from a higher rank
    /// to a lower one when it occurred before the record's last update.
    #[must_use]
    pub fn terminality(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::GracePeriod => 2,
            Self::Expired => 3,
            Self::Canceled => 4,
        }
    }
}

/// Profile tier, projected from subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free tier.
    Member,
    /// Paid tier; held iff the subscription status is entitled.
    Premium,
}

/// Why a subscription reached [`SubscriptionStatus::Canceled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Vendor-issued refund.
    Refund,
    /// Vendor revoked the entitlement (e.g. family-sharing removal).
    Revoked,
    /// User canceled through the store.
    UserCanceled,
}

/// Originating store platform for an event or purchase.
///
/// Only used for reporting and span fields; business logic never branches
/// on it downstream of the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Apple App Store.
    Ios,
    /// Google Play.
    Android,
}

impl Platform {
    /// Wire label matching the webhook outcome vocabulary.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

/// One user's subscription entitlement record.
///
/// # Invariants
///
/// - Exactly one record per `user_id`.
/// - `expires_at` is present whenever `status` is `active`,
///   `grace_period`, or `expired`.
/// - `original_transaction_id` is immutable once set; it is the durable
///   key correlating every event of one purchase lineage across renewals.
/// - `updated_at` is monotonically non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Owning user; foreign reference to the profile domain.
    pub user_id: String,
    /// Current lifecycle status.
    pub status: SubscriptionStatus,
    /// Whether the store reports auto-renewal enabled.
    pub auto_renew: bool,
    /// Entitlement expiry; absent only in `pending`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Latest vendor transaction id (Apple) or purchase token (Google).
    pub store_transaction_id: Option<String>,
    /// Durable lineage key spanning all renewals of one purchase.
    pub original_transaction_id: Option<String>,
    /// Set when `status` is `canceled`.
    pub cancellation_reason: Option<CancellationReason>,
    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Creates a pending record for a user with no purchase yet.
    #[must_use]
    pub fn pending(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            status: SubscriptionStatus::Pending,
            auto_renew: false,
            expires_at: None,
            store_transaction_id: None,
            original_transaction_id: None,
            cancellation_reason: None,
            updated_at: now,
        }
    }

    /// The tier this record's status projects to.
    #[must_use]
    pub fn projected_tier(&self) -> Tier {
        if self.status.entitled() { Tier::Premium } else { Tier::Member }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_entitlement() {
        assert!(SubscriptionStatus::Active.entitled());
        assert!(SubscriptionStatus::GracePeriod.entitled());
        assert!(!SubscriptionStatus::Pending.entitled());
        assert!(!SubscriptionStatus::Expired.entitled());
        assert!(!SubscriptionStatus::Canceled.entitled());
    }

    #[test]
    fn test_terminality_is_strictly_ordered() {
        let order = [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Active,
            SubscriptionStatus::GracePeriod,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Canceled,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].terminality() < pair[1].terminality());
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SubscriptionStatus::GracePeriod).unwrap();
        assert_eq!(json, "\"grace_period\"");

        let parsed: SubscriptionStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(parsed, SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_cancellation_reason_serialization() {
        let json = serde_json::to_string(&CancellationReason::UserCanceled).unwrap();
        assert_eq!(json, "\"user_canceled\"");
    }

    #[test]
    fn test_pending_record_has_no_expiry() {
        let record = SubscriptionRecord::pending("user-1", Utc::now());
        assert_eq!(record.status, SubscriptionStatus::Pending);
        assert!(record.expires_at.is_none());
        assert_eq!(record.projected_tier(), Tier::Member);
    }

    #[test]
    fn test_projected_tier_follows_entitlement() {
        let mut record = SubscriptionRecord::pending("user-2", Utc::now());
        record.status = SubscriptionStatus::Active;
        assert_eq!(record.projected_tier(), Tier::Premium);

        record.status = SubscriptionStatus::Expired;
        assert_eq!(record.projected_tier(), Tier::Member);
    }

    #[test]
    fn test_platform_labels() {
        assert_eq!(Platform::Ios.as_str(), "ios");
        assert_eq!(Platform::Android.as_str(), "android");
    }
}
