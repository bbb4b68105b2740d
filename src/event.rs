//! Canonical subscription events.
//!
//! Both vendor notification vocabularies (Apple's string enum, Google's
//! integer enum) and the sweep's wall-clock conditions normalize into one
//! [`SubscriptionEvent`] before any business logic runs. Events are
//! transient: constructed by a normalizer or the sweeper, consumed exactly
//! once by the state machine, never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Platform;

/// Canonical event kind, vendor-neutral.
///
/// `Canceled` exists as an explicit variant (rather than folding into
/// `Revoked`) because Google cancellation deliberately does not downgrade
/// the profile tier; see the machine's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Renewal or (re)start of a subscription.
    Renewed,
    /// User toggled auto-renewal in the store.
    RenewalStatusChanged {
        /// New auto-renewal setting.
        enabled: bool,
    },
    /// Payment failed; entitlement enters the grace period.
    RenewalFailed,
    /// Subscription expired per the vendor.
    Expired,
    /// Grace period fully lapsed (sweep-synthesized).
    GracePeriodExpired,
    /// User canceled through the store; runs until `expires_at`.
    Canceled,
    /// Vendor refunded the purchase.
    Refunded,
    /// Vendor revoked the entitlement.
    Revoked,
    /// New purchase observed.
    Purchased,
    /// Vendor paused the subscription.
    Paused,
    /// Entitlement nears expiry with auto-renew on (sweep-synthesized,
    /// observational only).
    ApproachingExpiry,
    /// Vendor test notification.
    Test,
    /// Recognized envelope, no handling defined.
    Unhandled,
}

/// Identifier resolving an event to its target subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CorrelationKey {
    /// Apple's durable lineage id, spanning all renewals.
    OriginalTransactionId(String),
    /// Google's purchase token (stored as the record's transaction id).
    PurchaseToken(String),
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OriginalTransactionId(id) => write!(f, "original_transaction_id={id}"),
            Self::PurchaseToken(token) => write!(f, "purchase_token={token}"),
        }
    }
}

/// Canonical normalized form of a vendor notification or sweep condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// What happened.
    pub kind: EventKind,
    /// Which record it happened to.
    pub correlation_key: CorrelationKey,
    /// When it happened, per the vendor or the sweep clock.
    pub occurred_at: DateTime<Utc>,
    /// Originating platform, for reporting only.
    pub platform: Option<Platform>,
}

impl SubscriptionEvent {
    /// Builds a sweep-synthesized event with no platform attribution.
    #[must_use]
    pub fn synthetic(kind: EventKind, key: CorrelationKey, occurred_at: DateTime<Utc>) -> Self {
        Self { kind, correlation_key: key, occurred_at, platform: None }
    }
}
