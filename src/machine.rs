//! Subscription transition decision core.
//!
//! [`decide`] is a pure function from a canonical event and the current
//! record to a [`Decision`]. It owns three rules that every entry path
//! (webhook, verified purchase, sweep) relies on:
//!
//! - the **transition table**: which event kinds move which statuses
//!   where, and with what side effects;
//! - the **stale-event tie-break**: last-writer-wins by `occurred_at`, so
//!   out-of-order delivery can never regress a record to a less-terminal
//!   status;
//! - the **idempotency check**: a decision whose patch changes nothing
//!   observable collapses to a successful no-op, so duplicate deliveries
//!   produce no second write and no second tier side effect.
//!
//! Executing a decision (the conditional store write, the tier
//! projection call) is [`crate::reconcile::Reconciler`]'s job; nothing in
//! this module touches the store.

use crate::{
    event::{EventKind, SubscriptionEvent},
    model::{CancellationReason, SubscriptionRecord, SubscriptionStatus},
    store::RecordPatch,
};

/// Direction of the profile-tier projection side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierChange {
    /// Move the profile to `premium`.
    Upgrade,
    /// Move the profile to `member`.
    Downgrade,
}

/// A transition the reconciler should execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Status after the transition.
    pub next_status: SubscriptionStatus,
    /// Field patch for the conditional update.
    pub patch: RecordPatch,
    /// Tier projection to run after the status write, if the entitled
    /// class flipped.
    pub tier: Option<TierChange>,
    /// Action label for outcome reporting (webhook vocabulary).
    pub action: &'static str,
}

/// Outcome of deciding an event against a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Execute this transition.
    Apply(Transition),
    /// Nothing to change; still a success for the caller.
    Noop {
        /// Action label for outcome reporting.
        action: &'static str,
    },
    /// Rejected by the last-writer-wins tie-break; state unchanged.
    Stale {
        /// Status the stale event would have regressed to.
        rejected: SubscriptionStatus,
    },
}

/// Decides what an event does to a record.
///
/// Pure: no clock, no store, no side effects. The `Canceled` kind is the
/// one deliberate deviation from the tier projection: store-side
/// cancellation runs until `expires_at`, so the paid tier is kept until
/// expiry handling catches up (see DESIGN.md).
#[must_use]
pub fn decide(event: &SubscriptionEvent, record: &SubscriptionRecord) -> Decision {
    let current = record.status;

    let (next_status, patch, action, suppress_tier) = match event.kind {
        EventKind::Renewed | EventKind::Purchased => (
            SubscriptionStatus::Active,
            RecordPatch {
                status: Some(SubscriptionStatus::Active),
                auto_renew: Some(true),
                cancellation_reason: Some(None),
                ..RecordPatch::default()
            },
            "activated",
            false,
        ),
        EventKind::RenewalStatusChanged { enabled } => (
            // Status is untouched; only the renewal intent is recorded.
            current,
            RecordPatch { auto_renew: Some(enabled), ..RecordPatch::default() },
            if enabled { "enabled_auto_renew" } else { "disabled_auto_renew" },
            false,
        ),
        EventKind::RenewalFailed => match current {
            SubscriptionStatus::Active => (
                SubscriptionStatus::GracePeriod,
                RecordPatch {
                    status: Some(SubscriptionStatus::GracePeriod),
                    ..RecordPatch::default()
                },
                "grace_period",
                false,
            ),
            SubscriptionStatus::GracePeriod => return Decision::Noop { action: "grace_period" },
            _ => return Decision::Noop { action: "ignored" },
        },
        EventKind::Expired | EventKind::GracePeriodExpired => match current {
            SubscriptionStatus::Active | SubscriptionStatus::GracePeriod => (
                SubscriptionStatus::Expired,
                RecordPatch {
                    status: Some(SubscriptionStatus::Expired),
                    auto_renew: Some(false),
                    ..RecordPatch::default()
                },
                "expired_and_downgraded",
                false,
            ),
            _ => return Decision::Noop { action: "ignored" },
        },
        EventKind::Refunded => (
            SubscriptionStatus::Canceled,
            RecordPatch {
                status: Some(SubscriptionStatus::Canceled),
                auto_renew: Some(false),
                cancellation_reason: Some(Some(CancellationReason::Refund)),
                ..RecordPatch::default()
            },
            "refunded_and_downgraded",
            false,
        ),
        EventKind::Revoked => (
            SubscriptionStatus::Canceled,
            RecordPatch {
                status: Some(SubscriptionStatus::Canceled),
                auto_renew: Some(false),
                cancellation_reason: Some(Some(CancellationReason::Revoked)),
                ..RecordPatch::default()
            },
            "revoked_and_downgraded",
            false,
        ),
        EventKind::Canceled => (
            SubscriptionStatus::Canceled,
            RecordPatch {
                status: Some(SubscriptionStatus::Canceled),
                auto_renew: Some(false),
                cancellation_reason: Some(Some(CancellationReason::UserCanceled)),
                ..RecordPatch::default()
            },
            "canceled",
            // Entitlement runs until expires_at for store-side
            // cancellation; the tier is left alone.
            true,
        ),
        EventKind::Paused => match current {
            SubscriptionStatus::Active => (
                SubscriptionStatus::Pending,
                RecordPatch {
                    status: Some(SubscriptionStatus::Pending),
                    ..RecordPatch::default()
                },
                "paused",
                false,
            ),
            _ => return Decision::Noop { action: "ignored" },
        },
        EventKind::ApproachingExpiry => return Decision::Noop { action: "approaching_expiry" },
        EventKind::Test => return Decision::Noop { action: "test_notification" },
        EventKind::Unhandled => return Decision::Noop { action: "unhandled" },
    };

    // Last-writer-wins: an event that happened before the record's last
    // mutation may not move it toward a less-terminal status.
    if next_status.terminality() < current.terminality() && event.occurred_at < record.updated_at {
        return Decision::Stale { rejected: next_status };
    }

    // Duplicate delivery: identical target state collapses to a no-op
    // before any write or side effect.
    if patch.is_noop(record) {
        return Decision::Noop { action };
    }

    let tier = if suppress_tier {
        None
    } else {
        match (current.entitled(), next_status.entitled()) {
            (false, true) => Some(TierChange::Upgrade),
            (true, false) => Some(TierChange::Downgrade),
            _ => None,
        }
    };

    Decision::Apply(Transition { next_status, patch, tier, action })
}
