//! Error types for the entitlement reconciliation core.
//!
//! This module defines all error types that can occur while normalizing
//! vendor notifications, verifying purchases, and applying state
//! transitions. All errors implement the standard [`std::error::Error`]
//! trait via [`thiserror::Error`].
//!
//! # Error Categories
//!
//! - **Normalization errors** ([`ReconcileError::MalformedPayload`],
//!   [`ReconcileError::UnsupportedNotificationType`]): the raw vendor
//!   payload could not be turned into a canonical event
//! - **Resolution errors** ([`ReconcileError::RecordNotFound`]): no
//!   subscription record matches the event's correlation key
//! - **Ordering errors** ([`ReconcileError::StaleEvent`]): the event lost
//!   the last-writer-wins tie-break and was rejected
//! - **Store errors** ([`ReconcileError::StoreConflict`],
//!   [`ReconcileError::Store`]): the entitlement store rejected or failed
//!   the conditional write
//! - **Verification errors** ([`ReconcileError::Verification`],
//!   [`ReconcileError::Timeout`], [`ReconcileError::Http`]): the vendor
//!   purchase-verification call failed

use thiserror::Error;

use crate::model::SubscriptionStatus;

/// Result type alias for reconciliation operations.
///
/// This is a convenience type that uses [`ReconcileError`] as the error
/// type. All fallible functions in this crate return this type.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Errors that can occur in the reconciliation core.
///
/// Normalization and lookup errors are reported per-event and never abort
/// a batch: the webhook handler folds them into a structured outcome, and
/// the sweeper counts them and continues with the remaining records.
///
/// This type implements `#[must_use]` to ensure errors are not silently
/// ignored.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The vendor payload is structurally invalid.
    ///
    /// Wrong JWT segment count, undecodable base64, invalid JSON, or a
    /// missing correlation identifier. Malformed input never mutates
    /// state; it is reported and dropped.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload is well-formed but carries no notification this core
    /// understands (e.g. a Pub/Sub envelope without a
    /// `subscriptionNotification`).
    #[error("unsupported notification type: {0}")]
    UnsupportedNotificationType(String),

    /// No subscription record matches the event's correlation key.
    ///
    /// Reported, not retried: without a record there is no user to
    /// attribute the event to, so a blind retry cannot succeed.
    #[error("no subscription record for correlation key: {0}")]
    RecordNotFound(String),

    /// The event lost the last-writer-wins tie-break.
    ///
    /// Its `occurred_at` is older than the record's `updated_at` and the
    /// transition would regress the record to a less-terminal status.
    /// State is unchanged.
    #[error(
        "stale event: would regress {current:?} to {rejected:?} (occurred before last update)"
    )]
    StaleEvent {
        /// Status the record currently holds.
        current: SubscriptionStatus,
        /// Status the stale event would have regressed to.
        rejected: SubscriptionStatus,
    },

    /// The conditional update failed twice against the expected status.
    ///
    /// The first conflict is retried in-process with a fresh read; a
    /// second conflict surfaces here so the caller (webhook or sweep) can
    /// report it.
    #[error("store conflict persisted after one retry")]
    StoreConflict,

    /// The entitlement store failed for a backend reason.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The vendor rejected the purchase verification.
    ///
    /// `reason` is the vendor status code translated to a stable string
    /// (e.g. `shared secret mismatch`, `subscription expired`), suitable
    /// for surfacing to callers without leaking vendor enum values.
    #[error("verification failed: {reason}")]
    Verification {
        /// Stable, vendor-neutral failure reason.
        reason: String,
    },

    /// A vendor call exceeded its deadline.
    ///
    /// Timeouts are not fatal to a batch: the affected purchase or record
    /// is reported as failed and processing continues.
    #[error("vendor call timed out")]
    Timeout,

    /// HTTP communication with a vendor endpoint failed.
    #[error("http request failed: {0}")]
    Http(reqwest::Error),
}

impl ReconcileError {
    /// Classifies a transport error, separating timeouts from other
    /// failures so callers can treat them per the taxonomy.
    pub fn from_http(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error)
        }
    }

    /// Builds a [`ReconcileError::Verification`] from a reason string.
    pub fn verification(reason: impl Into<String>) -> Self {
        Self::Verification { reason: reason.into() }
    }
}
