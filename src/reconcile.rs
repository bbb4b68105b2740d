//! Event application against the entitlement store.
//!
//! [`Reconciler`] executes the decisions of [`crate::machine::decide`] as
//! conditional read-modify-writes: read the record, decide, write iff the
//! status is still what was observed, then project the profile tier. A
//! single conflict is retried in-process with a fresh read before being
//! surfaced, which resolves webhook/sweep races on the same record
//! without any locking.
//!
//! Every invocation is stateless; concurrent invocations from separate
//! processes coordinate purely through the store's conditional update.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{ReconcileError, Result},
    event::SubscriptionEvent,
    machine::{Decision, TierChange, decide},
    model::{SubscriptionRecord, SubscriptionStatus},
    store::{EntitlementStore, RecordPatch, UpdateOutcome},
    verify::VerifiedPurchase,
};

/// Result of applying an event or verified purchase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyOutcome {
    /// User whose record was targeted.
    pub user_id: String,
    /// Record status after the operation.
    pub status: SubscriptionStatus,
    /// Action label (webhook vocabulary, e.g. `activated`,
    /// `expired_and_downgraded`).
    pub action: &'static str,
    /// False when the operation was an idempotent no-op.
    pub applied: bool,
}

/// Applies canonical events and verified purchases to the store.
///
/// Generic over the [`EntitlementStore`] implementation; cloning is as
/// cheap as cloning the store handle.
#[derive(Debug, Clone)]
pub struct Reconciler<S> {
    store: S,
}

impl<S: EntitlementStore> Reconciler<S> {
    /// Creates a reconciler over a store gateway.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the underlying store handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies a canonical event to its target record.
    ///
    /// Resolves the record by correlation key, decides the transition,
    /// and executes it under optimistic concurrency. Duplicate deliveries
    /// resolve to a successful no-op; out-of-order deliveries that would
    /// regress the record are rejected as [`ReconcileError::StaleEvent`].
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::RecordNotFound`] when no record matches the
    ///   correlation key (reported, not retried).
    /// - [`ReconcileError::StaleEvent`] per the last-writer-wins rule.
    /// - [`ReconcileError::StoreConflict`] when the conditional update
    ///   conflicts twice in a row.
    #[instrument(
        skip(self, event),
        fields(kind = ?event.kind, key = %event.correlation_key, apply_id = %Uuid::new_v4())
    )]
    pub async fn apply(&self, event: &SubscriptionEvent) -> Result<ApplyOutcome> {
        let mut record = self
            .store
            .find_by_correlation_key(&event.correlation_key)
            .await?
            .ok_or_else(|| ReconcileError::RecordNotFound(event.correlation_key.to_string()))?;

        for attempt in 0..2u8 {
            let transition = match decide(event, &record) {
                Decision::Noop { action } => {
                    return Ok(ApplyOutcome {
                        user_id: record.user_id,
                        status: record.status,
                        action,
                        applied: false,
                    });
                }
                Decision::Stale { rejected } => {
                    warn!(current = ?record.status, rejected = ?rejected, "rejecting stale event");
                    return Err(ReconcileError::StaleEvent { current: record.status, rejected });
                }
                Decision::Apply(transition) => transition,
            };

            let outcome = self
                .store
                .conditional_update(&record.user_id, record.status, transition.patch, Utc::now())
                .await?;

            match outcome {
                UpdateOutcome::Updated(updated) => {
                    self.project_tier(&updated.user_id, transition.tier).await?;
                    info!(
                        user_id = %updated.user_id,
                        status = ?updated.status,
                        action = transition.action,
                        "transition applied"
                    );
                    return Ok(ApplyOutcome {
                        user_id: updated.user_id,
                        status: updated.status,
                        action: transition.action,
                        applied: true,
                    });
                }
                UpdateOutcome::Conflict => {
                    if attempt == 0 {
                        warn!(user_id = %record.user_id, "conditional update conflicted, re-reading");
                        record = self
                            .store
                            .find_by_correlation_key(&event.correlation_key)
                            .await?
                            .ok_or_else(|| {
                                ReconcileError::RecordNotFound(event.correlation_key.to_string())
                            })?;
                    }
                }
                UpdateOutcome::NotFound => {
                    return Err(ReconcileError::RecordNotFound(format!(
                        "user {}",
                        record.user_id
                    )));
                }
            }
        }

        Err(ReconcileError::StoreConflict)
    }

    /// Applies a verified purchase for a user (the synchronous,
    /// user-initiated path).
    ///
    /// Creates the record if the user has none, otherwise activates the
    /// existing one with the purchase data. Idempotent: re-submitting the
    /// same purchase leaves the record unchanged and performs no second
    /// tier upgrade.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::StoreConflict`] when the conditional update
    /// conflicts twice; store errors are propagated.
    #[instrument(
        skip(self, purchase),
        fields(platform = purchase.platform.as_str(), product = %purchase.product_id)
    )]
    pub async fn apply_verified_purchase(
        &self,
        user_id: &str,
        purchase: &VerifiedPurchase,
    ) -> Result<ApplyOutcome> {
        let Some(mut record) = self.store.find_by_user(user_id).await? else {
            let now = Utc::now();
            let record = SubscriptionRecord {
                user_id: user_id.to_owned(),
                status: SubscriptionStatus::Active,
                auto_renew: purchase.auto_renewing,
                expires_at: purchase.expires_at,
                store_transaction_id: Some(purchase.transaction_id.clone()),
                original_transaction_id: Some(purchase.original_transaction_id.clone()),
                cancellation_reason: None,
                updated_at: now,
            };
            self.store.insert(record).await?;
            self.store.upgrade_tier(user_id).await?;
            info!(user_id, "subscription created from verified purchase");
            return Ok(ApplyOutcome {
                user_id: user_id.to_owned(),
                status: SubscriptionStatus::Active,
                action: "activated",
                applied: true,
            });
        };

        if let Some(ref existing) = record.original_transaction_id
            && *existing != purchase.original_transaction_id
        {
            // Lineage keys are immutable; a differing one needs manual
            // review, not a silent rewrite.
            warn!(
                user_id,
                existing = %existing,
                incoming = %purchase.original_transaction_id,
                "verified purchase carries a different original transaction id; keeping stored lineage"
            );
        }

        for attempt in 0..2u8 {
            let patch = RecordPatch {
                status: Some(SubscriptionStatus::Active),
                auto_renew: Some(purchase.auto_renewing),
                expires_at: purchase.expires_at,
                store_transaction_id: Some(purchase.transaction_id.clone()),
                original_transaction_id: Some(purchase.original_transaction_id.clone()),
                cancellation_reason: Some(None),
            };

            if patch.is_noop(&record) {
                return Ok(ApplyOutcome {
                    user_id: record.user_id,
                    status: record.status,
                    action: "activated",
                    applied: false,
                });
            }

            let was_entitled = record.status.entitled();
            let outcome = self
                .store
                .conditional_update(&record.user_id, record.status, patch, Utc::now())
                .await?;

            match outcome {
                UpdateOutcome::Updated(updated) => {
                    if !was_entitled {
                        self.store.upgrade_tier(&updated.user_id).await?;
                    }
                    info!(user_id = %updated.user_id, "subscription activated from verified purchase");
                    return Ok(ApplyOutcome {
                        user_id: updated.user_id,
                        status: updated.status,
                        action: "activated",
                        applied: true,
                    });
                }
                UpdateOutcome::Conflict => {
                    if attempt == 0 {
                        warn!(user_id, "purchase activation conflicted, re-reading");
                        record =
                            self.store.find_by_user(user_id).await?.ok_or_else(|| {
                                ReconcileError::RecordNotFound(format!("user {user_id}"))
                            })?;
                    }
                }
                UpdateOutcome::NotFound => {
                    return Err(ReconcileError::RecordNotFound(format!("user {user_id}")));
                }
            }
        }

        Err(ReconcileError::StoreConflict)
    }

    async fn project_tier(&self, user_id: &str, change: Option<TierChange>) -> Result<()> {
        match change {
            Some(TierChange::Upgrade) => self.store.upgrade_tier(user_id).await,
            Some(TierChange::Downgrade) => self.store.downgrade_tier(user_id).await,
            None => Ok(()),
        }
    }
}
