//! Scheduled expiry sweep.
//!
//! Webhooks can be lost; the sweep is the channel that detects expiry
//! purely from elapsed wall-clock time. Each run performs three
//! independent scans, synthesizes a canonical event per candidate record,
//! and feeds every event through the same state machine the webhook path
//! uses. Scans are partial-failure tolerant: one record failing to
//! update never aborts the rest.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    event::{CorrelationKey, EventKind, SubscriptionEvent},
    model::SubscriptionRecord,
    reconcile::Reconciler,
    store::EntitlementStore,
};

/// Sweep timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Days a grace-period record keeps entitlement past `expires_at`.
    pub grace_period_days: i64,
    /// Days ahead the approaching-expiry scan looks.
    pub approaching_window_days: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { grace_period_days: 3, approaching_window_days: 3 }
    }
}

/// Aggregate result of one sweep run.
///
/// Serializes like the cron endpoint's historical response shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records moved to `expired` from the active scan.
    pub expired_count: u64,
    /// Records moved to `expired` after their grace window lapsed.
    pub grace_expired_count: u64,
    /// Auto-renewing records expiring inside the lookahead window
    /// (observational only; no transition).
    pub approaching_count: u64,
    /// Per-record failures across all scans.
    pub failed_count: u64,
    /// When the sweep ran.
    pub swept_at: Option<DateTime<Utc>>,
}

/// Scheduled reconciliation from wall-clock time.
#[derive(Debug, Clone)]
pub struct Sweeper<S> {
    reconciler: Reconciler<S>,
    config: SweepConfig,
}

impl<S: EntitlementStore> Sweeper<S> {
    /// Creates a sweeper over a reconciler.
    pub fn new(reconciler: Reconciler<S>, config: SweepConfig) -> Self {
        Self { reconciler, config }
    }

    /// Runs the three scans against `now` and returns aggregate counts.
    ///
    /// # Errors
    ///
    /// Only scan-level store failures abort the run; per-record apply
    /// failures are counted in the report and logged.
    #[instrument(skip(self), fields(sweep_id = %Uuid::new_v4()))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport { swept_at: Some(now), ..SweepReport::default() };

        // 1. Active records already past their expiry.
        let candidates = self.reconciler.store().scan_expired_active(now).await?;
        let (applied, failed) = self.apply_all(&candidates, EventKind::Expired, now).await;
        report.expired_count += applied;
        report.failed_count += failed;

        // 2. Grace-period records whose window has fully lapsed.
        let cutoff = now - Duration::days(self.config.grace_period_days);
        let candidates = self.reconciler.store().scan_grace_lapsed(cutoff).await?;
        let (applied, failed) =
            self.apply_all(&candidates, EventKind::GracePeriodExpired, now).await;
        report.grace_expired_count += applied;
        report.failed_count += failed;

        // 3. Auto-renewing records nearing expiry. Observational only:
        // the machine never transitions on ApproachingExpiry. Hook point
        // for a future vendor renewal-status check.
        let until = now + Duration::days(self.config.approaching_window_days);
        let candidates = self.reconciler.store().scan_approaching_expiry(now, until).await?;
        for record in &candidates {
            info!(user_id = %record.user_id, expires_at = ?record.expires_at, "approaching expiry");
        }
        report.approaching_count += candidates.len() as u64;

        info!(
            expired = report.expired_count,
            grace_expired = report.grace_expired_count,
            approaching = report.approaching_count,
            failed = report.failed_count,
            "sweep finished"
        );
        Ok(report)
    }

    /// Applies one synthetic event per candidate, counting per-record
    /// outcomes instead of aborting on the first failure.
    async fn apply_all(
        &self,
        candidates: &[SubscriptionRecord],
        kind: EventKind,
        now: DateTime<Utc>,
    ) -> (u64, u64) {
        let mut applied = 0;
        let mut failed = 0;
        for record in candidates {
            let Some(key) = correlation_key_of(record) else {
                warn!(user_id = %record.user_id, "record has no correlation key, skipping");
                failed += 1;
                continue;
            };
            let event = SubscriptionEvent::synthetic(kind, key, now);
            match self.reconciler.apply(&event).await {
                // A racing webhook may have transitioned the record
                // first; that is a resolved state, not a failure.
                Ok(outcome) => {
                    if outcome.applied {
                        applied += 1;
                    }
                }
                Err(error) => {
                    warn!(user_id = %record.user_id, %error, "sweep failed for record");
                    failed += 1;
                }
            }
        }
        (applied, failed)
    }
}

/// Picks the durable key for a record, preferring the purchase lineage id.
fn correlation_key_of(record: &SubscriptionRecord) -> Option<CorrelationKey> {
    if let Some(ref id) = record.original_transaction_id {
        Some(CorrelationKey::OriginalTransactionId(id.clone()))
    } else {
        record
            .store_transaction_id
            .as_ref()
            .map(|token| CorrelationKey::PurchaseToken(token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{SubscriptionStatus, Tier},
        store::InMemoryStore,
    };

    // ========================================================================
    // Test Helpers
    // ========================================================================

    fn record(
        user_id: &str,
        status: SubscriptionStatus,
        expires_at: DateTime<Utc>,
        auto_renew: bool,
    ) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: user_id.into(),
            status,
            auto_renew,
            expires_at: Some(expires_at),
            store_transaction_id: Some(format!("token-{user_id}")),
            original_transaction_id: Some(format!("tx-{user_id}")),
            cancellation_reason: None,
            updated_at: expires_at - Duration::days(30),
        }
    }

    fn sweeper(store: &InMemoryStore) -> Sweeper<InMemoryStore> {
        Sweeper::new(Reconciler::new(store.clone()), SweepConfig::default())
    }

    // ========================================================================
    // Scan behavior
    // ========================================================================

    #[tokio::test]
    async fn test_sweep_expires_lapsed_active_record() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.seed(
            record("u1", SubscriptionStatus::Active, now - Duration::days(1), true),
            Tier::Premium,
        );

        let report = sweeper(&store).sweep(now).await.unwrap();

        assert_eq!(report.expired_count, 1);
        assert_eq!(report.failed_count, 0);
        let updated = store.record_of("u1").unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Expired);
        assert!(!updated.auto_renew);
        assert_eq!(store.tier_of("u1"), Some(Tier::Member));
    }

    #[tokio::test]
    async fn test_sweep_expires_fully_lapsed_grace_record() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.seed(
            record("u2", SubscriptionStatus::GracePeriod, now - Duration::days(4), true),
            Tier::Premium,
        );

        let report = sweeper(&store).sweep(now).await.unwrap();

        assert_eq!(report.grace_expired_count, 1);
        assert_eq!(store.record_of("u2").unwrap().status, SubscriptionStatus::Expired);
        assert_eq!(store.tier_of("u2"), Some(Tier::Member));
    }

    #[tokio::test]
    async fn test_sweep_leaves_grace_record_inside_window() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.seed(
            record("u3", SubscriptionStatus::GracePeriod, now - Duration::days(2), true),
            Tier::Premium,
        );

        let report = sweeper(&store).sweep(now).await.unwrap();

        assert_eq!(report.grace_expired_count, 0);
        assert_eq!(store.record_of("u3").unwrap().status, SubscriptionStatus::GracePeriod);
        assert_eq!(store.tier_of("u3"), Some(Tier::Premium));
    }

    #[tokio::test]
    async fn test_sweep_counts_approaching_without_transition() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.seed(
            record("u4", SubscriptionStatus::Active, now + Duration::days(2), true),
            Tier::Premium,
        );
        // Auto-renew off: not a renewal-check candidate.
        store.seed(
            record("u5", SubscriptionStatus::Active, now + Duration::days(2), false),
            Tier::Premium,
        );

        let report = sweeper(&store).sweep(now).await.unwrap();

        assert_eq!(report.approaching_count, 1);
        assert_eq!(report.expired_count, 0);
        assert_eq!(store.record_of("u4").unwrap().status, SubscriptionStatus::Active);
        assert_eq!(store.tier_of("u4"), Some(Tier::Premium));
    }

    #[tokio::test]
    async fn test_sweep_empty_store_reports_zeroes() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let report = sweeper(&store).sweep(now).await.unwrap();

        assert_eq!(report, SweepReport { swept_at: Some(now), ..SweepReport::default() });
    }

    #[tokio::test]
    async fn test_sweep_report_serializes_counts() {
        let report = SweepReport {
            expired_count: 2,
            grace_expired_count: 1,
            approaching_count: 3,
            failed_count: 0,
            swept_at: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"expired_count\":2"));
        assert!(json.contains("\"approaching_count\":3"));
    }
}
