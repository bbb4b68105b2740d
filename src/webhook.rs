//! Webhook entry point for vendor push notifications.
//!
//! Transport concerns (routing, CORS, signature verification) live
//! upstream; this module takes the raw request body and produces a
//! structured [`WebhookOutcome`] — always. Business-logic failures
//! (malformed payloads, unknown records, stale events) are folded into
//! the outcome with `success = false` so the HTTP layer can keep
//! returning 2xx and the vendor does not mistake a no-op for a delivery
//! failure needing redelivery.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::ReconcileError,
    model::Platform,
    normalize,
    reconcile::Reconciler,
    store::EntitlementStore,
};

/// Structured result of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookOutcome {
    /// Whether the notification was applied (or was a recognized no-op).
    pub success: bool,
    /// Platform label (`ios` / `android`), when detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<&'static str>,
    /// Vendor notification type, as received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    /// Action taken (e.g. `activated`, `grace_period`, `unhandled`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookOutcome {
    fn failure(platform: Option<Platform>, notification_type: Option<String>, error: String) -> Self {
        Self {
            success: false,
            platform: platform.map(Platform::as_str),
            notification_type,
            action: None,
            error: Some(error),
        }
    }
}

/// Handles one webhook delivery end to end.
///
/// Parses the body, detects the vendor, normalizes the notification into
/// a canonical event, and applies it through the reconciler. Never
/// returns an error: every failure mode is reported inside the outcome.
#[instrument(skip(reconciler, body), fields(request_id = %Uuid::new_v4()))]
pub async fn handle_webhook<S: EntitlementStore>(
    reconciler: &Reconciler<S>,
    body: &str,
    received_at: DateTime<Utc>,
) -> WebhookOutcome {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!(%e, "webhook body is not JSON");
            return WebhookOutcome::failure(None, None, format!("invalid JSON body: {e}"));
        }
    };

    let Some(platform) = normalize::detect_platform(&value) else {
        warn!("unknown webhook format");
        return WebhookOutcome::failure(None, None, "unknown webhook format".into());
    };

    let (event, notification_type) = match platform {
        Platform::Ios => {
            let notification = match normalize::apple::decode(&value) {
                Ok(notification) => notification,
                Err(e) => {
                    return WebhookOutcome::failure(Some(platform), None, e.to_string());
                }
            };
            let notification_type = notification.notification_type.clone();
            match normalize::apple::normalize(&notification, received_at) {
                Ok(event) => (event, notification_type),
                Err(e) => {
                    return WebhookOutcome::failure(
                        Some(platform),
                        Some(notification_type),
                        e.to_string(),
                    );
                }
            }
        }
        Platform::Android => {
            let notification = match normalize::google::decode(&value) {
                Ok(notification) => notification,
                Err(e) => {
                    return WebhookOutcome::failure(Some(platform), None, e.to_string());
                }
            };
            let notification_type = notification.notification_type.to_string();
            (normalize::google::normalize(&notification, received_at), notification_type)
        }
    };

    match reconciler.apply(&event).await {
        Ok(outcome) => {
            info!(
                platform = platform.as_str(),
                notification_type = %notification_type,
                action = outcome.action,
                applied = outcome.applied,
                "webhook processed"
            );
            WebhookOutcome {
                success: true,
                platform: Some(platform.as_str()),
                notification_type: Some(notification_type),
                action: Some(outcome.action),
                error: None,
            }
        }
        Err(error @ (ReconcileError::RecordNotFound(_) | ReconcileError::StaleEvent { .. })) => {
            warn!(%error, "webhook event not applied");
            WebhookOutcome::failure(Some(platform), Some(notification_type), error.to_string())
        }
        Err(error) => {
            warn!(%error, "webhook processing failed");
            WebhookOutcome::failure(Some(platform), Some(notification_type), error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::{
        model::{SubscriptionRecord, SubscriptionStatus, Tier},
        store::InMemoryStore,
    };

    // ========================================================================
    // Test Helpers
    // ========================================================================

    fn seeded() -> (Reconciler<InMemoryStore>, InMemoryStore) {
        let store = InMemoryStore::new();
        store.seed(
            SubscriptionRecord {
                user_id: "user-1".into(),
                status: SubscriptionStatus::Active,
                auto_renew: true,
                expires_at: Some(Utc::now() + Duration::days(20)),
                store_transaction_id: Some("token-1".into()),
                original_transaction_id: Some("tx-1".into()),
                cancellation_reason: None,
                updated_at: Utc::now() - Duration::hours(1),
            },
            Tier::Premium,
        );
        (Reconciler::new(store.clone()), store)
    }

    fn apple_body(notification_type: &str) -> String {
        let payload = json!({
            "notificationType": notification_type,
            "data": {
                "signedTransactionInfo": { "originalTransactionId": "tx-1" }
            }
        });
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            serde_json::to_vec(&payload).unwrap(),
        );
        json!({ "signedPayload": format!("h.{encoded}.s") }).to_string()
    }

    fn google_body(notification_type: i64) -> String {
        let data = json!({
            "subscriptionNotification": {
                "notificationType": notification_type,
                "purchaseToken": "token-1"
            }
        });
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            serde_json::to_vec(&data).unwrap(),
        );
        json!({ "message": { "data": encoded } }).to_string()
    }

    // ========================================================================
    // Delivery handling
    // ========================================================================

    #[tokio::test]
    async fn test_apple_fail_to_renew_enters_grace_period() {
        let (reconciler, store) = seeded();

        let outcome =
            handle_webhook(&reconciler, &apple_body("DID_FAIL_TO_RENEW"), Utc::now()).await;

        assert!(outcome.success);
        assert_eq!(outcome.platform, Some("ios"));
        assert_eq!(outcome.notification_type.as_deref(), Some("DID_FAIL_TO_RENEW"));
        assert_eq!(outcome.action, Some("grace_period"));
        assert_eq!(store.record_of("user-1").unwrap().status, SubscriptionStatus::GracePeriod);
        // Entitlement survives the grace period.
        assert_eq!(store.tier_of("user-1"), Some(Tier::Premium));
    }

    #[tokio::test]
    async fn test_google_purchase_is_applied() {
        let (reconciler, store) = seeded();
        let mut record = store.record_of("user-1").unwrap();
        record.status = SubscriptionStatus::Expired;
        record.auto_renew = false;
        store.seed(record, Tier::Member);

        let outcome = handle_webhook(&reconciler, &google_body(4), Utc::now()).await;

        assert!(outcome.success);
        assert_eq!(outcome.platform, Some("android"));
        assert_eq!(outcome.action, Some("activated"));
        assert_eq!(store.record_of("user-1").unwrap().status, SubscriptionStatus::Active);
        assert_eq!(store.tier_of("user-1"), Some(Tier::Premium));
    }

    #[tokio::test]
    async fn test_invalid_json_body_reports_failure() {
        let (reconciler, _store) = seeded();
        let outcome = handle_webhook(&reconciler, "{not json", Utc::now()).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("invalid JSON body"));
    }

    #[tokio::test]
    async fn test_unknown_format_reports_failure() {
        let (reconciler, _store) = seeded();
        let outcome = handle_webhook(&reconciler, r#"{"foo": 1}"#, Utc::now()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("unknown webhook format"));
    }

    #[tokio::test]
    async fn test_malformed_apple_envelope_reports_failure() {
        let (reconciler, store) = seeded();
        let body = json!({ "signedPayload": "two.parts" }).to_string();

        let outcome = handle_webhook(&reconciler, &body, Utc::now()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.platform, Some("ios"));
        assert!(outcome.error.unwrap().contains("malformed payload"));
        // Malformed input never mutates state.
        assert_eq!(store.record_of("user-1").unwrap().status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_unknown_record_reports_failure_with_type() {
        let (reconciler, _store) = seeded();
        let data = json!({
            "subscriptionNotification": {
                "notificationType": 4,
                "purchaseToken": "token-unknown"
            }
        });
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            serde_json::to_vec(&data).unwrap(),
        );
        let body = json!({ "message": { "data": encoded } }).to_string();

        let outcome = handle_webhook(&reconciler, &body, Utc::now()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.notification_type.as_deref(), Some("4"));
        assert!(outcome.error.unwrap().contains("no subscription record"));
    }

    #[tokio::test]
    async fn test_duplicate_google_purchase_reports_success_without_side_effects() {
        let (reconciler, store) = seeded();
        let body = google_body(4);

        let first = handle_webhook(&reconciler, &body, Utc::now()).await;
        assert!(first.success);
        let record_after_first = store.record_of("user-1").unwrap();
        let tier_changes = store.tier_change_count();

        let second = handle_webhook(&reconciler, &body, Utc::now()).await;
        assert!(second.success);
        assert_eq!(second.action, Some("activated"));
        assert_eq!(store.record_of("user-1").unwrap(), record_after_first);
        assert_eq!(store.tier_change_count(), tier_changes);
    }

    #[tokio::test]
    async fn test_unhandled_vendor_type_is_successful_noop() {
        let (reconciler, store) = seeded();

        let outcome =
            handle_webhook(&reconciler, &apple_body("PRICE_INCREASE"), Utc::now()).await;

        assert!(outcome.success);
        assert_eq!(outcome.action, Some("unhandled"));
        assert_eq!(store.record_of("user-1").unwrap().status, SubscriptionStatus::Active);
    }
}
