//! Google Play Real-time Developer Notification normalization.
//!
//! RTDN deliveries arrive as Pub/Sub push envelopes:
//! `{"message": {"data": "<base64>"}}` where the decoded data is a
//! developer notification carrying `subscriptionNotification`
//! `{notificationType, purchaseToken}`. The integer type enum is mapped
//! onto the canonical event vocabulary here and never leaks downstream.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::{
    error::{ReconcileError, Result},
    event::{CorrelationKey, EventKind, SubscriptionEvent},
    model::Platform,
};

/// Decoded Play developer notification, before canonical mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct GoogleNotification {
    /// Vendor notification type code (e.g. 4 = SUBSCRIPTION_PURCHASED).
    pub notification_type: i64,
    /// Purchase token identifying the subscription.
    pub purchase_token: String,
    /// Vendor event timestamp.
    pub event_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeveloperNotification {
    #[serde(default)]
    event_time_millis: Option<serde_json::Value>,
    #[serde(default)]
    subscription_notification: Option<SubscriptionNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionNotification {
    notification_type: i64,
    purchase_token: String,
}

/// Parses `eventTimeMillis`, which Google serializes as a string.
fn parse_event_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// Decodes the Pub/Sub envelope into a [`GoogleNotification`].
///
/// # Errors
///
/// - [`ReconcileError::MalformedPayload`] for a missing `message.data`,
///   undecodable base64, or invalid JSON.
/// - [`ReconcileError::UnsupportedNotificationType`] when the decoded
///   notification has no `subscriptionNotification` (e.g. one-time
///   product or voided-purchase notifications).
pub fn decode(envelope: &serde_json::Value) -> Result<GoogleNotification> {
    let data = envelope
        .get("message")
        .and_then(|message| message.get("data"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ReconcileError::MalformedPayload("missing message.data".into()))?;

    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
        .map_err(|e| ReconcileError::MalformedPayload(format!("invalid base64 data: {e}")))?;

    let notification: DeveloperNotification = serde_json::from_slice(&decoded)
        .map_err(|e| ReconcileError::MalformedPayload(format!("invalid notification JSON: {e}")))?;

    let Some(subscription) = notification.subscription_notification else {
        return Err(ReconcileError::UnsupportedNotificationType(
            "no subscription notification in payload".into(),
        ));
    };

    Ok(GoogleNotification {
        notification_type: subscription.notification_type,
        purchase_token: subscription.purchase_token,
        event_time: notification.event_time_millis.as_ref().and_then(parse_event_time),
    })
}

/// Maps a decoded notification onto the canonical event vocabulary.
///
/// `received_at` supplies `occurred_at` when the vendor omitted
/// `eventTimeMillis`.
#[must_use]
pub fn normalize(
    notification: &GoogleNotification,
    received_at: DateTime<Utc>,
) -> SubscriptionEvent {
    let kind = match notification.notification_type {
        // RECOVERED, RENEWED, PURCHASED, RESTARTED
        1 | 2 | 4 | 7 => EventKind::Renewed,
        // CANCELED: runs until expiry, handled distinctly from revocation
        3 => EventKind::Canceled,
        // ON_HOLD, IN_GRACE_PERIOD
        5 | 6 => EventKind::RenewalFailed,
        // PAUSED
        10 => EventKind::Paused,
        // REVOKED
        12 => EventKind::Revoked,
        // EXPIRED
        13 => EventKind::Expired,
        // PRICE_CHANGE_CONFIRMED, DEFERRED, PAUSE_SCHEDULE_CHANGED, unknown
        _ => EventKind::Unhandled,
    };

    SubscriptionEvent {
        kind,
        correlation_key: CorrelationKey::PurchaseToken(notification.purchase_token.clone()),
        occurred_at: notification.event_time.unwrap_or(received_at),
        platform: Some(Platform::Android),
    }
}
