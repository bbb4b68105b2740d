//! Apple App Store Server Notification normalization.
//!
//! Notifications arrive as `{"signedPayload": "<header>.<payload>.<sig>"}`
//! — a JWS whose middle segment is a base64url JSON document carrying
//! `notificationType` and, for subscription events, the transaction info.
//! Signature verification happens upstream; this module decodes and
//! re-validates the structure, then maps the vendor's string enum onto
//! the canonical event vocabulary.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::{
    error::{ReconcileError, Result},
    event::{CorrelationKey, EventKind, SubscriptionEvent},
    model::Platform,
};

/// Decoded Apple server notification, before canonical mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct AppleNotification {
    /// Vendor notification type string (e.g. `DID_RENEW`).
    pub notification_type: String,
    /// Lineage id from the transaction info, when present.
    pub original_transaction_id: Option<String>,
    /// Auto-renewal setting from `DID_CHANGE_RENEWAL_STATUS` payloads.
    pub auto_renew_enabled: Option<bool>,
    /// Vendor signing timestamp.
    pub signed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecodedPayload {
    notification_type: String,
    #[serde(default)]
    data: Option<PayloadData>,
    #[serde(default)]
    signed_date: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadData {
    #[serde(default)]
    signed_transaction_info: Option<serde_json::Value>,
    #[serde(default)]
    auto_renew_status: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionInfo {
    #[serde(default)]
    original_transaction_id: Option<String>,
}

/// Decodes a base64url segment, tolerating padded input.
fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        segment.trim_end_matches('='),
    )
    .map_err(|e| ReconcileError::MalformedPayload(format!("invalid base64url segment: {e}")))
}

/// Interprets Apple's auto-renew flag, which arrives as a bool or a 0/1.
fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// Decodes the signed envelope into an [`AppleNotification`].
///
/// # Errors
///
/// Returns [`ReconcileError::MalformedPayload`] for a missing or
/// non-string `signedPayload`, a segment count other than three,
/// undecodable base64, or invalid JSON. Nothing is partially processed.
pub fn decode(envelope: &serde_json::Value) -> Result<AppleNotification> {
    let signed_payload = envelope
        .get("signedPayload")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ReconcileError::MalformedPayload("missing signedPayload".into()))?;

    let parts: Vec<&str> = signed_payload.split('.').collect();
    if parts.len() != 3 {
        return Err(ReconcileError::MalformedPayload("invalid JWT format".into()));
    }

    let payload_bytes = decode_segment(parts[1])?;
    let payload: DecodedPayload = serde_json::from_slice(&payload_bytes)
        .map_err(|e| ReconcileError::MalformedPayload(format!("invalid payload JSON: {e}")))?;

    let (original_transaction_id, auto_renew_enabled) = match payload.data {
        Some(data) => {
            let original = match data.signed_transaction_info {
                // Verified upstream and already decoded to an object.
                Some(serde_json::Value::Object(map)) => {
                    let info: TransactionInfo =
                        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
                            ReconcileError::MalformedPayload(format!(
                                "invalid transaction info: {e}"
                            ))
                        })?;
                    info.original_transaction_id
                }
                // Still a nested JWS; decode its middle segment.
                Some(serde_json::Value::String(jws)) => {
                    let inner: Vec<&str> = jws.split('.').collect();
                    if inner.len() != 3 {
                        return Err(ReconcileError::MalformedPayload(
                            "invalid transaction info JWT format".into(),
                        ));
                    }
                    let info: TransactionInfo = serde_json::from_slice(&decode_segment(inner[1])?)
                        .map_err(|e| {
                            ReconcileError::MalformedPayload(format!(
                                "invalid transaction info JSON: {e}"
                            ))
                        })?;
                    info.original_transaction_id
                }
                Some(_) => {
                    return Err(ReconcileError::MalformedPayload(
                        "transaction info is neither object nor JWS".into(),
                    ));
                }
                None => None,
            };
            (original, data.auto_renew_status.as_ref().map(truthy))
        }
        None => (None, None),
    };

    Ok(AppleNotification {
        notification_type: payload.notification_type,
        original_transaction_id,
        auto_renew_enabled,
        signed_at: payload.signed_date.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    })
}

/// Maps a decoded notification onto the canonical event vocabulary.
///
/// `received_at` supplies `occurred_at` when the vendor omitted
/// `signedDate`.
///
/// # Errors
///
/// Returns [`ReconcileError::MalformedPayload`] when the notification
/// carries no `originalTransactionId` — without it there is no way to
/// correlate the event to a record.
pub fn normalize(
    notification: &AppleNotification,
    received_at: DateTime<Utc>,
) -> Result<SubscriptionEvent> {
    let kind = match notification.notification_type.as_str() {
        "DID_RENEW" | "SUBSCRIBED" => EventKind::Renewed,
        "DID_CHANGE_RENEWAL_STATUS" => EventKind::RenewalStatusChanged {
            enabled: notification.auto_renew_enabled.unwrap_or(false),
        },
        "DID_FAIL_TO_RENEW" => EventKind::RenewalFailed,
        "EXPIRED" | "GRACE_PERIOD_EXPIRED" => EventKind::Expired,
        "REFUND" => EventKind::Refunded,
        "REVOKE" => EventKind::Revoked,
        "TEST" => EventKind::Test,
        _ => EventKind::Unhandled,
    };

    let original_transaction_id =
        notification.original_transaction_id.clone().ok_or_else(|| {
            ReconcileError::MalformedPayload("missing originalTransactionId".into())
        })?;

    Ok(SubscriptionEvent {
        kind,
        correlation_key: CorrelationKey::OriginalTransactionId(original_transaction_id),
        occurred_at: notification.signed_at.unwrap_or(received_at),
        platform: Some(Platform::Ios),
    })
}
