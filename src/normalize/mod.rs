//! Vendor notification normalization.
//!
//! Apple and Google speak different vocabularies (a string enum inside a
//! signed-JWT envelope vs. an integer enum inside a base64 Pub/Sub
//! envelope). Both are translated into one [`SubscriptionEvent`] here,
//! and no business logic downstream of this boundary ever branches on a
//! vendor-specific code.
//!
//! Normalizers are structural only: cryptographic verification of the
//! payload happens in an upstream collaborator, but envelope shape is
//! re-validated defensively. Malformed input is rejected without partial
//! processing and never mutates state.
//!
//! [`SubscriptionEvent`]: crate::event::SubscriptionEvent

pub mod apple;
pub mod google;

pub use apple::AppleNotification;
pub use google::GoogleNotification;

use crate::model::Platform;

/// Determines which vendor a raw webhook body came from.
///
/// Apple server notifications wrap everything in `signedPayload`; Google
/// RTDN deliveries arrive as Pub/Sub push envelopes with a `message`.
/// Anything else is unknown and reported as such by the webhook layer.
#[must_use]
pub fn detect_platform(body: &serde_json::Value) -> Option<Platform> {
    if body.get("signedPayload").is_some() {
        Some(Platform::Ios)
    } else if body.get("message").is_some() {
        Some(Platform::Android)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_detect_apple_envelope() {
        let body = json!({ "signedPayload": "a.b.c" });
        assert_eq!(detect_platform(&body), Some(Platform::Ios));
    }

    #[test]
    fn test_detect_google_envelope() {
        let body = json!({ "message": { "data": "e30=" } });
        assert_eq!(detect_platform(&body), Some(Platform::Android));
    }

    #[test]
    fn test_detect_unknown_envelope() {
        let body = json!({ "something": "else" });
        assert_eq!(detect_platform(&body), None);
    }
}
