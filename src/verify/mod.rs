//! Purchase verification adapters.
//!
//! Each vendor's synchronous purchase-verification call is wrapped behind
//! a small API trait so the adapter logic (sandbox retry, status-code
//! translation, acknowledge-once) stays testable without a network. The
//! HTTP implementations live next to each adapter and share pooled
//! clients with bounded timeouts.

pub mod apple;
pub mod google;

pub use apple::{AppleReceiptVerifier, AppleVerifyApi, HttpAppleVerifyApi};
pub use google::{GooglePurchaseVerifier, GoogleSubscriptionsApi, HttpGoogleSubscriptionsApi};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Result, model::Platform};

/// Canonical result of a successful purchase verification.
///
/// Both vendors normalize into this shape before the reconciler sees the
/// purchase; nothing downstream branches on which store it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedPurchase {
    /// Vendor transaction id (Apple) or order id (Google).
    pub transaction_id: String,
    /// Durable lineage key. Google reuses the order id here, matching the
    /// Play billing model where the token identifies the lineage.
    pub original_transaction_id: String,
    /// Product identifier, after alias mapping.
    pub product_id: String,
    /// Entitlement expiry, when the vendor reports one.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the store reports auto-renewal enabled.
    pub auto_renewing: bool,
    /// Originating store.
    pub platform: Platform,
}

/// Supplies OAuth bearer tokens for the Google Play Developer API.
///
/// The service-account JWT exchange is an external collaborator; this
/// seam only hands the adapter a usable token.
pub trait AccessTokenProvider: Send + Sync {
    /// Returns a bearer token valid for the androidpublisher scope.
    async fn access_token(&self) -> Result<String>;
}

/// Token provider backed by a pre-acquired token.
///
/// Useful for tests and for deployments where a sidecar refreshes the
/// token out of band.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wraps an already-acquired bearer token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
