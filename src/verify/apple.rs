//! Apple receipt verification.
//!
//! Wraps the `verifyReceipt` call behind [`AppleVerifyApi`] and handles
//! the production/sandbox duality: a production response with the
//! sandbox-receipt status is retried once against the sandbox endpoint,
//! never recursively. Vendor status codes translate to stable reason
//! strings so callers never see raw Apple enum values.

use std::{collections::HashMap, sync::LazyLock, time::Duration};

use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::VerifiedPurchase;
use crate::{
    config::AppleConfig,
    error::{ReconcileError, Result},
    model::Platform,
};

/// Status Apple returns when a sandbox receipt hits the production
/// endpoint; the one case that triggers the single sandbox retry.
const SANDBOX_RECEIPT_STATUS: i64 = 21007;

/// Timeout for verification HTTP requests in seconds.
const VERIFY_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for all Apple verification requests.
static APPLE_HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(VERIFY_REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to create Apple verification HTTP client")
});

/// Request body for `verifyReceipt`.
#[derive(Debug, Clone, Serialize)]
pub struct AppleVerifyRequest {
    /// Base64 receipt from the client app.
    #[serde(rename = "receipt-data")]
    pub receipt_data: String,
    /// App shared secret.
    pub password: String,
    /// Only return the latest transaction per subscription.
    #[serde(rename = "exclude-old-transactions")]
    pub exclude_old_transactions: bool,
}

/// One transaction entry from the receipt response.
#[derive(Debug, Clone, Deserialize)]
pub struct AppleReceiptItem {
    /// Vendor transaction id.
    pub transaction_id: String,
    /// Durable lineage id.
    pub original_transaction_id: String,
    /// Store product SKU.
    pub product_id: String,
    /// Expiry in epoch milliseconds, serialized by Apple as a string.
    #[serde(default)]
    pub expires_date_ms: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AppleReceipt {
    #[serde(default)]
    in_app: Option<Vec<AppleReceiptItem>>,
}

/// Response body from `verifyReceipt`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppleVerifyResponse {
    /// Vendor status; 0 means the receipt is valid.
    pub status: i64,
    /// Receipt contents (non-subscription fallback).
    #[serde(default)]
    receipt: Option<AppleReceipt>,
    /// Latest transaction per subscription; preferred source.
    #[serde(default)]
    latest_receipt_info: Option<Vec<AppleReceiptItem>>,
}

impl AppleVerifyResponse {
    /// Builds a response carrying only a status code.
    #[must_use]
    pub fn with_status(status: i64) -> Self {
        Self { status, receipt: None, latest_receipt_info: None }
    }

    /// Builds a valid response around a single transaction.
    #[must_use]
    pub fn with_item(item: AppleReceiptItem) -> Self {
        Self { status: 0, receipt: None, latest_receipt_info: Some(vec![item]) }
    }
}

/// Performs the raw `verifyReceipt` POST.
///
/// The adapter logic above this trait stays free of networking so the
/// sandbox-retry and status-mapping behavior is testable in isolation.
pub trait AppleVerifyApi: Send + Sync {
    /// Posts the request to one endpoint and decodes the response.
    async fn verify_receipt(
        &self,
        endpoint: &str,
        request: &AppleVerifyRequest,
    ) -> Result<AppleVerifyResponse>;
}

/// HTTP implementation of [`AppleVerifyApi`] over the shared client.
#[derive(Debug, Clone, Default)]
pub struct HttpAppleVerifyApi;

impl AppleVerifyApi for HttpAppleVerifyApi {
    async fn verify_receipt(
        &self,
        endpoint: &str,
        request: &AppleVerifyRequest,
    ) -> Result<AppleVerifyResponse> {
        let response = APPLE_HTTP_CLIENT
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(ReconcileError::from_http)?;
        response.json().await.map_err(ReconcileError::from_http)
    }
}

/// Translates Apple's receipt status codes to stable reason strings.
fn status_reason(status: i64) -> String {
    match status {
        21000 => "App Store could not read the JSON".to_owned(),
        21002 => "receipt data is malformed".to_owned(),
        21003 => "receipt could not be authenticated".to_owned(),
        21004 => "shared secret mismatch".to_owned(),
        21005 => "receipt server unavailable".to_owned(),
        21006 => "receipt valid but subscription expired".to_owned(),
        21007 => "sandbox receipt sent to production".to_owned(),
        21008 => "production receipt sent to sandbox".to_owned(),
        21010 => "account not found".to_owned(),
        other => format!("unknown status: {other}"),
    }
}

/// Verifies App Store receipts into canonical purchases.
#[derive(Debug, Clone)]
pub struct AppleReceiptVerifier<A> {
    api: A,
    production_url: String,
    sandbox_url: String,
    shared_secret: String,
    product_aliases: HashMap<String, String>,
}

impl<A: AppleVerifyApi> AppleReceiptVerifier<A> {
    /// Creates a verifier over an API implementation.
    pub fn new(api: A, config: &AppleConfig, shared_secret: impl Into<String>) -> Self {
        Self {
            api,
            production_url: config.production_url.clone(),
            sandbox_url: config.sandbox_url.clone(),
            shared_secret: shared_secret.into(),
            product_aliases: HashMap::new(),
        }
    }

    /// Sets the store-SKU alias table.
    #[must_use]
    pub fn with_product_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.product_aliases = aliases;
        self
    }

    /// Verifies a receipt and normalizes the latest purchase.
    ///
    /// Tries production first; a sandbox-receipt status is retried once
    /// against the sandbox endpoint before the final status is judged.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Verification`] for any non-zero final status
    ///   or a receipt with no purchase in it.
    /// - [`ReconcileError::Timeout`] / [`ReconcileError::Http`] for
    ///   transport failures.
    #[instrument(skip(self, receipt))]
    pub async fn verify(&self, receipt: &str) -> Result<VerifiedPurchase> {
        let request = AppleVerifyRequest {
            receipt_data: receipt.to_owned(),
            password: self.shared_secret.clone(),
            exclude_old_transactions: true,
        };

        let mut response = self.api.verify_receipt(&self.production_url, &request).await?;

        if response.status == SANDBOX_RECEIPT_STATUS {
            info!("sandbox receipt detected, retrying against sandbox endpoint");
            response = self.api.verify_receipt(&self.sandbox_url, &request).await?;
        }

        if response.status != 0 {
            let reason = status_reason(response.status);
            warn!(status = response.status, reason = %reason, "receipt rejected");
            return Err(ReconcileError::Verification { reason });
        }

        // Subscriptions report in latest_receipt_info; fall back to the
        // receipt's in_app list for older receipt styles.
        let item = response
            .latest_receipt_info
            .and_then(|items| items.into_iter().next())
            .or_else(|| {
                response
                    .receipt
                    .and_then(|receipt| receipt.in_app)
                    .and_then(|items| items.into_iter().next())
            })
            .ok_or_else(|| ReconcileError::verification("no purchase found in receipt"))?;

        let expires_at = match item.expires_date_ms.as_deref() {
            Some(ms) => Some(
                ms.parse::<i64>()
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .ok_or_else(|| ReconcileError::verification("invalid expires_date_ms"))?,
            ),
            None => None,
        };

        let product_id = self
            .product_aliases
            .get(&item.product_id)
            .cloned()
            .unwrap_or_else(|| item.product_id.clone());

        Ok(VerifiedPurchase {
            transaction_id: item.transaction_id,
            original_transaction_id: item.original_transaction_id,
            product_id,
            expires_at,
            // A verifiable subscription receipt implies renewal intent;
            // the webhook channel corrects the flag when it changes.
            auto_renewing: true,
            platform: Platform::Ios,
        })
    }
}
