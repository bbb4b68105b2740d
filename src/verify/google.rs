//! Google Play purchase verification.
//!
//! Fetches the subscription resource for a purchase token from the Play
//! Developer API, validates expiry, and acknowledges the purchase when
//! Google reports it unacknowledged — at most once per observation, since
//! the guard is the resource's own `acknowledgementState`.

use std::{collections::HashMap, sync::LazyLock, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use url::Url;

use super::{AccessTokenProvider, VerifiedPurchase};
use crate::{
    config::GoogleConfig,
    error::{ReconcileError, Result},
    model::Platform,
};

/// Timeout for verification HTTP requests in seconds.
const VERIFY_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for all Play Developer API requests.
static GOOGLE_HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(VERIFY_REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to create Google verification HTTP client")
});

/// `acknowledgementState` value meaning "not yet acknowledged".
const UNACKNOWLEDGED: i64 = 0;

/// Subscription purchase resource from the Play Developer API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSubscriptionResource {
    /// Expiry in epoch milliseconds, serialized as a string.
    pub expiry_time_millis: String,
    /// Whether the subscription renews automatically.
    #[serde(default)]
    pub auto_renewing: bool,
    /// Order id; doubles as the lineage key in this model.
    pub order_id: String,
    /// Payment state (1 = received, 0 = pending).
    #[serde(default)]
    pub payment_state: Option<i64>,
    /// 0 when the purchase still needs acknowledgement.
    #[serde(default)]
    pub acknowledgement_state: Option<i64>,
}

/// Raw Play Developer API operations for one purchase token.
pub trait GoogleSubscriptionsApi: Send + Sync {
    /// Fetches the subscription purchase resource.
    async fn get_subscription(
        &self,
        access_token: &str,
        package_name: &str,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<GoogleSubscriptionResource>;

    /// Acknowledges the purchase.
    async fn acknowledge(
        &self,
        access_token: &str,
        package_name: &str,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<()>;
}

/// HTTP implementation of [`GoogleSubscriptionsApi`].
#[derive(Debug, Clone)]
pub struct HttpGoogleSubscriptionsApi {
    base_url: String,
}

impl HttpGoogleSubscriptionsApi {
    /// Creates the API client against a base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Config`] when the base URL is invalid.
    pub fn new(config: &GoogleConfig) -> Result<Self> {
        Url::parse(&config.api_base_url).map_err(|e| {
            ReconcileError::Config(format!("invalid api_base_url '{}': {e}", config.api_base_url))
        })?;
        Ok(Self { base_url: config.api_base_url.trim_end_matches('/').to_owned() })
    }

    fn subscription_url(&self, package_name: &str, product_id: &str, purchase_token: &str) -> String {
        format!(
            "{}/androidpublisher/v3/applications/{package_name}/purchases/subscriptions/{product_id}/tokens/{purchase_token}",
            self.base_url
        )
    }
}

#[derive(Debug, Deserialize)]
struct GoogleApiError {
    #[serde(default)]
    error: Option<GoogleApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GoogleApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Extracts a stable failure reason from an error response body.
async fn error_reason(response: reqwest::Response, fallback: &str) -> String {
    match response.json::<GoogleApiError>().await {
        Ok(GoogleApiError { error: Some(GoogleApiErrorBody { message: Some(message) }) }) => message,
        _ => fallback.to_owned(),
    }
}

impl GoogleSubscriptionsApi for HttpGoogleSubscriptionsApi {
    async fn get_subscription(
        &self,
        access_token: &str,
        package_name: &str,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<GoogleSubscriptionResource> {
        let response = GOOGLE_HTTP_CLIENT
            .get(self.subscription_url(package_name, product_id, purchase_token))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(ReconcileError::from_http)?;

        if !response.status().is_success() {
            let reason = error_reason(response, "failed to verify purchase").await;
            return Err(ReconcileError::Verification { reason });
        }

        response.json().await.map_err(ReconcileError::from_http)
    }

    async fn acknowledge(
        &self,
        access_token: &str,
        package_name: &str,
        product_id: &str,
        purchase_token: &str,
    ) -> Result<()> {
        let url = format!(
            "{}:acknowledge",
            self.subscription_url(package_name, product_id, purchase_token)
        );
        let response = GOOGLE_HTTP_CLIENT
            .post(url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(ReconcileError::from_http)?;

        if !response.status().is_success() {
            let reason = error_reason(response, "failed to acknowledge purchase").await;
            return Err(ReconcileError::Verification { reason });
        }
        Ok(())
    }
}

/// Verifies Play purchases into canonical purchases.
#[derive(Debug, Clone)]
pub struct GooglePurchaseVerifier<G, T> {
    api: G,
    tokens: T,
    package_name: String,
    product_aliases: HashMap<String, String>,
}

impl<G: GoogleSubscriptionsApi, T: AccessTokenProvider> GooglePurchaseVerifier<G, T> {
    /// Creates a verifier over an API implementation and token provider.
    pub fn new(api: G, tokens: T, config: &GoogleConfig) -> Self {
        Self {
            api,
            tokens,
            package_name: config.package_name.clone(),
            product_aliases: HashMap::new(),
        }
    }

    /// Sets the store-SKU alias table.
    #[must_use]
    pub fn with_product_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.product_aliases = aliases;
        self
    }

    /// Verifies a purchase token and normalizes the purchase.
    ///
    /// The subscription must not be expired at `now`. An unacknowledged
    /// purchase triggers one acknowledge call; acknowledge failures are
    /// logged and do not fail verification (the state stays
    /// unacknowledged, so the next verification retries it).
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Verification`] when the vendor rejects the
    ///   token, the resource is malformed, or the subscription already
    ///   expired.
    /// - [`ReconcileError::Timeout`] / [`ReconcileError::Http`] for
    ///   transport failures.
    #[instrument(skip(self, purchase_token))]
    pub async fn verify(
        &self,
        product_id: &str,
        purchase_token: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedPurchase> {
        let access_token = self.tokens.access_token().await?;
        let resource = self
            .api
            .get_subscription(&access_token, &self.package_name, product_id, purchase_token)
            .await?;

        let expires_at = resource
            .expiry_time_millis
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ReconcileError::verification("invalid expiryTimeMillis"))?;

        if expires_at <= now {
            return Err(ReconcileError::verification("subscription expired"));
        }

        if resource.acknowledgement_state == Some(UNACKNOWLEDGED) {
            match self
                .api
                .acknowledge(&access_token, &self.package_name, product_id, purchase_token)
                .await
            {
                Ok(()) => info!("purchase acknowledged"),
                Err(error) => {
                    warn!(%error, "failed to acknowledge purchase; will retry on next verification");
                }
            }
        }

        let mapped_product_id = self
            .product_aliases
            .get(product_id)
            .cloned()
            .unwrap_or_else(|| product_id.to_owned());

        Ok(VerifiedPurchase {
            transaction_id: resource.order_id.clone(),
            original_transaction_id: resource.order_id,
            product_id: mapped_product_id,
            expires_at: Some(expires_at),
            auto_renewing: resource.auto_renewing,
            platform: Platform::Android,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::verify::StaticTokenProvider;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    #[derive(Debug, Default)]
    struct ScriptedApi {
        resource: Mutex<Option<GoogleSubscriptionResource>>,
        acknowledge_calls: Mutex<u32>,
        fail_acknowledge: bool,
        seen_tokens: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn with_resource(resource: GoogleSubscriptionResource) -> Self {
            Self { resource: Mutex::new(Some(resource)), ..Self::default() }
        }

        fn acknowledge_calls(&self) -> u32 {
            *self.acknowledge_calls.lock().unwrap()
        }
    }

    impl GoogleSubscriptionsApi for &ScriptedApi {
        async fn get_subscription(
            &self,
            access_token: &str,
            _package_name: &str,
            _product_id: &str,
            _purchase_token: &str,
        ) -> Result<GoogleSubscriptionResource> {
            self.seen_tokens.lock().unwrap().push(access_token.to_owned());
            self.resource
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ReconcileError::verification("purchase token was not found"))
        }

        async fn acknowledge(
            &self,
            _access_token: &str,
            _package_name: &str,
            _product_id: &str,
            _purchase_token: &str,
        ) -> Result<()> {
            *self.acknowledge_calls.lock().unwrap() += 1;
            if self.fail_acknowledge {
                Err(ReconcileError::verification("failed to acknowledge purchase"))
            } else {
                Ok(())
            }
        }
    }

    fn resource(expiry: DateTime<Utc>, acknowledgement_state: Option<i64>) -> GoogleSubscriptionResource {
        GoogleSubscriptionResource {
            expiry_time_millis: expiry.timestamp_millis().to_string(),
            auto_renewing: true,
            order_id: "GPA.1234-5678".into(),
            payment_state: Some(1),
            acknowledgement_state,
        }
    }

    fn verifier(api: &ScriptedApi) -> GooglePurchaseVerifier<&ScriptedApi, StaticTokenProvider> {
        GooglePurchaseVerifier::new(
            api,
            StaticTokenProvider::new("ya29.token"),
            &GoogleConfig::default(),
        )
        .with_product_aliases(HashMap::from([(
            "monthly_premium_sub".to_owned(),
            "monthly_premium".to_owned(),
        )]))
    }

    // ========================================================================
    // Verification flow
    // ========================================================================

    #[tokio::test]
    async fn test_valid_purchase_is_normalized() {
        let now = Utc::now();
        let expiry = now + chrono::Duration::days(30);
        let api = ScriptedApi::with_resource(resource(expiry, Some(1)));

        let purchase =
            verifier(&api).verify("monthly_premium_sub", "token-abc", now).await.unwrap();

        assert_eq!(purchase.transaction_id, "GPA.1234-5678");
        assert_eq!(purchase.original_transaction_id, "GPA.1234-5678");
        assert_eq!(purchase.product_id, "monthly_premium");
        assert!(purchase.auto_renewing);
        assert_eq!(purchase.platform, Platform::Android);
        assert_eq!(
            purchase.expires_at.unwrap().timestamp_millis(),
            expiry.timestamp_millis()
        );
        assert_eq!(api.seen_tokens.lock().unwrap().as_slice(), ["ya29.token"]);
    }

    #[tokio::test]
    async fn test_expired_subscription_rejected() {
        let now = Utc::now();
        let api = ScriptedApi::with_resource(resource(now - chrono::Duration::hours(1), Some(1)));

        let result = verifier(&api).verify("monthly_premium_sub", "token-abc", now).await;

        match result {
            Err(ReconcileError::Verification { reason }) => {
                assert_eq!(reason, "subscription expired");
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
        assert_eq!(api.acknowledge_calls(), 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_purchase_is_acknowledged_once() {
        let now = Utc::now();
        let api = ScriptedApi::with_resource(resource(
            now + chrono::Duration::days(30),
            Some(UNACKNOWLEDGED),
        ));

        verifier(&api).verify("monthly_premium_sub", "token-abc", now).await.unwrap();
        assert_eq!(api.acknowledge_calls(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_purchase_is_not_reacknowledged() {
        let now = Utc::now();
        let api = ScriptedApi::with_resource(resource(now + chrono::Duration::days(30), Some(1)));

        verifier(&api).verify("monthly_premium_sub", "token-abc", now).await.unwrap();
        assert_eq!(api.acknowledge_calls(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_does_not_fail_verification() {
        let now = Utc::now();
        let api = ScriptedApi {
            resource: Mutex::new(Some(resource(
                now + chrono::Duration::days(30),
                Some(UNACKNOWLEDGED),
            ))),
            fail_acknowledge: true,
            ..ScriptedApi::default()
        };

        let purchase =
            verifier(&api).verify("monthly_premium_sub", "token-abc", now).await.unwrap();

        assert_eq!(purchase.transaction_id, "GPA.1234-5678");
        assert_eq!(api.acknowledge_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let api = ScriptedApi::default();
        let result =
            verifier(&api).verify("monthly_premium_sub", "token-missing", Utc::now()).await;
        assert!(matches!(result, Err(ReconcileError::Verification { .. })));
    }

    #[tokio::test]
    async fn test_invalid_expiry_rejected() {
        let mut bad = resource(Utc::now() + chrono::Duration::days(1), Some(1));
        bad.expiry_time_millis = "soon".into();
        let api = ScriptedApi::with_resource(bad);

        let result = verifier(&api).verify("monthly_premium_sub", "token-abc", Utc::now()).await;
        match result {
            Err(ReconcileError::Verification { reason }) => {
                assert_eq!(reason, "invalid expiryTimeMillis");
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
    }

    #[test]
    fn test_subscription_url_shape() {
        let api = HttpGoogleSubscriptionsApi::new(&GoogleConfig::default()).unwrap();
        let url = api.subscription_url("com.onemessage.app", "monthly_premium_sub", "tok-1");
        assert_eq!(
            url,
            "https://androidpublisher.googleapis.com/androidpublisher/v3/applications/com.onemessage.app/purchases/subscriptions/monthly_premium_sub/tokens/tok-1"
        );
    }
}
