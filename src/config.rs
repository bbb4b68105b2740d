//! Reconciler configuration.
//!
//! TOML-deserializable settings for the vendor endpoints, sweep timing,
//! and product-id aliasing. Secrets (the Apple shared secret, Google
//! OAuth tokens) are deliberately not configuration fields; they are
//! passed to the adapters at construction time.

use std::collections::HashMap;

use serde::Deserialize;
use url::Url;

use crate::{
    error::{ReconcileError, Result},
    sweep::SweepConfig,
};

/// Apple receipt-verification endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppleConfig {
    /// Production verification endpoint.
    pub production_url: String,
    /// Sandbox verification endpoint, used once after a
    /// sandbox-receipt-sent-to-production response.
    pub sandbox_url: String,
}

impl Default for AppleConfig {
    fn default() -> Self {
        Self {
            production_url: "https://buy.itunes.apple.com/verifyReceipt".to_owned(),
            sandbox_url: "https://sandbox.itunes.apple.com/verifyReceipt".to_owned(),
        }
    }
}

/// Google Play Developer API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// API base URL.
    pub api_base_url: String,
    /// Android application package name.
    pub package_name: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://androidpublisher.googleapis.com".to_owned(),
            package_name: "com.onemessage.app".to_owned(),
        }
    }
}

/// Root configuration for the reconciliation core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Apple endpoints.
    pub apple: AppleConfig,
    /// Google endpoints and package.
    pub google: GoogleConfig,
    /// Sweep timing.
    pub sweep: SweepConfig,
    /// Store SKU → internal product id aliases (identity when absent).
    pub product_aliases: HashMap<String, String>,
}

impl ReconcilerConfig {
    /// Parses configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Config`] wrapping the parse failure, or
    /// a validation error for insecure endpoints.
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| ReconcileError::Config(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Vendor endpoints must parse as HTTPS URLs; sweep windows must be
    /// positive.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("apple.production_url", &self.apple.production_url),
            ("apple.sandbox_url", &self.apple.sandbox_url),
            ("google.api_base_url", &self.google.api_base_url),
        ] {
            let url = Url::parse(value)
                .map_err(|e| ReconcileError::Config(format!("invalid {name} '{value}': {e}")))?;
            if url.scheme() != "https" {
                return Err(ReconcileError::Config(format!("{name} must use HTTPS, got: {value}")));
            }
        }

        if self.google.package_name.is_empty() {
            return Err(ReconcileError::Config("google.package_name must not be empty".into()));
        }
        if self.sweep.grace_period_days <= 0 {
            return Err(ReconcileError::Config("sweep.grace_period_days must be positive".into()));
        }
        if self.sweep.approaching_window_days <= 0 {
            return Err(ReconcileError::Config(
                "sweep.approaching_window_days must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Resolves a store SKU through the alias table.
    #[must_use]
    pub fn resolve_product_id<'a>(&'a self, store_product_id: &'a str) -> &'a str {
        self.product_aliases.get(store_product_id).map_or(store_product_id, String::as_str)
    }
}
