//! IAP Reconciler: subscription entitlement lifecycle across app stores.
//!
//! This library reconciles one user's paid-subscription entitlement from
//! two independent, asynchronous sources of truth: vendor push
//! notifications (Apple App Store Server Notifications, Google Play
//! Real-time Developer Notifications) and a periodic wall-clock sweep
//! that detects expiry even when no notification arrives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Apple / Play │   │  verify-     │   │  cron tick   │
//! │   webhook    │   │  receipt API │   │              │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │                  │                  │
//!   [normalize]        [verify::*]         [sweep]
//!        │                  │                  │
//!        └────────┬─────────┴─────────┬────────┘
//!                 ▼                   ▼
//!          SubscriptionEvent    VerifiedPurchase
//!                 │                   │
//!                 └───── [machine + reconcile] ─────► EntitlementStore
//! ```
//!
//! All three entry paths converge on one state machine
//! ([`machine::decide`]), the single authority for legal transitions.
//! The [`reconcile::Reconciler`] executes its decisions as conditional
//! read-modify-writes against the [`store::EntitlementStore`] gateway,
//! which is what makes duplicate and out-of-order deliveries — and
//! webhook/sweep races on the same record — safe without locks.
//!
//! # Quick Start
//!
//! ```rust
//! use chrono::Utc;
//! use iap_reconciler::{
//!     reconcile::Reconciler,
//!     store::InMemoryStore,
//!     sweep::{SweepConfig, Sweeper},
//!     webhook::handle_webhook,
//! };
//!
//! # async fn example() {
//! let store = InMemoryStore::new();
//! let reconciler = Reconciler::new(store.clone());
//!
//! // Webhook path: raw vendor body in, structured outcome out.
//! let outcome = handle_webhook(&reconciler, r#"{"message":{"data":"e30="}}"#, Utc::now()).await;
//! assert!(!outcome.success); // no subscriptionNotification in that envelope
//!
//! // Sweep path: reconcile purely from elapsed wall-clock time.
//! let sweeper = Sweeper::new(reconciler, SweepConfig::default());
//! let report = sweeper.sweep(Utc::now()).await.unwrap();
//! assert_eq!(report.failed_count, 0);
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`model`]: subscription records, statuses, the tier projection
//! - [`event`]: the canonical event vocabulary both vendors map into
//! - [`normalize`]: vendor payload decoding and mapping
//! - [`machine`]: the pure transition decision core
//! - [`reconcile`]: decision execution with optimistic concurrency
//! - [`store`]: the entitlement store gateway contract
//! - [`verify`]: receipt/purchase verification adapters
//! - [`sweep`]: the scheduled expiry sweep
//! - [`webhook`]: the webhook entry point
//! - [`config`]: TOML configuration
//! - [`error`]: the error taxonomy
//!
//! # Concurrency Model
//!
//! Every webhook delivery and every sweep run is a stateless unit of
//! work; no state survives an invocation in process memory. Conflicting
//! writers are resolved by the store's conditional update (compare
//! observed status, then patch), retried once with a fresh read. Events
//! are ordered per record by `occurred_at`, not arrival order; a late
//! event that would regress a record is rejected as stale.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod event;
pub mod machine;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod store;
pub mod sweep;
pub mod verify;
pub mod webhook;

pub use config::ReconcilerConfig;
pub use error::{ReconcileError, Result};
pub use event::{CorrelationKey, EventKind, SubscriptionEvent};
pub use model::{SubscriptionRecord, SubscriptionStatus, Tier};
pub use reconcile::{ApplyOutcome, Reconciler};
pub use store::{EntitlementStore, InMemoryStore};
pub use sweep::{SweepReport, Sweeper};
pub use webhook::{WebhookOutcome, handle_webhook};
