//! Consent Reconciliation Engine
//!
//! Keeps bank-granted consents in sync with the banks that grant them.
//!
//! # Architecture
//!
//! Consents are approved asynchronously: the user is redirected to the bank
//! and the aggregator only learns the outcome by asking again later. The
//! engine is built from five parts:
//!
//! 1. **Credential cache** ([`credentials`]): one shared bearer token per bank,
//!    refreshed on expiry, concurrent cold fetches collapsed into one.
//! 2. **Normalizer** ([`normalizer`]): ordered rule table that pulls status and
//!    identifiers out of whatever JSON shape a bank answers with.
//! 3. **Repository adapters** ([`repository`]): one per consent kind, all
//!    behind the same three-operation contract.
//! 4. **Reconciliation poller** ([`poller`]): periodic tick that fans out one
//!    bounded task per pending consent.
//! 5. **Notification hub** ([`hub`]): one-shot waiters and live subscribers
//!    told the moment a consent is approved.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use consent_engine::{
//!     BankApiClient, BankRegistry, Config, ConsentKind, CredentialCache,
//!     InMemoryCredentialStore, InMemoryConsentRepository, NotificationHub,
//!     PollerConfig, ReconciliationPoller,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> consent_engine::Result<()> {
//!     let config = Config::from_env()?;
//!     let banks = Arc::new(BankRegistry::new(config.banks.clone()));
//!     let client = BankApiClient::new(config.bank_request_timeout(), &config.aggregator.requesting_bank)?;
//!     let credentials = Arc::new(CredentialCache::new(
//!         Arc::new(InMemoryCredentialStore::new()),
//!         client.clone(),
//!         config.credential_fallback_lifetime(),
//!     ));
//!     let hub = Arc::new(NotificationHub::new(config.hub.subscriber_buffer));
//!
//!     let poller = ReconciliationPoller::new(
//!         vec![Arc::new(InMemoryConsentRepository::new(ConsentKind::AccountAccess))],
//!         banks,
//!         credentials,
//!         client,
//!         hub,
//!         PollerConfig::from(&config.poller),
//!     );
//!
//!     let report = poller.tick().await;
//!     println!("checked {} consents, {} approved", report.checked, report.approved);
//!
//!     let shutdown = CancellationToken::new();
//!     let handle = poller.spawn(shutdown.clone());
//!     shutdown.cancel();
//!     let _ = handle.await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod bank;
pub mod config;
pub mod consents;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod normalizer;
pub mod poller;
pub mod repository;
pub mod store;
pub mod types;

// Re-exports
pub use bank::{BankApiClient, BankDescriptor, BankRegistry, BankResponse};
pub use config::Config;
pub use consents::{ConsentService, CreatedConsent, ProductConsentRequest};
pub use credentials::{
    CredentialCache, CredentialStore, InMemoryCredentialStore, RedisCredentialStore,
};
pub use error::{ConsentEngineError, CredentialError, ErrorCategory, Result};
pub use hub::{NotificationHub, Subscription, WaitHandle, WaitOutcome};
pub use normalizer::{normalize, NormalizedBankStatusResponse};
pub use poller::{PollerConfig, ReconciliationPoller, RecordOutcome, TickReport};
pub use repository::{ConsentRepository, InMemoryConsentRepository, PgConsentRepository};
pub use store::Database;
pub use types::*;
