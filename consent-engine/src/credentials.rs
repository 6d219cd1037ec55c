//! Per-bank bearer credential cache
//!
//! One credential per bank is shared by every caller. Entries live in a
//! key-value store with TTL semantics (Redis in production) under
//! `token:{bank_code}`. A credential is never handed out at or past its
//! `expires_at`; stale or missing entries are re-issued and replaced before
//! they are returned.
//!
//! Concurrent cold-cache callers for the same bank share one in-flight
//! issuance instead of each calling the bank.

use crate::bank::{BankApiClient, BankDescriptor};
use crate::error::{CredentialError, Result};
use crate::metrics::METRICS;
use crate::types::CachedCredential;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cache key prefix
pub const KEY_PREFIX: &str = "token";

/// Default lifetime when the bank does not announce one (24 hours)
pub const DEFAULT_FALLBACK_LIFETIME_SECS: i64 = 24 * 60 * 60;

fn cache_key(bank_code: &str) -> String {
    format!("{}:{}", KEY_PREFIX, bank_code)
}

/// Key-value backend with TTL semantics
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, bank_code: &str) -> Result<Option<CachedCredential>>;

    async fn save(
        &self,
        bank_code: &str,
        credential: &CachedCredential,
        ttl: chrono::Duration,
    ) -> Result<()>;

    async fn remove(&self, bank_code: &str) -> Result<()>;
}

/// Redis-backed credential store
#[derive(Clone)]
pub struct RedisCredentialStore {
    redis: ConnectionManager,
}

impl RedisCredentialStore {
    pub fn new(redis: ConnectionManager) -> Self {
        RedisCredentialStore { redis }
    }
}

impl fmt::Debug for RedisCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCredentialStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn load(&self, bank_code: &str) -> Result<Option<CachedCredential>> {
        let json: Option<String> = self.redis.clone().get(cache_key(bank_code)).await?;

        match json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(credential) => Ok(Some(credential)),
                Err(e) => {
                    warn!("Discarding unreadable cached token for {}: {}", bank_code, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        bank_code: &str,
        credential: &CachedCredential,
        ttl: chrono::Duration,
    ) -> Result<()> {
        let json = serde_json::to_string(credential)?;
        let seconds = ttl.num_seconds().max(1) as u64;
        let _: () = self
            .redis
            .clone()
            .set_ex(cache_key(bank_code), json, seconds)
            .await?;
        Ok(())
    }

    async fn remove(&self, bank_code: &str) -> Result<()> {
        let _: () = self.redis.clone().del(cache_key(bank_code)).await?;
        Ok(())
    }
}

/// Process-local credential store, used in tests and single-node setups
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    entries: DashMap<String, (CachedCredential, Instant)>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, bank_code: &str) -> Result<Option<CachedCredential>> {
        let key = cache_key(bank_code);
        match self.entries.get(&key) {
            Some(entry) if Instant::now() < entry.1 => return Ok(Some(entry.0.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // Guard is released above; evict the expired entry.
        self.entries.remove(&key);
        Ok(None)
    }

    async fn save(
        &self,
        bank_code: &str,
        credential: &CachedCredential,
        ttl: chrono::Duration,
    ) -> Result<()> {
        let ttl = ttl.to_std().unwrap_or_default();
        let Some(deadline) = Instant::now().checked_add(ttl) else {
            warn!("Not caching token for {}: TTL out of range", bank_code);
            return Ok(());
        };
        self.entries
            .insert(cache_key(bank_code), (credential.clone(), deadline));
        Ok(())
    }

    async fn remove(&self, bank_code: &str) -> Result<()> {
        self.entries.remove(&cache_key(bank_code));
        Ok(())
    }
}

/// Clears the in-flight slot however the issuance ends
struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<String, Issuance>>>,
    bank_code: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let _finished = self.in_flight.lock().remove(&self.bank_code);
    }
}

type Issuance = Shared<BoxFuture<'static, std::result::Result<CachedCredential, CredentialError>>>;

/// Shared per-bank credential cache
pub struct CredentialCache {
    store: Arc<dyn CredentialStore>,
    client: BankApiClient,
    fallback_lifetime: chrono::Duration,
    in_flight: Arc<Mutex<HashMap<String, Issuance>>>,
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("fallback_lifetime", &self.fallback_lifetime)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl CredentialCache {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: BankApiClient,
        fallback_lifetime: chrono::Duration,
    ) -> Self {
        CredentialCache {
            store,
            client,
            fallback_lifetime,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Valid credential for `bank`, issuing a new one when the cache is cold or stale
    pub async fn get_valid_credential(
        &self,
        bank: &BankDescriptor,
    ) -> std::result::Result<CachedCredential, CredentialError> {
        match self.store.load(&bank.code).await {
            Ok(Some(credential)) if credential.is_valid_at(Utc::now()) => {
                METRICS.credential_cache_hits.inc();
                return Ok(credential);
            }
            Ok(_) => {}
            Err(e) => warn!("Credential cache read failed for {}: {}", bank.code, e),
        }

        METRICS.credential_cache_misses.inc();
        let credential = self.issuance_for(bank).await?;

        // An issuance joined late may already have aged out.
        if credential.is_valid_at(Utc::now()) {
            Ok(credential)
        } else {
            self.issuance_for(bank).await
        }
    }

    /// Drop the cached credential so the next caller re-issues
    pub async fn invalidate(&self, bank_code: &str) {
        if let Err(e) = self.store.remove(bank_code).await {
            warn!("Failed to invalidate cached token for {}: {}", bank_code, e);
        } else {
            info!("Invalidated cached token for {}", bank_code);
        }
    }

    fn issuance_for(&self, bank: &BankDescriptor) -> Issuance {
        let mut in_flight = self.in_flight.lock();
        if let Some(issuance) = in_flight.get(&bank.code) {
            debug!("Joining in-flight token issuance for {}", bank.code);
            return issuance.clone();
        }

        let issuance = Self::issue(
            self.client.clone(),
            self.store.clone(),
            self.in_flight.clone(),
            bank.clone(),
            self.fallback_lifetime,
        )
        .boxed()
        .shared();
        in_flight.insert(bank.code.clone(), issuance.clone());
        issuance
    }

    async fn issue(
        client: BankApiClient,
        store: Arc<dyn CredentialStore>,
        in_flight: Arc<Mutex<HashMap<String, Issuance>>>,
        bank: BankDescriptor,
        fallback_lifetime: chrono::Duration,
    ) -> std::result::Result<CachedCredential, CredentialError> {
        let _guard = InFlightGuard {
            in_flight,
            bank_code: bank.code.clone(),
        };
        Self::issue_and_store(&client, store.as_ref(), &bank, fallback_lifetime).await
    }

    async fn issue_and_store(
        client: &BankApiClient,
        store: &dyn CredentialStore,
        bank: &BankDescriptor,
        fallback_lifetime: chrono::Duration,
    ) -> std::result::Result<CachedCredential, CredentialError> {
        let issued = match client.issue_token(bank).await {
            Ok(issued) => issued,
            Err(e) => {
                METRICS.credential_issuances.with_label_values(&["error"]).inc();
                warn!("Token issuance for {} failed: {}", bank.code, e);
                return Err(e);
            }
        };
        METRICS.credential_issuances.with_label_values(&["ok"]).inc();

        let now = Utc::now();
        let announced = issued
            .lifetime
            .filter(|lifetime| *lifetime > chrono::Duration::zero())
            .and_then(|lifetime| now.checked_add_signed(lifetime).map(|at| (lifetime, at)));
        let (lifetime, expires_at) = match announced {
            Some(announced) => announced,
            None => {
                if issued.lifetime.is_some() {
                    warn!("Ignoring unusable token lifetime from {}", bank.code);
                }
                let expires_at = now.checked_add_signed(fallback_lifetime).ok_or_else(|| {
                    CredentialError::Malformed {
                        bank: bank.code.clone(),
                        reason: "fallback credential lifetime is out of range".to_string(),
                    }
                })?;
                (fallback_lifetime, expires_at)
            }
        };
        let credential = CachedCredential {
            token: issued.token,
            expires_at,
        };

        if let Err(e) = store.save(&bank.code, &credential, lifetime).await {
            warn!("Cannot cache token for {}: {}", bank.code, e);
        }

        info!(
            "Issued token for {} valid until {}",
            bank.code, credential.expires_at
        );
        Ok(credential)
    }
}
