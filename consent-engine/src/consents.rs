//! Consent creation
//!
//! Requests new consents from banks on behalf of a user and stores them as
//! pending (or approved, when the bank auto-approves). The poller picks new
//! pending records up on its next tick.

use crate::bank::{BankApiClient, BankDescriptor, BankRegistry};
use crate::config::AggregatorConfig;
use crate::credentials::CredentialCache;
use crate::error::{ConsentEngineError, Result};
use crate::metrics::METRICS;
use crate::normalizer::{normalize, NormalizedBankStatusResponse};
use crate::store::{Database, NewAccountConsent, NewProductConsent, StoredProductConsent};
use crate::types::{ConsentKind, ConsentStatus};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Permissions requested for every account-access consent
pub const ACCOUNT_PERMISSIONS: [&str; 3] =
    ["ReadAccountsDetail", "ReadBalances", "ReadTransactionsDetail"];

const ACCOUNT_CONSENT_REASON: &str = "Account aggregation";
const PRODUCT_CONSENT_REASON: &str = "Product management through a financial aggregator";

/// Product-agreement permissions a caller asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductConsentRequest {
    #[serde(default)]
    pub read_product_agreements: bool,
    #[serde(default)]
    pub open_product_agreements: bool,
    #[serde(default)]
    pub close_product_agreements: bool,
    #[serde(default)]
    pub allowed_product_types: Vec<String>,
    #[serde(default)]
    pub max_amount: Decimal,
}

impl ProductConsentRequest {
    /// Whether `existing` already grants every permission requested here
    pub fn covered_by(&self, existing: &StoredProductConsent) -> bool {
        (!self.read_product_agreements || existing.read_product_agreements)
            && (!self.open_product_agreements || existing.open_product_agreements)
            && (!self.close_product_agreements || existing.close_product_agreements)
    }
}

/// Result of a creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedConsent {
    pub consent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: ConsentStatus,
    pub kind: ConsentKind,
    pub bank: String,
    /// An active consent already existed and was returned as is
    pub reused: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Identifier to persist for a fresh bank reply: the final id once approved,
/// the request id while approval is outstanding, the final id as last resort.
pub fn select_tracked_identifier(reply: &NormalizedBankStatusResponse) -> Option<String> {
    if reply.is_approved() {
        if let Some(final_id) = &reply.final_identifier {
            return Some(final_id.clone());
        }
    }
    reply
        .request_identifier
        .clone()
        .or_else(|| reply.final_identifier.clone())
}

/// Status a fresh consent is stored with
pub fn initial_status(reply: &NormalizedBankStatusResponse) -> ConsentStatus {
    if reply.is_approved() {
        ConsentStatus::Approved
    } else {
        ConsentStatus::Pending
    }
}

fn stored_status(raw: &str) -> ConsentStatus {
    raw.parse().unwrap_or(ConsentStatus::Pending)
}

/// Requests consents from banks and persists them
pub struct ConsentService {
    db: Arc<Database>,
    banks: Arc<BankRegistry>,
    credentials: Arc<CredentialCache>,
    client: BankApiClient,
    aggregator: AggregatorConfig,
}

impl std::fmt::Debug for ConsentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentService")
            .field("banks", &self.banks.len())
            .field("aggregator", &self.aggregator)
            .finish()
    }
}

impl ConsentService {
    pub fn new(
        db: Arc<Database>,
        banks: Arc<BankRegistry>,
        credentials: Arc<CredentialCache>,
        client: BankApiClient,
        aggregator: AggregatorConfig,
    ) -> Self {
        Self {
            db,
            banks,
            credentials,
            client,
            aggregator,
        }
    }

    /// Request account access for `subject_id` at `bank_code`, or return the
    /// consent that is already active there
    pub async fn create_account_consent(
        &self,
        subject_id: i64,
        bank_code: &str,
    ) -> Result<CreatedConsent> {
        let kind = ConsentKind::AccountAccess;
        let result = self.account_consent(subject_id, bank_code).await;
        Self::record_creation(kind, &result);
        result
    }

    /// Request product-agreement permissions for `subject_id` at `bank_code`.
    /// An active consent that covers the request is reused; one that does not
    /// is revoked and replaced.
    pub async fn create_product_consent(
        &self,
        subject_id: i64,
        bank_code: &str,
        request: ProductConsentRequest,
    ) -> Result<CreatedConsent> {
        let kind = ConsentKind::ProductAgreement;
        let result = self.product_consent(subject_id, bank_code, request).await;
        Self::record_creation(kind, &result);
        result
    }

    async fn account_consent(&self, subject_id: i64, bank_code: &str) -> Result<CreatedConsent> {
        let bank = self.banks.resolve(bank_code)?;
        let user = self
            .db
            .user_by_id(subject_id)
            .await?
            .ok_or_else(|| ConsentEngineError::UserNotFound(subject_id.to_string()))?;

        let existing = self.db.active_account_consents(user.id, &bank.code).await?;
        if let Some(active) = existing.into_iter().next() {
            info!(
                "Reusing account consent {} for user {} at {}",
                active.consent_id, user.id, bank.code
            );
            return Ok(CreatedConsent {
                status: stored_status(&active.status),
                consent_id: active.consent_id,
                request_id: None,
                kind: ConsentKind::AccountAccess,
                bank: bank.code.clone(),
                reused: true,
                expires_at: active.expires_at,
            });
        }

        let payload = account_consent_payload(&user.client_id, &self.aggregator);
        let reply = self
            .request(&bank, ConsentKind::AccountAccess, &[], &payload)
            .await?;

        let consent_id = Self::tracked_identifier(&bank, &reply)?;
        let status = initial_status(&reply);
        let expires_at = Utc::now() + self.aggregator.consent_lifetime();

        self.db
            .insert_account_consent(&NewAccountConsent {
                client_id: user.client_id.clone(),
                bank_code: bank.code.clone(),
                consent_id: consent_id.clone(),
                requesting_bank: self.aggregator.requesting_bank.clone(),
                permissions: ACCOUNT_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
                status,
                expires_at,
            })
            .await
            .map_err(|e| {
                error!("Failed to store account consent {}: {}", consent_id, e);
                e
            })?;

        Ok(CreatedConsent {
            consent_id,
            request_id: reply.request_identifier,
            status,
            kind: ConsentKind::AccountAccess,
            bank: bank.code.clone(),
            reused: false,
            expires_at: Some(expires_at),
        })
    }

    async fn product_consent(
        &self,
        subject_id: i64,
        bank_code: &str,
        request: ProductConsentRequest,
    ) -> Result<CreatedConsent> {
        let bank = self.banks.resolve(bank_code)?;
        let user = self
            .db
            .user_by_id(subject_id)
            .await?
            .ok_or_else(|| ConsentEngineError::UserNotFound(subject_id.to_string()))?;

        if let Some(existing) = self.db.active_product_consent(user.id, &bank.code).await? {
            if request.covered_by(&existing) {
                info!(
                    "Reusing product consent {} for user {} at {}",
                    existing.consent_id, user.id, bank.code
                );
                return Ok(CreatedConsent {
                    status: stored_status(&existing.status),
                    consent_id: existing.consent_id,
                    request_id: None,
                    kind: ConsentKind::ProductAgreement,
                    bank: bank.code.clone(),
                    reused: true,
                    expires_at: existing.expires_at,
                });
            }

            info!(
                "Product consent {} does not cover the request, replacing it",
                existing.consent_id
            );
            self.revoke(&bank, &existing.consent_id).await;
            self.db.delete_product_consent(&existing.consent_id).await?;
        }

        let expires_at = Utc::now() + self.aggregator.consent_lifetime();
        let payload =
            product_consent_payload(&user.client_id, &request, expires_at, &self.aggregator);
        let reply = self
            .request(
                &bank,
                ConsentKind::ProductAgreement,
                &[("client_id", user.client_id.as_str())],
                &payload,
            )
            .await?;

        let consent_id = Self::tracked_identifier(&bank, &reply)?;
        let status = initial_status(&reply);

        self.db
            .insert_product_consent(&NewProductConsent {
                client_id: user.client_id.clone(),
                bank_code: bank.code.clone(),
                request_id: reply.request_identifier.clone(),
                consent_id: consent_id.clone(),
                requesting_bank: self.aggregator.requesting_bank.clone(),
                read_product_agreements: request.read_product_agreements,
                open_product_agreements: request.open_product_agreements,
                close_product_agreements: request.close_product_agreements,
                allowed_product_types: request.allowed_product_types,
                max_amount: request.max_amount,
                status,
                expires_at,
            })
            .await
            .map_err(|e| {
                error!("Failed to store product consent {}: {}", consent_id, e);
                e
            })?;

        Ok(CreatedConsent {
            consent_id,
            request_id: reply.request_identifier,
            status,
            kind: ConsentKind::ProductAgreement,
            bank: bank.code.clone(),
            reused: false,
            expires_at: Some(expires_at),
        })
    }

    async fn request(
        &self,
        bank: &BankDescriptor,
        kind: ConsentKind,
        query: &[(&str, &str)],
        payload: &Value,
    ) -> Result<NormalizedBankStatusResponse> {
        let credential = self.credentials.get_valid_credential(bank).await?;
        let response = self
            .client
            .request_consent(bank, kind, &credential.token, query, payload)
            .await?;

        if !response.is_success() {
            if response.status == reqwest::StatusCode::UNAUTHORIZED {
                self.credentials.invalidate(&bank.code).await;
            }
            return Err(ConsentEngineError::BankRejected {
                bank: bank.code.clone(),
                status: response.status.as_u16(),
                body: response.body_text(),
            });
        }

        Ok(normalize(&response.body))
    }

    /// Best-effort revocation at the bank
    async fn revoke(&self, bank: &BankDescriptor, consent_id: &str) {
        let credential = match self.credentials.get_valid_credential(bank).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Cannot revoke {} at {}: {}", consent_id, bank.code, e);
                return;
            }
        };

        match self
            .client
            .revoke_consent(bank, ConsentKind::ProductAgreement, consent_id, &credential.token)
            .await
        {
            Ok(response) if response.is_success() => {
                info!("Revoked product consent {} at {}", consent_id, bank.code)
            }
            Ok(response) => warn!(
                "Revocation of {} at {} returned {}",
                consent_id, bank.code, response.status
            ),
            Err(e) => warn!("Revocation of {} at {} failed: {}", consent_id, bank.code, e),
        }
    }

    fn tracked_identifier(
        bank: &BankDescriptor,
        reply: &NormalizedBankStatusResponse,
    ) -> Result<String> {
        select_tracked_identifier(reply).ok_or_else(|| {
            ConsentEngineError::Internal(format!(
                "consent reply from {} carried no identifier",
                bank.code
            ))
        })
    }

    fn record_creation(kind: ConsentKind, result: &Result<CreatedConsent>) {
        let outcome = match result {
            Ok(created) if created.reused => "reused",
            Ok(_) => "created",
            Err(_) => "error",
        };
        METRICS
            .consents_created
            .with_label_values(&[kind.as_str(), outcome])
            .inc();
    }
}

/// Body of `POST /account-consents/request`
pub fn account_consent_payload(client_id: &str, aggregator: &AggregatorConfig) -> Value {
    json!({
        "client_id": client_id,
        "permissions": ACCOUNT_PERMISSIONS,
        "reason": ACCOUNT_CONSENT_REASON,
        "requesting_bank": aggregator.requesting_bank,
        "requesting_bank_name": aggregator.requesting_bank_name,
    })
}

/// Body of `POST /product-agreement-consents/request`
pub fn product_consent_payload(
    client_id: &str,
    request: &ProductConsentRequest,
    valid_until: DateTime<Utc>,
    aggregator: &AggregatorConfig,
) -> Value {
    json!({
        "requesting_bank": aggregator.requesting_bank,
        "client_id": client_id,
        "read_product_agreements": request.read_product_agreements,
        "open_product_agreements": request.open_product_agreements,
        "close_product_agreements": request.close_product_agreements,
        "allowed_product_types": request.allowed_product_types,
        "max_amount": request.max_amount.to_f64(),
        "valid_until": valid_until.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "reason": PRODUCT_CONSENT_REASON,
    })
}
