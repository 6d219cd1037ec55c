//! Bank registry and HTTP client for the banks' Open Banking APIs

use crate::error::{ConsentEngineError, CredentialError, Result};
use crate::types::ConsentKind;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Identity of one external bank integration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDescriptor {
    /// Short code used in headers and records, e.g. `vbank`
    pub code: String,
    pub name: String,
    pub base_url: String,
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: String,
}

impl BankDescriptor {
    /// Absolute URL for `path` under this bank's base address
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Status endpoint of one consent, e.g. `/account-consents/{id}`
    pub fn consent_url(&self, kind: ConsentKind, consent_id: &str) -> String {
        self.endpoint(&format!("{}/{}", kind.endpoint_family(), consent_id))
    }
}

/// Banks known to this deployment, keyed by code
#[derive(Debug, Clone, Default)]
pub struct BankRegistry {
    banks: HashMap<String, Arc<BankDescriptor>>,
}

impl BankRegistry {
    pub fn new(banks: impl IntoIterator<Item = BankDescriptor>) -> Self {
        let banks = banks
            .into_iter()
            .map(|bank| (bank.code.clone(), Arc::new(bank)))
            .collect();
        Self { banks }
    }

    pub fn get(&self, code: &str) -> Option<Arc<BankDescriptor>> {
        self.banks.get(code).cloned()
    }

    /// Like [`get`](Self::get) but an unknown or empty code is a configuration error
    pub fn resolve(&self, code: &str) -> Result<Arc<BankDescriptor>> {
        if code.trim().is_empty() {
            return Err(ConsentEngineError::Validation(
                "bank code is required".to_string(),
            ));
        }
        self.get(code)
            .ok_or_else(|| ConsentEngineError::UnknownBank(code.to_string()))
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.banks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }
}

/// Raw bank reply; bodies stay opaque until normalized
#[derive(Debug, Clone)]
pub struct BankResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl BankResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text for logs
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Token as handed out by a bank, before caching
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    /// Lifetime announced by the bank; `None` when absent, non-positive or out of range
    pub lifetime: Option<chrono::Duration>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// HTTP client shared by credential issuance, reconciliation and consent creation
#[derive(Debug, Clone)]
pub struct BankApiClient {
    client: Client,
    interaction_id: String,
}

impl BankApiClient {
    /// `interaction_id` is sent as `X-Fapi-Interaction-Id` on consent calls
    pub fn new(timeout: Duration, interaction_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(BankApiClient {
            client,
            interaction_id: interaction_id.into(),
        })
    }

    /// POST `/auth/bank-token` with the bank's client credentials
    pub async fn issue_token(
        &self,
        bank: &BankDescriptor,
    ) -> std::result::Result<IssuedCredential, CredentialError> {
        let url = bank.endpoint("auth/bank-token");

        let response = self
            .client
            .post(&url)
            .query(&[
                ("client_id", bank.client_id.as_str()),
                ("client_secret", bank.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                error!("Token request to {} failed: {}", bank.code, e);
                CredentialError::Transport {
                    bank: bank.code.clone(),
                    reason: e.to_string(),
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                bank: bank.code.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| CredentialError::Malformed {
            bank: bank.code.clone(),
            reason: e.to_string(),
        })?;

        if token.access_token.is_empty() {
            return Err(CredentialError::Malformed {
                bank: bank.code.clone(),
                reason: "access_token is missing".to_string(),
            });
        }

        debug!(bank = %bank.code, expires_in = ?token.expires_in, "Issued bank token");

        Ok(IssuedCredential {
            token: token.access_token,
            lifetime: token
                .expires_in
                .filter(|secs| *secs > 0)
                .and_then(chrono::Duration::try_seconds),
        })
    }

    /// GET `/{kind}-consents/{id}`
    pub async fn consent_status(
        &self,
        bank: &BankDescriptor,
        kind: ConsentKind,
        consent_id: &str,
        token: &str,
    ) -> Result<BankResponse> {
        let response = self
            .client
            .get(bank.consent_url(kind, consent_id))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .header("X-Fapi-Interaction-Id", &self.interaction_id)
            .send()
            .await?;

        Self::collect(response).await
    }

    /// POST `/{kind}-consents/request`
    pub async fn request_consent(
        &self,
        bank: &BankDescriptor,
        kind: ConsentKind,
        token: &str,
        query: &[(&str, &str)],
        payload: &serde_json::Value,
    ) -> Result<BankResponse> {
        let url = bank.endpoint(&format!("{}/request", kind.endpoint_family()));

        let response = self
            .client
            .post(&url)
            .query(query)
            .bearer_auth(token)
            .header("X-Fapi-Interaction-Id", &self.interaction_id)
            .json(payload)
            .send()
            .await?;

        Self::collect(response).await
    }

    /// DELETE `/{kind}-consents/{id}`
    pub async fn revoke_consent(
        &self,
        bank: &BankDescriptor,
        kind: ConsentKind,
        consent_id: &str,
        token: &str,
    ) -> Result<BankResponse> {
        let response = self
            .client
            .delete(bank.consent_url(kind, consent_id))
            .bearer_auth(token)
            .header("X-Fapi-Interaction-Id", &self.interaction_id)
            .send()
            .await?;

        Self::collect(response).await
    }

    async fn collect(response: reqwest::Response) -> Result<BankResponse> {
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(BankResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vbank(base_url: &str) -> BankDescriptor {
        BankDescriptor {
            code: "vbank".to_string(),
            name: "Virtual Bank".to_string(),
            base_url: base_url.to_string(),
            client_id: "team081".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[test]
    fn test_consent_url_trims_slashes() {
        let bank = vbank("https://vbank.example/");
        assert_eq!(
            bank.consent_url(ConsentKind::AccountAccess, "REQ-1"),
            "https://vbank.example/account-consents/REQ-1"
        );
        assert_eq!(
            bank.consent_url(ConsentKind::ProductAgreement, "C-9"),
            "https://vbank.example/product-agreement-consents/C-9"
        );
    }

    #[test]
    fn test_registry_resolution() {
        let registry = BankRegistry::new(vec![vbank("https://vbank.example")]);

        assert!(registry.resolve("vbank").is_ok());
        assert!(matches!(
            registry.resolve("nobank"),
            Err(ConsentEngineError::UnknownBank(code)) if code == "nobank"
        ));
        assert!(matches!(
            registry.resolve(""),
            Err(ConsentEngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_token_reads_expiry() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/auth/bank-token")
                    .query_param("client_id", "team081")
                    .query_param("client_secret", "secret");
                then.status(200)
                    .json_body(serde_json::json!({"access_token": "tok-1", "expires_in": 3600}));
            })
            .await;

        let client = BankApiClient::new(Duration::from_secs(5), "team081").unwrap();
        let issued = client.issue_token(&vbank(&server.base_url())).await.unwrap();

        mock.assert_async().await;
        assert_eq!(issued.token, "tok-1");
        assert_eq!(issued.lifetime, Some(chrono::Duration::seconds(3600)));
    }

    #[tokio::test]
    async fn test_issue_token_rejected() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/auth/bank-token");
                then.status(401).body("bad client");
            })
            .await;

        let client = BankApiClient::new(Duration::from_secs(5), "team081").unwrap();
        let err = client.issue_token(&vbank(&server.base_url())).await.unwrap_err();

        assert_eq!(
            err,
            CredentialError::Rejected {
                bank: "vbank".to_string(),
                status: 401,
                body: "bad client".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_issue_token_ignores_unusable_expiry() {
        let client = BankApiClient::new(Duration::from_secs(5), "team081").unwrap();

        for expires_in in [serde_json::json!(0), serde_json::json!(-60), serde_json::json!(i64::MAX)] {
            let server = httpmock::MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(httpmock::Method::POST).path("/auth/bank-token");
                    then.status(200)
                        .json_body(serde_json::json!({"access_token": "tok", "expires_in": expires_in}));
                })
                .await;

            let issued = client.issue_token(&vbank(&server.base_url())).await.unwrap();
            assert_eq!(issued.token, "tok");
            assert_eq!(issued.lifetime, None, "expires_in {}", expires_in);
        }
    }
}
