//! Core types for consent reconciliation

use crate::error::ConsentEngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical consent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    /// Requested at the bank, awaiting the user's authorization
    Pending,
    /// Granted by the bank
    Approved,
    /// Refused by the user or the bank
    Rejected,
    /// Lapsed before or after approval
    Expired,
}

impl ConsentStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Approved => "approved",
            ConsentStatus::Rejected => "rejected",
            ConsentStatus::Expired => "expired",
        }
    }

    /// Terminal records are never polled again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConsentStatus::Pending)
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentStatus {
    type Err = ConsentEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "awaitingauthorisation" | "awaitingauthorization" => {
                Ok(ConsentStatus::Pending)
            }
            "approved" | "authorised" | "authorized" => Ok(ConsentStatus::Approved),
            "rejected" => Ok(ConsentStatus::Rejected),
            "expired" | "revoked" => Ok(ConsentStatus::Expired),
            other => Err(ConsentEngineError::Validation(format!(
                "unknown consent status: {}",
                other
            ))),
        }
    }
}

/// Consent category; each kind has its own table and bank endpoint family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentKind {
    /// Read access to accounts, balances and transactions
    #[serde(rename = "account")]
    AccountAccess,
    /// Permission to read/open/close product agreements
    #[serde(rename = "product-agreement")]
    ProductAgreement,
}

impl ConsentKind {
    /// Every kind the engine reconciles
    pub const ALL: [ConsentKind; 2] = [ConsentKind::AccountAccess, ConsentKind::ProductAgreement];

    /// Kind name as it appears in bank paths
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentKind::AccountAccess => "account",
            ConsentKind::ProductAgreement => "product-agreement",
        }
    }

    /// Bank endpoint family, e.g. `account-consents`
    pub fn endpoint_family(&self) -> String {
        format!("{}-consents", self.as_str())
    }

    /// Backing table in the relational store
    pub fn table(&self) -> &'static str {
        match self {
            ConsentKind::AccountAccess => "account_consents",
            ConsentKind::ProductAgreement => "product_agreement_consents",
        }
    }
}

impl fmt::Display for ConsentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consent record as seen by reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// Identifier tracked at the bank; a provisional request id until the
    /// bank hands out the final consent id
    pub consent_id: String,
    pub bank_code: String,
    pub subject_id: i64,
    pub status: ConsentStatus,
    pub kind: ConsentKind,
    pub requesting_party: String,
}

impl ConsentRecord {
    /// New pending record
    pub fn pending(
        consent_id: impl Into<String>,
        bank_code: impl Into<String>,
        subject_id: i64,
        kind: ConsentKind,
        requesting_party: impl Into<String>,
    ) -> Self {
        Self {
            consent_id: consent_id.into(),
            bank_code: bank_code.into(),
            subject_id,
            status: ConsentStatus::Pending,
            kind,
            requesting_party: requesting_party.into(),
        }
    }
}

/// Bearer credential issued by a bank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedCredential {
    /// Usable strictly before `expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Event delivered to waiters and live subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Identifier the record carried when it was approved
    pub consent_id: String,
    /// Set when approval came with a new, final identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_consent_id: Option<String>,
    pub kind: ConsentKind,
    pub bank_code: String,
    pub subject_id: i64,
    pub approved_at: DateTime<Utc>,
}

impl ConsentEvent {
    pub const APPROVED: &'static str = "consent_approved";

    /// Approval of `record`, optionally under a new final identifier
    pub fn approved(record: &ConsentRecord, final_consent_id: Option<String>) -> Self {
        Self {
            event_type: Self::APPROVED.to_string(),
            consent_id: record.consent_id.clone(),
            final_consent_id,
            kind: record.kind,
            bank_code: record.bank_code.clone(),
            subject_id: record.subject_id,
            approved_at: Utc::now(),
        }
    }

    /// Identifier the consent is known by from now on
    pub fn current_consent_id(&self) -> &str {
        self.final_consent_id.as_deref().unwrap_or(&self.consent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_accepts_bank_synonyms() {
        assert_eq!("Authorised".parse::<ConsentStatus>().unwrap(), ConsentStatus::Approved);
        assert_eq!("AUTHORIZED".parse::<ConsentStatus>().unwrap(), ConsentStatus::Approved);
        assert_eq!(
            "AwaitingAuthorisation".parse::<ConsentStatus>().unwrap(),
            ConsentStatus::Pending
        );
        assert!("whatever".parse::<ConsentStatus>().is_err());
    }

    #[test]
    fn test_kind_endpoints_and_tables() {
        assert_eq!(ConsentKind::AccountAccess.endpoint_family(), "account-consents");
        assert_eq!(
            ConsentKind::ProductAgreement.endpoint_family(),
            "product-agreement-consents"
        );
        assert_eq!(ConsentKind::ProductAgreement.table(), "product_agreement_consents");
    }

    #[test]
    fn test_event_serializes_for_clients() {
        let record = ConsentRecord::pending("REQ-1", "vbank", 7, ConsentKind::AccountAccess, "team081");
        let event = ConsentEvent::approved(&record, None);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "consent_approved");
        assert_eq!(json["consent_id"], "REQ-1");
        assert_eq!(json["kind"], "account");
        assert!(json.get("final_consent_id").is_none());
        assert_eq!(event.current_consent_id(), "REQ-1");
    }

    #[test]
    fn test_credential_expiry_is_exclusive() {
        let now = Utc::now();
        let credential = CachedCredential {
            token: "t".to_string(),
            expires_at: now,
        };
        assert!(!credential.is_valid_at(now));
        assert!(credential.is_valid_at(now - chrono::Duration::seconds(1)));
    }
}
