//! Consent repository adapters
//!
//! The poller only ever talks to [`ConsentRepository`]; each consent kind
//! plugs in its own adapter over its own backing table.

use crate::error::Result;
use crate::store::Database;
use crate::types::{ConsentKind, ConsentRecord, ConsentStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Read/write contract reconciliation needs from a consent store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsentRepository: Send + Sync {
    /// Consent kind this adapter stores
    fn kind(&self) -> ConsentKind;

    /// Every record currently pending. Order is irrelevant.
    async fn list_pending(&self) -> Result<Vec<ConsentRecord>>;

    /// Idempotent status update
    async fn update_status(&self, consent_id: &str, status: ConsentStatus) -> Result<()>;

    /// Atomically rewrite identifier and status. Succeeds without effect when
    /// `old_id` no longer exists.
    async fn transfer_identifier(
        &self,
        old_id: &str,
        new_id: &str,
        status: ConsentStatus,
    ) -> Result<()>;
}

/// PostgreSQL adapter for one consent kind
#[derive(Debug, Clone)]
pub struct PgConsentRepository {
    db: Arc<Database>,
    kind: ConsentKind,
}

impl PgConsentRepository {
    pub fn new(db: Arc<Database>, kind: ConsentKind) -> Self {
        Self { db, kind }
    }

    /// `account_consents` adapter
    pub fn account_access(db: Arc<Database>) -> Self {
        Self::new(db, ConsentKind::AccountAccess)
    }

    /// `product_agreement_consents` adapter
    pub fn product_agreement(db: Arc<Database>) -> Self {
        Self::new(db, ConsentKind::ProductAgreement)
    }
}

#[async_trait]
impl ConsentRepository for PgConsentRepository {
    fn kind(&self) -> ConsentKind {
        self.kind
    }

    async fn list_pending(&self) -> Result<Vec<ConsentRecord>> {
        self.db.list_pending(self.kind).await
    }

    async fn update_status(&self, consent_id: &str, status: ConsentStatus) -> Result<()> {
        self.db.update_status(self.kind, consent_id, status).await?;
        Ok(())
    }

    async fn transfer_identifier(
        &self,
        old_id: &str,
        new_id: &str,
        status: ConsentStatus,
    ) -> Result<()> {
        let rows = self
            .db
            .transfer_identifier(self.kind, old_id, new_id, status)
            .await?;
        if rows == 0 {
            debug!("{} consent {} already transferred", self.kind, old_id);
        }
        Ok(())
    }
}

/// Process-local adapter keyed by consent id
#[derive(Debug)]
pub struct InMemoryConsentRepository {
    kind: ConsentKind,
    records: Mutex<HashMap<String, ConsentRecord>>,
}

impl InMemoryConsentRepository {
    pub fn new(kind: ConsentKind) -> Self {
        Self {
            kind,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Store a record, replacing any record with the same id
    pub fn insert(&self, record: ConsentRecord) {
        self.records.lock().insert(record.consent_id.clone(), record);
    }

    pub fn get(&self, consent_id: &str) -> Option<ConsentRecord> {
        self.records.lock().get(consent_id).cloned()
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<ConsentRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ConsentRepository for InMemoryConsentRepository {
    fn kind(&self) -> ConsentKind {
        self.kind
    }

    async fn list_pending(&self) -> Result<Vec<ConsentRecord>> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|record| record.status == ConsentStatus::Pending)
            .cloned()
            .collect())
    }

    async fn update_status(&self, consent_id: &str, status: ConsentStatus) -> Result<()> {
        if let Some(record) = self.records.lock().get_mut(consent_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn transfer_identifier(
        &self,
        old_id: &str,
        new_id: &str,
        status: ConsentStatus,
    ) -> Result<()> {
        let mut records = self.records.lock();
        if let Some(mut record) = records.remove(old_id) {
            record.consent_id = new_id.to_string();
            record.status = status;
            records.insert(new_id.to_string(), record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository() -> InMemoryConsentRepository {
        let repository = InMemoryConsentRepository::new(ConsentKind::AccountAccess);
        repository.insert(ConsentRecord::pending(
            "R1",
            "vbank",
            1,
            ConsentKind::AccountAccess,
            "team081",
        ));
        repository
    }

    #[tokio::test]
    async fn test_update_status_is_idempotent() {
        let repository = repository();

        repository.update_status("R1", ConsentStatus::Approved).await.unwrap();
        let once = repository.records();
        repository.update_status("R1", ConsentStatus::Approved).await.unwrap();

        assert_eq!(repository.records(), once);
        assert!(repository.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_rewrites_identity() {
        let repository = repository();

        repository
            .transfer_identifier("R1", "C1", ConsentStatus::Approved)
            .await
            .unwrap();

        assert_eq!(repository.len(), 1);
        assert!(repository.get("R1").is_none());
        assert_eq!(repository.get("C1").unwrap().status, ConsentStatus::Approved);
    }

    #[tokio::test]
    async fn test_transfer_of_missing_record_is_noop() {
        let repository = repository();
        repository
            .transfer_identifier("R1", "C1", ConsentStatus::Approved)
            .await
            .unwrap();

        // A concurrent cycle arriving second finds nothing under R1.
        repository
            .transfer_identifier("R1", "C1", ConsentStatus::Approved)
            .await
            .unwrap();

        assert_eq!(repository.len(), 1);
        assert_eq!(repository.get("C1").unwrap().status, ConsentStatus::Approved);
    }

    #[tokio::test]
    async fn test_list_pending_skips_terminal_records() {
        let repository = repository();
        let mut rejected = ConsentRecord::pending("R2", "abank", 2, ConsentKind::AccountAccess, "team081");
        rejected.status = ConsentStatus::Rejected;
        repository.insert(rejected);

        let pending = repository.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consent_id, "R1");
    }
}
