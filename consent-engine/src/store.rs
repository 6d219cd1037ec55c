//! Relational store access (PostgreSQL)
//!
//! Consent tables share one layout for the columns reconciliation needs
//! (`consent_id`, `user_id`, `bank_id`, `requesting_bank`, `status`), so the
//! per-kind operations are written once against [`ConsentKind::table`].

use crate::error::{ConsentEngineError, Result};
use crate::types::{ConsentKind, ConsentRecord, ConsentStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub client_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct BankRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub api_base_url: String,
}

#[derive(Debug, Clone, FromRow)]
struct PendingConsentRow {
    consent_id: String,
    bank_code: String,
    user_id: i64,
    requesting_bank: String,
}

#[derive(Debug, Clone, FromRow)]
struct StoredConsentRow {
    consent_id: String,
    bank_code: String,
    user_id: i64,
    requesting_bank: String,
    status: String,
}

/// Stored account consent as returned to callers of the creation flow
#[derive(Debug, Clone, FromRow)]
pub struct StoredAccountConsent {
    pub consent_id: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Stored product-agreement consent with the permissions it grants
#[derive(Debug, Clone, FromRow)]
pub struct StoredProductConsent {
    pub consent_id: String,
    pub status: String,
    pub read_product_agreements: bool,
    pub open_product_agreements: bool,
    pub close_product_agreements: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAccountConsent {
    pub client_id: String,
    pub bank_code: String,
    pub consent_id: String,
    pub requesting_bank: String,
    pub permissions: Vec<String>,
    pub status: ConsentStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProductConsent {
    pub client_id: String,
    pub bank_code: String,
    pub request_id: Option<String>,
    pub consent_id: String,
    pub requesting_bank: String,
    pub read_product_agreements: bool,
    pub open_product_agreements: bool,
    pub close_product_agreements: bool,
    pub allowed_product_types: Vec<String>,
    pub max_amount: Decimal,
    pub status: ConsentStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolve a user by internal id
    pub async fn user_by_id(&self, user_id: i64) -> Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, client_id, email FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Resolve a bank by code
    pub async fn bank_by_code(&self, code: &str) -> Result<Option<BankRow>> {
        let bank = sqlx::query_as::<_, BankRow>(
            r#"
            SELECT id, code, name, api_base_url FROM banks WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(bank)
    }

    /// Pending consents of one kind, with the owning bank's code joined in
    pub async fn list_pending(&self, kind: ConsentKind) -> Result<Vec<ConsentRecord>> {
        let query = format!(
            r#"
            SELECT c.consent_id,
                   COALESCE(b.code, '') AS bank_code,
                   c.user_id,
                   COALESCE(c.requesting_bank, '') AS requesting_bank
            FROM {} c
            LEFT JOIN banks b ON b.id = c.bank_id
            WHERE c.status = $1
            "#,
            kind.table()
        );

        let rows = sqlx::query_as::<_, PendingConsentRow>(&query)
            .bind(ConsentStatus::Pending.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ConsentRecord {
                consent_id: row.consent_id,
                bank_code: row.bank_code,
                subject_id: row.user_id,
                status: ConsentStatus::Pending,
                kind,
                requesting_party: row.requesting_bank,
            })
            .collect())
    }

    /// Look a consent up by its tracked identifier in every consent table
    pub async fn find_consent(&self, consent_id: &str) -> Result<Option<ConsentRecord>> {
        for kind in ConsentKind::ALL {
            let query = format!(
                r#"
                SELECT c.consent_id,
                       COALESCE(b.code, '') AS bank_code,
                       c.user_id,
                       COALESCE(c.requesting_bank, '') AS requesting_bank,
                       c.status
                FROM {} c
                LEFT JOIN banks b ON b.id = c.bank_id
                WHERE c.consent_id = $1
                "#,
                kind.table()
            );

            let row = sqlx::query_as::<_, StoredConsentRow>(&query)
                .bind(consent_id)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = row {
                let status = row.status.parse().map_err(|_| {
                    ConsentEngineError::Internal(format!(
                        "consent {} has unreadable status {}",
                        row.consent_id, row.status
                    ))
                })?;
                return Ok(Some(ConsentRecord {
                    consent_id: row.consent_id,
                    bank_code: row.bank_code,
                    subject_id: row.user_id,
                    status,
                    kind,
                    requesting_party: row.requesting_bank,
                }));
            }
        }

        Ok(None)
    }

    /// Set the status of one consent; updating to the current status is a no-op
    pub async fn update_status(
        &self,
        kind: ConsentKind,
        consent_id: &str,
        status: ConsentStatus,
    ) -> Result<u64> {
        let query = format!("UPDATE {} SET status = $1 WHERE consent_id = $2", kind.table());

        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(consent_id)
            .execute(&self.pool)
            .await?;

        debug!(
            "Updated {} {} to {} ({} rows)",
            kind,
            consent_id,
            status,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// Replace a provisional identifier with the final one; zero rows when
    /// `old_id` was already transferred
    pub async fn transfer_identifier(
        &self,
        kind: ConsentKind,
        old_id: &str,
        new_id: &str,
        status: ConsentStatus,
    ) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET consent_id = $1, status = $2 WHERE consent_id = $3",
            kind.table()
        );

        let result = sqlx::query(&query)
            .bind(new_id)
            .bind(status.as_str())
            .bind(old_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Unexpired, non-terminal-failure account consents of a user at a bank
    pub async fn active_account_consents(
        &self,
        user_id: i64,
        bank_code: &str,
    ) -> Result<Vec<StoredAccountConsent>> {
        let consents = sqlx::query_as::<_, StoredAccountConsent>(
            r#"
            SELECT c.consent_id, c.status, c.expires_at
            FROM account_consents c
            JOIN banks b ON b.id = c.bank_id
            WHERE c.user_id = $1
              AND b.code = $2
              AND c.status IN ('pending', 'approved')
              AND (c.expires_at IS NULL OR c.expires_at > NOW())
            ORDER BY c.created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(bank_code)
        .fetch_all(&self.pool)
        .await?;

        Ok(consents)
    }

    /// Insert an account consent, resolving client id and bank code in one transaction
    pub async fn insert_account_consent(&self, consent: &NewAccountConsent) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let user_id = Self::resolve_user(&mut tx, &consent.client_id).await?;
        let bank_id = Self::resolve_bank(&mut tx, &consent.bank_code).await?;

        sqlx::query(
            r#"
            INSERT INTO account_consents (
                consent_id, user_id, bank_id, requesting_bank,
                permissions, status, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&consent.consent_id)
        .bind(user_id)
        .bind(bank_id)
        .bind(&consent.requesting_bank)
        .bind(&consent.permissions)
        .bind(consent.status.as_str())
        .bind(consent.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "Stored account consent {} for {} at {} ({})",
            consent.consent_id, consent.client_id, consent.bank_code, consent.status
        );
        Ok(())
    }

    /// Active (pending or approved) product consent of a user at a bank
    pub async fn active_product_consent(
        &self,
        user_id: i64,
        bank_code: &str,
    ) -> Result<Option<StoredProductConsent>> {
        let consent = sqlx::query_as::<_, StoredProductConsent>(
            r#"
            SELECT c.consent_id, c.status,
                   c.read_product_agreements, c.open_product_agreements,
                   c.close_product_agreements, c.expires_at
            FROM product_agreement_consents c
            JOIN banks b ON b.id = c.bank_id
            WHERE c.user_id = $1
              AND b.code = $2
              AND c.status IN ('pending', 'approved')
            ORDER BY c.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(bank_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(consent)
    }

    /// Insert a product-agreement consent, resolving keys in one transaction
    pub async fn insert_product_consent(&self, consent: &NewProductConsent) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let user_id = Self::resolve_user(&mut tx, &consent.client_id).await?;
        let bank_id = Self::resolve_bank(&mut tx, &consent.bank_code).await?;

        sqlx::query(
            r#"
            INSERT INTO product_agreement_consents (
                request_id, consent_id, user_id, bank_id, requesting_bank,
                read_product_agreements, open_product_agreements, close_product_agreements,
                allowed_product_types, max_amount, status, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&consent.request_id)
        .bind(&consent.consent_id)
        .bind(user_id)
        .bind(bank_id)
        .bind(&consent.requesting_bank)
        .bind(consent.read_product_agreements)
        .bind(consent.open_product_agreements)
        .bind(consent.close_product_agreements)
        .bind(&consent.allowed_product_types)
        .bind(consent.max_amount)
        .bind(consent.status.as_str())
        .bind(consent.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "Stored product consent {} for {} at {} ({})",
            consent.consent_id, consent.client_id, consent.bank_code, consent.status
        );
        Ok(())
    }

    /// Remove a product consent after it was revoked at the bank
    pub async fn delete_product_consent(&self, consent_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM product_agreement_consents WHERE consent_id = $1")
            .bind(consent_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn resolve_user(tx: &mut Transaction<'_, Postgres>, client_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ConsentEngineError::UserNotFound(client_id.to_string()))
    }

    async fn resolve_bank(tx: &mut Transaction<'_, Postgres>, code: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM banks WHERE code = $1")
            .bind(code)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| ConsentEngineError::UnknownBank(code.to_string()))
    }
}
