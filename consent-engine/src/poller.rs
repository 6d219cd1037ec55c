//! Reconciliation poller
//!
//! Every tick lists the pending consents of each repository and asks the
//! owning bank about each of them, one bounded task per record. Approvals
//! are written back through the repository and announced on the hub.

use crate::bank::{BankApiClient, BankRegistry};
use crate::config::PollerSettings;
use crate::credentials::CredentialCache;
use crate::hub::NotificationHub;
use crate::metrics::METRICS;
use crate::normalizer::normalize;
use crate::repository::ConsentRepository;
use crate::types::{ConsentEvent, ConsentRecord, ConsentStatus};
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Upper bound on records reconciled at the same time
    pub max_concurrency: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_concurrency: 16,
        }
    }
}

impl From<&PollerSettings> for PollerConfig {
    fn from(settings: &PollerSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            max_concurrency: settings.max_concurrency.max(1),
        }
    }
}

/// What happened to one record during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Status flipped to approved under the same identifier
    Approved,
    /// Approved under a new final identifier
    Transferred,
    /// Bank answered, consent not approved yet
    StillPending,
    /// Not checked: not pending, bank unknown, or shutting down
    Skipped,
    /// Check failed; retried next tick
    Failed,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Approved => "approved",
            RecordOutcome::Transferred => "transferred",
            RecordOutcome::StillPending => "still_pending",
            RecordOutcome::Skipped => "skipped",
            RecordOutcome::Failed => "failed",
        }
    }
}

/// Summary of one reconciliation tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub approved: usize,
    pub transferred: usize,
    pub still_pending: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl TickReport {
    fn record(&mut self, outcome: RecordOutcome) {
        self.checked += 1;
        match outcome {
            RecordOutcome::Approved => self.approved += 1,
            RecordOutcome::Transferred => self.transferred += 1,
            RecordOutcome::StillPending => self.still_pending += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed => self.failed += 1,
        }
    }
}

/// Periodic reconciliation of pending consents against their banks
#[derive(Clone)]
pub struct ReconciliationPoller {
    repositories: Vec<Arc<dyn ConsentRepository>>,
    banks: Arc<BankRegistry>,
    credentials: Arc<CredentialCache>,
    client: BankApiClient,
    hub: Arc<NotificationHub>,
    config: PollerConfig,
}

impl fmt::Debug for ReconciliationPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationPoller")
            .field(
                "repositories",
                &self.repositories.iter().map(|r| r.kind()).collect::<Vec<_>>(),
            )
            .field("banks", &self.banks.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ReconciliationPoller {
    pub fn new(
        repositories: Vec<Arc<dyn ConsentRepository>>,
        banks: Arc<BankRegistry>,
        credentials: Arc<CredentialCache>,
        client: BankApiClient,
        hub: Arc<NotificationHub>,
        config: PollerConfig,
    ) -> Self {
        Self {
            repositories,
            banks,
            credentials,
            client,
            hub,
            config,
        }
    }

    /// Run on a background task until `shutdown` fires
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    }

    /// Tick every `interval` until `shutdown` fires. A tick in progress at
    /// shutdown is abandoned and its unfinished record tasks aborted.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting consent reconciliation loop: interval {:?}, concurrency {}",
            self.config.interval, self.config.max_concurrency
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("Shutdown requested, abandoning reconciliation tick in progress");
                    break;
                }
                report = self.tick_with(&shutdown) => {
                    if report.checked > 0 {
                        info!(
                            checked = report.checked,
                            approved = report.approved,
                            transferred = report.transferred,
                            still_pending = report.still_pending,
                            skipped = report.skipped,
                            failed = report.failed,
                            duration_ms = report.duration.as_millis() as u64,
                            "Reconciliation tick complete"
                        );
                    } else {
                        debug!("Reconciliation tick complete: nothing pending");
                    }
                }
            }
        }

        info!("Consent reconciliation loop stopped");
    }

    /// One reconciliation pass over every repository
    pub async fn tick(&self) -> TickReport {
        self.tick_with(&CancellationToken::new()).await
    }

    async fn tick_with(&self, shutdown: &CancellationToken) -> TickReport {
        let started = Instant::now();
        let _timer = METRICS.poll_tick_duration_seconds.start_timer();
        METRICS.poll_ticks_total.inc();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for repository in &self.repositories {
            let pending = match repository.list_pending().await {
                Ok(pending) => pending,
                Err(e) => {
                    error!(
                        "Failed to list pending {} consents: {}",
                        repository.kind(),
                        e
                    );
                    continue;
                }
            };

            debug!("{} pending {} consents", pending.len(), repository.kind());

            for record in pending {
                let poller = self.clone();
                let repository = repository.clone();
                let semaphore = semaphore.clone();
                let shutdown = shutdown.clone();

                tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return RecordOutcome::Skipped,
                    };
                    poller
                        .reconcile_record(repository.as_ref(), record, &shutdown)
                        .await
                });
            }
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Reconciliation task failed: {}", e);
                    RecordOutcome::Failed
                }
            };
            METRICS
                .records_reconciled
                .with_label_values(&[outcome.as_str()])
                .inc();
            report.record(outcome);
        }

        report.duration = started.elapsed();
        report
    }

    /// Check one pending record with its bank and apply the answer
    pub async fn reconcile_record(
        &self,
        repository: &dyn ConsentRepository,
        record: ConsentRecord,
        shutdown: &CancellationToken,
    ) -> RecordOutcome {
        if record.status != ConsentStatus::Pending {
            return RecordOutcome::Skipped;
        }

        if record.bank_code.trim().is_empty() {
            warn!("Consent {} has no bank code, skipping", record.consent_id);
            return RecordOutcome::Skipped;
        }

        let bank = match self.banks.get(&record.bank_code) {
            Some(bank) => bank,
            None => {
                warn!(
                    "Consent {} references unknown bank {}, skipping",
                    record.consent_id, record.bank_code
                );
                return RecordOutcome::Skipped;
            }
        };

        if shutdown.is_cancelled() {
            return RecordOutcome::Skipped;
        }

        let credential = match self.credentials.get_valid_credential(&bank).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("No token for {}, skipping {}: {}", bank.code, record.consent_id, e);
                return RecordOutcome::Failed;
            }
        };

        if shutdown.is_cancelled() {
            return RecordOutcome::Skipped;
        }

        let response = {
            let _timer = METRICS.bank_query_duration_seconds.start_timer();
            self.client
                .consent_status(&bank, record.kind, &record.consent_id, &credential.token)
                .await
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Status query for {} at {} failed: {}",
                    record.consent_id, bank.code, e
                );
                return RecordOutcome::Failed;
            }
        };

        if !response.is_success() {
            warn!(
                "Status query for {} at {} returned {}: {}",
                record.consent_id,
                bank.code,
                response.status,
                response.body_text()
            );
            if response.status == StatusCode::UNAUTHORIZED {
                self.credentials.invalidate(&bank.code).await;
            }
            return RecordOutcome::Failed;
        }

        let normalized = normalize(&response.body);
        if normalized.is_empty() {
            warn!(
                "Unrecognized status payload for {} from {}",
                record.consent_id, bank.code
            );
            return RecordOutcome::Failed;
        }

        if let Some(final_id) = normalized.transfer_target(&record.consent_id) {
            if let Err(e) = repository
                .transfer_identifier(&record.consent_id, final_id, ConsentStatus::Approved)
                .await
            {
                error!(
                    "Failed to transfer consent {} to {}: {}",
                    record.consent_id, final_id, e
                );
                return RecordOutcome::Failed;
            }

            info!(
                "Consent {} approved at {} as {}",
                record.consent_id, bank.code, final_id
            );
            self.hub
                .notify_approved(&ConsentEvent::approved(&record, Some(final_id.to_string())));
            return RecordOutcome::Transferred;
        }

        if normalized.is_approved() {
            if let Err(e) = repository
                .update_status(&record.consent_id, ConsentStatus::Approved)
                .await
            {
                error!("Failed to approve consent {}: {}", record.consent_id, e);
                return RecordOutcome::Failed;
            }

            info!("Consent {} approved at {}", record.consent_id, bank.code);
            self.hub.notify_approved(&ConsentEvent::approved(&record, None));
            return RecordOutcome::Approved;
        }

        debug!(
            "Consent {} still {} at {}",
            record.consent_id,
            normalized.status.as_deref().unwrap_or("unknown"),
            bank.code
        );
        RecordOutcome::StillPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::BankDescriptor;
    use crate::credentials::InMemoryCredentialStore;
    use crate::error::ConsentEngineError;
    use crate::repository::{InMemoryConsentRepository, MockConsentRepository};
    use crate::types::ConsentKind;
    use httpmock::prelude::*;

    fn bank(code: &str, base_url: &str) -> BankDescriptor {
        BankDescriptor {
            code: code.to_string(),
            name: code.to_uppercase(),
            base_url: base_url.to_string(),
            client_id: "team081".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    fn poller(
        repositories: Vec<Arc<dyn ConsentRepository>>,
        banks: Vec<BankDescriptor>,
    ) -> (ReconciliationPoller, Arc<NotificationHub>) {
        let client = BankApiClient::new(Duration::from_secs(2), "team081").unwrap();
        let credentials = Arc::new(CredentialCache::new(
            Arc::new(InMemoryCredentialStore::new()),
            client.clone(),
            chrono::Duration::hours(24),
        ));
        let hub = Arc::new(NotificationHub::default());
        let poller = ReconciliationPoller::new(
            repositories,
            Arc::new(BankRegistry::new(banks)),
            credentials,
            client,
            hub.clone(),
            PollerConfig::default(),
        );
        (poller, hub)
    }

    #[test]
    fn test_tick_report_counts() {
        let mut report = TickReport::default();
        report.record(RecordOutcome::Approved);
        report.record(RecordOutcome::Skipped);
        report.record(RecordOutcome::Failed);
        assert_eq!(report.checked, 3);
        assert_eq!(report.approved, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_poller_config_from_settings() {
        let config = PollerConfig::from(&PollerSettings {
            interval_secs: 7,
            max_concurrency: 0,
            request_timeout_secs: 3,
        });
        assert_eq!(config.interval, Duration::from_secs(7));
        assert_eq!(config.max_concurrency, 1);
    }

    #[tokio::test]
    async fn test_failing_repository_is_skipped() {
        let mut failing = MockConsentRepository::new();
        failing.expect_kind().return_const(ConsentKind::ProductAgreement);
        failing
            .expect_list_pending()
            .returning(|| Err(ConsentEngineError::Internal("connection reset".to_string())));
        failing.expect_update_status().times(0);
        failing.expect_transfer_identifier().times(0);

        let healthy = Arc::new(InMemoryConsentRepository::new(ConsentKind::AccountAccess));
        healthy.insert(ConsentRecord::pending(
            "C1",
            "nobank",
            1,
            ConsentKind::AccountAccess,
            "team081",
        ));

        let (poller, _hub) = poller(vec![Arc::new(failing), healthy.clone()], vec![]);
        let report = poller.tick().await;

        assert_eq!(report.checked, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(healthy.get("C1").unwrap().status, ConsentStatus::Pending);
    }

    #[tokio::test]
    async fn test_non_pending_record_is_not_queried() {
        let mut repository = MockConsentRepository::new();
        repository.expect_kind().return_const(ConsentKind::AccountAccess);
        repository.expect_list_pending().returning(|| {
            let mut record =
                ConsentRecord::pending("C9", "vbank", 1, ConsentKind::AccountAccess, "team081");
            record.status = ConsentStatus::Rejected;
            Ok(vec![record])
        });
        repository.expect_update_status().times(0);

        // Any bank call would fail against this address
        let (poller, _hub) = poller(
            vec![Arc::new(repository)],
            vec![bank("vbank", "http://127.0.0.1:9")],
        );
        let report = poller.tick().await;

        assert_eq!(report.checked, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_credential() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/bank-token");
                then.status(200)
                    .json_body(serde_json::json!({"access_token": "T1", "expires_in": 3600}));
            })
            .await;
        let status = server
            .mock_async(|when, then| {
                when.method(GET).path("/account-consents/C1");
                then.status(401).body("token expired");
            })
            .await;

        let repository = Arc::new(InMemoryConsentRepository::new(ConsentKind::AccountAccess));
        repository.insert(ConsentRecord::pending(
            "C1",
            "vbank",
            1,
            ConsentKind::AccountAccess,
            "team081",
        ));

        let (poller, _hub) = poller(
            vec![repository.clone()],
            vec![bank("vbank", &server.base_url())],
        );

        let first = poller.tick().await;
        let second = poller.tick().await;

        assert_eq!(first.failed, 1);
        assert_eq!(second.failed, 1);
        status.assert_hits_async(2).await;
        // Each 401 drops the token, so every tick issues a fresh one
        token.assert_hits_async(2).await;
        assert_eq!(repository.get("C1").unwrap().status, ConsentStatus::Pending);
    }

    #[tokio::test]
    async fn test_approved_status_updates_and_notifies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/bank-token");
                then.status(200).json_body(serde_json::json!({"access_token": "T1"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/product-agreement-consents/P1")
                    .header("authorization", "Bearer T1")
                    .header("x-fapi-interaction-id", "team081");
                then.status(200)
                    .json_body(serde_json::json!({"status": "Authorized", "consent_id": "P1"}));
            })
            .await;

        let repository = Arc::new(InMemoryConsentRepository::new(ConsentKind::ProductAgreement));
        repository.insert(ConsentRecord::pending(
            "P1",
            "abank",
            3,
            ConsentKind::ProductAgreement,
            "team081",
        ));

        let (poller, hub) = poller(
            vec![repository.clone()],
            vec![bank("abank", &server.base_url())],
        );
        let handle = hub.register_wait("P1");

        let report = poller.tick().await;
        assert_eq!(report.approved, 1);
        assert_eq!(repository.get("P1").unwrap().status, ConsentStatus::Approved);

        match hub.wait(handle, Duration::from_secs(1)).await {
            crate::hub::WaitOutcome::Approved(event) => {
                assert_eq!(event.consent_id, "P1");
                assert_eq!(event.final_consent_id, None);
                assert_eq!(event.kind, ConsentKind::ProductAgreement);
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_answer_leaves_record() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/bank-token");
                then.status(200).json_body(serde_json::json!({"access_token": "T1"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/account-consents/R7");
                then.status(200)
                    .json_body(serde_json::json!({"data": {"status": "AwaitingAuthorisation"}}));
            })
            .await;

        let repository = Arc::new(InMemoryConsentRepository::new(ConsentKind::AccountAccess));
        repository.insert(ConsentRecord::pending(
            "R7",
            "sbank",
            2,
            ConsentKind::AccountAccess,
            "team081",
        ));

        let (poller, _hub) = poller(
            vec![repository.clone()],
            vec![bank("sbank", &server.base_url())],
        );
        let report = poller.tick().await;

        assert_eq!(report.still_pending, 1);
        assert_eq!(repository.get("R7").unwrap().status, ConsentStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (poller, _hub) = poller(vec![], vec![]);
        let shutdown = CancellationToken::new();
        let handle = poller.spawn(shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}
