// Prometheus metrics for consent reconciliation
// Tracks: poll ticks, per-record outcomes, credential cache behaviour, live subscribers

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::fmt;
use std::sync::Arc;

pub struct Metrics {
    pub registry: Registry,

    // Poller metrics
    pub poll_ticks_total: IntCounter,
    pub poll_tick_duration_seconds: Histogram,
    pub records_reconciled: IntCounterVec,
    pub bank_query_duration_seconds: Histogram,

    // Credential metrics
    pub credential_cache_hits: IntCounter,
    pub credential_cache_misses: IntCounter,
    pub credential_issuances: IntCounterVec,

    // Consent creation
    pub consents_created: IntCounterVec,

    // Notification hub
    pub live_subscribers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let poll_ticks_total = register_int_counter_with_registry!(
            Opts::new("consent_poll_ticks_total", "Reconciliation ticks executed"),
            registry
        )?;

        let poll_tick_duration_seconds = register_histogram_with_registry!(
            HistogramOpts::new(
                "consent_poll_tick_duration_seconds",
                "Wall time of one reconciliation tick"
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            registry
        )?;

        let records_reconciled = register_int_counter_vec_with_registry!(
            Opts::new(
                "consent_records_reconciled_total",
                "Pending consents checked, by outcome"
            ),
            &["outcome"],
            registry
        )?;

        let bank_query_duration_seconds = register_histogram_with_registry!(
            HistogramOpts::new(
                "consent_bank_query_duration_seconds",
                "Latency of consent status queries to banks"
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            registry
        )?;

        let credential_cache_hits = register_int_counter_with_registry!(
            Opts::new("consent_credential_cache_hits_total", "Bank tokens served from cache"),
            registry
        )?;

        let credential_cache_misses = register_int_counter_with_registry!(
            Opts::new(
                "consent_credential_cache_misses_total",
                "Bank token lookups that required issuance"
            ),
            registry
        )?;

        let credential_issuances = register_int_counter_vec_with_registry!(
            Opts::new("consent_credential_issuances_total", "Bank token issuance calls"),
            &["result"],
            registry
        )?;

        let consents_created = register_int_counter_vec_with_registry!(
            Opts::new("consent_created_total", "Consent creation requests"),
            &["kind", "result"],
            registry
        )?;

        let live_subscribers = register_int_gauge_with_registry!(
            Opts::new("consent_live_subscribers", "Connected approval subscribers"),
            registry
        )?;

        Ok(Self {
            registry,
            poll_ticks_total,
            poll_tick_duration_seconds,
            records_reconciled,
            bank_query_duration_seconds,
            credential_cache_hits,
            credential_cache_misses,
            credential_issuances,
            consents_created,
            live_subscribers,
        })
    }

    /// Prometheus text exposition
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_families() {
        METRICS.poll_ticks_total.inc();
        METRICS.records_reconciled.with_label_values(&["approved"]).inc();

        let text = METRICS.export().unwrap();
        assert!(text.contains("consent_poll_ticks_total"));
        assert!(text.contains("consent_records_reconciled_total"));
    }
}
