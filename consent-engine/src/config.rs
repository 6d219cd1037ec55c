use crate::bank::BankDescriptor;
use crate::error::{ConsentEngineError, Result};
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Banks the aggregator integrates with when none are configured
pub const DEFAULT_BANK_CODES: [&str; 3] = ["vbank", "abank", "sbank"];

/// Upper bound for `aggregator.consent_lifetime_days`
pub const MAX_CONSENT_LIFETIME_DAYS: i64 = 3650;

/// Upper bound for `credentials.fallback_ttl_secs` (30 days)
pub const MAX_FALLBACK_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub poller: PollerSettings,
    pub credentials: CredentialSettings,
    pub aggregator: AggregatorConfig,
    pub hub: HubConfig,
    #[serde(default)]
    pub banks: Vec<BankDescriptor>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PollerSettings {
    pub interval_secs: u64,
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CredentialSettings {
    pub fallback_ttl_secs: i64,
    pub client_id: String,
    #[serde(default, skip_serializing)]
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AggregatorConfig {
    pub requesting_bank: String,
    pub requesting_bank_name: String,
    pub consent_lifetime_days: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HubConfig {
    pub subscriber_buffer: usize,
    pub default_wait_secs: u64,
    pub max_wait_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // .env is optional in every environment
        let _ = dotenvy::dotenv();

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("poller.interval_secs", 5)?
            .set_default("poller.max_concurrency", 16)?
            .set_default("poller.request_timeout_secs", 10)?
            .set_default("credentials.fallback_ttl_secs", 86_400)?
            .set_default("credentials.client_id", "team081")?
            .set_default("credentials.client_secret", "")?
            .set_default("aggregator.requesting_bank", "team081")?
            .set_default("aggregator.requesting_bank_name", "MoneyPilot")?
            .set_default("aggregator.consent_lifetime_days", 90)?
            .set_default("hub.subscriber_buffer", 64)?
            .set_default("hub.default_wait_secs", 30)?
            .set_default("hub.max_wait_secs", 120)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        builder = builder.add_source(Environment::with_prefix("CONSENT_ENGINE").separator("__"));

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("redis.url", redis_url)?;
        }

        if let Ok(port) = env::var("GATEWAY_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(client_id) = env::var("BANK_CLIENT_ID") {
            builder = builder.set_override("credentials.client_id", client_id)?;
        }

        if let Ok(client_secret) = env::var("BANK_CLIENT_SECRET") {
            builder = builder.set_override("credentials.client_secret", client_secret)?;
        }

        let mut config: Config = builder.build()?.try_deserialize()?;

        if let Ok(raw) = env::var("BANKS") {
            config.banks = parse_banks(&raw)?;
        }
        if config.banks.is_empty() {
            config.banks = default_banks(&config.credentials);
        }

        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.redis.url.is_empty() {
            return Err("Redis URL is required".to_string());
        }

        if self.poller.interval_secs == 0 {
            return Err("Poll interval must be positive".to_string());
        }

        if self.poller.max_concurrency == 0 {
            return Err("Poller concurrency must be at least 1".to_string());
        }

        if self.poller.request_timeout_secs == 0 {
            return Err("Bank request timeout must be positive".to_string());
        }

        if self.credentials.fallback_ttl_secs <= 0 {
            return Err("Credential fallback TTL must be positive".to_string());
        }

        if self.credentials.fallback_ttl_secs > MAX_FALLBACK_TTL_SECS {
            return Err(format!(
                "Credential fallback TTL cannot exceed {} seconds",
                MAX_FALLBACK_TTL_SECS
            ));
        }

        if !(1..=MAX_CONSENT_LIFETIME_DAYS).contains(&self.aggregator.consent_lifetime_days) {
            return Err(format!(
                "Consent lifetime must be between 1 and {} days",
                MAX_CONSENT_LIFETIME_DAYS
            ));
        }

        if self.hub.subscriber_buffer == 0 {
            return Err("Subscriber buffer must be at least 1".to_string());
        }

        if self.hub.default_wait_secs > self.hub.max_wait_secs {
            return Err("Default wait cannot exceed the maximum wait".to_string());
        }

        if self.banks.is_empty() {
            return Err("At least one bank is required".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for bank in &self.banks {
            if bank.code.trim().is_empty() {
                return Err("Bank code cannot be empty".to_string());
            }
            if !seen.insert(bank.code.as_str()) {
                return Err(format!("Bank {} is configured twice", bank.code));
            }
            if bank.base_url.is_empty() {
                return Err(format!("Bank {} has no base URL", bank.code));
            }
        }

        Ok(())
    }

    /// Per-request timeout applied to every bank call
    pub fn bank_request_timeout(&self) -> Duration {
        Duration::from_secs(self.poller.request_timeout_secs)
    }

    pub fn credential_fallback_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.credentials
                .fallback_ttl_secs
                .clamp(1, MAX_FALLBACK_TTL_SECS),
        )
    }

    pub fn consent_lifetime(&self) -> chrono::Duration {
        self.aggregator.consent_lifetime()
    }
}

impl AggregatorConfig {
    /// Validity period requested for new consents, kept within the accepted range
    pub fn consent_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(
            self.consent_lifetime_days
                .clamp(1, MAX_CONSENT_LIFETIME_DAYS),
        )
    }
}

impl HubConfig {
    /// Wait timeout requested by a caller, clamped to the configured maximum
    pub fn wait_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .unwrap_or(self.default_wait_secs)
            .min(self.max_wait_secs);
        Duration::from_secs(secs)
    }
}

/// Parse a JSON array of bank descriptors, as given in the `BANKS` variable
pub fn parse_banks(raw: &str) -> Result<Vec<BankDescriptor>> {
    serde_json::from_str(raw)
        .map_err(|e| ConsentEngineError::Config(format!("Invalid BANKS definition: {}", e)))
}

/// Sandbox banks sharing one set of team credentials
pub fn default_banks(credentials: &CredentialSettings) -> Vec<BankDescriptor> {
    DEFAULT_BANK_CODES
        .iter()
        .map(|code| BankDescriptor {
            code: code.to_string(),
            name: code.to_uppercase(),
            base_url: format!("https://{}.open.bankingapi.ru", code),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        let credentials = CredentialSettings {
            fallback_ttl_secs: 86_400,
            client_id: "team081".to_string(),
            client_secret: "secret".to_string(),
        };
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/consents".to_string(),
                max_connections: 5,
            },
            redis: RedisConfig {
                url: "redis://localhost".to_string(),
            },
            poller: PollerSettings {
                interval_secs: 5,
                max_concurrency: 4,
                request_timeout_secs: 10,
            },
            banks: default_banks(&credentials),
            credentials,
            aggregator: AggregatorConfig {
                requesting_bank: "team081".to_string(),
                requesting_bank_name: "MoneyPilot".to_string(),
                consent_lifetime_days: 90,
            },
            hub: HubConfig {
                subscriber_buffer: 64,
                default_wait_secs: 30,
                max_wait_secs: 120,
            },
        }
    }

    #[test]
    fn test_sample_config_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = sample();
        config.poller.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_banks() {
        let mut config = sample();
        let duplicate = config.banks[0].clone();
        config.banks.push(duplicate);
        assert_eq!(
            config.validate().unwrap_err(),
            "Bank vbank is configured twice".to_string()
        );
    }

    #[test]
    fn test_validate_rejects_missing_database() {
        let mut config = sample();
        config.database.url.clear();
        assert_eq!(
            config.validate().unwrap_err(),
            "Database URL is required".to_string()
        );
    }

    #[test]
    fn test_default_banks() {
        let config = sample();
        let codes: Vec<_> = config.banks.iter().map(|b| b.code.as_str()).collect();
        assert_eq!(codes, vec!["vbank", "abank", "sbank"]);
        assert_eq!(config.banks[0].base_url, "https://vbank.open.bankingapi.ru");
        assert_eq!(config.banks[0].client_secret, "secret");
    }

    #[test]
    fn test_parse_banks() {
        let banks = parse_banks(
            r#"[{"code":"mock","name":"Mock Bank","base_url":"http://127.0.0.1:9000","client_id":"team"}]"#,
        )
        .unwrap();
        assert_eq!(banks.len(), 1);
        assert_eq!(banks[0].code, "mock");
        assert!(banks[0].client_secret.is_empty());

        assert!(matches!(
            parse_banks("not json"),
            Err(ConsentEngineError::Config(_))
        ));
    }

    #[test]
    fn test_wait_timeout_clamped() {
        let hub = sample().hub;
        assert_eq!(hub.wait_timeout(None), Duration::from_secs(30));
        assert_eq!(hub.wait_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(hub.wait_timeout(Some(10_000)), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_consent_lifetime_out_of_range() {
        for days in [0, -5, MAX_CONSENT_LIFETIME_DAYS + 1, i64::MAX] {
            let mut config = sample();
            config.aggregator.consent_lifetime_days = days;
            assert!(config.validate().is_err(), "{} days accepted", days);
        }
    }

    #[test]
    fn test_validate_rejects_oversized_fallback_ttl() {
        let mut config = sample();
        config.credentials.fallback_ttl_secs = i64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifetimes_stay_in_range_without_validation() {
        let mut config = sample();
        config.aggregator.consent_lifetime_days = i64::MAX;
        config.credentials.fallback_ttl_secs = i64::MAX;

        assert_eq!(
            config.consent_lifetime(),
            chrono::Duration::days(MAX_CONSENT_LIFETIME_DAYS)
        );
        assert_eq!(
            config.credential_fallback_lifetime(),
            chrono::Duration::seconds(MAX_FALLBACK_TTL_SECS)
        );
    }

    #[test]
    fn test_durations() {
        let config = sample();
        assert_eq!(config.bank_request_timeout(), Duration::from_secs(10));
        assert_eq!(config.credential_fallback_lifetime(), chrono::Duration::hours(24));
        assert_eq!(config.consent_lifetime(), chrono::Duration::days(90));
    }
}
