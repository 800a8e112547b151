//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::payments::providers::adyen::AdyenConfig;
use crate::workers::jobs::QueueName;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// In-memory ledger and cache instead of Postgres and Redis
    pub skip_externals: bool,
    pub database: Option<DatabaseConfig>,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub gateway: AdyenConfig,
    pub payments: PaymentsConfig,
    pub idempotency: IdempotencySettings,
    pub webhooks: WebhookSettings,
    pub circuit_breaker: CircuitSettings,
    pub notifications: NotificationConfig,
    pub jobs: JobsConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub auto_capture: bool,
    pub session_expiry_secs: u64,
    pub refund_check_delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    pub ttl_secs: u64,
    pub processing_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub require_signature: bool,
    pub dedupe_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub reconciliation_interval_secs: u64,
    /// Owner lease on a persisted job; an instance that stops renewing loses its jobs after this
    pub owner_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// `QUEUE_<NAME>_CONCURRENCY` overrides
    pub concurrency: BTreeMap<QueueName, usize>,
}

/// Parse `name`, falling back to `default` when unset
fn var_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        _ => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = var_or("SKIP_EXTERNALS", false)?;
        let database = match DatabaseConfig::from_env() {
            Ok(db) => Some(db),
            Err(_) if skip_externals => None,
            Err(e) => return Err(e),
        };
        let gateway = AdyenConfig::from_env().map_err(|e| match e {
            crate::payments::error::GatewayError::Validation {
                field: Some(field), ..
            } => ConfigError::MissingVariable(field),
            other => ConfigError::ValidationFailed(other.to_string()),
        })?;

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            skip_externals,
            database,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            gateway,
            payments: PaymentsConfig::from_env()?,
            idempotency: IdempotencySettings::from_env()?,
            webhooks: WebhookSettings::from_env()?,
            circuit_breaker: CircuitSettings::from_env()?,
            notifications: NotificationConfig::from_env()?,
            jobs: JobsConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if !self.skip_externals {
            self.cache.validate()?;
        }
        self.logging.validate()?;
        self.payments.validate()?;
        self.idempotency.validate()?;
        self.circuit_breaker.validate()?;
        self.notifications.validate()?;
        self.jobs.validate()?;

        if self.webhooks.require_signature && self.gateway.hmac_key.is_none() {
            return Err(ConfigError::ValidationFailed(
                "WEBHOOK_REQUIRE_SIGNATURE needs ADYEN_HMAC_KEY".to_string(),
            ));
        }
        if let Some(key) = &self.gateway.hmac_key {
            if hex::decode(key).is_err() {
                return Err(ConfigError::InvalidValue("ADYEN_HMAC_KEY".to_string()));
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: var_or("SERVER_PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: var_or("DB_MAX_CONNECTIONS", 20)?,
            min_connections: var_or("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: var_or("DB_CONNECTION_TIMEOUT", 30)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: var_or("CACHE_MAX_CONNECTIONS", 20)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PaymentsConfig {
            auto_capture: var_or("PAYMENTS_AUTO_CAPTURE", false)?,
            session_expiry_secs: var_or("SESSION_EXPIRY_SECS", 3600)?,
            refund_check_delay_secs: var_or("REFUND_CHECK_DELAY_SECS", 21_600)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_expiry_secs == 0 {
            return Err(ConfigError::InvalidValue("SESSION_EXPIRY_SECS".to_string()));
        }
        Ok(())
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_secs)
    }

    pub fn refund_check_delay(&self) -> Duration {
        Duration::from_secs(self.refund_check_delay_secs)
    }
}

impl IdempotencySettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(IdempotencySettings {
            ttl_secs: var_or("IDEMPOTENCY_TTL_SECS", 86_400)?,
            processing_ttl_secs: var_or("IDEMPOTENCY_PROCESSING_TTL_SECS", 300)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::InvalidValue("IDEMPOTENCY_TTL_SECS".to_string()));
        }
        if self.processing_ttl_secs == 0 || self.processing_ttl_secs > self.ttl_secs {
            return Err(ConfigError::InvalidValue(
                "IDEMPOTENCY_PROCESSING_TTL_SECS must be in 1..=IDEMPOTENCY_TTL_SECS".to_string(),
            ));
        }
        Ok(())
    }
}

impl WebhookSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(WebhookSettings {
            require_signature: var_or("WEBHOOK_REQUIRE_SIGNATURE", false)?,
            dedupe_ttl_secs: var_or("WEBHOOK_DEDUPE_TTL_SECS", 604_800)?,
        })
    }
}

impl CircuitSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CircuitSettings {
            failure_threshold: var_or("CIRCUIT_FAILURE_THRESHOLD", 5)?,
            cooldown_secs: var_or("CIRCUIT_COOLDOWN_SECS", 30)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "CIRCUIT_FAILURE_THRESHOLD".to_string(),
            ));
        }
        if self.cooldown_secs == 0 {
            return Err(ConfigError::InvalidValue("CIRCUIT_COOLDOWN_SECS".to_string()));
        }
        Ok(())
    }
}

impl NotificationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(NotificationConfig {
            webhook_url: optional_var("NOTIFICATION_WEBHOOK_URL"),
            timeout_ms: var_or("NOTIFICATION_TIMEOUT_MS", 3000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "NOTIFICATION_WEBHOOK_URL must be a valid URL".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut concurrency = BTreeMap::new();
        for queue in QueueName::ALL {
            let name = format!("QUEUE_{}_CONCURRENCY", queue.as_str().to_uppercase());
            if optional_var(&name).is_some() {
                concurrency.insert(queue, var_or(&name, 1usize)?);
            }
        }
        Ok(JobsConfig {
            reconciliation_interval_secs: var_or("RECONCILIATION_INTERVAL_SECS", 86_400)?,
            owner_ttl_secs: var_or("JOB_OWNER_TTL_SECS", 30)?,
            sweep_interval_secs: var_or("JOB_SWEEP_INTERVAL_SECS", 10)?,
            concurrency,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciliation_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "RECONCILIATION_INTERVAL_SECS".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("JOB_SWEEP_INTERVAL_SECS".to_string()));
        }
        if self.owner_ttl_secs <= self.sweep_interval_secs {
            return Err(ConfigError::ValidationFailed(
                "JOB_OWNER_TTL_SECS must exceed JOB_SWEEP_INTERVAL_SECS".to_string(),
            ));
        }
        if let Some((queue, _)) = self.concurrency.iter().find(|(_, n)| **n == 0) {
            return Err(ConfigError::InvalidValue(format!(
                "QUEUE_{}_CONCURRENCY",
                queue.as_str().to_uppercase()
            )));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            skip_externals: true,
            database: None,
            cache: CacheConfig {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                max_connections: 20,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Plain,
            },
            gateway: AdyenConfig::default(),
            payments: PaymentsConfig {
                auto_capture: false,
                session_expiry_secs: 3600,
                refund_check_delay_secs: 21_600,
            },
            idempotency: IdempotencySettings {
                ttl_secs: 86_400,
                processing_ttl_secs: 300,
            },
            webhooks: WebhookSettings {
                require_signature: false,
                dedupe_ttl_secs: 604_800,
            },
            circuit_breaker: CircuitSettings {
                failure_threshold: 5,
                cooldown_secs: 30,
            },
            notifications: NotificationConfig {
                webhook_url: None,
                timeout_ms: 3000,
            },
            jobs: JobsConfig {
                reconciliation_interval_secs: 86_400,
                owner_ttl_secs: 30,
                sweep_interval_secs: 10,
                concurrency: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let mut config = valid();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_signature_needs_key() {
        let mut config = valid();
        config.webhooks.require_signature = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));

        config.gateway.hmac_key = Some("not-hex".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.gateway.hmac_key = Some("0A1B".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_processing_ttl_bounded_by_ttl() {
        let mut config = valid();
        config.idempotency.processing_ttl_secs = config.idempotency.ttl_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_concurrency_rejected() {
        let mut config = valid();
        config.jobs.concurrency.insert(QueueName::Webhooks, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_job_lease_outlives_sweep_interval() {
        let mut config = valid();
        config.jobs.owner_ttl_secs = config.jobs.sweep_interval_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_var_or_reports_variable_name() {
        env::set_var("PAYMENTS_CORE_TEST_BAD_INT", "twelve");
        match var_or::<u32>("PAYMENTS_CORE_TEST_BAD_INT", 1) {
            Err(ConfigError::InvalidValue(name)) => assert_eq!(name, "PAYMENTS_CORE_TEST_BAD_INT"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(var_or::<u32>("PAYMENTS_CORE_TEST_UNSET", 7).unwrap(), 7);
    }
}
