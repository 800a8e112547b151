//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::cache::SharedCache;
use crate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitState};

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    /// Serving traffic is possible unless the ledger is down
    pub fn is_ready(&self) -> bool {
        !matches!(self.status, HealthState::Unhealthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Where transactions live
#[derive(Clone)]
pub enum LedgerBackend {
    #[cfg(feature = "database")]
    Postgres(sqlx::PgPool),
    InMemory,
}

impl LedgerBackend {
    async fn check(&self) -> Result<u128, String> {
        let start = Instant::now();
        match self {
            #[cfg(feature = "database")]
            LedgerBackend::Postgres(pool) => crate::database::health_check(pool)
                .await
                .map(|_| start.elapsed().as_millis())
                .map_err(|e| e.to_string()),
            LedgerBackend::InMemory => Ok(start.elapsed().as_millis()),
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    ledger: LedgerBackend,
    cache: Arc<dyn SharedCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    gateway: String,
}

impl HealthChecker {
    pub fn new(
        ledger: LedgerBackend,
        cache: Arc<dyn SharedCache>,
        breakers: Arc<CircuitBreakerRegistry>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            cache,
            breakers,
            gateway: gateway.into(),
        }
    }

    /// Ledger down is unhealthy. A down cache or an open gateway circuit only
    /// degrades service: idempotency fails open and gateway calls fail fast.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut ledger_up = true;
        let mut degraded = false;

        let ledger = match timeout(Duration::from_secs(5), self.ledger.check()).await {
            Ok(Ok(response_time)) => ComponentHealth::up(Some(response_time)),
            Ok(Err(e)) => {
                error!(error = %e, "ledger health check failed");
                ledger_up = false;
                ComponentHealth::down(Some(e))
            }
            Err(_) => {
                error!("ledger health check timed out");
                ledger_up = false;
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        health_status.checks.insert("ledger".to_string(), ledger);

        let start = Instant::now();
        let cache = match timeout(Duration::from_secs(5), self.cache.ping()).await {
            Ok(Ok(())) => ComponentHealth::up(Some(start.elapsed().as_millis())),
            Ok(Err(e)) => {
                warn!(backend = self.cache.backend_name(), error = %e, "cache health check failed");
                degraded = true;
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                warn!(backend = self.cache.backend_name(), "cache health check timed out");
                degraded = true;
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        health_status.checks.insert("cache".to_string(), cache);

        let snapshot = self.breakers.get(&self.gateway).snapshot();
        let gateway = match snapshot.state {
            CircuitState::Closed => ComponentHealth::up(None),
            CircuitState::HalfOpen => {
                degraded = true;
                ComponentHealth::warning(None, Some("circuit half-open".to_string()))
            }
            CircuitState::Open => {
                degraded = true;
                ComponentHealth::down(Some(format!(
                    "circuit open, retry in {}s",
                    snapshot.retry_after_secs.unwrap_or(0)
                )))
            }
        };
        health_status.checks.insert("gateway".to_string(), gateway);

        health_status.status = match (ledger_up, degraded) {
            (false, _) => HealthState::Unhealthy,
            (true, true) => HealthState::Degraded,
            (true, false) => HealthState::Healthy,
        };
        health_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::services::circuit_breaker::CircuitBreakerConfig;

    fn checker(cache: InMemoryCache, breakers: Arc<CircuitBreakerRegistry>) -> HealthChecker {
        HealthChecker::new(LedgerBackend::InMemory, Arc::new(cache), breakers, "adyen")
    }

    #[tokio::test]
    async fn test_all_up_is_healthy() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let status = checker(InMemoryCache::new(), registry).check_health().await;
        assert_eq!(status.status, HealthState::Healthy);
        assert_eq!(status.checks.len(), 3);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_but_stays_ready() {
        let cache = InMemoryCache::new();
        cache.set_available(false);
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let status = checker(cache, registry).check_health().await;
        assert_eq!(status.status, HealthState::Degraded);
        assert!(status.is_ready());
        assert_eq!(status.checks["cache"].status, ComponentState::Down);
    }

    #[tokio::test]
    async fn test_open_circuit_reports_gateway_down() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        }));
        let breaker = registry.get("adyen");
        breaker.try_acquire().unwrap().failure();

        let status = checker(InMemoryCache::new(), registry).check_health().await;
        assert_eq!(status.checks["gateway"].status, ComponentState::Down);
        assert_eq!(status.status, HealthState::Degraded);
    }

    #[test]
    fn test_component_health_states() {
        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(500));
    }
}
