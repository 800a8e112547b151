//! Composition root
//!
//! Every long-lived service is constructed once here and passed by handle to
//! whatever needs it. Storage, cache and gateway are chosen by the caller so the
//! same wiring serves the binary and the integration tests.

use axum::Router;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{self, AppState};
use crate::cache::SharedCache;
use crate::config::AppConfig;
use crate::database::audit_repository::AuditRepository;
use crate::database::refund_repository::RefundRepository;
use crate::database::transaction_repository::TransactionRepository;
use crate::database::InMemoryLedger;
use crate::health::{HealthChecker, LedgerBackend};
use crate::payments::provider::PaymentGateway;
use crate::payments::CircuitBreakingGateway;
use crate::services::audit::AuditRecorder;
use crate::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::services::idempotency::{IdempotencyConfig, IdempotencyGuard};
use crate::services::notification::{NotificationSink, Notifier};
use crate::services::payment_orchestrator::{OrchestratorConfig, PaymentOrchestrator};
use crate::services::reconciliation::{ReconciliationConfig, Reconciler};
use crate::services::webhook_processor::{WebhookConfig, WebhookProcessor};
use crate::workers::handlers::{
    NotificationJobHandler, PaymentJobHandler, ReconciliationJobHandler, RefundJobHandler,
    WebhookJobHandler,
};
use crate::workers::jobs::{JobHandler, QueueName};
use crate::workers::queue::{QueueConfig, QueueManager};
use crate::workers::scheduler::ReconciliationScheduler;
use crate::workers::store::{JobStore, JobStoreConfig};

const AUDIT_BUFFER: usize = 1024;

/// External collaborators
pub struct Components {
    pub transactions: Arc<dyn TransactionRepository>,
    pub refunds: Arc<dyn RefundRepository>,
    pub audit_log: Arc<dyn AuditRepository>,
    pub cache: Arc<dyn SharedCache>,
    pub ledger_backend: LedgerBackend,
    /// Wrapped in its circuit breaker during [`build`]
    pub gateway: Arc<dyn PaymentGateway>,
    pub notification_sink: Arc<dyn NotificationSink>,
}

impl Components {
    /// In-memory ledger and cache around the given gateway and sink
    pub fn in_memory(
        gateway: Arc<dyn PaymentGateway>,
        cache: Arc<dyn SharedCache>,
        notification_sink: Arc<dyn NotificationSink>,
    ) -> (Self, InMemoryLedger) {
        let ledger = InMemoryLedger::new();
        let components = Self::over_ledger(ledger.clone(), gateway, cache, notification_sink);
        (components, ledger)
    }

    /// Components sharing an existing in-memory ledger
    pub fn over_ledger(
        ledger: InMemoryLedger,
        gateway: Arc<dyn PaymentGateway>,
        cache: Arc<dyn SharedCache>,
        notification_sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            transactions: Arc::new(ledger.clone()),
            refunds: Arc::new(ledger.clone()),
            audit_log: Arc::new(ledger.clone()),
            cache,
            ledger_backend: LedgerBackend::InMemory,
            gateway,
            notification_sink,
        }
    }
}

/// Tunables for every service, derived from [`AppConfig`] or defaulted in tests
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub idempotency: IdempotencyConfig,
    pub webhooks: WebhookConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub queues: BTreeMap<QueueName, QueueConfig>,
    pub job_store: JobStoreConfig,
    pub reconciliation: ReconciliationConfig,
    /// `None` disables the periodic reconciliation trigger
    pub reconciliation_interval: Option<Duration>,
}

impl Settings {
    pub fn from_config(config: &AppConfig) -> Self {
        let queues = QueueName::ALL
            .into_iter()
            .map(|name| {
                let mut queue = QueueConfig::defaults_for(name);
                if let Some(concurrency) = config.jobs.concurrency.get(&name) {
                    queue.concurrency = *concurrency;
                }
                (name, queue)
            })
            .collect();

        Self {
            orchestrator: OrchestratorConfig {
                auto_capture: config.payments.auto_capture,
                session_expiry: config.payments.session_expiry(),
                refund_check_delay: config.payments.refund_check_delay(),
            },
            idempotency: IdempotencyConfig {
                ttl: Duration::from_secs(config.idempotency.ttl_secs),
                processing_ttl: Duration::from_secs(config.idempotency.processing_ttl_secs),
            },
            webhooks: WebhookConfig {
                hmac_key: config.gateway.hmac_key.clone(),
                require_signature: config.webhooks.require_signature,
                dedupe_ttl: Duration::from_secs(config.webhooks.dedupe_ttl_secs),
                ..WebhookConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker.failure_threshold,
                cooldown: Duration::from_secs(config.circuit_breaker.cooldown_secs),
            },
            queues,
            job_store: JobStoreConfig {
                owner_ttl: Duration::from_secs(config.jobs.owner_ttl_secs),
                sweep_interval: Duration::from_secs(config.jobs.sweep_interval_secs),
                ..JobStoreConfig::default()
            },
            reconciliation: ReconciliationConfig {
                session_expiry: config.payments.session_expiry(),
                ..ReconciliationConfig::default()
            },
            reconciliation_interval: Some(Duration::from_secs(
                config.jobs.reconciliation_interval_secs,
            )),
        }
    }
}

/// The running service
pub struct App {
    pub router: Router,
    pub state: AppState,
    pub queues: Arc<QueueManager>,
    pub audit: AuditRecorder,
    /// Queue dispatchers, the job store sweeper and the reconciliation trigger
    pub workers: Vec<JoinHandle<()>>,
    pub audit_writer: JoinHandle<()>,
}

/// Wire every service and start the background workers.
/// Workers stop when `shutdown_rx` turns `true`.
pub fn build(components: Components, settings: Settings, shutdown_rx: watch::Receiver<bool>) -> App {
    let (audit, audit_writer) = AuditRecorder::spawn(components.audit_log.clone(), AUDIT_BUFFER);

    let queues = Arc::new(QueueManager::with_store(
        settings.queues,
        JobStore::new(components.cache.clone(), settings.job_store),
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::new(settings.circuit_breaker));
    let gateway_name = components.gateway.name();
    let gateway: Arc<dyn PaymentGateway> = Arc::new(CircuitBreakingGateway::new(
        components.gateway.clone(),
        breakers.get(gateway_name),
    ));

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        components.transactions.clone(),
        components.refunds.clone(),
        gateway,
        queues.clone(),
        Notifier::new(queues.clone()),
        audit.clone(),
        settings.orchestrator,
    ));
    let webhooks = Arc::new(WebhookProcessor::new(
        orchestrator.clone(),
        components.cache.clone(),
        queues.clone(),
        audit.clone(),
        settings.webhooks,
    ));
    let reconciler = Arc::new(Reconciler::new(
        orchestrator.clone(),
        components.transactions.clone(),
        components.refunds.clone(),
        audit.clone(),
        settings.reconciliation,
    ));
    let idempotency = Arc::new(IdempotencyGuard::new(
        components.cache.clone(),
        settings.idempotency,
    ));
    let health = HealthChecker::new(
        components.ledger_backend,
        components.cache.clone(),
        breakers.clone(),
        gateway_name,
    );

    let mut handlers: HashMap<QueueName, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        QueueName::Payments,
        Arc::new(PaymentJobHandler::new(orchestrator.clone())),
    );
    handlers.insert(
        QueueName::Refunds,
        Arc::new(RefundJobHandler::new(orchestrator.clone())),
    );
    handlers.insert(
        QueueName::Webhooks,
        Arc::new(WebhookJobHandler::new(webhooks.clone())),
    );
    handlers.insert(
        QueueName::Notifications,
        Arc::new(NotificationJobHandler::new(components.notification_sink)),
    );
    handlers.insert(
        QueueName::Reconciliation,
        Arc::new(ReconciliationJobHandler::new(reconciler)),
    );
    let mut workers = queues.start(handlers, shutdown_rx.clone());

    if let Some(interval) = settings.reconciliation_interval {
        workers.push(tokio::spawn(
            ReconciliationScheduler::new(queues.clone(), interval).run(shutdown_rx),
        ));
    }
    info!(workers = workers.len(), gateway = gateway_name, "services wired");

    let state = AppState {
        orchestrator,
        webhooks,
        queues: queues.clone(),
        breakers,
        health,
        audit: audit.clone(),
        idempotency,
    };

    App {
        router: api::router(state.clone()),
        state,
        queues,
        audit,
        workers,
        audit_writer,
    }
}

/// Connect to Postgres and Redis, or fall back to in-memory stores when
/// `SKIP_EXTERNALS` is set, and build the live gateway.
#[cfg(all(feature = "database", feature = "cache"))]
pub async fn connect(config: &AppConfig) -> anyhow::Result<Components> {
    use crate::cache::{init_cache_pool, InMemoryCache, RedisCache};
    use crate::database::audit_repository::PgAuditRepository;
    use crate::database::refund_repository::PgRefundRepository;
    use crate::database::transaction_repository::PgTransactionRepository;
    use crate::payments::AdyenGateway;
    use crate::services::notification::{HttpNotificationSink, LogNotificationSink};
    use tracing::warn;

    let gateway: Arc<dyn PaymentGateway> = Arc::new(AdyenGateway::new(config.gateway.clone())?);

    let notification_sink: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(HttpNotificationSink::new(
            url.clone(),
            Duration::from_millis(config.notifications.timeout_ms),
        )?),
        None => {
            info!("NOTIFICATION_WEBHOOK_URL not set, notifications are logged only");
            Arc::new(LogNotificationSink)
        }
    };

    if config.skip_externals {
        warn!("SKIP_EXTERNALS=true, using in-memory ledger and cache; data is not persisted");
        let (components, _ledger) =
            Components::in_memory(gateway, Arc::new(InMemoryCache::new()), notification_sink);
        return Ok(components);
    }

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set"))?;
    info!("initializing database connection pool");
    let pool = crate::database::init_pool_from_config(database).await?;
    crate::database::run_migrations(&pool, "./migrations").await?;

    info!("initializing Redis cache connection pool");
    let cache_pool = init_cache_pool(crate::cache::CacheConfig {
        redis_url: config.cache.redis_url.clone(),
        max_connections: config.cache.max_connections,
        ..Default::default()
    })
    .await?;

    Ok(Components {
        transactions: Arc::new(PgTransactionRepository::new(pool.clone())),
        refunds: Arc::new(PgRefundRepository::new(pool.clone())),
        audit_log: Arc::new(PgAuditRepository::new(pool.clone())),
        cache: Arc::new(RedisCache::new(cache_pool)),
        ledger_backend: LedgerBackend::Postgres(pool),
        gateway,
        notification_sink,
    })
}
