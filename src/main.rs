use std::net::SocketAddr;
use std::time::Duration;

use payments_core::config::AppConfig;
use payments_core::logging::init_tracing;
use payments_core::startup::{self, Settings};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(35);

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        skip_externals = config.skip_externals,
        auto_capture = config.payments.auto_capture,
        "Starting payments core"
    );

    let components = startup::connect(&config).await.map_err(|e| {
        error!(error = %e, "failed to connect external dependencies");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = startup::build(components, Settings::from_config(&config), shutdown_rx);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(
        listener,
        app.router
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx.clone()))
    .await?;

    // Stop dispatchers even if the server exited for another reason
    let _ = shutdown_tx.send(true);
    app.queues.close_all();
    for handle in app.workers {
        if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, handle)
            .await
            .is_err()
        {
            warn!("Timed out waiting for a worker to drain");
        }
    }
    app.queues.release_held().await;

    if let Err(e) = app.audit.flush().await {
        error!(error = %e, "failed to flush audit log on shutdown");
    }
    drop(app.audit);
    drop(app.state);
    if tokio::time::timeout(Duration::from_secs(5), app.audit_writer)
        .await
        .is_err()
    {
        warn!("Timed out waiting for the audit writer");
    }

    info!("Server shutdown complete");
    Ok(())
}
