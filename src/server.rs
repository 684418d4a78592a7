use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;

use crate::config::Config;
use crate::transport::RetryTransport;
use crate::{proxy, Result};

/// Binds every configured listener and serves until SIGINT/SIGTERM. The
/// largest listener write timeout caps how long in-flight responses get
/// to drain during shutdown.
pub async fn serve(config: Config) -> Result<()> {
    tracing::info!(listeners = config.listeners.len(), "starting llm-relay");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut servers = Vec::with_capacity(config.listeners.len());
    let mut drain_timeout = Duration::from_secs(30);

    for listener in &config.listeners {
        tracing::info!(
            name = %listener.name,
            host = %listener.host,
            port = listener.port,
            models = listener.resolved_models.len(),
            "configured listener"
        );
        for model in &listener.resolved_models {
            tracing::info!(
                listener = %listener.name,
                provider = %model.provider,
                model = %model.model,
                r#type = %model.model_type,
                attempts = model.attempts,
                "configured model"
            );
        }

        let transport = Arc::new(RetryTransport::new(listener, &config)?);
        let app = proxy::router(transport);
        let addr = format!("{}:{}", listener.host, listener.port);
        let tcp = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(address = %addr, "listening");

        drain_timeout = drain_timeout.max(listener.write_timeout());
        let mut shutdown_rx = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(tcp, app).with_graceful_shutdown(shutdown).await {
                tracing::error!(address = %addr, error = %err, "server error");
            }
        }));
    }

    shutdown_signal().await;
    tracing::info!("shutting down servers");
    let _ = shutdown_tx.send(());

    let drain = async {
        for server in servers {
            let _ = server.await;
        }
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!("shutdown drain timed out");
    }
    tracing::info!("all servers stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
