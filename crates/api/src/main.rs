use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use docflow_api::app::{build_app, services::AppServices};
use docflow_auth::Hs256OwnerResolver;
use docflow_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    docflow_observability::init();

    let settings = Settings::from_env().context("loading configuration")?;
    let services = AppServices::from_settings(&settings).await?;

    let workers = services.pool.clone().spawn(services.pool_config.clone());

    let (stop_recovery, recovery_stopped) = watch::channel(false);
    let recovery = tokio::spawn(services.jobs.clone().run_recovery(
        settings.pending_recovery,
        settings.pending_recovery,
        settings.workers.claim_lease,
        recovery_stopped,
    ));

    let resolver = Arc::new(Hs256OwnerResolver::new(settings.jwt_secret.as_bytes()));
    let app = build_app(services.jobs.clone(), resolver, services.limits.max_input_bytes);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("stopping background work");
    let _ = stop_recovery.send(true);
    let _ = recovery.await;
    workers.shutdown(settings.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
