#![warn(clippy::all, clippy::pedantic)]

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::{error, info, warn};
use wa_gateway::client::loopback::LoopbackFactory;
use wa_gateway::config::GatewayConfig;
use wa_gateway::context::GatewayContext;
use wa_gateway::store::SqliteStore;
use wa_gateway::supervisor::{InstanceSupervisor, StartOutcome};
use wa_gateway::{AppState, http};

const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = GatewayConfig::from_env()?;
    config.validate()?;

    let store = Arc::new(SqliteStore::new(&config.database_path)?);
    let ctx = Arc::new(GatewayContext::new(config.clone(), store)?);
    let supervisor = Arc::new(InstanceSupervisor::new(
        Arc::clone(&ctx),
        Arc::new(LoopbackFactory::new()),
    ));

    match &ctx.secret {
        Some(guard) => info!(fingerprint = %guard.fingerprint(), "app secret check enabled"),
        None => warn!("no app secret configured; control endpoints are open"),
    }

    if let Some(proxy) = &config.restore_proxy {
        match supervisor.start(proxy, true).await {
            Ok(StartOutcome::Started { paired }) => info!(paired, "restored previous session"),
            Ok(StartOutcome::NoExistingAuth) => info!("no previous session to restore"),
            Err(error) => error!("failed to restore previous session: {error}"),
        }
    }

    let app_state = AppState::new(Arc::clone(&ctx), Arc::clone(&supervisor));
    let app = http::router(app_state);

    info!(
        bind = %config.bind_addr,
        db = %config.database_path.display(),
        media = %config.media_dir.display(),
        instance_id = config.instance_id,
        "starting wa-gateway"
    );

    if config.uses_tls() {
        let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) else {
            bail!("tls requires both a certificate and a key path");
        };

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load rustls cert/key")?;

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                shutdown_signal(&ctx).await;
                handle.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
            });
        }

        axum_server::bind_rustls(config.bind_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("axum tls server failed")?;
    } else {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .context("failed to bind TCP listener")?;

        let signal_ctx = Arc::clone(&ctx);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_signal(&signal_ctx).await })
            .await
            .context("axum server failed")?;
    }

    if supervisor.stop().await {
        info!("client disconnected");
    }
    info!(
        uptime_secs = wa_gateway::now_secs() - ctx.started_at,
        "wa-gateway stopped"
    );

    Ok(())
}

/// Resolves on ctrl-c, SIGTERM, or when the session was replaced elsewhere.
async fn shutdown_signal(ctx: &GatewayContext) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!("failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
        () = ctx.wait_for_shutdown() => warn!("session replaced; shutting down"),
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
