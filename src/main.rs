use std::sync::Arc;

use anyhow::Context;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use social_hub::auth::JwtAuthenticator;
use social_hub::config::HubConfig;
use social_hub::handlers::build_router;
use social_hub::hub::Hub;
use social_hub::metrics::HubMetrics;
use social_hub::storage::{run_migrations, MemoryStorage, PgStorage, Storage};
use social_hub::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,social_hub=debug,tower_http=info")),
        )
        .init();

    let config = HubConfig::from_env().context("loading configuration")?;

    let storage: Arc<dyn Storage> = match &config.database_url {
        Some(url) => {
            let manager = ConnectionManager::<PgConnection>::new(url);
            let pool = Pool::builder()
                .build(manager)
                .context("creating database pool")?;
            let applied = run_migrations(&pool).context("running migrations")?;
            info!(applied, "database ready");
            Arc::new(PgStorage::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    };

    let metrics = HubMetrics::new().context("registering metrics")?;
    let hub = Hub::new(config.hub.clone(), storage, metrics.clone())
        .context("starting hub")?;
    let state = AppState {
        hub: hub.clone(),
        auth: Arc::new(JwtAuthenticator::new(config.jwt_secret.as_bytes())),
        metrics,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("server error")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(hub: Hub) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
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
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    let closed = hub.shutdown();
    info!(closed, "closed live connections");
}
