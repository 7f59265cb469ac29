//! Peptide shop web service: storefront API, webhooks, internal bot RPC
//! and the background schedulers.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use peptide_shop::config::Config;
use peptide_shop::scheduler::Schedulers;
use peptide_shop::{db, router, AppState};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("reading configuration")?;
    let pool = db::connect(&config.database).await.context("connecting to the database")?;
    db::migrate(&pool).await.context("applying migrations")?;

    let port = config.port;
    let state = AppState::build(config, pool).context("building integrations")?;
    let schedulers = Schedulers::spawn(&state);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("peptide-shop listening on 0.0.0.0:{}", port);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    schedulers.shutdown().await;
    Ok(())
}
