use std::sync::Arc;

use clap::Parser;
use proxy_core::Config;
use proxy_service::routes;
use proxy_service::AppState;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line overrides for the persisted `config.json` (§6). Anything not
/// passed here falls back to the config file, then to built-in defaults, in
/// that order.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to.
    #[arg(long)]
    addr: Option<String>,
    /// Path to `config.json`; defaults to the platform config dir.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("proxy_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let addr = args.addr.unwrap_or_else(|| format!("0.0.0.0:{}", config.port));

    tracing::info!(
        addr = %addr,
        upstream = %config.upstream_base_url,
        auth = %if config.accepted_keys().is_empty() { "disabled" } else { "enabled" },
        "starting proxy-service"
    );

    let state = Arc::new(AppState::new(config));
    let app = routes::router(state.clone());

    tokio::spawn(run_quota_maintenance_loop(state.clone()));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await?;

    state.persist().await;
    Ok(())
}

/// Background timer driving C2's periodic maintenance (§4.2): refreshes any
/// stale quota snapshot, runs the auto-pause/resume rule, and checks for a
/// month boundary. Runs at a fraction of the 5-minute staleness window so a
/// snapshot rarely goes unrefreshed for long after it goes stale.
async fn run_quota_maintenance_loop(state: Arc<AppState>) {
    use chrono::Datelike;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let base_url = state.config.upstream_base_url.clone();
        let now = chrono::Utc::now();
        state
            .pool
            .run_quota_maintenance(
                move |cred| {
                    let cred = cred.clone();
                    let base_url = base_url.clone();
                    Box::pin(async move { crate::dispatch::fetch_quota_snapshot(&cred, &base_url).await })
                },
                now.year(),
                now.month(),
            )
            .await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, persisting state");
}
