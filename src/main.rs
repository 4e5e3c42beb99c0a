use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use postal_inspector::config::Config;
use postal_inspector::mail::{ImapConfig, ImapMailStore, MailStore};
use postal_inspector::pipeline::{Poller, spawn_poller};
use postal_inspector::store::{LibSqlBackend, PolicyStore, spawn_retention_task};
use postal_inspector::web::dashboard_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = Config::from_env()?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&config);

    eprintln!("📬 Postal Inspector v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   IMAP: {}:{} as {}", config.imap_host, config.imap_port, config.username);
    eprintln!("   Poll interval: {}s", config.poll_interval.as_secs());
    eprintln!("   Dashboard: http://0.0.0.0:{}/", config.web_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn PolicyStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    if config.snapshot_retention_days > 0 {
        eprintln!("   Snapshot retention: {} days", config.snapshot_retention_days);
    }
    let _retention_handle =
        spawn_retention_task(Arc::clone(&store), config.snapshot_retention_days);

    // ── Dashboard ────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.web_port))
        .await
        .with_context(|| format!("Failed to bind dashboard port {}", config.web_port))?;
    let app = dashboard_routes(Arc::clone(&store));
    tokio::spawn(async move {
        tracing::info!("Dashboard server started");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Dashboard server exited");
        }
    });

    // ── Poller ───────────────────────────────────────────────────────────
    let mail: Arc<dyn MailStore> = Arc::new(ImapMailStore::new(ImapConfig::from(&config)));
    let poller = Arc::new(Poller::new(mail, Arc::clone(&store)));
    let handle = spawn_poller(poller, config.poll_interval);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, waiting for current cycle");
    let cycles = handle.stop().await;
    tracing::info!(cycles, "Stopped");

    Ok(())
}

/// Console logging always; a daily rolling file as well when `LOG_DIR` is set.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "postal-inspector.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
