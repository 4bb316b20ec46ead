use std::sync::Arc;

use alancoin_core::config::Config;
use alancoin_core::db::{self, Db};
use alancoin_core::scheduler::Scheduler;
use alancoin_core::state::AppState;
use tokio::sync::broadcast;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("starting alancoin-core");

    let config = Config::load()?;
    tracing::info!(env = %config.env, chain_id = config.chain_id, "configuration loaded");

    let db = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections, config.db_min_connections).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("database connected and migrated");
            Db::connected(pool)
        }
        None => Db::disabled(),
    };

    let state = Arc::new(AppState::new(config.clone(), db));

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(());
    });

    let mut scheduler = Scheduler::new();
    state.register_periodic_tasks(&mut scheduler);

    let http_state = state.clone();
    let http_port = config.port;
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        tokio::select! {
            result = alancoin_core::api::serve("0.0.0.0", http_port, http_state) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "http server error");
                }
            }
            _ = subscribe_and_wait(http_shutdown) => {
                tracing::info!("http server shutting down");
            }
        }
    });

    scheduler.run(shutdown_rx).await;
    let _ = http_handle.await;

    tracing::info!("alancoin-core stopped");
    Ok(())
}

async fn subscribe_and_wait(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,alancoin_core=debug"));

    tracing_subscriber::registry().with(fmt::layer().with_target(true).with_thread_ids(true)).with(filter).init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
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
        _ = ctrl_c => {
            tracing::info!("received ctrl+c, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received sigterm, initiating shutdown");
        }
    }
}
