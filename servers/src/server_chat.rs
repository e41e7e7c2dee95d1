use anyhow::Result;
use lib_common::Store;
use lib_common::connections::{FileStore, PgStore};
use servers::chat_logic::{config, downstream, flusher, logger, monitor, state};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let store = match &config.db_url {
        Some(url) => {
            log::info!("Message storage: PostgreSQL");
            Store::Postgres(PgStore::new(url).await?)
        }
        None => {
            log::info!("Message storage: file ({})", config.data_file().display());
            Store::File(FileStore::new(config.data_file(), config.cache_bound())?)
        }
    };

    let policy = state::Policy {
        max_text_len: config.max_text_len(),
        cache_bound: config.cache_bound(),
        edit_window: config.edit_window(),
        typing_expiry: config.typing_expiry(),
        flush_interval: config.flush_interval(),
        admin_token: config.admin_token.clone(),
    };
    let app_state = state::AppState::new(store, policy);

    let warmed = app_state.warm_up().await?;
    log::info!("Loaded {} messages from storage", warmed);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let downstream_handle = tokio::spawn(downstream::run(
        config.port(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));
    let flusher_handle = tokio::spawn(flusher::run(app_state.clone(), shutdown_tx.subscribe()));
    let monitor_handle = tokio::spawn(monitor::run(app_state.clone(), shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components; the flusher drains the
    // pending buffer once before exiting.
    let _ = shutdown_tx.send(());

    let _ = tokio::try_join!(downstream_handle, flusher_handle, monitor_handle);

    log::info!("Shutdown complete.");
    Ok(())
}
