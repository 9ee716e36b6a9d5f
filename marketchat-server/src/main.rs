//! MarketChat messaging server — buyer/seller chat with realtime fanout.
//!
//! Serves the conversation HTTP API and the `/ws` realtime channel. User
//! identities come from an external provider; for standalone deployments
//! the directory can be seeded from a TOML file.
//!
//! # Usage
//!
//! ```bash
//! # Run on the default address 0.0.0.0:5000
//! cargo run --bin marketchat-server -- --users-file users.toml
//!
//! # Run on a custom address
//! cargo run --bin marketchat-server -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! MARKETCHAT_ADDR=127.0.0.1:8080 cargo run --bin marketchat-server
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use marketchat_server::config::{ServerCliArgs, ServerConfig};
use marketchat_server::directory::UserDirectory;
use marketchat_server::hub::RealtimeHub;
use marketchat_server::routes::{self, AppState};
use marketchat_server::service::ChatService;
use marketchat_server::store::ConversationStore;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting marketchat server");

    let directory = Arc::new(UserDirectory::new());
    if let Some(users_file) = &config.users_file {
        match directory.load_seed(users_file).await {
            Ok(count) => {
                tracing::info!(path = %users_file.display(), count, "user directory seeded");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to seed user directory");
                std::process::exit(1);
            }
        }
    }

    let store = Arc::new(ConversationStore::with_limits(
        Arc::clone(&directory),
        config.max_content_len,
        Duration::from_millis(config.op_timeout_ms),
    ));
    let hub = Arc::new(RealtimeHub::new());
    let service = Arc::new(ChatService::new(
        Arc::clone(&directory),
        Arc::clone(&store),
        Arc::clone(&hub),
    ));
    let state = Arc::new(AppState {
        directory,
        service,
        hub: Arc::clone(&hub),
    });

    match routes::start_server(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received, closing realtime connections");
                    hub.close_all().await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
