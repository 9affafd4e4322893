use std::{path::PathBuf, sync::Arc, time::Duration};

use chat_reaper::{
    config::{PlatformConfig, ReaperConfig},
    engine::DeleteScheduler,
    observability,
    persistence::{self, PendingStore},
    platform::TelegramPlatform,
    routes::{self, AppState},
};
use clap::Parser;

/// Used when `--config` is not given and the file exists.
const DEFAULT_CONFIG_PATH: &str = "chat-reaper.toml";

#[derive(Parser, Debug)]
#[command(version, about = "Deferred chat message deletion service", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./chat-reaper.toml if it exists,
    /// otherwise built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the deletion service (default)
    Serve,
    /// Validate the configuration file and exit
    Check,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config(args.config.as_deref());

    match args.command {
        Some(Command::Check) => {
            println!("Configuration is valid");
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> ReaperConfig {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return ReaperConfig::default();
            }
            default
        }
    };

    match ReaperConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

async fn run_server(config: ReaperConfig) {
    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }

    let Some(PlatformConfig::Telegram(telegram)) = &config.platform else {
        eprintln!("Error: a [platform] section is required to serve");
        std::process::exit(1);
    };
    let platform = match TelegramPlatform::from_config(telegram) {
        Ok(platform) => Arc::new(platform),
        Err(e) => {
            eprintln!("Failed to build Telegram client: {e}");
            std::process::exit(1);
        }
    };

    let store: Option<Arc<dyn PendingStore>> = if config.persistence.enabled {
        match persistence::create_store(&config.persistence).await {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::error!(error = %e, "Failed to open persistence store, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let mut persistence_config = config.persistence.clone();
    if store.is_none() {
        persistence_config.enabled = false;
    }

    let scheduler = match DeleteScheduler::new(&config.engine, &persistence_config, store) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    scheduler.start(platform).await;

    let app = routes::build_router(
        AppState::new(scheduler.clone()),
        config.observability.metrics.enabled,
    );

    let bind_addr = config.server.socket_addr();
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, address = %bind_addr, "Failed to bind");
            scheduler.shutdown().await;
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    match tokio::time::timeout(timeout, scheduler.shutdown()).await {
        Ok(()) => tracing::info!("Shutdown complete"),
        Err(_) => tracing::warn!("Timeout waiting for the scheduler to stop, some deletions may not have completed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received, stopping the scheduler...");
}
