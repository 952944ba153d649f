use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polygate::api::build_router;
use polygate::auth::AuthStore;
use polygate::config::AppConfig;
use polygate::manager::Manager;
use polygate::registry::ModelRegistry;
use polygate::watcher::Watcher;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_PORT_IN_USE: u8 = 2;
const EXIT_AUTH_DIR_UNREADABLE: u8 = 3;

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from("config.yaml")
}

fn init_tracing(config: &AppConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    if config.logging_to_file {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("polygate.log")
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
            return;
        }
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> ExitCode {
    let config_path = config_path_from_args();
    let config = match AppConfig::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("fatal: {error:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    init_tracing(&config);

    let auth_dir = config.resolve_auth_dir();
    if let Err(error) = std::fs::create_dir_all(&auth_dir).and_then(|_| std::fs::read_dir(&auth_dir).map(|_| ())) {
        tracing::error!(dir = %auth_dir.display(), error = %error, "auth directory is unreadable");
        return ExitCode::from(EXIT_AUTH_DIR_UNREADABLE);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(error = %error, "failed to start async runtime");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    runtime.block_on(run(config_path, config))
}

async fn run(config_path: PathBuf, config: Arc<AppConfig>) -> ExitCode {
    let store = Arc::new(AuthStore::new());
    let registry = Arc::new(ModelRegistry::new());
    let manager = Arc::new(Manager::new(store.clone(), registry.clone(), config.clone()));

    let shutdown = CancellationToken::new();
    let watcher = Watcher::new(
        config_path.clone(),
        config.clone(),
        store.clone(),
        registry.clone(),
        manager.clone(),
    );
    tokio::spawn(watcher.run(shutdown.clone()));
    let _recovery = manager.spawn_cooldown_recovery();

    let host = if config.host.is_empty() {
        "0.0.0.0"
    } else {
        config.host.as_str()
    };
    let addr = format!("{}:{}", host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!(addr, "port already in use");
            return ExitCode::from(EXIT_PORT_IN_USE);
        }
        Err(error) => {
            tracing::error!(addr, error = %error, "failed to bind listener");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    tracing::info!(addr, "gateway listening");

    let app = build_router(manager);
    let serve_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = serve_shutdown.cancelled() => {},
            }
        })
        .await;
    shutdown.cancel();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "server error");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}
