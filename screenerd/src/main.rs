use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use screener_core::{load_screener_config, ReviewService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Screener review daemon", long_about = None)]
struct Cli {
    /// Path to screener.toml
    #[arg(long, default_value = "configs/screener.toml")]
    config: PathBuf,
    /// Override the configured HTTP bind address
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Promote debug logging to stdout
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] screener_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<(), DaemonError> {
    let mut config = load_screener_config(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.http.bind = bind;
    }
    if cli.debug {
        config.logging.debug = true;
    }
    init_tracing(config.logging.debug);

    let bind = config.http.bind;
    let service = Arc::new(ReviewService::new(config).await);
    service.spawn_ttl_sweeper();

    let app = screener_core::router(service.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, "screenerd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "screener_core=debug,screenerd=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Block until SIGINT/SIGTERM, then abort every transcoder and download so
/// no child outlives the daemon.
async fn shutdown_signal(service: Arc<ReviewService>) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown requested, aborting all sessions");
    service.abort_all().await;
}
