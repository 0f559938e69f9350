//! Smart Query - main entry point.

use std::path::PathBuf;

use clap::Parser;
use mimalloc::MiMalloc;

use smart_query::config::AppConfig;
use smart_query::logging::init_tracing;
use smart_query::server::create_app;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments. Flags override the loaded configuration.
#[derive(Parser, Debug)]
#[command(name = "smart-query")]
#[command(about = "Natural-language questions to validated ClickHouse SQL")]
#[command(version)]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "SMART_QUERY_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "SMART_QUERY_PORT")]
    port: Option<u16>,

    /// Log level.
    #[arg(long, env = "SMART_QUERY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Config file path.
    #[arg(short, long, env = "SMART_QUERY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging.level, config.logging.json)?;
    tracing::info!("Starting Smart Query v{}", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
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
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
