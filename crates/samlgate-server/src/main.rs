use clap::Parser;
use samlgate_server::cli::Cli;
use samlgate_server::config::loader::load_config;
use samlgate_server::{GatewayServer, build_state, init_tracing};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let cli = Cli::parse();

    let cfg = match load_config(cli.config.as_deref(), &cli.overrides()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&cfg.logging.level, cfg.logging.format);
    tracing::info!(
        config = %cli.config.as_deref().map_or_else(|| "default".to_string(), |p| p.display().to_string()),
        root_url = %cfg.service.root_url,
        targets = cfg.backends.targets.len(),
        "Configuration loaded"
    );

    let state = match build_state(cfg) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Gateway initialization failed");
            std::process::exit(2);
        }
    };
    let server = match GatewayServer::bind(state).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Gateway initialization failed");
            std::process::exit(2);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    if let Err(err) = server.run(shutdown).await {
        tracing::error!(error = %err, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
