use modelgate::admin::{PKG_NAME, VERSION};
use modelgate::config::{default_config_path, Config};
use modelgate::process::ProcessManager;
use modelgate::proxy::{ProxyServer, RequestRouter};
use modelgate::resolver::{ArtifactResolver, HfCacheResolver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelgate=info".parse().expect("valid log directive"))
                .add_directive("backend=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let resolver = match config.defaults.cache_dir {
        Some(ref dir) => HfCacheResolver::new(dir),
        None => HfCacheResolver::from_env(),
    };

    print_startup_banner(&config, &resolver);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let resolver: Arc<dyn ArtifactResolver> = Arc::new(resolver);
    let process_manager = ProcessManager::new(config.models.clone(), config.defaults.clone(), resolver);
    let router = Arc::new(RequestRouter::new(Arc::clone(&process_manager), &config.server));
    let server = ProxyServer::new(&config.server, router, shutdown_rx);

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or the server dying on its own
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = &mut server_handle => {
                error!("Proxy server exited unexpectedly");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = &mut server_handle => {
                error!("Proxy server exited unexpectedly");
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // No backend outlives the proxy, persistent ones included
    info!("Stopping all backends...");
    process_manager.stop_all(false).await;

    if !server_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, resolver: &HfCacheResolver) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        stream_chunk_size = config.server.stream_chunk_size,
        "Server configuration"
    );
    info!(
        command = %config.defaults.command,
        health_path = %config.defaults.health_path,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        health_check_interval_ms = config.defaults.health_check_interval_ms,
        shutdown_timeout_secs = config.defaults.shutdown_timeout_secs,
        "Backend defaults"
    );
    info!(cache = %resolver.root().display(), "Artifact cache");

    let mut names: Vec<&String> = config.models.keys().collect();
    names.sort();
    let persistent: Vec<&String> = names
        .iter()
        .copied()
        .filter(|name| config.models[*name].persist)
        .collect();
    info!(
        model_count = names.len(),
        models = ?names,
        persistent = ?persistent,
        "Configured models"
    );
}
