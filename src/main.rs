use clap::{Arg, Command};
use oci_proxy::{
    config::Config,
    logging,
    proxy::ProxyServer,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Interval between background cache persistence runs; a clean dirty flag
/// makes each run a no-op.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("oci-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Caching reverse proxy for OCI container registries")
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("PATH")
                .default_value("config.yaml")
                .help("path to config file"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            logging::init("info");
            error!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level);

    info!(
        "starting OCI proxy v{} (built: {}): port={} default_registry={}",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP"),
        config.port,
        config.default_registry
    );

    // Bind to [::] for IPv6 dual-stack (accepts both IPv4 and IPv6)
    let addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to listen on {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = Arc::new(ProxyServer::new(config.clone()));

    let mut shutdown_coordinator = ShutdownCoordinator::new(SHUTDOWN_GRACE);
    shutdown_coordinator.set_cache_manager(server.cache_manager());

    // Background cache persistence so a crash loses at most one interval of
    // LRU ordering.
    let persist_caches = server.cache_manager();
    let mut persist_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PERSIST_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => persist_caches.persist_all().await,
                _ = persist_shutdown.wait_for_shutdown() => break,
            }
        }
    });

    let server_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(listener, server_shutdown).await {
            error!("proxy server failed: {e}");
        }
    });

    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("shutdown coordinator failed: {e}");
    }
    server_task.await.ok();

    info!("server gracefully stopped");
    ExitCode::SUCCESS
}
