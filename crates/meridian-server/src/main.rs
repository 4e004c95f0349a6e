mod config;
mod db;
mod geoip;
mod hub;
mod scheduler;
mod web;

use clap::Parser;
use config::ServerConfig;
use dotenv::dotenv;
use geoip::GeoIpService;
use hub::Hub;
use scheduler::Scheduler;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use web::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Meridian measurement controller", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging() {
    let file_appender = rolling::daily("logs", "server.log");
    let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false).json();
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();
    dotenv().ok();

    let args = Args::parse();
    let server_config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "failed to load server configuration");
            return Err(e.into());
        }
    };

    info!(port = server_config.http_port, "starting meridian server");

    let db = db::init_pool(Path::new(&server_config.database_path))?;
    info!(path = %server_config.database_path, "database initialized");

    let geoip = Arc::new(GeoIpService::new());
    let hub = Arc::new(Hub::new(
        db.clone(),
        geoip.clone(),
        server_config.shared_secret.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        hub.clone(),
        Duration::from_secs(server_config.scan_interval_secs.max(1)),
        shutdown_rx,
    ));
    tokio::spawn(scheduler.clone().run());

    let state = Arc::new(AppState {
        db,
        hub,
        scheduler,
        geoip,
        config: server_config.clone(),
    });
    let router = web::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "http server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    info!("server stopped");
    Ok(())
}
