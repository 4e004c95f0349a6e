mod config;
mod executors;
mod geoip;
mod identity;
mod session;
mod worker;

use clap::Parser;
use config::ProbeConfig;
use session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::WorkerPool;

#[derive(Parser, Debug)]
#[command(author, version, about = "Meridian measurement probe", long_about = None)]
struct Args {
    /// Path to the probe config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meridian_probe=info")),
        )
        .init();
}

/// Keep only capabilities whose backing tool is actually installed.
fn filter_capabilities(capabilities: Vec<String>, has_tool: impl Fn(&str) -> bool) -> Vec<String> {
    capabilities
        .into_iter()
        .filter(|cap| match cap.as_str() {
            meridian_proto::TASK_ICMP_PING => has_tool("ping"),
            meridian_proto::TASK_TRACEROUTE => has_tool("traceroute"),
            meridian_proto::TASK_BIRD_ROUTE => has_tool("birdc"),
            _ => true,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();

    let args = Args::parse();
    let mut cfg = ProbeConfig::load(&args.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        ProbeConfig::default()
    });

    info!(name = %cfg.probe.name, server = %cfg.server.url, "starting probe");

    let mut metadata: HashMap<String, String> = HashMap::new();
    metadata.insert("os".to_string(), std::env::consts::OS.to_string());
    metadata.insert("arch".to_string(), std::env::consts::ARCH.to_string());

    // Where are we, as seen from the internet. Detection failures are not
    // fatal: the configured location simply stands.
    match geoip::detect().await {
        Ok(info) => {
            info!(ip = %info.ip, city = %info.city, country = %info.country, "auto-detected location");
            cfg.probe.location = format!("{}, {}", info.city, info.country);
            cfg.probe.region = info.country.clone();
            cfg.probe.latitude = Some(info.latitude);
            cfg.probe.longitude = Some(info.longitude);
            if !info.asn.is_empty() {
                metadata.insert("asn".to_string(), info.asn);
            }
            if !info.isp.is_empty() {
                metadata.insert("isp".to_string(), info.isp);
            }
        }
        Err(e) => warn!(error = %e, "failed to auto-detect location"),
    }
    if let Some(lat) = cfg.probe.latitude {
        metadata.insert("latitude".to_string(), lat.to_string());
    }
    if let Some(lon) = cfg.probe.longitude {
        metadata.insert("longitude".to_string(), lon.to_string());
    }

    // The HTTP executor needs no external tool, so every probe offers it.
    if !cfg
        .capabilities
        .iter()
        .any(|c| c == meridian_proto::TASK_HTTP_TEST)
    {
        cfg.capabilities
            .push(meridian_proto::TASK_HTTP_TEST.to_string());
    }
    cfg.capabilities =
        filter_capabilities(cfg.capabilities.clone(), |tool| which::which(tool).is_ok());
    info!(capabilities = ?cfg.capabilities, "effective capabilities");

    let probe_id = identity::load_or_create(&identity::probe_id_path())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let pool = WorkerPool::new(cfg.executor.max_concurrent_tasks, outbound_tx);

    let session = Arc::new(Session::new(
        cfg,
        probe_id,
        metadata,
        pool,
        shutdown_rx,
    ));
    let session_task = tokio::spawn(session.run(outbound_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), session_task).await;

    info!("probe stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_without_tools_are_dropped() {
        let caps = vec![
            "icmp_ping".to_string(),
            "tcp_ping".to_string(),
            "traceroute".to_string(),
            "bird_route".to_string(),
            "http_test".to_string(),
        ];
        let filtered = filter_capabilities(caps, |tool| tool == "ping");
        assert_eq!(filtered, vec!["icmp_ping", "tcp_ping", "http_test"]);
    }

    #[test]
    fn unknown_capabilities_pass_through() {
        let filtered = filter_capabilities(vec!["custom_check".to_string()], |_| false);
        assert_eq!(filtered, vec!["custom_check"]);
    }
}
