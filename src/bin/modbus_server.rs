//! Modbus debug server
//!
//! Usage: `modbus_server -f /path/to/modbus_server.json`

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use modbus_debug_server::config::ServerSettings;
use modbus_debug_server::logging::init_logger;
use modbus_debug_server::metrics_server::MetricsServer;
use modbus_debug_server::persistence::{load_snapshot, RegisterPersistence};
use modbus_debug_server::telemetry::{ModbusMetrics, NoopTelemetry, TelemetrySink};
use modbus_debug_server::utils::format::format_uptime;
use modbus_debug_server::utils::network::outbound_ip_address;
use modbus_debug_server::{ModbusServer, ModbusTcpServer, VERSION};

#[derive(Parser, Debug)]
#[command(name = "modbus_server", version, about = "Modbus TCP/UDP/TLS debug server")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(
        short = 'f',
        long = "config_file",
        env = "CONFIG_FILE",
        default_value = "/app/modbus_server.json"
    )]
    config_file: PathBuf,
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.config_file.is_file() {
        eprintln!("Configuration file {} not found", cli.config_file.display());
        std::process::exit(1);
    }

    let settings = ServerSettings::from_file(&cli.config_file)?;
    init_logger(settings.server.logging.level()).context("failed to initialise logging")?;
    settings.validate()?;

    info!("Starting Modbus TCP Server, v{}", VERSION);
    match outbound_ip_address() {
        Some(ip) => info!("Outbound IP address: {}", ip),
        None => warn!("Could not determine the outbound IP address"),
    }

    let persistence_config = &settings.server.persistence;
    let snapshot = if persistence_config.enabled {
        load_snapshot(&persistence_config.file)
            .with_context(|| format!("refusing to start without {}", persistence_config.file.display()))?
    } else {
        None
    };
    let store = Arc::new(settings.registers.build_store(snapshot.as_ref()));

    let metrics_shutdown = CancellationToken::new();
    let mut metrics_task = None;
    let telemetry: Arc<dyn TelemetrySink> = if settings.server.telemetry.enabled {
        let metrics = Arc::new(ModbusMetrics::new()?);
        let metrics_server = MetricsServer::bind(
            settings.server.telemetry.socket_addr()?,
            metrics.clone(),
            &settings.server.telemetry.path,
        )
        .await?;
        let token = metrics_shutdown.clone();
        metrics_task = Some(tokio::spawn(async move {
            if let Err(e) = metrics_server.run(token).await {
                error!("Metrics server failed: {}", e);
            }
        }));
        metrics
    } else {
        Arc::new(NoopTelemetry)
    };

    let mut server = ModbusTcpServer::with_config(settings.server_config()?, store.clone(), telemetry)?;
    server.start().await?;

    let persistence_shutdown = CancellationToken::new();
    let auto_save = if persistence_config.enabled {
        let persistence = Arc::new(RegisterPersistence::new(
            persistence_config.file.clone(),
            store,
            persistence_config.save_interval(),
        ));
        if let Some(snapshot) = snapshot {
            persistence.mark_saved(snapshot);
        }
        Some(persistence.spawn_auto_save(persistence_shutdown.clone()))
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    info!("Shutdown requested");

    server.stop().await?;

    persistence_shutdown.cancel();
    if let Some(task) = auto_save {
        if let Err(e) = task.await {
            error!("Auto-save task ended abnormally: {}", e);
        }
    }

    metrics_shutdown.cancel();
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            error!("Metrics server task ended abnormally: {}", e);
        }
    }

    let stats = server.get_stats();
    info!(
        "Served {} connections, {} requests, {} exception responses in {}",
        stats.connections_count,
        stats.total_requests,
        stats.exception_responses,
        format_uptime(Duration::from_secs(stats.uptime_seconds))
    );
    Ok(())
}
