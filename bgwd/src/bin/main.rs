use bgw_broker::{gateway, ClientSubscribe, ClientUnsubscribe, CloudEvent, ListDevices};
use bgwd::{config::GatewayConfig, GatewayDaemonError, GatewayDaemonResult};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc::unbounded_channel;
use tracing_appender::rolling;
use tracing_subscriber::FmtSubscriber;

use tracing_log::LogTracer;

const CLOUD_LOG_CLIENT: u32 = 0;

/// Gateway between BLE reader nodes and the cloud
#[derive(Parser)]
#[command(name = "ble-gateway")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the node listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[actix::main]
async fn main() -> GatewayDaemonResult<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    let options = config.gateway_options()?;

    LogTracer::init().map_err(|e| GatewayDaemonError::Logging(e.to_string()))?;

    let log = rolling::daily(&config.log_dir, "gateway");
    let (nb, _guard) = tracing_appender::non_blocking(log);

    let sub = FmtSubscriber::builder()
        .with_max_level(config.max_level()?)
        .with_writer(nb)
        .finish();

    tracing::subscriber::set_global_default(sub)
        .map_err(|e| GatewayDaemonError::Logging(e.to_string()))?;

    let handle = gateway(options).await.map_err(|e| {
        log::error!("Error creating gateway & handle {e:}");
        e
    })?;

    let (cloud_tx, mut cloud_rx) = unbounded_channel();
    handle
        .send(ClientSubscribe {
            id: CLOUD_LOG_CLIENT,
            cloud_events: cloud_tx,
        })
        .await??;

    loop {
        tokio::select! {
            Some(event) = cloud_rx.recv() => match event {
                CloudEvent::Alert { address, node_id, kind, .. } => {
                    log::warn!("{kind:?} alert for {address:} via {node_id:}");
                }
                CloudEvent::Telemetry(t) => {
                    log::debug!("{} via {}: {:?}", t.address, t.node_id, t.data);
                }
                other => log::info!("{other:?}"),
            },
            res = tokio::signal::ctrl_c() => {
                res?;
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    let devices = handle.send(ListDevices).await??;
    log::info!("{} device(s) known at shutdown", devices.len());
    handle
        .send(ClientUnsubscribe {
            id: CLOUD_LOG_CLIENT,
        })
        .await??;

    Ok(())
}
