//! The oxcand daemon binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use oxcan_client::{SharedReceiver, SharedSender, TransferOptions};
use oxcan_common::{open_socketcan, NodeId};

use oxcand::bus::{BusIo, NodeStatus, RunSignal};
use oxcand::cache::FileCache;
use oxcand::config::DaemonConfig;
use oxcand::dict::{standard_dictionary, Identity};
use oxcand::file_transfer::register_file_transfer;
use oxcand::ipc::{self, Broadcaster, Responder};

const DEFAULT_CONFIG_PATH: &str = "/etc/oxcan/config.toml";

#[derive(Parser)]
#[command(about = "CANopen node daemon bridging local processes onto a CAN bus")]
struct Args {
    /// CAN interface (overrides the config file)
    #[arg(short, long)]
    interface: Option<String>,

    /// CANopen node id (overrides the config file)
    #[arg(short, long, value_parser = parse_node_id)]
    node_id: Option<u8>,

    /// Path to the config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_node_id(s: &str) -> Result<u8, String> {
    let value = match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())?;
    NodeId::new(value).map_err(|e| e.to_string())?;
    Ok(value)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    let mut config = match &args.config {
        Some(path) => match DaemonConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{e}");
                std::process::exit(1);
            }
        },
        None => {
            if std::path::Path::new(DEFAULT_CONFIG_PATH).is_file() {
                match DaemonConfig::load(DEFAULT_CONFIG_PATH) {
                    Ok(config) => config,
                    Err(e) => {
                        log::error!("{e}");
                        std::process::exit(1);
                    }
                }
            } else {
                DaemonConfig::default()
            }
        }
    };
    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    let node_id = match NodeId::new(config.node_id) {
        Ok(id) => id,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    log::info!(
        "starting oxcand {} on {} as node {}",
        env!("CARGO_PKG_VERSION"),
        config.interface,
        node_id
    );

    let cache_root = config.resolve_cache_root();
    let fread_cache = Arc::new(
        FileCache::new(cache_root.join("fread"), config.cache_capacity)
            .expect("failed to open fread cache"),
    );
    let fwrite_cache = Arc::new(
        FileCache::new(cache_root.join("fwrite"), config.cache_capacity)
            .expect("failed to open fwrite cache"),
    );
    log::info!("fread cache path: {}", fread_cache.root().display());
    log::info!("fwrite cache path: {}", fwrite_cache.root().display());

    let mut dict = standard_dictionary(
        config.device_type,
        Identity {
            vendor_id: config.identity.vendor_id,
            product_code: config.identity.product_code,
            revision: config.identity.revision,
            serial: config.identity.serial,
        },
        config.heartbeat_ms,
    );
    register_file_transfer(&mut dict, fread_cache.clone(), fwrite_cache.clone());
    let dict = Arc::new(dict);

    let transfer_opts = TransferOptions {
        response_timeout: Duration::from_millis(config.sdo_timeout_ms),
        block_mode: config.sdo_block_mode,
        ..Default::default()
    };

    let (signal, _) = watch::channel(RunSignal::Run);

    // Ctrl-C / SIGTERM raises the same shared signal the loops observe
    {
        let signal = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, shutting down");
                signal.send_replace(RunSignal::Shutdown);
            }
        });
    }

    loop {
        signal.send_replace(RunSignal::Run);

        // Wait for the interface to appear, as the daemon may start before
        // the CAN link is configured
        let (tx, rx) = loop {
            match open_socketcan(&config.interface, None) {
                Ok(pair) => break pair,
                Err(e) => {
                    if *signal.borrow() == RunSignal::Shutdown {
                        return;
                    }
                    log::warn!("can't open CAN interface {}: {e}", config.interface);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        };

        let sender = SharedSender::new(tx);
        let shared_rx = SharedReceiver::new(rx);
        let status = Arc::new(NodeStatus::new());
        let (event_tx, event_rx) = mpsc::channel(64);

        let bus = BusIo::new(
            node_id,
            sender.clone(),
            shared_rx.create_rx(),
            dict.clone(),
            status.clone(),
            event_tx,
            signal.clone(),
        );
        // The responder takes ownership of the receive fan-out; dropping it
        // after all loops join is what releases the socket
        let responder = Responder::new(
            node_id,
            dict.clone(),
            status.clone(),
            sender.clone(),
            shared_rx,
            config.tpdo_count,
            transfer_opts,
        );
        let broadcaster = Broadcaster::new(event_rx);

        let respond_socket = bind_ipc_socket(config.ipc.respond_port).await;
        let broadcast_socket = bind_ipc_socket(config.ipc.broadcast_port).await;
        let consume_socket = bind_ipc_socket(config.ipc.consume_port).await;

        let bus_task = tokio::spawn(bus.run());
        let responder_task = tokio::spawn(responder.run(respond_socket, signal.clone()));
        let broadcaster_task = tokio::spawn(broadcaster.run(broadcast_socket, signal.clone()));
        let consumer_task = tokio::spawn(ipc::consumer::run(consume_socket, signal.clone()));

        log::info!("running ...");

        // All four loops observe the signal and finish their current unit of
        // work; they must all be joined before the channel handles drop
        let (a, b, c, d) =
            tokio::join!(bus_task, responder_task, broadcaster_task, consumer_task);
        for result in [a, b, c, d] {
            if let Err(e) = result {
                log::error!("task panicked: {e}");
            }
        }

        match *signal.borrow() {
            RunSignal::Restart => {
                log::info!("communication reset");
                continue;
            }
            _ => break,
        }
    }

    log::info!("finished");
}

async fn bind_ipc_socket(port: u16) -> UdpSocket {
    UdpSocket::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|e| panic!("failed to bind IPC socket on port {port}: {e}"))
}
