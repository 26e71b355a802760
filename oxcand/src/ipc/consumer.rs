//! IPC consumer
//!
//! Accepts administrative commands from local processes. Commands that
//! require tearing communications down do not act alone: they raise the
//! shared run signal, so the bus loop, responder, and broadcaster all observe
//! the same termination point.

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::bus::RunSignal;

/// Administrative command bytes
pub mod commands {
    /// Tear down and re-initialize communications
    pub const RESTART_COMMS: u8 = 0x01;
    /// Stop the daemon
    pub const SHUTDOWN: u8 = 0x02;
}

/// Serve administrative commands until the run signal leaves `Run`
pub async fn run(socket: UdpSocket, signal: watch::Sender<RunSignal>) {
    let mut signal_rx = signal.subscribe();
    let mut buf = [0u8; 16];
    loop {
        if *signal_rx.borrow() != RunSignal::Run {
            break;
        }
        tokio::select! {
            _ = signal_rx.changed() => {}
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        log::error!("IPC consume receive failed: {e}");
                        continue;
                    }
                };
                if len == 0 {
                    continue;
                }
                match buf[0] {
                    commands::RESTART_COMMS => {
                        log::info!("restart commanded by {peer}");
                        signal.send_replace(RunSignal::Restart);
                    }
                    commands::SHUTDOWN => {
                        log::info!("shutdown commanded by {peer}");
                        signal.send_replace(RunSignal::Shutdown);
                    }
                    cmd => {
                        log::warn!("unknown admin command 0x{cmd:02X} from {peer}");
                    }
                }
            }
        }
    }
    log::info!("consumer finished");
}
