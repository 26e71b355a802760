//! IPC broadcaster
//!
//! Pushes asynchronous bus events (emergencies, node state changes, periodic
//! health snapshots) out to local subscriber processes. A subscriber
//! registers by sending any datagram to the broadcast socket. Delivery is
//! fire-and-forget: with no subscribers an event is simply dropped, and a
//! subscriber whose address stops accepting datagrams is pruned.

use std::collections::HashSet;
use std::net::SocketAddr;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::bus::{BusEvent, RunSignal};
use crate::ipc::wire::IpcMessage;

/// The IPC broadcaster loop
pub struct Broadcaster {
    events: mpsc::Receiver<BusEvent>,
    subscribers: HashSet<SocketAddr>,
}

impl Broadcaster {
    /// Create a broadcaster draining the given event channel
    pub fn new(events: mpsc::Receiver<BusEvent>) -> Self {
        Self {
            events,
            subscribers: HashSet::new(),
        }
    }

    /// Forward events until the run signal leaves `Run`
    pub async fn run(mut self, socket: UdpSocket, signal: watch::Sender<RunSignal>) {
        let mut signal_rx = signal.subscribe();
        let mut buf = [0u8; 16];
        loop {
            if *signal_rx.borrow() != RunSignal::Run {
                break;
            }
            tokio::select! {
                _ = signal_rx.changed() => {}
                result = socket.recv_from(&mut buf) => {
                    if let Ok((_, peer)) = result {
                        if self.subscribers.insert(peer) {
                            log::info!("IPC subscriber registered: {peer}");
                        }
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.forward(&socket, event).await,
                        // The bus loop is gone; nothing more will arrive
                        None => break,
                    }
                }
            }
        }
        log::info!("broadcaster finished");
    }

    async fn forward(&mut self, socket: &UdpSocket, event: BusEvent) {
        let payload = encode_event(event).encode();

        let sends = self
            .subscribers
            .iter()
            .map(|peer| {
                let payload = &payload;
                async move { (*peer, socket.send_to(payload, peer).await) }
            })
            .collect::<Vec<_>>();

        for (peer, result) in join_all(sends).await {
            if result.is_err() {
                log::info!("dropping IPC subscriber {peer}");
                self.subscribers.remove(&peer);
            }
        }
    }
}

fn encode_event(event: BusEvent) -> IpcMessage {
    match event {
        BusEvent::Emcy { code, info, .. } => IpcMessage::Emcy { code, info },
        BusEvent::NodeState { node, state } => IpcMessage::Heartbeat { node, state },
        BusEvent::Status(snapshot) => IpcMessage::BusStatus(snapshot),
    }
}
