//! The bus I/O loop
//!
//! Owns this node's presence on the bus: answers SDO requests against the
//! local dictionary, obeys NMT commands, produces the heartbeat, tracks the
//! other nodes' heartbeats, and turns emergency frames and state changes into
//! events for the IPC broadcaster. Events flow through a bounded channel;
//! when the broadcaster falls behind, events are dropped rather than stalling
//! bus processing.

use std::collections::HashMap;

use crossbeam::atomic::AtomicCell;
use oxcan_common::constants::object_ids;
use oxcan_common::messages::{
    BusMessage, CanId, NmtCommandCmd, NmtState, SDO_RESP_BASE,
};
use oxcan_common::traits::{AsyncCanReceiver, AsyncCanSender};
use oxcan_common::{CanMessage, NodeId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

use crate::dict::Dictionary;
use crate::sdo_server::SdoServer;

/// How the daemon's loops should proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    /// Keep serving
    Run,
    /// Tear down communications and start over
    Restart,
    /// Exit the process
    Shutdown,
}

/// Shared view of this node's own state
///
/// Written by the bus loop, read by the IPC responder (which must not
/// transmit PDOs outside the operational state).
pub struct NodeStatus {
    state: AtomicCell<NmtState>,
}

impl NodeStatus {
    /// Create with the initial state
    pub fn new() -> Self {
        Self {
            state: AtomicCell::new(NmtState::Bootup),
        }
    }

    /// This node's current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.state.load()
    }

    fn set(&self, state: NmtState) {
        self.state.store(state);
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically recomputed bus health numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatusSnapshot {
    /// This node's NMT state
    pub state: NmtState,
    /// Emergency frames seen since startup
    pub emcy_count: u32,
    /// Malformed or error frames seen since startup
    pub error_count: u32,
    /// Number of distinct nodes seen producing heartbeats
    pub node_count: u8,
}

/// An asynchronous bus occurrence pushed out to IPC subscribers
#[derive(Debug, Clone, Copy)]
pub enum BusEvent {
    /// A node raised an emergency
    Emcy {
        /// Producing node
        node: u8,
        /// Standardized error code
        code: u16,
        /// Manufacturer specific info
        info: u32,
    },
    /// A tracked node's heartbeat reported a new NMT state
    NodeState {
        /// The node whose state changed
        node: u8,
        /// The new state
        state: NmtState,
    },
    /// The periodic health snapshot
    Status(BusStatusSnapshot),
}

/// Interval between health snapshots
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// The bus I/O loop
pub struct BusIo<S, R> {
    node_id: NodeId,
    sender: S,
    receiver: R,
    dict: Arc<Dictionary>,
    status: Arc<NodeStatus>,
    events: mpsc::Sender<BusEvent>,
    signal: watch::Sender<RunSignal>,
    server: SdoServer,
    node_states: HashMap<u8, NmtState>,
    emcy_count: u32,
    error_count: u32,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> BusIo<S, R> {
    /// Create the loop
    ///
    /// `signal` is the process-wide run signal: the loop observes it for
    /// shutdown and raises it when an NMT reset command arrives.
    pub fn new(
        node_id: NodeId,
        sender: S,
        receiver: R,
        dict: Arc<Dictionary>,
        status: Arc<NodeStatus>,
        events: mpsc::Sender<BusEvent>,
        signal: watch::Sender<RunSignal>,
    ) -> Self {
        Self {
            node_id,
            sender,
            receiver,
            dict,
            status,
            events,
            signal,
            server: SdoServer::new(),
            node_states: HashMap::new(),
            emcy_count: 0,
            error_count: 0,
        }
    }

    /// Drive the bus until the run signal leaves `Run`
    ///
    /// Each iteration handles exactly one unit of work (one message or one
    /// timer tick) to completion before the signal is observed again.
    pub async fn run(mut self) {
        let mut signal_rx = self.signal.subscribe();

        // Nodes come up in pre-operational and announce it with a boot-up
        // heartbeat
        self.set_own_state(NmtState::Bootup);
        self.send_heartbeat().await;
        self.set_own_state(NmtState::PreOperational);

        let mut next_heartbeat = Instant::now() + self.heartbeat_period();
        let mut next_status = Instant::now() + STATUS_INTERVAL;

        loop {
            if *signal_rx.borrow() != RunSignal::Run {
                break;
            }
            tokio::select! {
                _ = signal_rx.changed() => {}
                result = self.receiver.recv() => {
                    match result {
                        Ok(msg) => self.handle_message(msg).await,
                        Err(e) => {
                            log::error!("bus receive failed: {e}");
                            self.error_count += 1;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    self.send_heartbeat().await;
                    // The period re-reads object 0x1017, so dictionary
                    // writes take effect at the next beat
                    next_heartbeat = Instant::now() + self.heartbeat_period();
                }
                _ = tokio::time::sleep_until(next_status) => {
                    self.publish(BusEvent::Status(self.snapshot()));
                    next_status = Instant::now() + STATUS_INTERVAL;
                }
            }
        }
        log::info!("bus loop finished");
    }

    fn heartbeat_period(&self) -> Duration {
        let ms = self.dict
            .read_u16(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .unwrap_or(0);
        if ms == 0 {
            // Heartbeat production disabled
            Duration::from_secs(3600)
        } else {
            Duration::from_millis(ms as u64)
        }
    }

    /// The current health numbers
    pub fn snapshot(&self) -> BusStatusSnapshot {
        BusStatusSnapshot {
            state: self.status.nmt_state(),
            emcy_count: self.emcy_count,
            error_count: self.error_count,
            node_count: self.node_states.len() as u8,
        }
    }

    fn set_own_state(&mut self, state: NmtState) {
        if self.status.nmt_state() != state {
            log::info!("node {} entering {state}", self.node_id);
            self.status.set(state);
        }
    }

    async fn send_heartbeat(&mut self) {
        let msg: CanMessage = oxcan_common::messages::Heartbeat {
            node: self.node_id.raw(),
            toggle: false,
            state: self.status.nmt_state(),
        }
        .into();
        if self.sender.send(msg).await.is_err() {
            log::warn!("failed to send heartbeat");
            self.error_count += 1;
        }
    }

    async fn handle_message(&mut self, msg: CanMessage) {
        let msg = match BusMessage::try_from(msg) {
            Ok(msg) => msg,
            Err(oxcan_common::messages::MessageError::UnrecognizedId { .. }) => {
                // PDO and other traffic this node does not consume
                return;
            }
            Err(e) => {
                log::debug!("dropping malformed message: {e}");
                self.error_count += 1;
                return;
            }
        };

        match msg {
            BusMessage::NmtCommand(cmd) => {
                if cmd.node == 0 || cmd.node == self.node_id.raw() {
                    self.handle_nmt_command(cmd.cmd);
                }
            }
            BusMessage::Heartbeat(hb) => {
                if hb.node != self.node_id.raw() {
                    self.track_heartbeat(hb.node, hb.state);
                }
            }
            BusMessage::Emcy(emcy) => {
                self.emcy_count += 1;
                log::info!(
                    "EMCY from node {}: code 0x{:04X} register 0x{:02X}",
                    emcy.node,
                    emcy.error_code,
                    emcy.error_register
                );
                self.publish(BusEvent::Emcy {
                    node: emcy.node,
                    code: emcy.error_code,
                    info: emcy.info(),
                });
            }
            BusMessage::SdoRequest { node, req } => {
                if node != self.node_id.raw() {
                    return;
                }
                // SDO service is not available in the stopped state
                if self.status.nmt_state() == NmtState::Stopped {
                    return;
                }
                if let Some(resp) = self.server.handle_request(&req, &self.dict) {
                    let cob_id = CanId::Std(SDO_RESP_BASE + self.node_id.raw() as u16);
                    if self.sender.send(resp.to_can_message(cob_id)).await.is_err() {
                        log::warn!("failed to send SDO response");
                        self.error_count += 1;
                    }
                }
            }
            BusMessage::SdoResponse { .. } => {
                // Responses to this daemon's own client transfers are
                // consumed from the responder's receive channel
            }
        }
    }

    fn handle_nmt_command(&mut self, cmd: NmtCommandCmd) {
        match cmd {
            NmtCommandCmd::Start => self.set_own_state(NmtState::Operational),
            NmtCommandCmd::Stop => self.set_own_state(NmtState::Stopped),
            NmtCommandCmd::EnterPreOp => self.set_own_state(NmtState::PreOperational),
            NmtCommandCmd::ResetApp | NmtCommandCmd::ResetComm => {
                log::info!("NMT reset commanded, restarting communications");
                self.signal.send_replace(RunSignal::Restart);
            }
        }
    }

    fn track_heartbeat(&mut self, node: u8, state: NmtState) {
        let changed = self.node_states.insert(node, state) != Some(state);
        if changed {
            log::info!("node {node} reported {state}");
            self.publish(BusEvent::NodeState { node, state });
        }
    }

    fn publish(&self, event: BusEvent) {
        // Telemetry: dropped events are acceptable, a stalled bus loop is not
        if let Err(e) = self.events.try_send(event) {
            log::warn!("dropping bus event: {e}");
        }
    }
}
