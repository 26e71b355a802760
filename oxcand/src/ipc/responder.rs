//! IPC responder
//!
//! Serves the synchronous request/reply side of the bridge: local dictionary
//! reads and writes, proxied SDO transfers against remote nodes, TPDO
//! transmission, and emergency generation. Each request is processed to full
//! completion — including any bus round trip — before the next datagram is
//! read, since the SDO channel supports only one in-flight transaction.

use std::io::Cursor;
use std::sync::Arc;

use oxcan_common::messages::{CanId, EmcyMessage, NmtState, TPDO_BASES};
use oxcan_common::objects::DataType;
use oxcan_common::sdo::AbortCode;
use oxcan_common::traits::AsyncCanSender;
use oxcan_common::{CanMessage, NodeId};
use oxcan_client::{SdoClient, SharedReceiver, SharedSender, TransferOptions};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::bus::{NodeStatus, RunSignal};
use crate::dict::Dictionary;
use crate::ipc::wire::{IpcMessage, WireError, MAX_VALUE_LEN};

/// The IPC responder loop
///
/// Owns the bus-side receive fan-out: each proxied SDO transfer gets a fresh
/// receive channel, created when the transfer starts and dropped when it
/// completes.
pub struct Responder<S: AsyncCanSender + Sync> {
    node_id: NodeId,
    dict: Arc<Dictionary>,
    status: Arc<NodeStatus>,
    sender: SharedSender<S>,
    bus_rx: SharedReceiver,
    tpdo_count: u8,
    transfer_opts: TransferOptions,
}

impl<S: AsyncCanSender + Sync> Responder<S> {
    /// Create a responder over the shared bus channel
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        dict: Arc<Dictionary>,
        status: Arc<NodeStatus>,
        sender: SharedSender<S>,
        bus_rx: SharedReceiver,
        tpdo_count: u8,
        transfer_opts: TransferOptions,
    ) -> Self {
        Self {
            node_id,
            dict,
            status,
            sender,
            bus_rx,
            tpdo_count,
            transfer_opts,
        }
    }

    /// Serve requests until the run signal leaves `Run`
    pub async fn run(mut self, socket: UdpSocket, signal: watch::Sender<RunSignal>) {
        let mut signal_rx = signal.subscribe();
        let mut buf = vec![0u8; 65536];
        loop {
            if *signal_rx.borrow() != RunSignal::Run {
                break;
            }
            tokio::select! {
                _ = signal_rx.changed() => {}
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => {
                            let reply = self.handle_request(&buf[0..len]).await;
                            if let Err(e) = socket.send_to(&reply, peer).await {
                                log::warn!("failed to send IPC reply to {peer}: {e}");
                            }
                        }
                        Err(e) => {
                            log::error!("IPC receive failed: {e}");
                        }
                    }
                }
            }
        }
        log::info!("responder finished");
    }

    /// Process one request into one reply
    ///
    /// A bad request never takes the loop down; it is answered with the
    /// matching error message.
    pub async fn handle_request(&mut self, data: &[u8]) -> Vec<u8> {
        let msg = match IpcMessage::decode(data) {
            Ok(msg) => msg,
            Err(WireError::UnknownId { id }) => {
                return IpcMessage::ErrorUnknownId { id }.encode()
            }
            Err(WireError::Length) => return IpcMessage::ErrorLength.encode(),
        };

        match msg {
            IpcMessage::OdRead {
                index, sub, dtype, ..
            } => match self.od_read(index, sub, dtype) {
                Ok(value) => IpcMessage::OdRead {
                    index,
                    sub,
                    dtype,
                    value,
                }
                .encode(),
                Err(code) => IpcMessage::ErrorOdAbort { code: code as u32 }.encode(),
            },
            IpcMessage::OdWrite {
                index,
                sub,
                dtype,
                value,
            } => match self.dict.write_value(index, sub, &value) {
                Ok(()) => IpcMessage::OdWrite {
                    index,
                    sub,
                    dtype,
                    value,
                }
                .encode(),
                Err(code) => IpcMessage::ErrorOdAbort { code: code as u32 }.encode(),
            },
            IpcMessage::SdoRead {
                node,
                index,
                sub,
                dtype,
                ..
            } => match self.sdo_read(node, index, sub, dtype).await {
                Ok(value) => IpcMessage::SdoRead {
                    node,
                    index,
                    sub,
                    dtype,
                    value,
                }
                .encode(),
                Err(code) => IpcMessage::ErrorSdoAbort { code }.encode(),
            },
            IpcMessage::SdoWrite {
                node,
                index,
                sub,
                dtype,
                value,
            } => match self.sdo_write(node, index, sub, &value).await {
                Ok(()) => IpcMessage::SdoWrite {
                    node,
                    index,
                    sub,
                    dtype,
                    value,
                }
                .encode(),
                Err(code) => IpcMessage::ErrorSdoAbort { code }.encode(),
            },
            IpcMessage::TpdoSend { num, data } => self.tpdo_send(num, &data).await,
            IpcMessage::Emcy { code, info } => {
                self.send_emcy(code, info).await;
                IpcMessage::Emcy { code, info }.encode()
            }
            // Broadcast and error kinds are never valid requests
            other => {
                let id = other.encode()[0];
                IpcMessage::ErrorUnknownId { id }.encode()
            }
        }
    }

    fn od_read(&self, index: u16, sub: u8, dtype: DataType) -> Result<Vec<u8>, AbortCode> {
        let value = self.dict.read_value(index, sub)?;
        if let Some(size) = dtype.fixed_size() {
            if value.len() != size {
                return Err(AbortCode::DataTypeMismatch);
            }
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(AbortCode::OutOfMemory);
        }
        Ok(value)
    }

    async fn sdo_read(
        &mut self,
        node: u8,
        index: u16,
        sub: u8,
        dtype: DataType,
    ) -> Result<Vec<u8>, u32> {
        let node = NodeId::new(node).map_err(|_| AbortCode::GeneralError as u32)?;
        let mut client =
            SdoClient::new_std(node.raw(), self.sender.clone(), self.bus_rx.create_rx());
        let mut value = Vec::new();
        client
            .upload_to(index, sub, &mut value, &self.transfer_opts)
            .await
            .map_err(|e| {
                log::warn!("SDO read from node {node} of 0x{index:04X}sub{sub} failed: {e}");
                e.abort_code().raw()
            })?;
        if let Some(size) = dtype.fixed_size() {
            if value.len() != size {
                return Err(AbortCode::DataTypeMismatch as u32);
            }
        }
        Ok(value)
    }

    async fn sdo_write(
        &mut self,
        node: u8,
        index: u16,
        sub: u8,
        value: &[u8],
    ) -> Result<(), u32> {
        let node = NodeId::new(node).map_err(|_| AbortCode::GeneralError as u32)?;
        let mut client =
            SdoClient::new_std(node.raw(), self.sender.clone(), self.bus_rx.create_rx());
        let mut source = Cursor::new(value);
        client
            .download_from(index, sub, &mut source, value.len() as u64, &self.transfer_opts)
            .await
            .map_err(|e| {
                log::warn!("SDO write to node {node} of 0x{index:04X}sub{sub} failed: {e}");
                e.abort_code().raw()
            })?;
        Ok(())
    }

    async fn tpdo_send(&mut self, num: u8, data: &[u8]) -> Vec<u8> {
        if num as usize >= TPDO_BASES.len() || num >= self.tpdo_count {
            return IpcMessage::ErrorTpdoNumber.encode();
        }
        // PDO traffic only exists in the operational state; the request is
        // still acknowledged so callers are not coupled to NMT timing
        if self.status.nmt_state() == NmtState::Operational {
            let cob_id = CanId::Std(TPDO_BASES[num as usize] + self.node_id.raw() as u16);
            let msg = CanMessage::new(cob_id, data);
            if self.sender.send(msg).await.is_err() {
                log::warn!("failed to transmit TPDO {num}");
            }
        } else {
            log::debug!("TPDO {num} requested outside operational state, not sent");
        }
        IpcMessage::TpdoSend {
            num,
            data: data.to_vec(),
        }
        .encode()
    }

    async fn send_emcy(&mut self, code: u16, info: u32) {
        let mut data = [0u8; 5];
        data[0..4].copy_from_slice(&info.to_le_bytes());
        let msg: CanMessage = EmcyMessage {
            node: self.node_id.raw(),
            error_code: code,
            error_register: self
                .dict
                .read_u8(oxcan_common::constants::object_ids::ERROR_REGISTER, 0)
                .unwrap_or(0),
            data,
        }
        .into();
        if self.sender.send(msg).await.is_err() {
            log::warn!("failed to transmit EMCY");
        }
    }
}
