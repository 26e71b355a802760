//! Shared fixtures: an in-process "remote node" served over channel-backed
//! CAN endpoints, so protocol tests run without a bus.
#![allow(dead_code)]

use std::sync::Arc;

use oxcan_common::messages::{BusMessage, CanId, SDO_RESP_BASE};
use oxcan_common::traits::{AsyncCanReceiver, AsyncCanSender, CanSendError};
use oxcan_common::CanMessage;
use tokio::sync::mpsc;

use oxcand::cache::FileCache;
use oxcand::dict::{standard_dictionary, Dictionary, Identity};
use oxcand::file_transfer::register_file_transfer;
use oxcand::sdo_server::SdoServer;

pub struct ChanSender(pub mpsc::Sender<CanMessage>);

impl AsyncCanSender for ChanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.0.send(msg).await.map_err(|_| CanSendError(msg))
    }
}

pub struct ChanReceiver(pub mpsc::Receiver<CanMessage>);

#[derive(Debug)]
pub struct RecvClosed;

impl core::fmt::Display for RecvClosed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "channel closed")
    }
}
impl std::error::Error for RecvClosed {}

impl AsyncCanReceiver for ChanReceiver {
    type Error = RecvClosed;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        Ok(self.0.try_recv().ok())
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.0.recv().await.ok_or(RecvClosed)
    }
}

/// A remote node with file transfer records over its caches
pub struct RemoteNode {
    pub node_id: u8,
    pub dict: Arc<Dictionary>,
    pub fread: Arc<FileCache>,
    pub fwrite: Arc<FileCache>,
    pub fread_dir: tempfile::TempDir,
    pub fwrite_dir: tempfile::TempDir,
}

impl RemoteNode {
    pub fn new(node_id: u8) -> Self {
        let fread_dir = tempfile::tempdir().unwrap();
        let fwrite_dir = tempfile::tempdir().unwrap();
        let fread = Arc::new(FileCache::new(fread_dir.path(), 4).unwrap());
        let fwrite = Arc::new(FileCache::new(fwrite_dir.path(), 4).unwrap());

        let mut dict = standard_dictionary(
            0x1234,
            Identity {
                vendor_id: 0xCAFE,
                product_code: 7,
                revision: 1,
                serial: 99,
            },
            1000,
        );
        register_file_transfer(&mut dict, fread.clone(), fwrite.clone());

        Self {
            node_id,
            dict: Arc::new(dict),
            fread,
            fwrite,
            fread_dir,
            fwrite_dir,
        }
    }

    /// Spawn the node's SDO server loop, returning the client-side endpoints
    pub fn spawn(&self) -> (ChanSender, ChanReceiver) {
        let (client_tx, mut node_rx) = mpsc::channel::<CanMessage>(64);
        let (node_tx, client_rx) = mpsc::channel::<CanMessage>(64);

        let dict = self.dict.clone();
        let node_id = self.node_id;
        tokio::spawn(async move {
            let mut server = SdoServer::new();
            while let Some(msg) = node_rx.recv().await {
                let Ok(BusMessage::SdoRequest { node, req }) = BusMessage::try_from(msg) else {
                    continue;
                };
                if node != node_id {
                    continue;
                }
                if let Some(resp) = server.handle_request(&req, &dict) {
                    let cob_id = CanId::Std(SDO_RESP_BASE + node_id as u16);
                    if node_tx.send(resp.to_can_message(cob_id)).await.is_err() {
                        break;
                    }
                }
            }
        });

        (ChanSender(client_tx), ChanReceiver(client_rx))
    }
}
