//! A client library for talking to CANopen nodes
//!
//! The crate provides:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object
//!   dictionary via its SDO server, with expedited, segmented, and block
//!   transfers
//! - A streaming [transfer engine](SdoClient::upload_to) for moving
//!   arbitrary-length payloads (including whole files) between a remote
//!   dictionary entry and a local byte sink or source
//! - [SharedSender]/[SharedReceiver] utilities so several tasks can
//!   multiplex onto one physical CAN channel
//!
//! This library is based on tokio/async.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]

mod sdo_client;
mod shared;
mod transfer;

pub use oxcan_common as common;

pub use sdo_client::{SdoClient, SdoClientError};
pub use shared::{NoMsgError, SharedReceiver, SharedReceiverChannel, SharedSender};
pub use transfer::{EngineError, TransferOptions};
