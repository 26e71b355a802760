//! oxcand — a CANopen node daemon for Linux
//!
//! The daemon multiplexes local host processes onto one CAN channel: it
//! answers dictionary reads/writes and proxied SDO transfers over a small
//! UDP IPC protocol, pushes bus events (emergencies, node state changes,
//! health snapshots) to subscribers, and serves two bounded file caches
//! through dictionary entries so remote peers can move whole files over SDO.
#![warn(missing_docs)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod dict;
pub mod file_transfer;
pub mod ipc;
pub mod sdo_server;
