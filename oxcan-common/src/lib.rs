//! Common functionality shared among the oxcan crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `oxcan-client`.
#![warn(missing_docs, missing_copy_implementations)]

pub mod constants;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use messages::{CanError, CanId, CanMessage};
pub use node_id::NodeId;
