//! IPC wire format
//!
//! Every message is a packed, little-endian struct whose first byte is the
//! kind tag, so its expected length is determined by the tag (plus, for
//! dictionary access, the data type tag). Requests and replies share kinds:
//! a read reply echoes the request header followed by the value bytes, and a
//! successful write is acknowledged by echoing the request.

use oxcan_common::messages::NmtState;
use oxcan_common::objects::DataType;
use snafu::Snafu;

use crate::bus::BusStatusSnapshot;

/// Message kind tags
pub mod tags {
    /// Send or report an emergency
    pub const EMCY: u8 = 0x00;
    /// Trigger a TPDO transmission
    pub const TPDO_SEND: u8 = 0x01;
    /// Read a local dictionary entry
    pub const OD_READ: u8 = 0x02;
    /// Write a local dictionary entry
    pub const OD_WRITE: u8 = 0x03;
    /// Read a remote node's dictionary entry over SDO
    pub const SDO_READ: u8 = 0x04;
    /// Write a remote node's dictionary entry over SDO
    pub const SDO_WRITE: u8 = 0x05;
    /// A tracked node's NMT state changed
    pub const HEARTBEAT: u8 = 0x06;
    /// Periodic bus health snapshot
    pub const BUS_STATUS: u8 = 0x07;
    /// The request's kind tag is not recognized
    pub const ERROR_UNKNOWN_ID: u8 = 0x80;
    /// The request is shorter than its kind requires
    pub const ERROR_LENGTH: u8 = 0x81;
    /// The requested TPDO is not configured
    pub const ERROR_TPDO_NUM: u8 = 0x82;
    /// A local dictionary access was rejected
    pub const ERROR_OD_ABORT: u8 = 0x83;
    /// A remote SDO transfer failed
    pub const ERROR_SDO_ABORT: u8 = 0x84;
}

/// The largest value payload accepted or produced in one message
pub const MAX_VALUE_LEN: usize = 60000;

/// Errors raised while decoding an IPC message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum WireError {
    /// The kind tag is not recognized
    #[snafu(display("Unknown IPC message id 0x{id:02X}"))]
    UnknownId {
        /// The offending tag byte
        id: u8,
    },
    /// The message length does not fit its kind (or its declared data type)
    #[snafu(display("IPC message length does not match its kind"))]
    Length,
}

type Result<T> = std::result::Result<T, WireError>;

/// A message exchanged over the local IPC sockets
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    /// An emergency: a request to raise one, or a broadcast of a received one
    Emcy {
        /// Standardized error code
        code: u16,
        /// Manufacturer specific info
        info: u32,
    },
    /// Trigger transmission of a configured TPDO
    TpdoSend {
        /// TPDO number, starting from 0
        num: u8,
        /// PDO payload, up to 8 bytes
        data: Vec<u8>,
    },
    /// Local dictionary read; the reply carries the value
    OdRead {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Expected data type of the value
        dtype: DataType,
        /// Value bytes; empty in a request
        value: Vec<u8>,
    },
    /// Local dictionary write
    OdWrite {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Data type of the value
        dtype: DataType,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Remote dictionary read over SDO; the reply carries the value
    SdoRead {
        /// Target node
        node: u8,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Expected data type of the value
        dtype: DataType,
        /// Value bytes; empty in a request
        value: Vec<u8>,
    },
    /// Remote dictionary write over SDO
    SdoWrite {
        /// Target node
        node: u8,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Data type of the value
        dtype: DataType,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Broadcast: a tracked node's NMT state
    Heartbeat {
        /// The reporting node
        node: u8,
        /// Its new state
        state: NmtState,
    },
    /// Broadcast: periodic health snapshot
    BusStatus(BusStatusSnapshot),
    /// Reply: unknown kind tag
    ErrorUnknownId {
        /// The unrecognized tag
        id: u8,
    },
    /// Reply: request too short for its kind
    ErrorLength,
    /// Reply: TPDO number out of range
    ErrorTpdoNumber,
    /// Reply: local dictionary access rejected with an abort code
    ErrorOdAbort {
        /// The abort code
        code: u32,
    },
    /// Reply: remote SDO transfer failed with an abort code
    ErrorSdoAbort {
        /// The abort code
        code: u32,
    },
}

impl IpcMessage {
    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IpcMessage::Emcy { code, info } => {
                let mut out = vec![tags::EMCY];
                out.extend_from_slice(&code.to_le_bytes());
                out.extend_from_slice(&info.to_le_bytes());
                out
            }
            IpcMessage::TpdoSend { num, data } => {
                let mut out = vec![tags::TPDO_SEND, *num, data.len() as u8];
                out.extend_from_slice(data);
                out
            }
            IpcMessage::OdRead {
                index,
                sub,
                dtype,
                value,
            } => encode_od(tags::OD_READ, *index, *sub, *dtype, value),
            IpcMessage::OdWrite {
                index,
                sub,
                dtype,
                value,
            } => encode_od(tags::OD_WRITE, *index, *sub, *dtype, value),
            IpcMessage::SdoRead {
                node,
                index,
                sub,
                dtype,
                value,
            } => encode_sdo(tags::SDO_READ, *node, *index, *sub, *dtype, value),
            IpcMessage::SdoWrite {
                node,
                index,
                sub,
                dtype,
                value,
            } => encode_sdo(tags::SDO_WRITE, *node, *index, *sub, *dtype, value),
            IpcMessage::Heartbeat { node, state } => {
                vec![tags::HEARTBEAT, *node, *state as u8]
            }
            IpcMessage::BusStatus(snapshot) => {
                let mut out = vec![tags::BUS_STATUS, snapshot.state as u8];
                out.extend_from_slice(&snapshot.emcy_count.to_le_bytes());
                out.extend_from_slice(&snapshot.error_count.to_le_bytes());
                out.push(snapshot.node_count);
                out
            }
            IpcMessage::ErrorUnknownId { id } => vec![tags::ERROR_UNKNOWN_ID, *id],
            IpcMessage::ErrorLength => vec![tags::ERROR_LENGTH],
            IpcMessage::ErrorTpdoNumber => vec![tags::ERROR_TPDO_NUM],
            IpcMessage::ErrorOdAbort { code } => {
                let mut out = vec![tags::ERROR_OD_ABORT];
                out.extend_from_slice(&code.to_le_bytes());
                out
            }
            IpcMessage::ErrorSdoAbort { code } => {
                let mut out = vec![tags::ERROR_SDO_ABORT];
                out.extend_from_slice(&code.to_le_bytes());
                out
            }
        }
    }

    /// Decode wire bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let tag = *data.first().ok_or(WireError::Length)?;
        match tag {
            tags::EMCY => {
                check_len(data, 7)?;
                Ok(IpcMessage::Emcy {
                    code: u16::from_le_bytes(data[1..3].try_into().unwrap()),
                    info: u32::from_le_bytes(data[3..7].try_into().unwrap()),
                })
            }
            tags::TPDO_SEND => {
                check_len(data, 3)?;
                let num = data[1];
                let len = data[2] as usize;
                if len > 8 {
                    return Err(WireError::Length);
                }
                check_len(data, 3 + len)?;
                Ok(IpcMessage::TpdoSend {
                    num,
                    data: data[3..3 + len].to_vec(),
                })
            }
            tags::OD_READ => {
                let (index, sub, dtype, value) = decode_od(data)?;
                Ok(IpcMessage::OdRead {
                    index,
                    sub,
                    dtype,
                    value,
                })
            }
            tags::OD_WRITE => {
                let (index, sub, dtype, value) = decode_od(data)?;
                Ok(IpcMessage::OdWrite {
                    index,
                    sub,
                    dtype,
                    value,
                })
            }
            tags::SDO_READ => {
                let (node, index, sub, dtype, value) = decode_sdo(data)?;
                Ok(IpcMessage::SdoRead {
                    node,
                    index,
                    sub,
                    dtype,
                    value,
                })
            }
            tags::SDO_WRITE => {
                let (node, index, sub, dtype, value) = decode_sdo(data)?;
                Ok(IpcMessage::SdoWrite {
                    node,
                    index,
                    sub,
                    dtype,
                    value,
                })
            }
            tags::HEARTBEAT => {
                check_len(data, 3)?;
                let state = NmtState::try_from(data[2]).map_err(|_| WireError::Length)?;
                Ok(IpcMessage::Heartbeat {
                    node: data[1],
                    state,
                })
            }
            tags::BUS_STATUS => {
                check_len(data, 11)?;
                let state = NmtState::try_from(data[1]).map_err(|_| WireError::Length)?;
                Ok(IpcMessage::BusStatus(BusStatusSnapshot {
                    state,
                    emcy_count: u32::from_le_bytes(data[2..6].try_into().unwrap()),
                    error_count: u32::from_le_bytes(data[6..10].try_into().unwrap()),
                    node_count: data[10],
                }))
            }
            tags::ERROR_UNKNOWN_ID => {
                check_len(data, 2)?;
                Ok(IpcMessage::ErrorUnknownId { id: data[1] })
            }
            tags::ERROR_LENGTH => Ok(IpcMessage::ErrorLength),
            tags::ERROR_TPDO_NUM => Ok(IpcMessage::ErrorTpdoNumber),
            tags::ERROR_OD_ABORT => {
                check_len(data, 5)?;
                Ok(IpcMessage::ErrorOdAbort {
                    code: u32::from_le_bytes(data[1..5].try_into().unwrap()),
                })
            }
            tags::ERROR_SDO_ABORT => {
                check_len(data, 5)?;
                Ok(IpcMessage::ErrorSdoAbort {
                    code: u32::from_le_bytes(data[1..5].try_into().unwrap()),
                })
            }
            id => Err(WireError::UnknownId { id }),
        }
    }
}

fn check_len(data: &[u8], wanted: usize) -> Result<()> {
    if data.len() < wanted {
        Err(WireError::Length)
    } else {
        Ok(())
    }
}

fn encode_od(tag: u8, index: u16, sub: u8, dtype: DataType, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&index.to_le_bytes());
    out.push(sub);
    out.push(dtype as u8);
    out.extend_from_slice(value);
    out
}

fn encode_sdo(tag: u8, node: u8, index: u16, sub: u8, dtype: DataType, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag, node];
    out.extend_from_slice(&index.to_le_bytes());
    out.push(sub);
    out.push(dtype as u8);
    out.extend_from_slice(value);
    out
}

fn decode_od(data: &[u8]) -> Result<(u16, u8, DataType, Vec<u8>)> {
    check_len(data, 5)?;
    let index = u16::from_le_bytes(data[1..3].try_into().unwrap());
    let sub = data[3];
    let dtype = DataType::try_from(data[4]).map_err(|_| WireError::Length)?;
    let value = decode_value(dtype, &data[5..])?;
    Ok((index, sub, dtype, value))
}

fn decode_sdo(data: &[u8]) -> Result<(u8, u16, u8, DataType, Vec<u8>)> {
    check_len(data, 6)?;
    let node = data[1];
    let index = u16::from_le_bytes(data[2..4].try_into().unwrap());
    let sub = data[4];
    let dtype = DataType::try_from(data[5]).map_err(|_| WireError::Length)?;
    let value = decode_value(dtype, &data[6..])?;
    Ok((node, index, sub, dtype, value))
}

/// Validate a value payload against its declared data type
///
/// Fixed-size types must be absent (a read request) or exactly their size;
/// string and domain payloads are variable.
fn decode_value(dtype: DataType, value: &[u8]) -> Result<Vec<u8>> {
    if value.len() > MAX_VALUE_LEN {
        return Err(WireError::Length);
    }
    if let Some(size) = dtype.fixed_size() {
        if !value.is_empty() && value.len() != size {
            return Err(WireError::Length);
        }
    }
    Ok(value.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msgs = [
            IpcMessage::Emcy {
                code: 0x8110,
                info: 42,
            },
            IpcMessage::TpdoSend {
                num: 2,
                data: vec![1, 2, 3],
            },
            IpcMessage::OdRead {
                index: 0x3004,
                sub: 1,
                dtype: DataType::UInt8,
                value: vec![],
            },
            IpcMessage::OdWrite {
                index: 0x3004,
                sub: 3,
                dtype: DataType::VisibleString,
                value: b"file.txt".to_vec(),
            },
            IpcMessage::SdoRead {
                node: 0x10,
                index: 0x1018,
                sub: 4,
                dtype: DataType::UInt32,
                value: vec![],
            },
            IpcMessage::SdoWrite {
                node: 0x10,
                index: 0x1017,
                sub: 0,
                dtype: DataType::UInt16,
                value: 1000u16.to_le_bytes().to_vec(),
            },
            IpcMessage::Heartbeat {
                node: 5,
                state: NmtState::Operational,
            },
            IpcMessage::ErrorUnknownId { id: 0x42 },
            IpcMessage::ErrorLength,
            IpcMessage::ErrorTpdoNumber,
            IpcMessage::ErrorOdAbort { code: 0x0601_0002 },
            IpcMessage::ErrorSdoAbort { code: 0x0800_0000 },
        ];
        for msg in msgs {
            let bytes = msg.encode();
            assert_eq!(msg, IpcMessage::decode(&bytes).unwrap(), "bytes: {bytes:02x?}");
        }
    }

    #[test]
    fn test_bus_status_roundtrip() {
        let msg = IpcMessage::BusStatus(BusStatusSnapshot {
            state: NmtState::PreOperational,
            emcy_count: 3,
            error_count: 1,
            node_count: 7,
        });
        match IpcMessage::decode(&msg.encode()).unwrap() {
            IpcMessage::BusStatus(s) => {
                assert_eq!(NmtState::PreOperational, s.state);
                assert_eq!(3, s.emcy_count);
                assert_eq!(1, s.error_count);
                assert_eq!(7, s.node_count);
            }
            other => panic!("Expected BusStatus, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(
            Err(WireError::UnknownId { id: 0x55 }),
            IpcMessage::decode(&[0x55, 0, 0])
        );
    }

    #[test]
    fn test_short_payloads() {
        assert_eq!(Err(WireError::Length), IpcMessage::decode(&[]));
        // EMCY needs 7 bytes
        assert_eq!(Err(WireError::Length), IpcMessage::decode(&[0x00, 1, 2]));
        // OD read header is 5 bytes
        assert_eq!(
            Err(WireError::Length),
            IpcMessage::decode(&[tags::OD_READ, 0x04, 0x30])
        );
    }

    #[test]
    fn test_value_length_must_match_dtype() {
        // A u16 write carrying 3 bytes does not decode
        let mut bytes = vec![tags::OD_WRITE, 0x17, 0x10, 0, DataType::UInt16 as u8];
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(Err(WireError::Length), IpcMessage::decode(&bytes));
    }
}
