//! CAN message types and classification of the CANopen messages oxcan handles

use snafu::Snafu;

use crate::sdo::{SdoRequest, SdoResponse};

/// A CAN identifier, either standard (11-bit) or extended (29-bit)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw integer value of the ID
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true for extended IDs
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN frame with up to 8 data bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// Frame payload; only the first `dlc` bytes are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes
    pub dlc: u8,
    /// Frame identifier
    pub id: CanId,
    rtr: bool,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a new data frame
    ///
    /// Panics if `data` is longer than 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if dlc > MAX_DATA_LENGTH as u8 {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self {
            id,
            dlc,
            data: buf,
            rtr: false,
        }
    }

    /// Create a new remote (RTR) frame
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            ..Default::default()
        }
        .with_rtr()
    }

    fn with_rtr(mut self) -> Self {
        self.rtr = true;
        self
    }

    /// Get the frame ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this is a remote frame
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// An error reported by the CAN controller in place of a data frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[snafu(display("CAN bus error (raw bits: {bits:#x})"))]
pub struct CanError {
    /// Raw error class bits from the controller
    pub bits: u8,
}

impl CanError {
    /// Create a CanError from the controller's raw error class byte
    pub fn from_raw(bits: u8) -> Self {
        Self { bits }
    }
}

/// COB-ID of NMT command messages
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Base COB-ID for emergency messages (producer node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// Base COB-ID for heartbeat messages (producer node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Base COB-IDs of the four predefined transmit PDOs (sender node ID is added)
pub const TPDO_BASES: [u16; 4] = [0x180, 0x280, 0x380, 0x480];

/// The NMT command specifier values
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandCmd {
    /// Enter the operational state
    Start = 1,
    /// Enter the stopped state
    Stop = 2,
    /// Enter the pre-operational state
    EnterPreOp = 128,
    /// Reset the application
    ResetApp = 129,
    /// Reset communications
    ResetComm = 130,
}

impl NmtCommandCmd {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command addressed to one node, or to all nodes when `node` is 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The commanded state transition
    pub cmd: NmtCommandCmd,
    /// Target node ID, 0 for broadcast
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandCmd::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        let mut msg = CanMessage {
            id: NMT_CMD_ID,
            dlc: 2,
            ..Default::default()
        };
        msg.data[0] = cmd.cmd as u8;
        msg.data[1] = cmd.node;
        msg
    }
}

/// NMT node states, as reported in heartbeat messages
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Node has booted and not yet entered pre-operational
    Bootup = 0,
    /// Node is stopped
    Stopped = 4,
    /// Node is operational
    Operational = 5,
    /// Node is pre-operational
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Bootup => "boot-up",
            NmtState::Stopped => "stopped",
            NmtState::Operational => "operational",
            NmtState::PreOperational => "pre-operational",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<u8> for NmtState {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(MessageError::InvalidNmtState { value }),
        }
    }
}

/// A heartbeat message produced by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The producing node's ID
    pub node: u8,
    /// Heartbeat toggle bit
    pub toggle: bool,
    /// The producing node's NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut msg = CanMessage {
            id: CanId::Std(HEARTBEAT_BASE | value.node as u16),
            dlc: 1,
            ..Default::default()
        };
        msg.data[0] = value.state as u8;
        if value.toggle {
            msg.data[0] |= 1 << 7;
        }
        msg
    }
}

/// An emergency (EMCY) message produced by a node to signal a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyMessage {
    /// The producing node's ID
    pub node: u8,
    /// Standardized emergency error code
    pub error_code: u16,
    /// The producer's current error register (object 0x1001)
    pub error_register: u8,
    /// Manufacturer specific error information
    pub data: [u8; 5],
}

impl EmcyMessage {
    /// The error-reset/no-error code, sent when a fault condition clears
    pub const ERROR_RESET: u16 = 0x0000;

    /// Pack the manufacturer data bytes into a single u32 info value
    ///
    /// Only the first four manufacturer bytes fit; the fifth is dropped. This
    /// is the shape the IPC emergency event carries.
    pub fn info(&self) -> u32 {
        u32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }
}

impl From<EmcyMessage> for CanMessage {
    fn from(value: EmcyMessage) -> Self {
        let mut msg = CanMessage {
            id: CanId::Std(EMCY_BASE + value.node as u16),
            dlc: 8,
            ..Default::default()
        };
        msg.data[0..2].copy_from_slice(&value.error_code.to_le_bytes());
        msg.data[2] = value.error_register;
        msg.data[3..8].copy_from_slice(&value.data);
        msg
    }
}

/// The set of CANopen messages recognized on the bus
#[derive(Debug, Clone, Copy)]
pub enum BusMessage {
    /// An NMT command
    NmtCommand(NmtCommand),
    /// A node heartbeat
    Heartbeat(Heartbeat),
    /// An emergency message
    Emcy(EmcyMessage),
    /// An SDO request addressed to some server
    SdoRequest {
        /// The server node the request addresses
        node: u8,
        /// The decoded request
        req: SdoRequest,
    },
    /// An SDO response from some server
    SdoResponse {
        /// The responding server node
        node: u8,
        /// The decoded response
        resp: SdoResponse,
    },
}

impl TryFrom<CanMessage> for BusMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        let raw = cob_id.raw();
        if cob_id == NMT_CMD_ID {
            Ok(BusMessage::NmtCommand(msg.try_into()?))
        } else if (0x81..=0xff).contains(&raw) {
            if msg.data().len() < 8 {
                return Err(MessageError::MessageTooShort);
            }
            let node = (raw - EMCY_BASE as u32) as u8;
            let error_code = u16::from_le_bytes(msg.data[0..2].try_into().unwrap());
            let error_register = msg.data[2];
            let data = msg.data[3..8].try_into().unwrap();
            Ok(BusMessage::Emcy(EmcyMessage {
                node,
                error_code,
                error_register,
                data,
            }))
        } else if (0x701..=0x77f).contains(&raw) {
            if msg.data().is_empty() {
                return Err(MessageError::MessageTooShort);
            }
            let node = (raw & 0x7f) as u8;
            let toggle = (msg.data[0] & (1 << 7)) != 0;
            let state: NmtState = (msg.data[0] & 0x7f).try_into()?;
            Ok(BusMessage::Heartbeat(Heartbeat {
                node,
                toggle,
                state,
            }))
        } else if (0x581..=0x5ff).contains(&raw) {
            let node = (raw - SDO_RESP_BASE as u32) as u8;
            let resp: SdoResponse = msg
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(BusMessage::SdoResponse { node, resp })
        } else if (0x601..=0x67f).contains(&raw) {
            let node = (raw - SDO_REQ_BASE as u32) as u8;
            let req: SdoRequest = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(BusMessage::SdoRequest { node, req })
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// Errors raised while decoding CAN messages
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The message payload is shorter than the message type requires
    MessageTooShort,
    /// The payload could not be decoded for the message type its ID implies
    MalformedMsg {
        /// The offending COB-ID
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The received COB-ID
        cob_id: CanId,
        /// The COB-ID that was expected
        expected: CanId,
    },
    /// A field in the message holds an invalid value
    InvalidField,
    /// The COB-ID does not belong to any recognized message
    UnrecognizedId {
        /// The offending COB-ID
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The offending state byte
        value: u8,
    },
}
