//! SDO protocol message types
//!
//! Defines the request and response messages exchanged between an SDO client
//! and an SDO server, for expedited, segmented, and block transfers, along
//! with the standard abort codes.

use crate::messages::{CanId, CanMessage};

/// Specifies the possible server command specifier (SCS) values in SDO response packets
#[derive(Clone, Copy, Debug)]
pub enum ServerCommand {
    /// Response to an upload segment request
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Acknowledge an upload initiation
    Upload = 2,
    /// Acknowledge a download command
    Download = 3,
    /// Abort the transfer
    Abort = 4,
    /// Block download responses
    BlockDownload = 5,
    /// Block upload responses
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(()),
        }
    }
}

/// Specifies the possible client command specifier (CCS) values in SDO request packets
#[derive(Clone, Copy, Debug)]
pub enum ClientCommand {
    /// Download one segment
    DownloadSegment = 0,
    /// Initiate a download
    InitiateDownload = 1,
    /// Initiate an upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort the transfer
    Abort = 4,
    /// Block upload requests
    BlockUpload = 5,
    /// Block download requests
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

macro_rules! abort_codes {
    ($($(#[$meta:meta])* $name:ident = $value:literal => $desc:literal,)*) => {
        /// The standard SDO abort codes
        ///
        /// A code of zero on the wire means "no error" and is not represented
        /// here; every member of this enum is a failure.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u32)]
        pub enum AbortCode {
            $($(#[$meta])* $name = $value,)*
        }

        impl AbortCode {
            /// The canonical human readable description of this abort code
            pub fn description(&self) -> &'static str {
                match self {
                    $(AbortCode::$name => $desc,)*
                }
            }
        }

        impl TryFrom<u32> for AbortCode {
            type Error = ();

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(AbortCode::$name),)*
                    _ => Err(()),
                }
            }
        }
    };
}

abort_codes! {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000 => "Toggle bit not altered",
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000 => "SDO protocol timed out",
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001 => "Command specifier not valid or unknown",
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002 => "Invalid block size in block mode",
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003 => "Invalid sequence number in block mode",
    /// CRC Error (block mode only)
    CrcError = 0x0504_0004 => "CRC error (block mode only)",
    /// Out of memory
    OutOfMemory = 0x0504_0005 => "Out of memory",
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000 => "Unsupported access to an object",
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001 => "Attempt to read a write only object",
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002 => "Attempt to write a read only object",
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000 => "Object does not exist in the object dictionary",
    /// Object cannot be mapped to the PDO
    UnmappablePdo = 0x0604_0041 => "Object cannot be mapped to the PDO",
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042 => "Number and length of object to be mapped exceeds PDO length",
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043 => "General parameter incompatibility reasons",
    /// General internal incompatibility in the device
    IncompatibleInternal = 0x0604_0047 => "General internal incompatibility in device",
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000 => "Access failed due to hardware error",
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010 => "Length of service parameter does not match",
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012 => "Length of service parameter too high",
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013 => "Length of service parameter too short",
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011 => "Sub index does not exist",
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030 => "Invalid value for parameter (download only)",
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031 => "Value range of parameter written too high",
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032 => "Value range of parameter written too low",
    /// Maximum value is less than minimum value
    MaxLessThanMin = 0x0609_0036 => "Maximum value is less than minimum value",
    /// Resource not available
    ResourceNotAvailable = 0x060A_0023 => "Resource not available: SDO connection",
    /// General error
    GeneralError = 0x0800_0000 => "General error",
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020 => "Data cannot be transferred or stored to application",
    /// Data cannot be transferred or stored to the application because of local control
    CantStoreLocalControl = 0x0800_0021 =>
        "Data cannot be transferred or stored to application because of local control",
    /// Data cannot be transferred or stored to the application because of the device state
    CantStoreDeviceState = 0x0800_0022 =>
        "Data cannot be transferred or stored to application because of present device state",
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023 => "Object dictionary not present or dynamic generation fails",
    /// No data available
    NoData = 0x0800_0024 => "No data available",
}

impl core::fmt::Display for AbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to
/// receive other values and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl RawAbortCode {
    /// Get the raw 32-bit code value
    pub fn raw(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => *code as u32,
            RawAbortCode::Unknown(code) => *code,
        }
    }

    /// Get the documented description, if the code is a recognized one
    pub fn description(&self) -> Option<&'static str> {
        match self {
            RawAbortCode::Valid(code) => Some(code.description()),
            RawAbortCode::Unknown(_) => None,
        }
    }
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RawAbortCode::Valid(code) => write!(f, "{}", code.description()),
            RawAbortCode::Unknown(code) => write!(f, "unrecognized abort code 0x{code:08X}"),
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

impl From<AbortCode> for RawAbortCode {
    fn from(value: AbortCode) -> Self {
        Self::Valid(value)
    }
}

/// A request message sent from an SDO client to an SDO server
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SdoRequest {
    /// Initiate an expedited or segmented download
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value on expedited, size when e=0 and s=1
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Initiate an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Initiate a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, contains the number of bytes to be downloaded
        size: u32,
    },
    /// Finish a block download
    EndBlockDownload {
        /// Number of unused bytes in the final segment
        n: u8,
        /// CRC over all downloaded data, or 0 when CRC is not in use
        crc: u16,
    },
    /// Initiate a block upload
    InitiateBlockUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Client CRC supported flag
        cc: bool,
        /// Number of segments per block
        blksize: u8,
        /// Protocol switch threshold; 0 to always use block transfer
        pst: u8,
    },
    /// Begin receiving block upload segments
    StartBlockUpload,
    /// Acknowledge received block upload segments
    ConfirmBlock {
        /// Sequence number of the last successfully received segment
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUpload,
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download message
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create a download segment message
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an expedited download message
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block upload message
    pub fn initiate_block_upload(index: u16, sub: u8, cc: bool, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            index,
            sub,
            cc,
            blksize,
            pst,
        }
    }

    /// Encode to an 8-byte CAN payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | (n << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = (ClientCommand::BlockDownload as u8) << 5
                    | ((cc as u8) << 2)
                    | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = (ClientCommand::BlockDownload as u8) << 5 | ((n & 7) << 2) | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                index,
                sub,
                cc,
                blksize,
                pst,
            } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | ((cc as u8) << 2);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 3;
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::EndBlockUpload => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5 | 1;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }

        payload
    }

    /// Encode to a CAN message with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & 1) != 0;
                let data = value[1..8].try_into().unwrap();
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & 1) != 0;
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::BlockDownload => {
                let cs = value[0] & 1;
                if cs == 0 {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoRequest::EndBlockDownload { n, crc })
                }
            }
            ClientCommand::BlockUpload => match value[0] & 0x3 {
                0 => {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    let sub = value[3];
                    let blksize = value[4];
                    let pst = value[5];
                    Ok(SdoRequest::InitiateBlockUpload {
                        index,
                        sub,
                        cc,
                        blksize,
                        pst,
                    })
                }
                1 => Ok(SdoRequest::EndBlockUpload),
                2 => Ok(SdoRequest::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                3 => Ok(SdoRequest::StartBlockUpload),
                _ => unreachable!(),
            },
        }
    }
}

/// One segment of a block transfer
///
/// Block segments carry no command specifier; both sides know when to expect
/// them from the protocol state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockSegment {
    /// Set on the final segment of the transfer
    pub c: bool,
    /// Sequence number within the current block, starting from 1
    pub seqnum: u8,
    /// Segment payload
    pub data: [u8; 7],
}

impl BlockSegment {
    /// Encode to an 8-byte CAN payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7f);
        payload[1..8].copy_from_slice(&self.data);
        payload
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = ();

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(());
        }
        Ok(BlockSegment {
            c: (value[0] & (1 << 7)) != 0,
            seqnum: value[0] & 0x7f,
            data: value[1..8].try_into().unwrap(),
        })
    }
}

/// A response message sent from an SDO server to an SDO client
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    /// Acknowledge an upload initiation
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Acknowledge a download initiation
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Acknowledge a download segment
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Acknowledge a block download initiation
    ConfirmBlockDownload {
        /// Server CRC supported flag
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
    },
    /// Acknowledge a completed block of download segments
    ConfirmBlock {
        /// Sequence number of the last successfully received segment
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block download
    ConfirmBlockDownloadEnd,
    /// Acknowledge a block upload initiation
    ConfirmBlockUpload {
        /// Server CRC supported flag
        sc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Total upload size in bytes, valid when s=1
        size: u32,
    },
    /// Finish a block upload
    BlockUploadEnd {
        /// Number of unused bytes in the final segment
        n: u8,
        /// CRC over all uploaded data, or 0 when CRC is not in use
        crc: u16,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// Panics if data is longer than 4 bytes.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        if data.len() > 4 {
            panic!("Cannot create expedited upload with more than 4 bytes");
        }

        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: 4 - data.len() as u8,
            data: msg_data,
        }
    }

    /// Create a segmented upload acknowledge carrying the total size
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let n = (7 - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a download acknowledge
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledge
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        let abort_code = abort_code as u32;
        SdoResponse::Abort {
            index,
            sub,
            abort_code,
        }
    }

    /// Encode to an 8-byte CAN payload
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = (ServerCommand::SegmentUpload as u8) << 5
                    | (t as u8) << 4
                    | n << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | ((sc as u8) << 2);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 1;
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ServerCommand::BlockUpload as u8) << 5 | ((sc as u8) << 2) | ((s as u8) << 1);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                payload[0] = (ServerCommand::BlockUpload as u8) << 5 | ((n & 0x7) << 2) | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Encode to a CAN message with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = ();
    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let command: ServerCommand = (msg.data[0] >> 5).try_into()?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (msg.data[0] & (1 << 4)) != 0;
                let n = (msg.data[0] >> 1) & 7;
                let c = (msg.data[0] & 1) != 0;
                let data: [u8; 7] = msg.data[1..8].try_into().unwrap();
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (msg.data[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (msg.data[0] >> 2) & 0x3;
                let e = (msg.data[0] & (1 << 1)) != 0;
                let s = (msg.data[0] & 1) != 0;
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                let data: [u8; 4] = msg.data[4..8].try_into().unwrap();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::Abort => {
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                let abort_code = u32::from_le_bytes(msg.data[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ServerCommand::BlockDownload => match msg.data[0] & 0x3 {
                0 => {
                    let sc = (msg.data[0] & (1 << 2)) != 0;
                    let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                    let sub = msg.data[3];
                    let blksize = msg.data[4];
                    Ok(SdoResponse::ConfirmBlockDownload {
                        sc,
                        index,
                        sub,
                        blksize,
                    })
                }
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: msg.data[1],
                    blksize: msg.data[2],
                }),
                _ => Err(()),
            },
            ServerCommand::BlockUpload => match msg.data[0] & 0x3 {
                0 | 2 => {
                    let sc = (msg.data[0] & (1 << 2)) != 0;
                    let s = (msg.data[0] & (1 << 1)) != 0;
                    let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                    let sub = msg.data[3];
                    let size = u32::from_le_bytes(msg.data[4..8].try_into().unwrap());
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc,
                        s,
                        index,
                        sub,
                        size,
                    })
                }
                1 => {
                    let n = (msg.data[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                    Ok(SdoResponse::BlockUploadEnd { n, crc })
                }
                _ => Err(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CanId;

    #[test]
    fn test_abort_code_descriptions() {
        // Every code in the table decodes back to itself with its documented string
        let all = [
            (0x0503_0000, "Toggle bit not altered"),
            (0x0504_0000, "SDO protocol timed out"),
            (0x0504_0001, "Command specifier not valid or unknown"),
            (0x0504_0002, "Invalid block size in block mode"),
            (0x0504_0003, "Invalid sequence number in block mode"),
            (0x0504_0004, "CRC error (block mode only)"),
            (0x0504_0005, "Out of memory"),
            (0x0601_0000, "Unsupported access to an object"),
            (0x0601_0001, "Attempt to read a write only object"),
            (0x0601_0002, "Attempt to write a read only object"),
            (0x0602_0000, "Object does not exist in the object dictionary"),
            (0x0604_0041, "Object cannot be mapped to the PDO"),
            (
                0x0604_0042,
                "Number and length of object to be mapped exceeds PDO length",
            ),
            (0x0604_0043, "General parameter incompatibility reasons"),
            (0x0604_0047, "General internal incompatibility in device"),
            (0x0606_0000, "Access failed due to hardware error"),
            (0x0607_0010, "Length of service parameter does not match"),
            (0x0607_0012, "Length of service parameter too high"),
            (0x0607_0013, "Length of service parameter too short"),
            (0x0609_0011, "Sub index does not exist"),
            (0x0609_0030, "Invalid value for parameter (download only)"),
            (0x0609_0031, "Value range of parameter written too high"),
            (0x0609_0032, "Value range of parameter written too low"),
            (0x0609_0036, "Maximum value is less than minimum value"),
            (0x060A_0023, "Resource not available: SDO connection"),
            (0x0800_0000, "General error"),
            (
                0x0800_0020,
                "Data cannot be transferred or stored to application",
            ),
            (
                0x0800_0021,
                "Data cannot be transferred or stored to application because of local control",
            ),
            (
                0x0800_0022,
                "Data cannot be transferred or stored to application because of present device state",
            ),
            (
                0x0800_0023,
                "Object dictionary not present or dynamic generation fails",
            ),
            (0x0800_0024, "No data available"),
        ];
        for (raw, desc) in all {
            let code = AbortCode::try_from(raw).unwrap();
            assert_eq!(raw, code as u32);
            assert_eq!(desc, code.description());
        }
    }

    #[test]
    fn test_unknown_abort_code() {
        assert!(AbortCode::try_from(0xdead_beef).is_err());
        let raw = RawAbortCode::from(0xdead_beefu32);
        assert_eq!(RawAbortCode::Unknown(0xdead_beef), raw);
        assert_eq!(None, raw.description());
        assert_eq!("unrecognized abort code 0xDEADBEEF", raw.to_string());
        // Zero is "no error", not a member of the table
        assert!(AbortCode::try_from(0).is_err());
    }

    #[test]
    fn test_request_roundtrip() {
        let reqs = [
            SdoRequest::expedited_download(0x3004, 3, b"ab"),
            SdoRequest::initiate_download(0x3005, 4, Some(1234)),
            SdoRequest::download_segment(true, false, &[1, 2, 3, 4, 5]),
            SdoRequest::initiate_upload(0x1018, 2),
            SdoRequest::upload_segment_request(true),
            SdoRequest::InitiateBlockDownload {
                cc: true,
                s: true,
                index: 0x3005,
                sub: 4,
                size: 9999,
            },
            SdoRequest::EndBlockDownload { n: 3, crc: 0xbeef },
            SdoRequest::initiate_block_upload(0x3004, 4, true, 127, 0),
            SdoRequest::StartBlockUpload,
            SdoRequest::ConfirmBlock {
                ackseq: 12,
                blksize: 127,
            },
            SdoRequest::EndBlockUpload,
            SdoRequest::abort(0x3004, 4, AbortCode::NoData),
        ];
        for req in reqs {
            let bytes = req.to_bytes();
            let decoded = SdoRequest::try_from(&bytes[..]).unwrap();
            assert_eq!(req, decoded, "bytes: {bytes:02x?}");
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let resps = [
            SdoResponse::expedited_upload(0x1000, 0, &42u32.to_le_bytes()),
            SdoResponse::upload_acknowledge(0x3004, 4, 2048),
            SdoResponse::upload_segment(true, false, &[9, 8, 7]),
            SdoResponse::download_acknowledge(0x3005, 3),
            SdoResponse::download_segment_acknowledge(true),
            SdoResponse::ConfirmBlockDownload {
                sc: true,
                index: 0x3005,
                sub: 4,
                blksize: 127,
            },
            SdoResponse::ConfirmBlock {
                ackseq: 5,
                blksize: 64,
            },
            SdoResponse::ConfirmBlockDownloadEnd,
            SdoResponse::ConfirmBlockUpload {
                sc: true,
                s: true,
                index: 0x3004,
                sub: 4,
                size: 1000,
            },
            SdoResponse::BlockUploadEnd { n: 4, crc: 0x1234 },
            SdoResponse::abort(0x3004, 4, AbortCode::ReadOnly),
        ];
        for resp in resps {
            let msg = resp.to_can_message(CanId::std(0x581));
            let decoded = SdoResponse::try_from(msg).unwrap();
            assert_eq!(resp, decoded);
        }
    }

    #[test]
    fn test_block_segment_roundtrip() {
        let seg = BlockSegment {
            c: true,
            seqnum: 45,
            data: [1, 2, 3, 4, 5, 6, 7],
        };
        let bytes = seg.to_bytes();
        assert_eq!(seg, BlockSegment::try_from(&bytes[..]).unwrap());
    }
}
