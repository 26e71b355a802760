//! Streaming SDO transfer engine
//!
//! The methods in this module move payloads of arbitrary length between a
//! remote node's dictionary entry and a local byte sink or source, so whole
//! files can be transferred without buffering them in memory. Transfers run
//! one at a time per client: the channel supports a single in-flight
//! transaction, which is also what the protocol allows.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use oxcan_common::sdo::{AbortCode, BlockSegment, RawAbortCode, SdoRequest, SdoResponse};
use oxcan_common::traits::{AsyncCanReceiver, AsyncCanSender};
use snafu::{ResultExt, Snafu};

use crate::sdo_client::{
    match_response, SdoClient, SdoClientError, ServerAbortSnafu, UnexpectedResponseSnafu,
};

/// Options controlling a single transfer
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Timeout for each expected response; the first exchange of a transfer
    /// acts as the setup timeout
    pub response_timeout: Duration,
    /// Request a block transfer instead of a segmented one
    ///
    /// Block mode is only used for payloads larger than 4 bytes; smaller
    /// payloads always go expedited.
    pub block_mode: bool,
    /// Optional ceiling on the total duration of the transfer
    ///
    /// The protocol itself bounds only the setup phase, so a remote that
    /// keeps answering can stretch a transfer indefinitely. None preserves
    /// that behavior.
    pub overall_deadline: Option<Duration>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            block_mode: false,
            overall_deadline: None,
        }
    }
}

/// Error returned by the transfer engine
#[derive(Debug, Snafu)]
pub enum EngineError {
    /// The transfer was aborted at the protocol level
    #[snafu(display("SDO abort accessing 0x{index:04X}sub{sub}: {code}"))]
    ProtocolAbort {
        /// Index of the dictionary entry being transferred
        index: u16,
        /// Sub index of the dictionary entry being transferred
        sub: u8,
        /// The abort code
        code: RawAbortCode,
    },
    /// The channel could not be set up, or the remote never answered the
    /// transfer initiation
    #[snafu(display("Transfer setup failed: {message}"))]
    LocalSetup {
        /// Description of the setup failure
        message: String,
    },
    /// A local stream operation failed
    #[snafu(display("Local I/O error during transfer"))]
    LocalIo {
        /// Underlying error
        source: std::io::Error,
    },
    /// The configured overall deadline elapsed mid-transfer
    #[snafu(display("Transfer exceeded the configured overall duration limit"))]
    DeadlineExceeded,
}

impl EngineError {
    /// Flatten this error to a single abort code
    ///
    /// Failures with no protocol code negotiated report the general error
    /// code rather than an undefined value.
    pub fn abort_code(&self) -> RawAbortCode {
        match self {
            EngineError::ProtocolAbort { code, .. } => *code,
            _ => RawAbortCode::Valid(AbortCode::GeneralError),
        }
    }
}

type EResult<T> = std::result::Result<T, EngineError>;

/// Map a wire-client error into the engine taxonomy
///
/// `setup` marks the first exchange of the transfer: a silent remote during
/// setup is a local setup failure, while silence after the remote has
/// already answered is a protocol timeout.
fn map_client_error(e: SdoClientError, index: u16, sub: u8, setup: bool) -> EngineError {
    let protocol = |code: AbortCode| EngineError::ProtocolAbort {
        index,
        sub,
        code: RawAbortCode::Valid(code),
    };
    match e {
        SdoClientError::ServerAbort {
            index,
            sub,
            abort_code,
        } => EngineError::ProtocolAbort {
            index,
            sub,
            code: abort_code,
        },
        SdoClientError::NoResponse => {
            if setup {
                EngineError::LocalSetup {
                    message: format!("no response from node initiating 0x{index:04X}sub{sub}"),
                }
            } else {
                protocol(AbortCode::SdoTimeout)
            }
        }
        SdoClientError::SocketSendFailed { message } => EngineError::LocalSetup { message },
        SdoClientError::ToggleNotAlternated => protocol(AbortCode::ToggleNotAlternated),
        SdoClientError::CrcMismatch => protocol(AbortCode::CrcError),
        SdoClientError::BlockSizeChangedTooSmall => protocol(AbortCode::InvalidBlockSize),
        SdoClientError::MalformedResponse | SdoClientError::UnexpectedResponse { .. } => {
            protocol(AbortCode::InvalidCommandSpecifier)
        }
    }
}

struct Deadline {
    at: Option<tokio::time::Instant>,
}

impl Deadline {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            at: limit.map(|d| tokio::time::Instant::now() + d),
        }
    }

    fn expired(&self) -> bool {
        match self.at {
            Some(at) => tokio::time::Instant::now() >= at,
            None => false,
        }
    }
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    /// Upload a dictionary entry of arbitrary length into a byte sink
    ///
    /// Returns the number of bytes written to the sink.
    pub async fn upload_to<W: Write>(
        &mut self,
        index: u16,
        sub: u8,
        sink: &mut W,
        opts: &TransferOptions,
    ) -> EResult<u64> {
        self.set_timeout(opts.response_timeout);
        let deadline = Deadline::new(opts.overall_deadline);
        if opts.block_mode {
            self.block_upload_to(index, sub, sink, &deadline).await
        } else {
            self.segmented_upload_to(index, sub, sink, &deadline).await
        }
    }

    /// Download from a byte source into a dictionary entry
    ///
    /// The protocol requires the total payload size at initiation, so `size`
    /// must be known up front; exactly `size` bytes are consumed from
    /// `source`. Returns the number of bytes moved.
    pub async fn download_from<Rd: Read>(
        &mut self,
        index: u16,
        sub: u8,
        source: &mut Rd,
        size: u64,
        opts: &TransferOptions,
    ) -> EResult<u64> {
        self.set_timeout(opts.response_timeout);
        let deadline = Deadline::new(opts.overall_deadline);
        if opts.block_mode && size > 4 {
            self.block_download_from(index, sub, source, size, &deadline)
                .await
        } else {
            self.segmented_download_from(index, sub, source, size, &deadline)
                .await
        }
    }

    /// Upload a dictionary entry into a local file
    ///
    /// The file is created, or truncated if it exists.
    pub async fn upload_to_file<P: AsRef<Path>>(
        &mut self,
        index: u16,
        sub: u8,
        path: P,
        opts: &TransferOptions,
    ) -> EResult<u64> {
        let file = std::fs::File::create(path).context(LocalIoSnafu)?;
        let mut writer = std::io::BufWriter::new(file);
        let count = self.upload_to(index, sub, &mut writer, opts).await?;
        writer.flush().context(LocalIoSnafu)?;
        Ok(count)
    }

    /// Download a local file into a dictionary entry
    ///
    /// The file's length is determined before initiating, as the protocol
    /// requires the size up front.
    pub async fn download_from_file<P: AsRef<Path>>(
        &mut self,
        index: u16,
        sub: u8,
        path: P,
        opts: &TransferOptions,
    ) -> EResult<u64> {
        let file = std::fs::File::open(path).context(LocalIoSnafu)?;
        let size = file.metadata().context(LocalIoSnafu)?.len();
        let mut reader = std::io::BufReader::new(file);
        self.download_from(index, sub, &mut reader, size, opts)
            .await
    }

    /// Abort the in-progress transfer and return the sink/source error
    async fn abort_local<T>(
        &mut self,
        index: u16,
        sub: u8,
        code: AbortCode,
        source: std::io::Error,
    ) -> EResult<T> {
        self.send(SdoRequest::abort(index, sub, code).to_bytes())
            .await
            .ok();
        Err(EngineError::LocalIo { source })
    }

    async fn check_deadline(&mut self, index: u16, sub: u8, deadline: &Deadline) -> EResult<()> {
        if deadline.expired() {
            self.send(SdoRequest::abort(index, sub, AbortCode::SdoTimeout).to_bytes())
                .await
                .ok();
            Err(EngineError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    async fn segmented_upload_to<W: Write>(
        &mut self,
        index: u16,
        sub: u8,
        sink: &mut W,
        deadline: &Deadline,
    ) -> EResult<u64> {
        self.send(SdoRequest::initiate_upload(index, sub).to_bytes())
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;

        let resp = self
            .wait_for_response()
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;

        let mut total: u64 = 0;
        let expedited = (|| {
            match_response!(
                resp,
                "ConfirmUpload",
                SdoResponse::ConfirmUpload { n, e, s, index: _, sub: _, data } => {
                    let mut len = 0;
                    if e && s {
                        len = 4 - n as usize;
                    }
                    Ok((e, data, len))
                }
            )
        })()
        .map_err(|e: SdoClientError| map_client_error(e, index, sub, true))?;

        let (e, first_data, first_len) = expedited;
        if e {
            sink.write_all(&first_data[0..first_len])
                .context(LocalIoSnafu)?;
            return Ok(first_len as u64);
        }

        // Segmented: drain bytes from the server as it delivers them
        let mut toggle = false;
        loop {
            self.check_deadline(index, sub, deadline).await?;
            self.send(SdoRequest::upload_segment_request(toggle).to_bytes())
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;

            let resp = self
                .wait_for_response()
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;

            let done = (|| {
                match_response!(
                    resp,
                    "UploadSegment",
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            return Err(SdoClientError::ToggleNotAlternated);
                        }
                        Ok((c, data, 7 - n as usize))
                    }
                )
            })();

            match done {
                Ok((c, data, len)) => {
                    if let Err(err) = sink.write_all(&data[0..len]) {
                        return self
                            .abort_local(index, sub, AbortCode::GeneralError, err)
                            .await;
                    }
                    total += len as u64;
                    if c {
                        break;
                    }
                }
                Err(SdoClientError::ToggleNotAlternated) => {
                    self.send(
                        SdoRequest::abort(index, sub, AbortCode::ToggleNotAlternated).to_bytes(),
                    )
                    .await
                    .ok();
                    return Err(map_client_error(
                        SdoClientError::ToggleNotAlternated,
                        index,
                        sub,
                        false,
                    ));
                }
                Err(e) => return Err(map_client_error(e, index, sub, false)),
            }
            toggle = !toggle;
        }
        Ok(total)
    }

    async fn block_upload_to<W: Write>(
        &mut self,
        index: u16,
        sub: u8,
        sink: &mut W,
        deadline: &Deadline,
    ) -> EResult<u64> {
        const BLKSIZE: u8 = 127;
        self.send(SdoRequest::initiate_block_upload(index, sub, true, BLKSIZE, 0).to_bytes())
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;

        let resp = self
            .wait_for_response()
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;

        let server_crc = (|| {
            match_response!(
                resp,
                "ConfirmBlockUpload",
                SdoResponse::ConfirmBlockUpload { sc, s: _, index: _, sub: _, size: _ } => { Ok(sc) }
            )
        })()
        .map_err(|e: SdoClientError| map_client_error(e, index, sub, true))?;

        self.send(SdoRequest::StartBlockUpload.to_bytes())
            .await
            .map_err(|e| map_client_error(e, index, sub, false))?;

        // The byte count of the final segment is only known from the end
        // message, so each segment is held back until its successor arrives.
        let mut pending: Option<[u8; 7]> = None;
        let mut crc = crc16::State::<crc16::XMODEM>::new();
        let mut total: u64 = 0;
        let last_seqnum;
        loop {
            self.check_deadline(index, sub, deadline).await?;
            let segment = self
                .wait_for_block_segment()
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;
            if let Some(prev) = pending.take() {
                if let Err(err) = sink.write_all(&prev) {
                    return self
                        .abort_local(index, sub, AbortCode::GeneralError, err)
                        .await;
                }
                crc.update(&prev);
                total += prev.len() as u64;
            }
            pending = Some(segment.data);
            if !segment.c && segment.seqnum == BLKSIZE {
                self.send(
                    SdoRequest::ConfirmBlock {
                        ackseq: BLKSIZE,
                        blksize: BLKSIZE,
                    }
                    .to_bytes(),
                )
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;
            }
            if segment.c {
                last_seqnum = segment.seqnum;
                break;
            }
        }

        self.send(
            SdoRequest::ConfirmBlock {
                ackseq: last_seqnum,
                blksize: BLKSIZE,
            }
            .to_bytes(),
        )
        .await
        .map_err(|e| map_client_error(e, index, sub, false))?;

        let resp = self
            .wait_for_response()
            .await
            .map_err(|e| map_client_error(e, index, sub, false))?;
        let (n, expected_crc) = (|| {
            match_response!(
                resp,
                "BlockUploadEnd",
                SdoResponse::BlockUploadEnd { n, crc } => { Ok((n, crc)) }
            )
        })()
        .map_err(|e: SdoClientError| map_client_error(e, index, sub, false))?;

        // Unwrap: at least one segment is always sent, even for empty data
        let final_data = pending.take().unwrap();
        let final_len = 7 - n as usize;
        if let Err(err) = sink.write_all(&final_data[0..final_len]) {
            return self
                .abort_local(index, sub, AbortCode::GeneralError, err)
                .await;
        }
        crc.update(&final_data[0..final_len]);
        total += final_len as u64;

        if server_crc && crc.get() != expected_crc {
            self.send(SdoRequest::abort(index, sub, AbortCode::CrcError).to_bytes())
                .await
                .ok();
            return Err(map_client_error(
                SdoClientError::CrcMismatch,
                index,
                sub,
                false,
            ));
        }

        self.send(SdoRequest::EndBlockUpload.to_bytes())
            .await
            .map_err(|e| map_client_error(e, index, sub, false))?;

        Ok(total)
    }

    async fn segmented_download_from<Rd: Read>(
        &mut self,
        index: u16,
        sub: u8,
        source: &mut Rd,
        size: u64,
        deadline: &Deadline,
    ) -> EResult<u64> {
        if (1..=4).contains(&size) {
            // Expedited
            let mut buf = [0u8; 4];
            source
                .read_exact(&mut buf[0..size as usize])
                .context(LocalIoSnafu)?;
            self.send(SdoRequest::expedited_download(index, sub, &buf[0..size as usize]).to_bytes())
                .await
                .map_err(|e| map_client_error(e, index, sub, true))?;
            let resp = self
                .wait_for_response()
                .await
                .map_err(|e| map_client_error(e, index, sub, true))?;
            return (|| {
                match_response!(
                    resp,
                    "ConfirmDownload",
                    SdoResponse::ConfirmDownload { index: _, sub: _ } => { Ok(size) }
                )
            })()
            .map_err(|e: SdoClientError| map_client_error(e, index, sub, true));
        }

        self.send(SdoRequest::initiate_download(index, sub, Some(size as u32)).to_bytes())
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;
        let resp = self
            .wait_for_response()
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;
        (|| {
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index: _, sub: _ } => { Ok(()) }
            )
        })()
        .map_err(|e: SdoClientError| map_client_error(e, index, sub, true))?;

        let mut toggle = false;
        let mut remaining = size;
        // A zero-length download still carries one empty final segment, so
        // the initiate/segment handshake always completes.
        loop {
            self.check_deadline(index, sub, deadline).await?;
            let chunk_len = remaining.min(7) as usize;
            let mut chunk = [0u8; 7];
            if let Err(err) = source.read_exact(&mut chunk[0..chunk_len]) {
                return self
                    .abort_local(index, sub, AbortCode::NoData, err)
                    .await;
            }
            remaining -= chunk_len as u64;
            let last = remaining == 0;
            self.send(SdoRequest::download_segment(toggle, last, &chunk[0..chunk_len]).to_bytes())
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;
            let resp = self
                .wait_for_response()
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;
            self.check_segment_ack(resp, index, sub, toggle)
                .await
                .map_err(|e| map_client_error(e, index, sub, false))?;
            toggle = !toggle;
            if last {
                break;
            }
        }
        Ok(size)
    }

    async fn block_download_from<Rd: Read>(
        &mut self,
        index: u16,
        sub: u8,
        source: &mut Rd,
        size: u64,
        deadline: &Deadline,
    ) -> EResult<u64> {
        self.send(
            SdoRequest::InitiateBlockDownload {
                cc: true,
                s: true,
                index,
                sub,
                size: size as u32,
            }
            .to_bytes(),
        )
        .await
        .map_err(|e| map_client_error(e, index, sub, true))?;

        let resp = self
            .wait_for_response()
            .await
            .map_err(|e| map_client_error(e, index, sub, true))?;
        let (crc_enabled, mut blksize) = (|| {
            match_response!(
                resp,
                "ConfirmBlockDownload",
                SdoResponse::ConfirmBlockDownload { sc, index: _, sub: _, blksize } => {
                    Ok((sc, blksize))
                }
            )
        })()
        .map_err(|e: SdoClientError| map_client_error(e, index, sub, true))?;

        let mut crc = crc16::State::<crc16::XMODEM>::new();
        let mut consumed: u64 = 0;

        'blocks: loop {
            self.check_deadline(index, sub, deadline).await?;
            // Stage one block of data so unacknowledged segments can be
            // resent without seeking the source
            let remaining = size - consumed;
            let block_len = remaining.min(blksize as u64 * 7) as usize;
            let mut block = vec![0u8; block_len];
            if let Err(err) = source.read_exact(&mut block) {
                return self
                    .abort_local(index, sub, AbortCode::NoData, err)
                    .await;
            }
            let segments = block_len.div_ceil(7);
            let last_block = remaining == block_len as u64;

            let mut first_seq = 1u8;
            loop {
                for seq in first_seq..=segments as u8 {
                    let start = (seq as usize - 1) * 7;
                    let seg_len = (block_len - start).min(7);
                    let mut data = [0u8; 7];
                    data[0..seg_len].copy_from_slice(&block[start..start + seg_len]);
                    let c = last_block && seq == segments as u8;
                    self.send(BlockSegment { c, seqnum: seq, data }.to_bytes())
                        .await
                        .map_err(|e| map_client_error(e, index, sub, false))?;
                }

                let resp = self
                    .wait_for_response()
                    .await
                    .map_err(|e| map_client_error(e, index, sub, false))?;
                let (ackseq, new_blksize) = (|| {
                    match_response!(
                        resp,
                        "ConfirmBlock",
                        SdoResponse::ConfirmBlock { ackseq, blksize } => { Ok((ackseq, blksize)) }
                    )
                })()
                .map_err(|e: SdoClientError| map_client_error(e, index, sub, false))?;

                if ackseq as usize == segments {
                    crc.update(&block);
                    consumed += block_len as u64;
                    blksize = new_blksize;
                    if last_block {
                        break 'blocks;
                    }
                    break;
                }
                // Missing segments; resend everything after the last
                // acknowledged one
                first_seq = ackseq + 1;
                if new_blksize < first_seq {
                    return Err(map_client_error(
                        SdoClientError::BlockSizeChangedTooSmall,
                        index,
                        sub,
                        false,
                    ));
                }
            }
        }

        let n = ((7 - size % 7) % 7) as u8;
        let crc_value = if crc_enabled { crc.get() } else { 0 };
        self.send(SdoRequest::EndBlockDownload { n, crc: crc_value }.to_bytes())
            .await
            .map_err(|e| map_client_error(e, index, sub, false))?;

        let resp = self
            .wait_for_response()
            .await
            .map_err(|e| map_client_error(e, index, sub, false))?;
        (|| {
            match_response!(
                resp,
                "ConfirmBlockDownloadEnd",
                SdoResponse::ConfirmBlockDownloadEnd => { Ok(size) }
            )
        })()
        .map_err(|e: SdoClientError| map_client_error(e, index, sub, false))
    }
}
