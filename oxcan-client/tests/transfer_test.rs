//! Transfer engine tests against a scripted remote node
//!
//! The "bus" is a pair of mpsc channels; the remote side is driven frame by
//! frame from the test, so every exchange is deterministic and no real
//! sockets or sleeps are involved (beyond the timeout cases, which bound
//! their own duration).

use std::io::Cursor;
use std::time::{Duration, Instant};

use oxcan_client::{EngineError, SdoClient, TransferOptions};
use oxcan_common::messages::{CanId, SDO_RESP_BASE};
use oxcan_common::sdo::{
    AbortCode, BlockSegment, RawAbortCode, SdoRequest, SdoResponse,
};
use oxcan_common::traits::{AsyncCanReceiver, AsyncCanSender, CanSendError};
use oxcan_common::CanMessage;
use tokio::sync::mpsc;

const NODE_ID: u8 = 5;

struct ChanSender(mpsc::Sender<CanMessage>);

impl AsyncCanSender for ChanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        self.0.send(msg).await.map_err(|_| CanSendError(msg))
    }
}

struct ChanReceiver(mpsc::Receiver<CanMessage>);

#[derive(Debug)]
struct RecvClosed;

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

/// The remote end of the scripted bus
struct Remote {
    rx: mpsc::Receiver<CanMessage>,
    tx: mpsc::Sender<CanMessage>,
}

impl Remote {
    async fn expect_request(&mut self) -> SdoRequest {
        let msg = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for client request")
            .expect("client hung up");
        SdoRequest::try_from(msg.data()).expect("client sent a malformed request")
    }

    async fn expect_segment(&mut self) -> BlockSegment {
        let msg = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for block segment")
            .expect("client hung up");
        BlockSegment::try_from(msg.data()).expect("client sent a malformed segment")
    }

    async fn respond(&mut self, resp: SdoResponse) {
        let cob_id = CanId::Std(SDO_RESP_BASE + NODE_ID as u16);
        self.tx.send(resp.to_can_message(cob_id)).await.unwrap();
    }
}

fn setup() -> (SdoClient<ChanSender, ChanReceiver>, Remote) {
    let (client_tx, remote_rx) = mpsc::channel(64);
    let (remote_tx, client_rx) = mpsc::channel(64);
    let client = SdoClient::new_std(NODE_ID, ChanSender(client_tx), ChanReceiver(client_rx));
    let remote = Remote {
        rx: remote_rx,
        tx: remote_tx,
    };
    (client, remote)
}

fn opts() -> TransferOptions {
    TransferOptions {
        response_timeout: Duration::from_millis(250),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_segmented_upload_streams_exact_bytes() {
    let (mut client, mut remote) = setup();
    // 13 bytes: one full segment plus a 6-byte tail
    let payload: Vec<u8> = (0u8..13).collect();
    let server_payload = payload.clone();

    let server = tokio::spawn(async move {
        assert!(matches!(
            remote.expect_request().await,
            SdoRequest::InitiateUpload { index: 0x3004, sub: 4 }
        ));
        remote
            .respond(SdoResponse::upload_acknowledge(
                0x3004,
                4,
                server_payload.len() as u32,
            ))
            .await;

        let mut toggle = false;
        for chunk in server_payload.chunks(7) {
            match remote.expect_request().await {
                SdoRequest::ReqUploadSegment { t } => assert_eq!(toggle, t),
                other => panic!("unexpected request {other:?}"),
            }
            let last = chunk.len() < 7 || server_payload.len() == 7;
            remote
                .respond(SdoResponse::upload_segment(toggle, last, chunk))
                .await;
            toggle = !toggle;
        }
    });

    let mut sink = Vec::new();
    let count = client.upload_to(0x3004, 4, &mut sink, &opts()).await.unwrap();
    assert_eq!(13, count);
    assert_eq!(payload, sink);
    server.await.unwrap();
}

#[tokio::test]
async fn test_zero_length_upload_completes_handshake() {
    let (mut client, mut remote) = setup();

    let server = tokio::spawn(async move {
        assert!(matches!(
            remote.expect_request().await,
            SdoRequest::InitiateUpload { .. }
        ));
        remote
            .respond(SdoResponse::upload_acknowledge(0x3004, 4, 0))
            .await;
        assert!(matches!(
            remote.expect_request().await,
            SdoRequest::ReqUploadSegment { t: false }
        ));
        remote
            .respond(SdoResponse::upload_segment(false, true, &[]))
            .await;
    });

    let mut sink = Vec::new();
    let count = client.upload_to(0x3004, 4, &mut sink, &opts()).await.unwrap();
    assert_eq!(0, count);
    assert!(sink.is_empty());
    server.await.unwrap();
}

#[tokio::test]
async fn test_download_declares_size_and_moves_exactly() {
    let (mut client, mut remote) = setup();
    // 16 bytes does not divide into 7-byte segments evenly
    let payload: Vec<u8> = (0u8..16).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        match remote.expect_request().await {
            SdoRequest::InitiateDownload {
                e: false,
                s: true,
                index: 0x3005,
                sub: 4,
                data,
                ..
            } => {
                assert_eq!(16, u32::from_le_bytes(data));
            }
            other => panic!("unexpected request {other:?}"),
        }
        remote
            .respond(SdoResponse::download_acknowledge(0x3005, 4))
            .await;

        let mut received = Vec::new();
        let mut toggle = false;
        loop {
            let (t, n, c, data) = match remote.expect_request().await {
                SdoRequest::DownloadSegment { t, n, c, data } => (t, n, c, data),
                other => panic!("unexpected request {other:?}"),
            };
            assert_eq!(toggle, t);
            received.extend_from_slice(&data[0..7 - n as usize]);
            remote
                .respond(SdoResponse::download_segment_acknowledge(t))
                .await;
            toggle = !toggle;
            if c {
                break;
            }
        }
        assert_eq!(expected, received);
    });

    let count = client
        .download_from(0x3005, 4, &mut Cursor::new(payload), 16, &opts())
        .await
        .unwrap();
    assert_eq!(16, count);
    server.await.unwrap();
}

#[tokio::test]
async fn test_zero_length_download_sends_one_empty_segment() {
    let (mut client, mut remote) = setup();

    let server = tokio::spawn(async move {
        match remote.expect_request().await {
            SdoRequest::InitiateDownload { s, data, .. } => {
                assert!(s);
                assert_eq!(0, u32::from_le_bytes(data));
            }
            other => panic!("unexpected request {other:?}"),
        }
        remote
            .respond(SdoResponse::download_acknowledge(0x3005, 4))
            .await;
        match remote.expect_request().await {
            SdoRequest::DownloadSegment { n, c, .. } => {
                assert_eq!(7, n);
                assert!(c);
            }
            other => panic!("unexpected request {other:?}"),
        }
        remote
            .respond(SdoResponse::download_segment_acknowledge(false))
            .await;
    });

    let count = client
        .download_from(0x3005, 4, &mut Cursor::new(Vec::new()), 0, &opts())
        .await
        .unwrap();
    assert_eq!(0, count);
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_abort_is_reported() {
    let (mut client, mut remote) = setup();

    let server = tokio::spawn(async move {
        remote.expect_request().await;
        remote
            .respond(SdoResponse::abort(0x9999, 0, AbortCode::NoSuchObject))
            .await;
    });

    let mut sink = Vec::new();
    let err = client
        .upload_to(0x9999, 0, &mut sink, &opts())
        .await
        .unwrap_err();
    match err {
        EngineError::ProtocolAbort { code, .. } => {
            assert_eq!(RawAbortCode::Valid(AbortCode::NoSuchObject), code);
        }
        other => panic!("expected protocol abort, got {other:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_setup_timeout_is_local_and_bounded() {
    // No remote at all: the initiate gets no answer
    let (mut client, _remote) = setup();
    let opts = TransferOptions {
        response_timeout: Duration::from_millis(100),
        ..Default::default()
    };

    let start = Instant::now();
    let mut sink = Vec::new();
    let err = client
        .upload_to(0x1000, 0, &mut sink, &opts)
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, EngineError::LocalSetup { .. }), "{err:?}");
    assert!(
        elapsed < Duration::from_secs(2),
        "setup timeout took {elapsed:?}"
    );
    // And the flattened code is the general error, not zero
    assert_eq!(0x0800_0000, err.abort_code().raw());
}

#[tokio::test]
async fn test_block_download() {
    let (mut client, mut remote) = setup();
    let payload: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let size = match remote.expect_request().await {
            SdoRequest::InitiateBlockDownload {
                cc: true,
                s: true,
                index: 0x3005,
                sub: 4,
                size,
            } => size,
            other => panic!("unexpected request {other:?}"),
        };
        assert_eq!(100, size);
        remote
            .respond(SdoResponse::ConfirmBlockDownload {
                sc: true,
                index: 0x3005,
                sub: 4,
                blksize: 8,
            })
            .await;

        // 100 bytes = 15 segments; with blksize 8 that is one full block
        // plus a partial final one
        let mut received = Vec::new();
        for block in [8u8, 7u8] {
            let mut last_seq = 0;
            loop {
                let seg = remote.expect_segment().await;
                last_seq = seg.seqnum;
                received.extend_from_slice(&seg.data);
                if seg.c || seg.seqnum == 8 {
                    break;
                }
            }
            assert_eq!(block, last_seq);
            remote
                .respond(SdoResponse::ConfirmBlock {
                    ackseq: last_seq,
                    blksize: 8,
                })
                .await;
        }

        let (n, crc) = match remote.expect_request().await {
            SdoRequest::EndBlockDownload { n, crc } => (n, crc),
            other => panic!("unexpected request {other:?}"),
        };
        received.truncate(received.len() - n as usize);
        assert_eq!(expected, received);
        assert_eq!(crc16::State::<crc16::XMODEM>::calculate(&received), crc);
        remote.respond(SdoResponse::ConfirmBlockDownloadEnd).await;
    });

    let opts = TransferOptions {
        block_mode: true,
        ..opts()
    };
    let count = client
        .download_from(0x3005, 4, &mut Cursor::new(payload), 100, &opts)
        .await
        .unwrap();
    assert_eq!(100, count);
    server.await.unwrap();
}

#[tokio::test]
async fn test_block_upload() {
    let (mut client, mut remote) = setup();
    let payload: Vec<u8> = (0..40u32).map(|i| (i * 3) as u8).collect();
    let server_payload = payload.clone();

    let server = tokio::spawn(async move {
        match remote.expect_request().await {
            SdoRequest::InitiateBlockUpload {
                index: 0x3004,
                sub: 4,
                cc: true,
                ..
            } => {}
            other => panic!("unexpected request {other:?}"),
        }
        remote
            .respond(SdoResponse::ConfirmBlockUpload {
                sc: true,
                s: true,
                index: 0x3004,
                sub: 4,
                size: server_payload.len() as u32,
            })
            .await;
        assert!(matches!(
            remote.expect_request().await,
            SdoRequest::StartBlockUpload
        ));

        // 40 bytes = 6 segments, one block
        let segments = server_payload.chunks(7).collect::<Vec<_>>();
        for (i, chunk) in segments.iter().enumerate() {
            let mut data = [0u8; 7];
            data[0..chunk.len()].copy_from_slice(chunk);
            let seg = BlockSegment {
                c: i == segments.len() - 1,
                seqnum: (i + 1) as u8,
                data,
            };
            remote
                .tx
                .send(CanMessage::new(
                    CanId::Std(SDO_RESP_BASE + NODE_ID as u16),
                    &seg.to_bytes(),
                ))
                .await
                .unwrap();
        }

        match remote.expect_request().await {
            SdoRequest::ConfirmBlock { ackseq, .. } => assert_eq!(6, ackseq),
            other => panic!("unexpected request {other:?}"),
        }
        let n = (7 - server_payload.len() % 7) % 7;
        let crc = crc16::State::<crc16::XMODEM>::calculate(&server_payload);
        remote
            .respond(SdoResponse::BlockUploadEnd { n: n as u8, crc })
            .await;
        assert!(matches!(
            remote.expect_request().await,
            SdoRequest::EndBlockUpload
        ));
    });

    let opts = TransferOptions {
        block_mode: true,
        ..opts()
    };
    let mut sink = Vec::new();
    let count = client.upload_to(0x3004, 4, &mut sink, &opts).await.unwrap();
    assert_eq!(40, count);
    assert_eq!(payload, sink);
    server.await.unwrap();
}

#[tokio::test]
async fn test_sink_failure_is_local_io() {
    struct FailingSink;
    impl std::io::Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("sink is broken"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let (mut client, mut remote) = setup();
    let server = tokio::spawn(async move {
        remote.expect_request().await;
        remote
            .respond(SdoResponse::upload_acknowledge(0x3004, 4, 20))
            .await;
        remote.expect_request().await;
        remote
            .respond(SdoResponse::upload_segment(false, false, &[1; 7]))
            .await;
        // The client aborts after the sink write fails
        match remote.expect_request().await {
            SdoRequest::Abort { .. } => {}
            other => panic!("expected abort, got {other:?}"),
        }
    });

    let err = client
        .upload_to(0x3004, 4, &mut FailingSink, &opts())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LocalIo { .. }), "{err:?}");
    server.await.unwrap();
}
