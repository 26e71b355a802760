//! End-to-end file transfer tests: a client drives the daemon's SDO server
//! and file transfer records exactly the way the fread/fwrite tools do.

use std::fs;
use std::time::Duration;

use oxcan_client::{EngineError, SdoClient, TransferOptions};
use oxcan_common::constants::{file_transfer_subs as subs, object_ids};
use oxcan_common::sdo::{AbortCode, RawAbortCode};

use oxcand::cache::file_crc32;

mod common;
use common::RemoteNode;

const NODE_ID: u8 = 0x7C;

fn opts() -> TransferOptions {
    TransferOptions {
        response_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn client_for(node: &RemoteNode) -> SdoClient<common::ChanSender, common::ChanReceiver> {
    let (tx, rx) = node.spawn();
    SdoClient::new_std(NODE_ID, tx, rx)
}

async fn select_file(
    client: &mut SdoClient<common::ChanSender, common::ChanReceiver>,
    index: u16,
    name: &str,
) {
    client
        .download(index, subs::NAME, name.as_bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_file_round_trip() {
    // 1013 bytes does not divide into 7-byte segments evenly
    let payload: Vec<u8> = (0..1013u32).map(|i| (i % 251) as u8).collect();

    let node = RemoteNode::new(NODE_ID);
    node.fread
        .add("blob.bin", &mut payload.as_slice())
        .unwrap();

    let local_dir = tempfile::tempdir().unwrap();
    let local_path = local_dir.path().join("blob.bin");

    // Fetch from the inbound cache, the way fread does
    let mut client = client_for(&node);
    select_file(&mut client, object_ids::FREAD_CACHE, "blob.bin").await;
    let count = client
        .upload_to_file(object_ids::FREAD_CACHE, subs::DATA, &local_path, &opts())
        .await
        .unwrap();
    assert_eq!(payload.len() as u64, count);
    assert_eq!(payload, fs::read(&local_path).unwrap());
    assert!(node.fread.verify_matches("blob.bin", &local_path).unwrap());

    // Send the identical copy back through the outbound cache, the way
    // fwrite does
    select_file(&mut client, object_ids::FWRITE_CACHE, "blob.bin").await;
    let count = client
        .download_from_file(object_ids::FWRITE_CACHE, subs::DATA, &local_path, &opts())
        .await
        .unwrap();
    assert_eq!(payload.len() as u64, count);

    assert_eq!(vec!["blob.bin".to_string()], node.fwrite.list());
    assert_eq!(payload.len() as u64, node.fwrite.size_of("blob.bin").unwrap());
    assert!(node.fwrite.verify_matches("blob.bin", &local_path).unwrap());
    assert_eq!(
        file_crc32(&node.fread.path_of("blob.bin").unwrap()).unwrap(),
        file_crc32(&node.fwrite.path_of("blob.bin").unwrap()).unwrap()
    );
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let node = RemoteNode::new(NODE_ID);
    node.fread.add("empty", &mut std::io::empty()).unwrap();

    let local_dir = tempfile::tempdir().unwrap();
    let local_path = local_dir.path().join("empty");

    let mut client = client_for(&node);
    select_file(&mut client, object_ids::FREAD_CACHE, "empty").await;
    let count = client
        .upload_to_file(object_ids::FREAD_CACHE, subs::DATA, &local_path, &opts())
        .await
        .unwrap();
    assert_eq!(0, count);
    assert_eq!(0, fs::metadata(&local_path).unwrap().len());

    select_file(&mut client, object_ids::FWRITE_CACHE, "empty").await;
    let count = client
        .download_from_file(object_ids::FWRITE_CACHE, subs::DATA, &local_path, &opts())
        .await
        .unwrap();
    assert_eq!(0, count);
    assert_eq!(0, node.fwrite.size_of("empty").unwrap());
    assert!(node.fwrite.verify_matches("empty", &local_path).unwrap());
}

#[tokio::test]
async fn test_listing_and_count_over_sdo() {
    let node = RemoteNode::new(NODE_ID);
    node.fread.add("a.bin", &mut [1u8].as_slice()).unwrap();
    node.fread.add("b.bin", &mut [2u8].as_slice()).unwrap();

    let mut client = client_for(&node);

    assert_eq!(
        2,
        client
            .read_u8(object_ids::FREAD_CACHE, subs::COUNT)
            .await
            .unwrap()
    );
    assert_eq!(
        "[\"a.bin\",\"b.bin\"]",
        client
            .read_visible_string(object_ids::FREAD_CACHE, subs::LISTING)
            .await
            .unwrap()
    );
    // Highest supported subindex is a fixed constant
    assert_eq!(
        5,
        client
            .read_u8(object_ids::FREAD_CACHE, subs::HIGHEST_SUB)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_remove_over_sdo() {
    let node = RemoteNode::new(NODE_ID);
    node.fread.add("a.bin", &mut [1u8].as_slice()).unwrap();
    node.fread.add("b.bin", &mut [2u8].as_slice()).unwrap();

    let mut client = client_for(&node);
    select_file(&mut client, object_ids::FREAD_CACHE, "a.bin").await;
    client
        .download(object_ids::FREAD_CACHE, subs::REMOVE, &[1])
        .await
        .unwrap();

    assert_eq!(
        1,
        client
            .read_u8(object_ids::FREAD_CACHE, subs::COUNT)
            .await
            .unwrap()
    );
    assert_eq!(vec!["b.bin".to_string()], node.fread.list());
}

#[tokio::test]
async fn test_selecting_missing_file_aborts() {
    let node = RemoteNode::new(NODE_ID);
    let mut client = client_for(&node);

    let err = client
        .download(object_ids::FREAD_CACHE, subs::NAME, b"missing.bin")
        .await
        .unwrap_err();
    match err {
        oxcan_client::SdoClientError::ServerAbort { abort_code, .. } => {
            assert_eq!(RawAbortCode::Valid(AbortCode::NoData), abort_code);
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_write_to_read_only_sub_aborts() {
    let node = RemoteNode::new(NODE_ID);
    let mut client = client_for(&node);

    let err = client
        .download(object_ids::FREAD_CACHE, subs::HIGHEST_SUB, &[9])
        .await
        .unwrap_err();
    match err {
        oxcan_client::SdoClientError::ServerAbort { abort_code, .. } => {
            assert_eq!(RawAbortCode::Valid(AbortCode::ReadOnly), abort_code);
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reading_outbound_data_aborts() {
    let node = RemoteNode::new(NODE_ID);
    node.fwrite.add("f", &mut [1u8].as_slice()).unwrap();

    let mut client = client_for(&node);
    select_file(&mut client, object_ids::FWRITE_CACHE, "f").await;
    // fwrite's data sub is write-only
    let mut sink = Vec::new();
    let err = client
        .upload_to(object_ids::FWRITE_CACHE, subs::DATA, &mut sink, &opts())
        .await
        .unwrap_err();
    match err {
        EngineError::ProtocolAbort { code, .. } => {
            assert_eq!(RawAbortCode::Valid(AbortCode::WriteOnly), code);
        }
        other => panic!("expected protocol abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_upload_aborts_and_leaves_cache_unchanged() {
    let node = RemoteNode::new(NODE_ID);
    node.fwrite.add("dup", &mut [1u8, 2, 3].as_slice()).unwrap();

    let local_dir = tempfile::tempdir().unwrap();
    let local_path = local_dir.path().join("dup");
    fs::write(&local_path, b"different content").unwrap();

    let mut client = client_for(&node);
    select_file(&mut client, object_ids::FWRITE_CACHE, "dup").await;
    let err = client
        .download_from_file(object_ids::FWRITE_CACHE, subs::DATA, &local_path, &opts())
        .await
        .unwrap_err();
    match err {
        EngineError::ProtocolAbort { code, .. } => {
            assert_eq!(RawAbortCode::Valid(AbortCode::CantStore), code);
        }
        other => panic!("expected protocol abort, got {other:?}"),
    }
    assert_eq!(3, node.fwrite.size_of("dup").unwrap());
}

#[tokio::test]
async fn test_identity_read_over_sdo() {
    let node = RemoteNode::new(NODE_ID);
    let mut client = client_for(&node);
    assert_eq!(
        0xCAFE,
        client.read_u32(object_ids::IDENTITY, 1).await.unwrap()
    );
}
