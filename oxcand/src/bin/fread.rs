//! Read a file out of a remote node's inbound file cache

use std::io::Cursor;
use std::process::ExitCode;

use clap::Parser;
use oxcan_client::{EngineError, SdoClient, TransferOptions};
use oxcan_common::constants::{file_transfer_subs as subs, object_ids};
use oxcan_common::open_socketcan;

#[derive(Parser)]
#[command(name = "fread", about = "Fetch a cached file from a remote node")]
struct Args {
    /// CAN interface, e.g. "can0"
    interface: String,

    /// Remote node id
    #[arg(value_parser = parse_int)]
    node_id: u8,

    /// Name of the cached file; also used as the local destination path
    src: String,
}

fn parse_int(s: &str) -> Result<u8, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

fn report(e: &EngineError) {
    match e {
        EngineError::ProtocolAbort { code, .. } => {
            println!("SDO Abort: 0x{:08X} - {}", code.raw(), code);
        }
        other => println!("{other}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let (tx, rx) = match open_socketcan(&args.interface, None) {
        Ok(pair) => pair,
        Err(e) => {
            println!("can't open CAN interface {}: {e}", args.interface);
            return ExitCode::FAILURE;
        }
    };
    let mut client = SdoClient::new_std(args.node_id, tx, rx);
    let opts = TransferOptions::default();

    // Select the file, then stream its data to a local file of the same name
    let name = args.src.as_bytes();
    if let Err(e) = client
        .download_from(
            object_ids::FREAD_CACHE,
            subs::NAME,
            &mut Cursor::new(name),
            name.len() as u64,
            &opts,
        )
        .await
    {
        report(&e);
        return ExitCode::FAILURE;
    }

    match client
        .upload_to_file(object_ids::FREAD_CACHE, subs::DATA, &args.src, &opts)
        .await
    {
        Ok(count) => {
            println!("read {count} bytes into {}", args.src);
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
