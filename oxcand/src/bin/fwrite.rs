//! Write a local file into a remote node's outbound file cache

use std::io::Cursor;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use oxcan_client::{EngineError, SdoClient, TransferOptions};
use oxcan_common::constants::{file_transfer_subs as subs, object_ids};
use oxcan_common::open_socketcan;

#[derive(Parser)]
#[command(name = "fwrite", about = "Store a local file into a remote node's cache")]
struct Args {
    /// CAN interface, e.g. "can0"
    interface: String,

    /// Remote node id
    #[arg(value_parser = parse_int)]
    node_id: u8,

    /// Local file to send
    src: String,

    /// Name to store the file under; defaults to the source's file name
    dest: Option<String>,
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

    let src = Path::new(&args.src);
    if !src.is_file() {
        println!("file does not exist: {}", args.src);
        return ExitCode::FAILURE;
    }
    let name = match &args.dest {
        Some(dest) => dest.clone(),
        None => match src.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                println!("can't derive a file name from {}", args.src);
                return ExitCode::FAILURE;
            }
        },
    };

    let (tx, rx) = match open_socketcan(&args.interface, None) {
        Ok(pair) => pair,
        Err(e) => {
            println!("can't open CAN interface {}: {e}", args.interface);
            return ExitCode::FAILURE;
        }
    };
    let mut client = SdoClient::new_std(args.node_id, tx, rx);
    let opts = TransferOptions::default();

    // Name the entry, then stream the file into the data sub
    let name_bytes = name.as_bytes();
    if let Err(e) = client
        .download_from(
            object_ids::FWRITE_CACHE,
            subs::NAME,
            &mut Cursor::new(name_bytes),
            name_bytes.len() as u64,
            &opts,
        )
        .await
    {
        report(&e);
        return ExitCode::FAILURE;
    }

    match client
        .download_from_file(object_ids::FWRITE_CACHE, subs::DATA, src, &opts)
        .await
    {
        Ok(count) => {
            println!("wrote {count} bytes as {name}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
