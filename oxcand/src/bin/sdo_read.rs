//! Read a dictionary entry from a remote node and print it

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use oxcan_client::{EngineError, SdoClient, TransferOptions};
use oxcan_common::open_socketcan;

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum SdoDataType {
    B,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    Bytes,
}

#[derive(Parser)]
#[command(name = "sdo-read", about = "Read an object from a remote node over SDO")]
struct Args {
    /// CAN interface, e.g. "can0"
    interface: String,

    /// Remote node id
    #[arg(value_parser = parse_u8)]
    node_id: u8,

    /// Object index
    #[arg(value_parser = parse_u16)]
    index: u16,

    /// Object sub-index
    #[arg(value_parser = parse_u8)]
    subindex: u8,

    /// How to print the value; defaults to a hex dump
    dtype: Option<SdoDataType>,
}

fn parse_u8(s: &str) -> Result<u8, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

fn parse_u16(s: &str) -> Result<u16, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

fn format_value(dtype: SdoDataType, data: &[u8]) -> Result<String, String> {
    let wrong_size = || format!("value has unexpected size {}", data.len());

    macro_rules! fixed {
        ($type: ty) => {{
            let bytes = data.try_into().map_err(|_| wrong_size())?;
            Ok(<$type>::from_le_bytes(bytes).to_string())
        }};
    }

    match dtype {
        SdoDataType::B => match data {
            [b] => Ok((*b != 0).to_string()),
            _ => Err(wrong_size()),
        },
        SdoDataType::I8 => match data {
            [b] => Ok((*b as i8).to_string()),
            _ => Err(wrong_size()),
        },
        SdoDataType::U8 => match data {
            [b] => Ok(b.to_string()),
            _ => Err(wrong_size()),
        },
        SdoDataType::I16 => fixed!(i16),
        SdoDataType::I32 => fixed!(i32),
        SdoDataType::I64 => fixed!(i64),
        SdoDataType::U16 => fixed!(u16),
        SdoDataType::U32 => fixed!(u32),
        SdoDataType::U64 => fixed!(u64),
        SdoDataType::F32 => fixed!(f32),
        SdoDataType::F64 => fixed!(f64),
        SdoDataType::Str => Ok(String::from_utf8_lossy(data).into_owned()),
        SdoDataType::Bytes => Ok(hex_dump(data)),
    }
}

fn hex_dump(data: &[u8]) -> String {
    let mut out = String::from("0x");
    for byte in data {
        out.push_str(&format!("{byte:02x}"));
    }
    out
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

    let mut value = Vec::new();
    match client
        .upload_to(args.index, args.subindex, &mut value, &opts)
        .await
    {
        Ok(_) => {
            let dtype = args.dtype.unwrap_or(SdoDataType::Bytes);
            match format_value(dtype, &value) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    println!("{e}");
                    println!("{}", hex_dump(&value));
                }
            }
            ExitCode::SUCCESS
        }
        Err(EngineError::ProtocolAbort { code, .. }) => {
            println!("SDO Abort: 0x{:08X} - {}", code.raw(), code);
            ExitCode::FAILURE
        }
        Err(e) => {
            println!("{e}");
            ExitCode::FAILURE
        }
    }
}
