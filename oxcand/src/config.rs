//! Daemon configuration
//!
//! oxcand reads a TOML file; every field has a default, so an empty (or
//! absent) file yields a working configuration.
//!
//! ```toml
//! interface = "can0"
//! node_id = 0x7C
//! heartbeat_ms = 1000
//! cache_capacity = 16
//!
//! [identity]
//! vendor_id = 0xCAFE
//! product_code = 1
//!
//! [ipc]
//! respond_port = 5555
//! broadcast_port = 5556
//! consume_port = 5557
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Errors raised while loading the configuration
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("Failed to read config file {}", path.display()))]
    Read {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML for this config
    #[snafu(display("Failed to parse config file {}", path.display()))]
    Parse {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },
}

/// The four identity values served at object 0x1018
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// CiA assigned vendor ID
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

/// UDP ports of the three IPC sockets, all on loopback
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Request/reply socket
    pub respond_port: u16,
    /// Event push socket
    pub broadcast_port: u16,
    /// Administrative command socket
    pub consume_port: u16,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            respond_port: 5555,
            broadcast_port: 5556,
            consume_port: 5557,
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// CAN interface name, e.g. "can0"
    pub interface: String,
    /// This node's CANopen node ID
    pub node_id: u8,
    /// Heartbeat production period in milliseconds, 0 to disable
    pub heartbeat_ms: u16,
    /// Device type value served at object 0x1000
    pub device_type: u32,
    /// Directory holding the fread/fwrite cache directories
    ///
    /// Defaults to `/var/cache/oxcan`, falling back to `~/.cache/oxcan` when
    /// that is not writable.
    pub cache_root: Option<PathBuf>,
    /// Maximum number of files per cache
    pub cache_capacity: usize,
    /// Number of TPDOs local processes may trigger
    pub tpdo_count: u8,
    /// SDO client response timeout in milliseconds
    pub sdo_timeout_ms: u64,
    /// Request block transfers for proxied SDO access
    pub sdo_block_mode: bool,
    /// Identity record values
    pub identity: IdentityConfig,
    /// IPC socket ports
    pub ipc: IpcConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            node_id: 0x7C,
            heartbeat_ms: 1000,
            device_type: 0,
            cache_root: None,
            cache_capacity: 16,
            tpdo_count: 4,
            sdo_timeout_ms: 500,
            sdo_block_mode: false,
            identity: IdentityConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&text).context(ParseSnafu { path })
    }

    /// The cache root directory to use
    ///
    /// An explicitly configured root wins. Otherwise the system location is
    /// preferred, with the per-user cache directory as a fallback for
    /// unprivileged runs.
    pub fn resolve_cache_root(&self) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        let system = PathBuf::from("/var/cache/oxcan");
        if std::fs::create_dir_all(&system).is_ok() {
            return system;
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".cache/oxcan"),
            None => system,
        }
    }
}
