//! Constants defining standard and oxcan-specific object addresses

/// Object indices for the dictionary entries oxcand serves
pub mod object_ids {
    /// The device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// The inbound file cache record, served for remote reads
    pub const FREAD_CACHE: u16 = 0x3004;
    /// The outbound file cache record, accepting remote writes
    pub const FWRITE_CACHE: u16 = 0x3005;
}

/// Subindex layout of the file transfer cache records
pub mod file_transfer_subs {
    /// Highest supported subindex (read-only constant)
    pub const HIGHEST_SUB: u8 = 0;
    /// Number of files in the cache
    pub const COUNT: u8 = 1;
    /// JSON array of cached file names
    pub const LISTING: u8 = 2;
    /// Selects the file subsequent data/remove operations act on
    pub const NAME: u8 = 3;
    /// File content of the selected entry
    pub const DATA: u8 = 4;
    /// Write true to remove the selected entry
    pub const REMOVE: u8 = 5;
}
