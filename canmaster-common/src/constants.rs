//! Constants defining standard object and special values
//!
//!

/// Object indices for standard objects
pub mod object_ids {
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// Save objects command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// The auto start object index
    pub const AUTO_START: u16 = 0x5000;

    /// Pending firmware upload metadata: size, CRC, image type, target bank, and version
    pub const FW_METADATA: u16 = 0x1F57;
    /// Written to begin a firmware transfer session
    pub const FW_START: u16 = 0x1F51;
    /// Streamed firmware data chunks
    pub const FW_DATA: u16 = 0x1F50;
    /// Finalizes a firmware transfer, carrying the expected CRC of the complete image
    pub const FW_FINALIZE: u16 = 0x1F5A;
    /// The CRC of the firmware currently stored on the node
    pub const FW_REMOTE_CRC: u16 = 0x1F5B;
    /// The version of the firmware currently stored on the node
    pub const FW_REMOTE_VERSION: u16 = 0x1F5C;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value used to trigger object storage by writing to object 0x1010
    pub const SAVE_CMD: u32 = 0x73617665;
}
