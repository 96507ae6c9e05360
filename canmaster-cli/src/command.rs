use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_num::maybe_hex;
use std::{path::PathBuf, str::FromStr};

#[derive(Debug, Parser)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Read an object via SDO
    Read(ReadArgs),
    /// Write an object via SDO
    Write(WriteArgs),
    /// Scan all node IDs to find configured devices
    Scan,
    /// Print info about nodes
    Info,
    /// Load a configuration from a file to a node
    LoadConfig(LoadConfigArgs),
    /// Send command to save persistable objects
    SaveObjects(SaveObjectsArgs),
    /// NMT commands
    Nmt(NmtArgs),
    /// LSS commands
    #[command(subcommand)]
    Lss(LssCommands),
    /// Run the automatic commissioning loop: fastscan, assign an ID, optionally upload firmware
    Commission(CommissionArgs),
    /// Upload firmware to one or more already-configured nodes
    UploadFirmware(UploadFirmwareArgs),
}

#[derive(Debug, Args)]
pub struct CommissionArgs {
    /// Path to a firmware image to upload to every newly commissioned node
    #[arg(long, value_hint=clap::ValueHint::FilePath)]
    pub firmware: Option<PathBuf>,
    /// Firmware version number to record alongside an uploaded image
    #[arg(long, default_value_t = 1)]
    pub firmware_version: u16,
    /// Flash bank to target when uploading firmware
    #[arg(long, default_value_t = 0)]
    pub target_bank: u8,
}

#[derive(Debug, Args)]
pub struct UploadFirmwareArgs {
    /// Path to a TOML manifest listing node IDs, images, banks and versions to upload
    ///
    /// When given, all other arguments are ignored and every entry in the manifest is uploaded.
    #[arg(long, value_hint=clap::ValueHint::FilePath)]
    pub plan: Option<PathBuf>,
    /// The node ID to upload to, when not using `--plan`
    pub node_id: Option<u8>,
    /// Path to the firmware image, when not using `--plan`
    #[arg(value_hint=clap::ValueHint::FilePath)]
    pub image: Option<PathBuf>,
    /// Firmware version number to record alongside the image
    #[arg(long, default_value_t = 1)]
    pub firmware_version: u16,
    /// Flash bank to target
    #[arg(long, default_value_t = 0)]
    pub target_bank: u8,
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    /// The ID of the node to read from
    pub node_id: u8,
    /// The object index to read
    #[clap(value_parser=maybe_hex::<u16>)]
    pub index: u16,
    /// The sub object to read
    #[clap(value_parser=maybe_hex::<u8>)]
    pub sub: u8,
    /// How to interpret the response (optional)
    pub data_type: Option<SdoDataType>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SdoDataType {
    U32,
    U16,
    U8,
    I32,
    I16,
    I8,
    F32,
    Utf8,
}

#[derive(Debug, Args)]
pub struct WriteArgs{
        /// The ID of the node to read from
        pub node_id: u8,
        /// The object index to read
        #[clap(value_parser=maybe_hex::<u16>)]
        pub index: u16,
        /// The sub object to read
        #[clap(value_parser=maybe_hex::<u8>)]
        pub sub: u8,
        /// How to interpret the value
        pub data_type: SdoDataType,
        /// The value to write
        pub value: String
}

#[derive(Debug, Args)]
pub struct LoadConfigArgs {
    /// The ID of the node to load the configuration into
    pub node_id: u8,
    /// Path to a node config TOML file
    #[arg(value_hint=clap::ValueHint::FilePath)]
    pub path: PathBuf,
}

#[derive(Debug, Args)]
pub struct SaveObjectsArgs {
    /// The ID of the node to command
    pub node_id: u8
}

/// Specifies a node to apply an NMT command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NmtNodeArg {
    All,
    Specific(u8),
}

impl NmtNodeArg {
    pub fn raw(&self) -> u8 {
        match self {
            Self::All => 0,
            Self::Specific(id) => *id,
        }
    }
}

impl FromStr for NmtNodeArg {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u8>() {
            Ok(num) => {
                if num == 0 {
                    Ok(Self::All)
                } else if num < 128 {
                    Ok(Self::Specific(num))
                } else {
                    Err("Node ID must be between 0 and 127")
                }
            }
            Err(_) => {
                if s == "all" {
                    Ok(Self::All)
                } else {
                    Err("Must specify a node ID, or 'all' to broadcast")
                }
            }
        }
    }
}

#[derive(Debug, Args)]
pub struct NmtArgs {
    pub action: NmtAction,
    /// Specify the node ID to command. Use '0' or 'all' to broadcast to all nodes.
    pub node: NmtNodeArg,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
pub enum NmtAction {
    ResetApp,
    ResetComms,
    Start,
    Stop,
}

/// A node's 128-bit LSS identity, given as four separate values on the command line
#[derive(Debug, Clone, Copy, Args)]
pub struct IdentityArg {
    /// Vendor ID
    #[clap(value_parser=maybe_hex::<u32>)]
    pub vendor_id: u32,
    /// Product code
    #[clap(value_parser=maybe_hex::<u32>)]
    pub product_code: u32,
    /// Revision number
    #[clap(value_parser=maybe_hex::<u32>)]
    pub revision: u32,
    /// Serial number
    #[clap(value_parser=maybe_hex::<u32>)]
    pub serial: u32,
}

#[derive(Debug, Subcommand)]
pub enum LssCommands {
    /// Activate (select) a node by its LSS identity, putting it in configuration mode
    Activate {
        #[command(flatten)]
        identity: IdentityArg,
    },
    /// Perform a fastscan to find an unconfigured node
    Fastscan {
        /// How long to search before giving up, in milliseconds
        #[arg(default_value_t = 10_000)]
        timeout: u64,
    },
    /// Assign a node ID, optionally activating by identity first
    SetNodeId {
        node_id: u8,
        #[command(flatten)]
        identity: Option<IdentityArg>,
    },
    /// Command the selected node to persist its current LSS configuration
    StoreConfig {
        #[command(flatten)]
        identity: Option<IdentityArg>,
    },
    /// Globally enable or disable configuration mode for all nodes on the bus
    Global {
        /// 0 to return nodes to the waiting state, any other value to select configuration mode
        enable: i32,
    },
}
