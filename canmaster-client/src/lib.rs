//! A client for commissioning and upgrading CANopen nodes on a CAN bus
//!
//! The crate provides utilities for bringing up unconfigured nodes and talking to them, including:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary via its SDO server
//! - An [LSS master](LssMaster) for discovering and configuring un-configured nodes with IDs
//! - A [BusManager] which is intended to be the engine behind an application, such as `canmaster-cli`,
//!   keeping track of nodes, and providing an API for managing them.
//! - A [MasterContext] which runs the automatic commissioning state machine: scanning for
//!   unconfigured nodes, assigning them IDs, and kicking off firmware uploads once they settle.
//! - A [fw_upload] module implementing the SDO-based firmware transfer protocol.
//! - Defining a [NodeConfig] TOML file format, which allows for storing and loading node configuration (primarily
//!   PDOs, but any objects can be written)
//!
//! This library is currently based on tokio/async. The plan is to also include blocking APIs in the
//! future.
//!
//! This should be considered very alpha, with important missing features, and potentially frequent
//! breaking API changes.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bus_manager;
pub mod fw_upload;
mod lss_master;
pub mod master_context;
pub mod nmt_master;
mod node_configuration;
mod sdo_client;
pub use canmaster_common as common;

pub use bus_manager::bus_manager::BusManager;
pub use fw_upload::{FirmwareTransport, FwUploadError, ImageType, SdoFirmwareTransport, UploadPlan};
pub use lss_master::{LssError, LssMaster};
pub use master_context::{
    CommissioningEvent, ConfiguredNode, FirmwareSource, LssMasterState, MasterConfig, MasterContext,
};
pub use node_configuration::{
    FirmwarePlan, FirmwarePlanEntry, FirmwarePlanImageType, NodeConfig, PdoConfig, PdoMapping,
};
pub use sdo_client::{RawAbortCode, SdoClient, SdoClientError};
