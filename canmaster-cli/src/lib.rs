//! Command-line utilities for CANopen commissioning and firmware upload
//!
//! # canmaster-cli
//!
//! A REPL-style interactive shell for controlling CAN devices: reading and writing objects over
//! SDO, driving LSS commissioning by hand or automatically, and uploading firmware images.
//!
//! Usage example: `canmaster-cli can0`

pub mod command;
