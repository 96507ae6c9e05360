#![cfg_attr(not(feature = "std"), no_std)]

pub mod constants;
pub mod lss;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::open_socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::{SocketCanReceiver, SocketCanSender};

pub use node_id::{ConfiguredId, NodeId};

pub use messages::{CanMessage, CanId, CanError};
