//! Bus-wide node tracking and a mutex-guarded SDO client pool
pub mod bus_manager;
pub mod shared_receiver;
pub mod shared_sender;
