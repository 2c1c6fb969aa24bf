//! BLE GATT session
//!
//! Scans for a peripheral, connects, discovers its GATT table and runs
//! serialized reads and writes against it, including a periodic poll.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
