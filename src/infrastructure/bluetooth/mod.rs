//! Bluetooth Module
//!
//! Client-side GATT session with a single BLE peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                     │
//! │   (cloneable handle, commands go to the session worker) │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!       ┌───────────┬───┴────────┬────────────┐
//!       ▼           ▼            ▼            ▼
//! ┌──────────┐ ┌────────────┐ ┌─────────┐ ┌─────────┐
//! │ Scanner  │ │ Connection │ │  Queue  │ │ Poller  │
//! │          │ │            │ │         │ │         │
//! │ - scan   │ │ - states   │ │ - FIFO  │ │ - timed │
//! │ - timeout│ │ - GATT map │ │ - 1 out │ │   reads │
//! └────┬─────┘ └─────┬──────┘ └────┬────┘ └─────────┘
//!      └─────────────┼─────────────┘
//!                    ▼
//!         ┌────────────────────┐
//!         │     Transport      │
//!         │ (btleplug or fake) │
//!         └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, timing defaults and the value codec
//! - [`transport`] - Transport trait, correlation tokens and events
//! - [`scanner`] - Time-bounded advertisement scan
//! - [`connection`] - Connection state machine and discovered GATT table
//! - [`queue`] - Serialized GATT operation queue
//! - [`poller`] - Periodic characteristic reads
//! - [`service`] - Session worker and public handle
//! - [`btleplug_transport`] - Transport backed by the system adapter

pub mod btleplug_transport;
pub mod connection;
#[cfg(test)]
pub mod fake;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod scanner;
pub mod service;
pub mod transport;

// Re-export main service for convenience
pub use service::{BluetoothService, PendingOperation, SessionConfig, SessionSnapshot};
