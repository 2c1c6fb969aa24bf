//! Transport Capability
//!
//! The BLE adapter seen from the session. Every method only issues a request
//! and reports whether the adapter accepted it; the actual outcome arrives
//! later as a [`TransportEvent`] on the channel the transport was built with.
//! Events echo the scan/link/request token they belong to so the session can
//! discard anything that refers to work it has already finished.

use crate::domain::error::SessionError;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub u64);

/// Identifies one connection attempt and everything done on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// Identifies one dispatched read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Failure reported by the transport, either immediately or in an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("permission denied")]
    PermissionDenied,
    #[error("adapter disabled")]
    AdapterDisabled,
    #[error("GATT status {0:#04x}")]
    Status(u8),
    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T = ()> = Result<T, TransportFailure>;

impl From<TransportFailure> for SessionError {
    fn from(failure: TransportFailure) -> Self {
        match failure {
            TransportFailure::PermissionDenied => Self::PermissionDenied,
            TransportFailure::AdapterDisabled => Self::AdapterDisabled,
            TransportFailure::Status(status) => Self::OperationFailed { status },
            TransportFailure::Other(message) => Self::Transport(message),
        }
    }
}

/// Advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Asynchronous outcomes delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ScanResult {
        scan: ScanId,
        advertisement: Advertisement,
    },
    ScanFailed {
        scan: ScanId,
        reason: TransportFailure,
    },
    ConnectionStateChanged {
        link: LinkId,
        connected: bool,
        status: TransportResult,
    },
    ServicesDiscovered {
        link: LinkId,
        result: TransportResult<Vec<DiscoveredService>>,
    },
    ReadComplete {
        link: LinkId,
        request: RequestId,
        characteristic: Uuid,
        result: TransportResult<Vec<u8>>,
    },
    WriteComplete {
        link: LinkId,
        request: RequestId,
        characteristic: Uuid,
        result: TransportResult,
    },
}

/// BLE adapter operations consumed by the session
///
/// Implementations run their own authorization check before each operation
/// and report a missing grant as [`TransportFailure::PermissionDenied`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the radio is switched on
    async fn adapter_enabled(&self) -> bool;

    async fn start_scan(&self, scan: ScanId, filter: Uuid) -> TransportResult;

    async fn stop_scan(&self, scan: ScanId) -> TransportResult;

    async fn connect(&self, link: LinkId, address: &str) -> TransportResult;

    async fn disconnect(&self, link: LinkId) -> TransportResult;

    /// Release every resource held for `link`
    async fn close(&self, link: LinkId);

    async fn discover_services(&self, link: LinkId) -> TransportResult;

    async fn read_characteristic(
        &self,
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult;

    async fn write_characteristic(
        &self,
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> TransportResult;
}
