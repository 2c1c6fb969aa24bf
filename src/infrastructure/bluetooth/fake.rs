//! Recording transport for tests
//!
//! Logs every call it receives and never produces events on its own; tests
//! inject `TransportEvent`s to play the peripheral's side.

use crate::domain::models::Peripheral;
use crate::infrastructure::bluetooth::connection::BleConnection;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    DiscoveredCharacteristic, DiscoveredService, LinkId, RequestId, ScanId, Transport,
    TransportFailure, TransportResult,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(ScanId, Uuid),
    StopScan(ScanId),
    Connect(LinkId, String),
    Disconnect(LinkId),
    Close(LinkId),
    DiscoverServices(LinkId),
    Read {
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl Call {
    pub fn is_gatt_io(&self) -> bool {
        matches!(self, Call::Read { .. } | Call::Write { .. })
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    adapter_disabled: bool,
    permission_denied: bool,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    /// Read/write calls in dispatch order
    pub fn gatt_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_gatt_io).collect()
    }

    /// Token of the most recently dispatched read or write
    pub fn last_request(&self) -> Option<RequestId> {
        self.calls().iter().rev().find_map(|c| match c {
            Call::Read { request, .. } | Call::Write { request, .. } => Some(*request),
            _ => None,
        })
    }

    pub fn last_scan(&self) -> Option<ScanId> {
        self.calls().iter().rev().find_map(|c| match c {
            Call::StartScan(scan, _) => Some(*scan),
            _ => None,
        })
    }

    pub fn last_link(&self) -> Option<LinkId> {
        self.calls().iter().rev().find_map(|c| match c {
            Call::Connect(link, _) => Some(*link),
            _ => None,
        })
    }

    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().adapter_disabled = !enabled;
    }

    pub fn set_permission_denied(&self, denied: bool) {
        self.state.lock().unwrap().permission_denied = denied;
    }

    fn record(&self, call: Call) -> TransportResult {
        let mut state = self.state.lock().unwrap();
        if state.permission_denied {
            return Err(TransportFailure::PermissionDenied);
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn adapter_enabled(&self) -> bool {
        !self.state.lock().unwrap().adapter_disabled
    }

    async fn start_scan(&self, scan: ScanId, filter: Uuid) -> TransportResult {
        self.record(Call::StartScan(scan, filter))
    }

    async fn stop_scan(&self, scan: ScanId) -> TransportResult {
        self.record(Call::StopScan(scan))
    }

    async fn connect(&self, link: LinkId, address: &str) -> TransportResult {
        self.record(Call::Connect(link, address.to_string()))
    }

    async fn disconnect(&self, link: LinkId) -> TransportResult {
        self.record(Call::Disconnect(link))
    }

    async fn close(&self, link: LinkId) {
        self.state.lock().unwrap().calls.push(Call::Close(link));
    }

    async fn discover_services(&self, link: LinkId) -> TransportResult {
        self.record(Call::DiscoverServices(link))
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult {
        self.record(Call::Read {
            link,
            request,
            service,
            characteristic,
        })
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> TransportResult {
        self.record(Call::Write {
            link,
            request,
            service,
            characteristic,
            value,
        })
    }
}

/// The peripheral's GATT table as discovery reports it
pub fn known_services() -> Vec<DiscoveredService> {
    let characteristic = |uuid, readable, writable| DiscoveredCharacteristic {
        uuid,
        readable,
        writable,
    };
    vec![DiscoveredService {
        uuid: protocol::SERVICE_UUID,
        characteristics: vec![
            characteristic(protocol::READ_CHAR_UUID, true, false),
            characteristic(protocol::PERCENTAGE_CHAR_UUID, true, true),
            characteristic(protocol::SWITCH_CHAR_UUID, true, true),
        ],
    }]
}

/// Drive a fresh state machine to `Ready` against `fake`
pub async fn ready_connection(fake: &FakeTransport) -> BleConnection {
    let mut connection = BleConnection::new(Duration::from_millis(protocol::OPERATION_TIMEOUT_MS));
    connection
        .connect(fake, Peripheral::from_address("AA:BB:CC:DD:EE:FF"))
        .await
        .unwrap();
    let link = connection.link().unwrap();
    connection.on_connection_state(fake, link, true, Ok(())).await;
    connection
        .on_services_discovered(fake, link, Ok(known_services()))
        .await;
    connection
}
