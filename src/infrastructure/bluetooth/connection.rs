//! BLE Connection Module
//!
//! Connection lifecycle state machine and the discovered GATT table.
//!
//! ```text
//! Disconnected -> Connecting -> DiscoveringServices -> Ready -> Disconnecting -> Disconnected
//! ```
//!
//! A transport-reported disconnect moves any state straight to
//! `Disconnected`. Entering `Disconnected` always closes the link and drops
//! the descriptors. Every method returns the state changes it caused so the
//! session can cancel queued work and notify observers.

use crate::domain::error::SessionResult;
use crate::domain::models::{ConnectionState, Peripheral};
use crate::infrastructure::bluetooth::transport::{
    DiscoveredService, LinkId, Transport, TransportResult,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub readable: bool,
    pub writable: bool,
    pub last_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: BTreeMap<Uuid, CharacteristicDescriptor>,
}

impl From<DiscoveredService> for ServiceDescriptor {
    fn from(service: DiscoveredService) -> Self {
        let characteristics = service
            .characteristics
            .into_iter()
            .map(|c| {
                (
                    c.uuid,
                    CharacteristicDescriptor {
                        uuid: c.uuid,
                        readable: c.readable,
                        writable: c.writable,
                        last_value: None,
                    },
                )
            })
            .collect();
        Self {
            uuid: service.uuid,
            characteristics,
        }
    }
}

/// One observed transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: Option<String>,
}

impl StateChange {
    fn new(from: ConnectionState, to: ConnectionState) -> Self {
        Self {
            from,
            to,
            reason: None,
        }
    }
}

struct Connection {
    link: LinkId,
    peripheral: Peripheral,
    state: ConnectionState,
    services: BTreeMap<Uuid, ServiceDescriptor>,
    disconnect_deadline: Option<Instant>,
}

/// BLE connection state machine
pub struct BleConnection {
    current: Option<Connection>,
    next_link: u64,
    disconnect_timeout: Duration,
}

impl BleConnection {
    /// `disconnect_timeout` bounds how long `Disconnecting` waits for the
    /// transport to confirm.
    pub fn new(disconnect_timeout: Duration) -> Self {
        Self {
            current: None,
            next_link: 1,
            disconnect_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.current
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn link(&self) -> Option<LinkId> {
        self.current.as_ref().map(|c| c.link)
    }

    pub fn peripheral(&self) -> Option<&Peripheral> {
        self.current.as_ref().map(|c| &c.peripheral)
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.current
            .as_ref()
            .map(|c| c.services.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn disconnect_deadline(&self) -> Option<Instant> {
        self.current.as_ref().and_then(|c| c.disconnect_deadline)
    }

    /// Find a characteristic in the discovered table.
    ///
    /// Returns the owning service UUID alongside the descriptor.
    pub fn resolve(&self, characteristic: Uuid) -> Option<(Uuid, &CharacteristicDescriptor)> {
        self.current
            .as_ref()?
            .services
            .values()
            .find_map(|s| s.characteristics.get(&characteristic).map(|c| (s.uuid, c)))
    }

    /// Cache the last value observed for a characteristic
    pub fn record_value(&mut self, characteristic: Uuid, value: &[u8]) {
        let Some(conn) = self.current.as_mut() else {
            return;
        };
        if let Some(descriptor) = conn
            .services
            .values_mut()
            .find_map(|s| s.characteristics.get_mut(&characteristic))
        {
            descriptor.last_value = Some(value.to_vec());
        }
    }

    /// Request a connection to `peripheral`.
    ///
    /// The previous connection, if any, is released only once the transport
    /// has accepted the new request, so a refused connect changes nothing.
    pub async fn connect(
        &mut self,
        transport: &dyn Transport,
        peripheral: Peripheral,
    ) -> SessionResult<Vec<StateChange>> {
        let link = LinkId(self.next_link);
        self.next_link += 1;

        info!("Connecting to Bluetooth device: {}", peripheral);
        transport.connect(link, &peripheral.address).await?;

        let mut changes = self
            .enter_disconnected(transport, Some("replaced by a new connection"), true)
            .await;
        self.current = Some(Connection {
            link,
            peripheral,
            state: ConnectionState::Connecting,
            services: BTreeMap::new(),
            disconnect_deadline: None,
        });
        changes.push(StateChange::new(
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
        ));
        Ok(changes)
    }

    /// Handle a connection state callback from the transport
    pub async fn on_connection_state(
        &mut self,
        transport: &dyn Transport,
        link: LinkId,
        connected: bool,
        status: TransportResult,
    ) -> Vec<StateChange> {
        let Some(state) = self.state_for(link) else {
            debug!("Ignoring connection event for stale link {:?}", link);
            return Vec::new();
        };

        match (state, connected, status) {
            (ConnectionState::Connecting, true, Ok(())) => {
                self.set_state(ConnectionState::DiscoveringServices);
                let mut changes = vec![StateChange::new(
                    ConnectionState::Connecting,
                    ConnectionState::DiscoveringServices,
                )];
                info!("Device connected, discovering services...");
                if let Err(e) = transport.discover_services(link).await {
                    let reason = format!("Service discovery could not start: {e}");
                    changes.extend(self.enter_disconnected(transport, Some(&reason), true).await);
                }
                changes
            }
            (ConnectionState::Connecting, _, Err(e)) => {
                let reason = format!("Connection failed: {e}");
                self.enter_disconnected(transport, Some(&reason), false)
                    .await
            }
            (ConnectionState::Connecting, false, Ok(())) => {
                self.enter_disconnected(transport, Some("Connection failed"), false)
                    .await
            }
            (ConnectionState::Disconnecting, false, _) => {
                self.enter_disconnected(transport, None, false).await
            }
            (_, false, status) => {
                let reason = match status {
                    Ok(()) => "Connection lost".to_string(),
                    Err(e) => format!("Connection lost: {e}"),
                };
                self.enter_disconnected(transport, Some(&reason), false)
                    .await
            }
            (state, true, _) => {
                warn!("Unexpected connected event while {}", state);
                Vec::new()
            }
        }
    }

    /// Handle the result of service discovery
    pub async fn on_services_discovered(
        &mut self,
        transport: &dyn Transport,
        link: LinkId,
        result: TransportResult<Vec<DiscoveredService>>,
    ) -> Vec<StateChange> {
        if self.state_for(link) != Some(ConnectionState::DiscoveringServices) {
            debug!("Ignoring discovery result for link {:?}", link);
            return Vec::new();
        }

        match result {
            Ok(discovered) => {
                let services: BTreeMap<Uuid, ServiceDescriptor> = discovered
                    .into_iter()
                    .map(|s| (s.uuid, ServiceDescriptor::from(s)))
                    .collect();
                let characteristic_count: usize =
                    services.values().map(|s| s.characteristics.len()).sum();
                info!(
                    "Found {} services with {} characteristics",
                    services.len(),
                    characteristic_count
                );
                if let Some(conn) = self.current.as_mut() {
                    conn.services = services;
                    conn.state = ConnectionState::Ready;
                }
                vec![StateChange::new(
                    ConnectionState::DiscoveringServices,
                    ConnectionState::Ready,
                )]
            }
            Err(e) => {
                let reason = format!("Service discovery failed: {e}");
                self.enter_disconnected(transport, Some(&reason), true)
                    .await
            }
        }
    }

    /// Explicit disconnect request
    pub async fn disconnect(&mut self, transport: &dyn Transport) -> Vec<StateChange> {
        let Some(conn) = self.current.as_ref() else {
            return Vec::new();
        };
        let link = conn.link;

        match conn.state {
            ConnectionState::Ready => match transport.disconnect(link).await {
                Ok(()) => {
                    info!("Disconnecting from device...");
                    let deadline = Instant::now() + self.disconnect_timeout;
                    if let Some(conn) = self.current.as_mut() {
                        conn.state = ConnectionState::Disconnecting;
                        conn.disconnect_deadline = Some(deadline);
                    }
                    vec![StateChange::new(
                        ConnectionState::Ready,
                        ConnectionState::Disconnecting,
                    )]
                }
                Err(e) => {
                    warn!("Transport refused disconnect: {}", e);
                    let reason = format!("Disconnect failed: {e}");
                    self.enter_disconnected(transport, Some(&reason), false)
                        .await
                }
            },
            ConnectionState::Connecting | ConnectionState::DiscoveringServices => {
                self.enter_disconnected(transport, Some("Disconnect requested"), true)
                    .await
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => Vec::new(),
        }
    }

    /// Called when the disconnect deadline fires
    pub async fn on_disconnect_deadline(&mut self, transport: &dyn Transport) -> Vec<StateChange> {
        match self.disconnect_deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                warn!("Disconnect was not confirmed in time, releasing link");
                self.enter_disconnected(transport, Some("Disconnect not confirmed"), false)
                    .await
            }
            _ => Vec::new(),
        }
    }

    /// Tear down whatever connection exists
    pub async fn release(&mut self, transport: &dyn Transport, reason: &str) -> Vec<StateChange> {
        self.enter_disconnected(transport, Some(reason), true).await
    }

    fn state_for(&self, link: LinkId) -> Option<ConnectionState> {
        self.current
            .as_ref()
            .filter(|c| c.link == link)
            .map(|c| c.state)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if let Some(conn) = self.current.as_mut() {
            conn.state = state;
        }
    }

    async fn enter_disconnected(
        &mut self,
        transport: &dyn Transport,
        reason: Option<&str>,
        request_disconnect: bool,
    ) -> Vec<StateChange> {
        let Some(conn) = self.current.take() else {
            return Vec::new();
        };

        if request_disconnect {
            if let Err(e) = transport.disconnect(conn.link).await {
                warn!("Failed to disconnect link {:?}: {}", conn.link, e);
            }
        }
        transport.close(conn.link).await;

        match reason {
            Some(reason) => info!("Disconnected from {}: {}", conn.peripheral, reason),
            None => info!("Disconnected from {}", conn.peripheral),
        }
        vec![StateChange {
            from: conn.state,
            to: ConnectionState::Disconnected,
            reason: reason.map(str::to_string),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::SessionError;
    use crate::infrastructure::bluetooth::fake::{known_services, Call, FakeTransport};
    use crate::infrastructure::bluetooth::protocol::{
        PERCENTAGE_CHAR_UUID, READ_CHAR_UUID, SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::transport::TransportFailure;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn machine() -> BleConnection {
        BleConnection::new(Duration::from_millis(5000))
    }

    async fn ready(fake: &FakeTransport) -> BleConnection {
        let mut conn = machine();
        conn.connect(fake, Peripheral::from_address(ADDRESS))
            .await
            .unwrap();
        let link = conn.link().unwrap();
        conn.on_connection_state(fake, link, true, Ok(())).await;
        conn.on_services_discovered(fake, link, Ok(known_services()))
            .await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        conn
    }

    #[tokio::test]
    async fn test_lifecycle_to_ready() {
        let fake = FakeTransport::new();
        let mut conn = machine();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let changes = conn
            .connect(&fake, Peripheral::from_address(ADDRESS))
            .await
            .unwrap();
        assert_eq!(changes.last().unwrap().to, ConnectionState::Connecting);
        let link = conn.link().unwrap();
        assert_eq!(fake.calls(), vec![Call::Connect(link, ADDRESS.to_string())]);

        let changes = conn.on_connection_state(&fake, link, true, Ok(())).await;
        assert_eq!(changes[0].to, ConnectionState::DiscoveringServices);
        assert!(fake.calls().contains(&Call::DiscoverServices(link)));

        let changes = conn
            .on_services_discovered(&fake, link, Ok(known_services()))
            .await;
        assert_eq!(changes[0].to, ConnectionState::Ready);

        let (service, descriptor) = conn.resolve(PERCENTAGE_CHAR_UUID).unwrap();
        assert_eq!(service, SERVICE_UUID);
        assert!(descriptor.writable);
        assert!(conn.resolve(Uuid::nil()).is_none());
    }

    #[tokio::test]
    async fn test_permission_denied_keeps_state() {
        let fake = FakeTransport::new();
        let mut conn = ready(&fake).await;
        fake.set_permission_denied(true);

        let err = conn
            .connect(&fake, Peripheral::from_address("11:22:33:44:55:66"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.peripheral().unwrap().address, ADDRESS);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let fake = FakeTransport::new();
        let mut conn = machine();
        conn.connect(&fake, Peripheral::from_address(ADDRESS))
            .await
            .unwrap();
        let link = conn.link().unwrap();

        let changes = conn
            .on_connection_state(&fake, link, false, Err(TransportFailure::Status(0x85)))
            .await;
        assert_eq!(changes[0].from, ConnectionState::Connecting);
        assert_eq!(changes[0].to, ConnectionState::Disconnected);
        assert!(changes[0].reason.as_deref().unwrap().contains("0x85"));
        assert!(fake.calls().contains(&Call::Close(link)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_discovery_failure_disconnects() {
        let fake = FakeTransport::new();
        let mut conn = machine();
        conn.connect(&fake, Peripheral::from_address(ADDRESS))
            .await
            .unwrap();
        let link = conn.link().unwrap();
        conn.on_connection_state(&fake, link, true, Ok(())).await;

        let changes = conn
            .on_services_discovered(&fake, link, Err(TransportFailure::Status(0x81)))
            .await;
        assert_eq!(changes[0].from, ConnectionState::DiscoveringServices);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.services().is_empty());
        assert!(fake.calls().contains(&Call::Disconnect(link)));
        assert!(fake.calls().contains(&Call::Close(link)));
    }

    #[tokio::test]
    async fn test_orderly_disconnect() {
        let fake = FakeTransport::new();
        let mut conn = ready(&fake).await;
        let link = conn.link().unwrap();

        let changes = conn.disconnect(&fake).await;
        assert_eq!(changes[0].to, ConnectionState::Disconnecting);
        assert!(conn.disconnect_deadline().is_some());
        assert!(conn.disconnect(&fake).await.is_empty());

        let changes = conn.on_connection_state(&fake, link, false, Ok(())).await;
        assert_eq!(changes[0].from, ConnectionState::Disconnecting);
        assert_eq!(changes[0].to, ConnectionState::Disconnected);
        assert_eq!(changes[0].reason, None);
        assert_eq!(fake.count(|c| matches!(c, Call::Close(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_disconnect_is_forced() {
        let fake = FakeTransport::new();
        let mut conn = ready(&fake).await;
        conn.disconnect(&fake).await;

        assert!(conn.on_disconnect_deadline(&fake).await.is_empty());
        tokio::time::advance(Duration::from_millis(5000)).await;
        let changes = conn.on_disconnect_deadline(&fake).await;
        assert_eq!(changes[0].to, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_loss_from_any_state() {
        for steps in 0..3 {
            let fake = FakeTransport::new();
            let mut conn = machine();
            conn.connect(&fake, Peripheral::from_address(ADDRESS))
                .await
                .unwrap();
            let link = conn.link().unwrap();
            if steps >= 1 {
                conn.on_connection_state(&fake, link, true, Ok(())).await;
            }
            if steps >= 2 {
                conn.on_services_discovered(&fake, link, Ok(known_services()))
                    .await;
            }

            let changes = conn.on_connection_state(&fake, link, false, Ok(())).await;
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].to, ConnectionState::Disconnected);
            assert_eq!(conn.state(), ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_new_connection_replaces_previous() {
        let fake = FakeTransport::new();
        let mut conn = ready(&fake).await;
        let old_link = conn.link().unwrap();

        let changes = conn
            .connect(&fake, Peripheral::from_address("11:22:33:44:55:66"))
            .await
            .unwrap();
        assert_eq!(changes[0].from, ConnectionState::Ready);
        assert_eq!(changes[0].to, ConnectionState::Disconnected);
        assert_eq!(changes[1].to, ConnectionState::Connecting);
        assert!(fake.calls().contains(&Call::Close(old_link)));

        // Events from the released link are ignored.
        let stale = conn
            .on_connection_state(&fake, old_link, false, Ok(()))
            .await;
        assert!(stale.is_empty());
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_record_value() {
        let fake = FakeTransport::new();
        let mut conn = ready(&fake).await;
        conn.record_value(READ_CHAR_UUID, &[77]);
        let (_, descriptor) = conn.resolve(READ_CHAR_UUID).unwrap();
        assert_eq!(descriptor.last_value.as_deref(), Some(&[77u8][..]));
    }
}
