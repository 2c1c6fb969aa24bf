//! btleplug Transport
//!
//! Production [`Transport`] over the first system Bluetooth adapter. Each
//! request is accepted synchronously and carried out on its own tokio task,
//! which reports the outcome on the session's transport event channel.

use crate::infrastructure::bluetooth::transport::{
    Advertisement, DiscoveredCharacteristic, DiscoveredService, LinkId, RequestId, ScanId,
    Transport, TransportEvent, TransportFailure, TransportResult,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome reporting shared with spawned request tasks
#[derive(Clone)]
struct Reporter {
    events: mpsc::UnboundedSender<TransportEvent>,
    denied: Arc<AtomicBool>,
}

impl Reporter {
    fn send(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Session gone, dropping transport event");
        }
    }

    /// Convert a btleplug error, latching a missing permission grant
    fn failure(&self, error: btleplug::Error) -> TransportFailure {
        match error {
            btleplug::Error::PermissionDenied => {
                self.denied.store(true, Ordering::SeqCst);
                TransportFailure::PermissionDenied
            }
            other => TransportFailure::Other(other.to_string()),
        }
    }
}

/// BLE transport backed by btleplug
pub struct BtleplugTransport {
    adapter: Adapter,
    reporter: Reporter,
    links: Arc<Mutex<HashMap<LinkId, Peripheral>>>,
    scan_task: Mutex<Option<(ScanId, JoinHandle<()>)>>,
    watcher: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first adapter and report outcomes on `events`
    pub async fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to initialize Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .context("No Bluetooth adapters found")?;
        info!(
            "Using Bluetooth adapter: {}",
            adapter.adapter_info().await.unwrap_or_default()
        );

        let reporter = Reporter {
            events,
            denied: Arc::new(AtomicBool::new(false)),
        };
        let links = Arc::new(Mutex::new(HashMap::new()));
        let watcher = tokio::spawn(watch_disconnects(
            adapter.clone(),
            links.clone(),
            reporter.clone(),
        ));

        Ok(Self {
            adapter,
            reporter,
            links,
            scan_task: Mutex::new(None),
            watcher,
        })
    }

    /// Fail up front once the platform has refused access
    fn authorized(&self) -> TransportResult {
        if self.reporter.denied.load(Ordering::SeqCst) {
            return Err(TransportFailure::PermissionDenied);
        }
        Ok(())
    }

    fn peripheral(&self, link: LinkId) -> TransportResult<Peripheral> {
        self.links
            .lock()
            .map_err(|_| TransportFailure::Other("link table poisoned".to_string()))?
            .get(&link)
            .cloned()
            .ok_or_else(|| TransportFailure::Other(format!("unknown link {}", link.0)))
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                TransportFailure::Other(format!("characteristic {characteristic} not discovered"))
            })
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Ok(mut scan) = self.scan_task.lock() {
            if let Some((_, task)) = scan.take() {
                task.abort();
            }
        }
    }
}

/// Report links whose peripheral dropped the connection
async fn watch_disconnects(
    adapter: Adapter,
    links: Arc<Mutex<HashMap<LinkId, Peripheral>>>,
    reporter: Reporter,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch adapter events: {}", e);
            return;
        }
    };

    while let Some(event) = events.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };
        let affected: Vec<LinkId> = match links.lock() {
            Ok(links) => links
                .iter()
                .filter(|(_, p)| p.id() == id)
                .map(|(link, _)| *link)
                .collect(),
            Err(_) => Vec::new(),
        };
        for link in affected {
            info!("Peripheral dropped link {}", link.0);
            reporter.send(TransportEvent::ConnectionStateChanged {
                link,
                connected: false,
                status: Ok(()),
            });
        }
    }
}

fn advertised_id(event: &CentralEvent) -> Option<&PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        address: properties.address.to_string(),
        name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    })
}

fn discovered_services(peripheral: &Peripheral) -> Vec<DiscoveredService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| DiscoveredService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .into_iter()
                .map(|c| DiscoveredCharacteristic {
                    uuid: c.uuid,
                    readable: c.properties.contains(CharPropFlags::READ),
                    writable: c.properties.contains(CharPropFlags::WRITE)
                        || c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                })
                .collect(),
        })
        .collect()
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn adapter_enabled(&self) -> bool {
        !matches!(
            self.adapter.adapter_state().await,
            Ok(CentralState::PoweredOff)
        )
    }

    async fn start_scan(&self, scan: ScanId, filter: Uuid) -> TransportResult {
        self.authorized()?;
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| self.reporter.failure(e))?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![filter],
            })
            .await
            .map_err(|e| self.reporter.failure(e))?;

        let adapter = self.adapter.clone();
        let reporter = self.reporter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(id) = advertised_id(&event) else {
                    continue;
                };
                if let Some(advertisement) = advertisement(&adapter, id).await {
                    reporter.send(TransportEvent::ScanResult {
                        scan,
                        advertisement,
                    });
                }
            }
            reporter.send(TransportEvent::ScanFailed {
                scan,
                reason: TransportFailure::Other("adapter event stream ended".to_string()),
            });
        });

        if let Ok(mut slot) = self.scan_task.lock() {
            if let Some((_, previous)) = slot.replace((scan, task)) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn stop_scan(&self, scan: ScanId) -> TransportResult {
        let task = match self.scan_task.lock() {
            Ok(mut slot) if slot.as_ref().is_some_and(|(id, _)| *id == scan) => slot.take(),
            _ => None,
        };
        if let Some((_, task)) = task {
            task.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| self.reporter.failure(e))
    }

    async fn connect(&self, link: LinkId, address: &str) -> TransportResult {
        self.authorized()?;
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| self.reporter.failure(e))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| {
                TransportFailure::Other(format!("peripheral {address} has not been discovered"))
            })?;

        if let Ok(mut links) = self.links.lock() {
            links.insert(link, peripheral.clone());
        }

        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let status = peripheral
                .connect()
                .await
                .map_err(|e| reporter.failure(e));
            reporter.send(TransportEvent::ConnectionStateChanged {
                link,
                connected: status.is_ok(),
                status,
            });
        });
        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> TransportResult {
        self.authorized()?;
        let peripheral = self.peripheral(link)?;
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let status = peripheral
                .disconnect()
                .await
                .map_err(|e| reporter.failure(e));
            reporter.send(TransportEvent::ConnectionStateChanged {
                link,
                connected: false,
                status,
            });
        });
        Ok(())
    }

    async fn close(&self, link: LinkId) {
        let removed = self.links.lock().ok().and_then(|mut links| links.remove(&link));
        if let Some(peripheral) = removed {
            tokio::spawn(async move {
                if peripheral.is_connected().await.unwrap_or(false) {
                    let _ = peripheral.disconnect().await;
                }
            });
        }
    }

    async fn discover_services(&self, link: LinkId) -> TransportResult {
        self.authorized()?;
        let peripheral = self.peripheral(link)?;
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(discovered_services(&peripheral)),
                Err(e) => Err(reporter.failure(e)),
            };
            reporter.send(TransportEvent::ServicesDiscovered { link, result });
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult {
        self.authorized()?;
        let peripheral = self.peripheral(link)?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let result = peripheral
                .read(&target)
                .await
                .map_err(|e| reporter.failure(e));
            reporter.send(TransportEvent::ReadComplete {
                link,
                request,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: LinkId,
        request: RequestId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> TransportResult {
        self.authorized()?;
        let peripheral = self.peripheral(link)?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await
                .map_err(|e| reporter.failure(e));
            reporter.send(TransportEvent::WriteComplete {
                link,
                request,
                characteristic,
                result,
            });
        });
        Ok(())
    }
}
