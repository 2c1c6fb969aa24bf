use ble_gatt_session::domain::settings::SettingsService;
use ble_gatt_session::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use ble_gatt_session::infrastructure::bluetooth::{BluetoothService, SessionConfig};
use ble_gatt_session::infrastructure::logging;
use ble_gatt_session::presentation::cli::CommandLine;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting BLE GATT session");

    let config = SessionConfig::from_settings(settings_service.get())?;
    let settings = Arc::new(Mutex::new(settings_service));

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = BtleplugTransport::new(transport_tx).await?;
    let (service, events) = BluetoothService::spawn(Arc::new(transport), transport_rx, config);

    let result = CommandLine::new(service.clone(), settings).run(events).await;
    service.shutdown().await;
    result
}
