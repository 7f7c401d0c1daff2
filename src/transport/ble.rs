//! btleplug-backed implementation of the transport capability.

use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use crate::device::constants::IS_CONNECTED_DEADLINE;
use crate::transport::{
    Characteristic, Connection, Device, DeviceFilter, Service, Transport, TransportError,
};

/**
 * How long (milliseconds) a scan may run before device selection gives up.
 */
const SCAN_DEADLINE: u64 = 30_000;

/**
 * How long (milliseconds) to wait between sweeps of the adapters' peripheral lists.
 */
const SCAN_POLL_DELAY: u64 = 500;

pub struct BleTransport {
    manager: Manager,
}

impl BleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        Ok(BleTransport { manager })
    }
}

async fn start_scanning(manager: &Manager, service: Uuid) -> Result<Vec<Adapter>, TransportError> {
    let adapters = manager.adapters().await?;

    let filter = ScanFilter {
        services: vec![service],
    };

    for adapter in &adapters {
        info!(
            "Scanning using adapter {}...",
            adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string())
        );
        adapter.start_scan(filter.clone()).await?;
    }

    Ok(adapters)
}

async fn find_peripheral(adapters: &[Adapter], service: Uuid) -> Option<Peripheral> {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            }
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                }
                Ok(None) => {
                    warn!("Peripheral has no properties");
                }
                Ok(Some(properties)) => {
                    // Some environments ignore the filter, so make sure to check the service uuid again
                    if properties.services.contains(&service) {
                        info!(
                            "Using peripheral {} {:?} {} {:?}",
                            properties.address,
                            properties.address_type,
                            properties.local_name.unwrap_or(String::from("NONE")),
                            properties.services,
                        );
                        return Some(peripheral);
                    }
                }
            }
        }
    }

    None
}

async fn stop_scanning(adapters: &[Adapter]) {
    for adapter in adapters {
        if let Err(err) = adapter.stop_scan().await {
            debug!("Failed to stop scan: {:?}", err);
        }
    }
}

impl Transport for BleTransport {
    type Device = BleDevice;

    async fn request_device(&self, filter: DeviceFilter) -> Result<BleDevice, TransportError> {
        let adapters = start_scanning(&self.manager, filter.service).await?;
        let deadline = Instant::now() + Duration::from_millis(SCAN_DEADLINE);

        loop {
            if let Some(peripheral) = find_peripheral(&adapters, filter.service).await {
                stop_scanning(&adapters).await;
                return Ok(BleDevice { peripheral });
            }

            if Instant::now() >= deadline {
                stop_scanning(&adapters).await;
                return Err("no matching peripheral found before the scan deadline".into());
            }

            debug!("No peripherals matched");
            sleep(Duration::from_millis(SCAN_POLL_DELAY)).await;
        }
    }
}

#[derive(Clone)]
pub struct BleDevice {
    peripheral: Peripheral,
}

impl Device for BleDevice {
    type Connection = BleConnection;

    fn connectable(&self) -> bool {
        // a btleplug peripheral always carries a GATT handle
        true
    }

    async fn connect(&self) -> Result<BleConnection, TransportError> {
        info!("Connecting to peripheral...");
        self.peripheral.connect().await?;

        Ok(BleConnection {
            peripheral: self.peripheral.clone(),
        })
    }
}

#[derive(Clone)]
pub struct BleConnection {
    peripheral: Peripheral,
}

impl Connection for BleConnection {
    type Service = BleService;

    async fn service(&self, id: Uuid) -> Result<BleService, TransportError> {
        info!("Connected; Discovering services...");
        self.peripheral.discover_services().await?;

        for service in self.peripheral.services() {
            if service.uuid.eq(&id) {
                return Ok(BleService {
                    peripheral: self.peripheral.clone(),
                    service,
                });
            }
        }

        Err(format!("service {id} is not available on the peripheral").into())
    }

    async fn is_connected(&self) -> bool {
        let check = timeout(
            Duration::from_millis(IS_CONNECTED_DEADLINE),
            self.peripheral.is_connected(),
        );

        match check.await {
            Err(_) => {
                // macOS
                warn!("Checking for connection status took too long");
                false
            }
            Ok(Err(err)) => {
                warn!("Error checking for connection state: {:?}", err);
                false
            }
            Ok(Ok(connected)) => connected,
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

pub struct BleService {
    peripheral: Peripheral,
    service: btleplug::api::Service,
}

impl Service for BleService {
    type Characteristic = BleCharacteristic;

    async fn characteristic(&self, id: Uuid) -> Result<BleCharacteristic, TransportError> {
        for characteristic in &self.service.characteristics {
            if characteristic.uuid.eq(&id) {
                return Ok(BleCharacteristic {
                    peripheral: self.peripheral.clone(),
                    characteristic: characteristic.clone(),
                });
            }
        }

        Err(format!("characteristic {id} is not available on the peripheral").into())
    }
}

#[derive(Clone)]
pub struct BleCharacteristic {
    peripheral: Peripheral,
    characteristic: btleplug::api::Characteristic,
}

impl Characteristic for BleCharacteristic {
    type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

    async fn subscribe(&self) -> Result<Self::Notifications, TransportError> {
        info!("Subscribing to characteristic {:?}", self.characteristic.uuid);
        self.peripheral.subscribe(&self.characteristic).await?;

        let uuid = self.characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        let stream = notifications
            .filter_map(move |data| async move { (data.uuid == uuid).then_some(data.value) });

        Ok(Box::pin(stream))
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, bytes, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}
