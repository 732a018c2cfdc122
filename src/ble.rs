//! BLE transport backed by the `bluest` crate.
//!
//! Notifications from the FFE1 characteristic are forwarded into an mpsc
//! channel by a background task, so the exchange layer gets a cancel-safe
//! `recv()` it can race against its timeout.

use crate::protocol::BMS_CHARACTERISTIC_ID;
use crate::transport::{Transport, TransportError};
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const BMS_SERVICE_ID: &str = "0000FFE0-0000-1000-8000-00805F9B34FB";
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

impl From<bluest::Error> for TransportError {
    fn from(error: bluest::Error) -> Self {
        TransportError(error.to_string())
    }
}

fn service_id() -> Uuid {
    // Well-formed constant, cannot fail to parse.
    Uuid::parse_str(BMS_SERVICE_ID).unwrap()
}

fn characteristic_id() -> Uuid {
    Uuid::parse_str(BMS_CHARACTERISTIC_ID).unwrap()
}

pub struct BleTransport {
    address: String,
    pair_first: bool,
    scan_timeout: Duration,
    adapter: Option<Adapter>,
    device: Option<Device>,
    characteristic: Option<Characteristic>,
    notifications: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

impl BleTransport {
    /// `address` is matched case-insensitively against the device name and
    /// the platform's device identifier, since macOS hides MAC addresses.
    pub fn new(address: impl Into<String>, pair_first: bool) -> Self {
        Self {
            address: address.into(),
            pair_first,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            adapter: None,
            device: None,
            characteristic: None,
            notifications: None,
            forwarder: None,
        }
    }

    pub fn set_scan_timeout(&mut self, scan_timeout: Duration) -> &mut Self {
        self.scan_timeout = scan_timeout;
        self
    }

    async fn discover_device(&self, adapter: &Adapter) -> Result<Device, TransportError> {
        let wanted = self.address.to_lowercase();
        let services = [service_id()];
        let mut scan = adapter.scan(&services).await.map_err(TransportError::from)?;
        loop {
            let next = timeout(self.scan_timeout, scan.next())
                .await
                .map_err(|_| TransportError(format!("Device {} not found", self.address)))?;
            let Some(discovered) = next else {
                return Err(TransportError(format!("Device {} not found", self.address)));
            };
            let device = discovered.device;
            if let Ok(name) = device.name_async().await {
                if name.to_lowercase() == wanted {
                    return Ok(device);
                }
            }
            if format!("{:?}", device.id()).to_lowercase().contains(&wanted) {
                return Ok(device);
            }
        }
    }

    async fn discover_characteristic(device: &Device) -> Result<Characteristic, TransportError> {
        let service = device
            .discover_services_with_uuid(service_id())
            .await
            .map_err(TransportError::from)?
            .first()
            .ok_or_else(|| TransportError("Device does not expose the BMS service".into()))?
            .clone();
        let characteristic = service
            .discover_characteristics_with_uuid(characteristic_id())
            .await
            .map_err(TransportError::from)?
            .first()
            .ok_or_else(|| {
                TransportError("Device does not expose the BMS characteristic".into())
            })?
            .clone();
        Ok(characteristic)
    }
}

impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| TransportError("Default Bluetooth adapter not found".into()))?;
        adapter.wait_available().await?;

        let device = self.discover_device(&adapter).await?;
        adapter.connect_device(&device).await?;
        if self.pair_first {
            device.pair().await?;
        }

        let characteristic = Self::discover_characteristic(&device).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let notify_source = characteristic.clone();
        let forwarder = tokio::spawn(async move {
            let stream = match notify_source.notify().await {
                Ok(stream) => stream,
                Err(error) => {
                    log::warn!("Notification subscription failed: {}", error);
                    return;
                }
            };
            futures_util::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(raw) => {
                        if tx.send(raw).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        log::warn!("Notification stream error: {}", error);
                        break;
                    }
                }
            }
        });

        self.adapter = Some(adapter);
        self.device = Some(device);
        self.characteristic = Some(characteristic);
        self.notifications = Some(rx);
        self.forwarder = Some(forwarder);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let characteristic = self
            .characteristic
            .as_ref()
            .ok_or_else(|| TransportError("Not connected".into()))?;
        characteristic.write(frame).await?;
        Ok(())
    }

    async fn notification(&mut self) -> Result<Vec<u8>, TransportError> {
        let notifications = self
            .notifications
            .as_mut()
            .ok_or_else(|| TransportError("Not connected".into()))?;
        notifications
            .recv()
            .await
            .ok_or_else(|| TransportError("Notification stream closed".into()))
    }

    async fn disconnect(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.notifications = None;
        self.characteristic = None;
        if let (Some(adapter), Some(device)) = (self.adapter.take(), self.device.take()) {
            if let Err(error) = adapter.disconnect_device(&device).await {
                log::warn!("Disconnect failed: {}", error);
            }
        }
    }
}
