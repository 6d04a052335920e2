//! BLE UART link through BlueZ.
//!
//! Scans for a peripheral advertising the UART service (HM-10 / AT-09 style
//! bridges), connects over GATT, and uses the single read/write/notify
//! characteristic for both directions. Requires the `bluez` feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, Session, Uuid};
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{UART_CHARACTERISTIC_UUID, UART_SERVICE_UUID};
use crate::connection::{Connector, DeviceInfo, Link, LinkEvent, LinkSession};
use crate::errors::{LinkError, Result, RigError};

const SCAN_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const RESOLVE_TIMEOUT_SECS: u64 = 10;
const RESOLVE_POLL_MS: u64 = 100;

/// Finds and opens the rig's BLE UART bridge.
#[derive(Debug, Clone)]
pub struct BleConnector {
    /// Only accept a device with this advertised name.
    pub name: Option<String>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub resolve_timeout: Duration,
}

impl Default for BleConnector {
    fn default() -> Self {
        Self {
            name: None,
            service: parse_uuid(UART_SERVICE_UUID),
            characteristic: parse_uuid(UART_CHARACTERISTIC_UUID),
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            resolve_timeout: Duration::from_secs(RESOLVE_TIMEOUT_SECS),
        }
    }
}

impl BleConnector {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn open(&self) -> Result<LinkSession> {
        let session = Session::new().await.map_err(adapter_err)?;
        let adapter = session.default_adapter().await.map_err(adapter_err)?;
        adapter.set_powered(true).await.map_err(adapter_err)?;

        let device = self.discover(&adapter).await?;
        let info = DeviceInfo {
            name: device.name().await.ok().flatten(),
            address: device.address().to_string(),
        };

        if !device.is_connected().await.unwrap_or(false) {
            info!("connecting GATT: address={}", info.address);
            tokio::time::timeout(self.connect_timeout, device.connect())
                .await
                .map_err(|_| LinkError::Connection("GATT connect timed out".into()))?
                .map_err(connection_err)?;
        }

        let characteristic = match self.find_characteristic(&device).await {
            Ok(c) => c,
            Err(e) => {
                let _ = device.disconnect().await;
                return Err(e);
            }
        };

        let (tx, events) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(2);
        tasks.push(watch_device(&device, tx.clone()).await?);
        match characteristic.notify().await {
            Ok(stream) => tasks.push(tokio::spawn(forward_notifications(stream, tx))),
            // Some bridges do not notify; acks then time out and degrade.
            Err(e) => warn!("notifications unavailable: {}", e),
        }

        info!("BLE link ready: device={}", info.label());
        Ok(LinkSession {
            device: info,
            link: Arc::new(BleLink {
                _session: session,
                device,
                characteristic,
                tasks,
            }),
            events,
        })
    }
}

impl BleConnector {
    async fn discover(&self, adapter: &Adapter) -> Result<Device> {
        let events = adapter.discover_devices().await.map_err(adapter_err)?;
        pin_mut!(events);

        let scan = async {
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                if self.matches(&device).await {
                    info!("device discovered: address={}", address);
                    return Some(device);
                }
            }
            None
        };

        match tokio::time::timeout(self.scan_timeout, scan).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) | Err(_) => Err(RigError::Discovery(format!(
                "no device with service {} found",
                self.service
            ))),
        }
    }

    async fn matches(&self, device: &Device) -> bool {
        if let Some(wanted) = &self.name {
            return device.name().await.ok().flatten().as_ref() == Some(wanted);
        }
        device
            .uuids()
            .await
            .ok()
            .flatten()
            .is_some_and(|uuids| uuids.contains(&self.service))
    }

    async fn find_characteristic(&self, device: &Device) -> Result<Characteristic> {
        self.wait_resolved(device).await?;

        for service in device.services().await.map_err(connection_err)? {
            if service.uuid().await.map_err(connection_err)? != self.service {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(connection_err)? {
                if characteristic.uuid().await.map_err(connection_err)? == self.characteristic {
                    debug!("characteristic found: {}", self.characteristic);
                    return Ok(characteristic);
                }
            }
            return Err(LinkError::CharacteristicNotFound(self.characteristic.to_string()).into());
        }
        Err(LinkError::ServiceNotFound(self.service.to_string()).into())
    }

    async fn wait_resolved(&self, device: &Device) -> Result<()> {
        let poll = async {
            while !device.is_services_resolved().await.unwrap_or(false) {
                tokio::time::sleep(Duration::from_millis(RESOLVE_POLL_MS)).await;
            }
        };
        tokio::time::timeout(self.resolve_timeout, poll)
            .await
            .map_err(|_| LinkError::Connection("GATT services not resolved".into()).into())
    }
}

struct BleLink {
    _session: Session,
    device: Device,
    characteristic: Characteristic,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Link for BleLink {
    async fn write(&self, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        self.characteristic
            .write(bytes)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn close(&self) -> std::result::Result<(), LinkError> {
        self.device.disconnect().await.map_err(connection_err)
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Report `Closed` once BlueZ says the device is no longer connected.
async fn watch_device(
    device: &Device,
    tx: mpsc::UnboundedSender<LinkEvent>,
) -> Result<JoinHandle<()>> {
    let events = device.events().await.map_err(connection_err)?;
    Ok(tokio::spawn(async move {
        pin_mut!(events);
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                break;
            }
        }
        let _ = tx.send(LinkEvent::Closed);
    }))
}

async fn forward_notifications(
    stream: impl futures::Stream<Item = Vec<u8>>,
    tx: mpsc::UnboundedSender<LinkEvent>,
) {
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let text = String::from_utf8_lossy(&value).into_owned();
        if tx.send(LinkEvent::Notification(text)).is_err() {
            break;
        }
    }
}

fn parse_uuid(text: &str) -> Uuid {
    // The constants are well-formed; fall back to the nil UUID for the impossible case.
    Uuid::parse_str(text).unwrap_or_default()
}

fn adapter_err(e: bluer::Error) -> RigError {
    RigError::Link(LinkError::Adapter(e.to_string()))
}

fn connection_err(e: bluer::Error) -> LinkError {
    LinkError::Connection(e.to_string())
}
