//! BLE backend over the Nordic UART service (central role) using btleplug.
//! Device ids are adapter-reported Bluetooth addresses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::task::JoinHandle;

use super::{
    DiscoveredDevice, EventSink, Radio, RadioEvent, RX_CHARACTERISTIC_UUID, SERVICE_UUID,
    TX_CHARACTERISTIC_UUID,
};
use crate::error::LinkError;

type SinkSlot = Arc<Mutex<Option<EventSink>>>;
type Links = Arc<tokio::sync::Mutex<HashMap<String, BleLink>>>;

struct BleLink {
    peripheral: Peripheral,
    tx: Characteristic,
    notify_task: JoinHandle<()>,
}

pub struct BleRadio {
    adapter: Adapter,
    sink: SinkSlot,
    links: Links,
    scanning: Arc<AtomicBool>,
    events_task: JoinHandle<()>,
}

fn emit(sink: &SinkSlot, event: RadioEvent) {
    if let Some(tx) = sink.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        let _ = tx.send(event);
    }
}

fn adapter_error(e: btleplug::Error) -> LinkError {
    match e {
        btleplug::Error::PermissionDenied => LinkError::PermissionDenied,
        other => LinkError::RadioUnavailable(other.to_string()),
    }
}

fn connect_error(device_id: &str, e: btleplug::Error) -> LinkError {
    match e {
        btleplug::Error::PermissionDenied => LinkError::PermissionDenied,
        btleplug::Error::DeviceNotFound => LinkError::DeviceNotFound(device_id.to_string()),
        other => LinkError::ConnectionFailed {
            device_id: device_id.to_string(),
            reason: other.to_string(),
        },
    }
}

fn write_error(device_id: &str, e: btleplug::Error) -> LinkError {
    match e {
        btleplug::Error::NotConnected => LinkError::NotConnected(device_id.to_string()),
        other => LinkError::WriteFailed {
            device_id: device_id.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Whether an advertisement offers the messaging service.
fn advertises_service(props: &PeripheralProperties) -> bool {
    props.services.contains(&SERVICE_UUID)
}

fn sighting(device_id: String, props: Option<PeripheralProperties>) -> DiscoveredDevice {
    DiscoveredDevice {
        id: device_id,
        name: props.as_ref().and_then(|p| p.local_name.clone()),
        rssi: props.and_then(|p| p.rssi),
    }
}

/// Report `peripheral` if it offers the messaging service. The adapter scan filter is only a
/// hint on some platforms, and `DeviceUpdated` fires for every cached device.
async fn announce(sink: &SinkSlot, peripheral: &Peripheral) {
    let props = peripheral.properties().await.ok().flatten();
    if props.as_ref().is_some_and(advertises_service) {
        emit(
            sink,
            RadioEvent::Discovered(sighting(peripheral.address().to_string(), props)),
        );
    }
}

impl BleRadio {
    /// Open the first Bluetooth adapter and start watching its events.
    pub async fn open() -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(adapter_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(adapter_error)?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::RadioUnavailable("no Bluetooth adapter".into()))?;
        let sink: SinkSlot = Arc::new(Mutex::new(None));
        let links: Links = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let scanning = Arc::new(AtomicBool::new(false));
        let events = adapter.events().await.map_err(adapter_error)?;
        let events_task = tokio::spawn(watch_events(
            adapter.clone(),
            events,
            scanning.clone(),
            sink.clone(),
            links.clone(),
        ));
        tracing::info!("BLE adapter ready");
        Ok(Self {
            adapter,
            sink,
            links,
            scanning,
            events_task,
        })
    }

    async fn find(&self, device_id: &str) -> Result<Peripheral, LinkError> {
        let peripherals = self.adapter.peripherals().await.map_err(adapter_error)?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string() == device_id)
            .ok_or_else(|| LinkError::DeviceNotFound(device_id.to_string()))
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

async fn watch_events(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    scanning: Arc<AtomicBool>,
    sink: SinkSlot,
    links: Links,
) {
    while let Some(event) = events.next().await {
        match event {
            // BlueZ reports a peripheral as discovered once per adapter lifetime; later
            // scans only see updates. The transport drops repeats within a session.
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)
                if scanning.load(Ordering::Relaxed) =>
            {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    announce(&sink, &peripheral).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let device_id = peripheral.address().to_string();
                if let Some(link) = links.lock().await.remove(&device_id) {
                    link.notify_task.abort();
                    emit(&sink, RadioEvent::PeerDisconnected { device_id });
                }
            }
            _ => {}
        }
    }
    tracing::debug!("BLE event stream ended");
}

#[async_trait]
impl Radio for BleRadio {
    async fn start_scan(&self) -> Result<(), LinkError> {
        self.scanning.store(true, Ordering::Relaxed);
        let filter = ScanFilter {
            services: vec![SERVICE_UUID],
        };
        if let Err(e) = self.adapter.start_scan(filter).await {
            self.scanning.store(false, Ordering::Relaxed);
            return Err(adapter_error(e));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.scanning.store(false, Ordering::Relaxed);
        self.adapter.stop_scan().await.map_err(adapter_error)
    }

    async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let peripheral = self.find(device_id).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| connect_error(device_id, e))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| connect_error(device_id, e))?;
        let characteristics = peripheral.characteristics();
        let find_char =
            |uuid: uuid::Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let (Some(tx), Some(rx)) = (
            find_char(TX_CHARACTERISTIC_UUID),
            find_char(RX_CHARACTERISTIC_UUID),
        ) else {
            let _ = peripheral.disconnect().await;
            return Err(LinkError::ConnectionFailed {
                device_id: device_id.to_string(),
                reason: "messaging service not found".into(),
            });
        };
        peripheral
            .subscribe(&rx)
            .await
            .map_err(|e| connect_error(device_id, e))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| connect_error(device_id, e))?;

        let sink = self.sink.clone();
        let id = device_id.to_string();
        let notify_task = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid == RX_CHARACTERISTIC_UUID {
                    emit(
                        &sink,
                        RadioEvent::Received {
                            device_id: id.clone(),
                            bytes: n.value,
                        },
                    );
                }
            }
        });
        self.links.lock().await.insert(
            device_id.to_string(),
            BleLink {
                peripheral,
                tx,
                notify_task,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), LinkError> {
        let Some(link) = self.links.lock().await.remove(device_id) else {
            return Ok(());
        };
        link.notify_task.abort();
        link.peripheral
            .disconnect()
            .await
            .map_err(|e| connect_error(device_id, e))
    }

    async fn write(&self, device_id: &str, bytes: &[u8]) -> Result<(), LinkError> {
        // Writes to different devices must not wait on each other, so the map lock is
        // released before the acknowledged write.
        let (peripheral, tx) = {
            let links = self.links.lock().await;
            let link = links
                .get(device_id)
                .ok_or_else(|| LinkError::NotConnected(device_id.to_string()))?;
            (link.peripheral.clone(), link.tx.clone())
        };
        peripheral
            .write(&tx, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| write_error(device_id, e))
    }

    fn on_receive(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }
}
