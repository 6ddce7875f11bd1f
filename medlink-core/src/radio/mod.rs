//! Radio capability: the only surface the transport drives. Two backends:
//! [`sim::SimulatedRadio`] (deterministic, in-process) and `ble::BleRadio` (feature `ble`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::LinkError;

#[cfg(feature = "ble")]
pub mod ble;
pub mod sim;

/// Messaging service (Nordic UART Service).
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);
/// TX: central writes chunks here.
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E);
/// RX: peripheral notifies chunks here.
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Asynchronous notifications from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Discovered(DiscoveredDevice),
    /// A peer opened a link to us.
    PeerConnected { device_id: String },
    /// One write's worth of frame bytes from a peer; frames may span several.
    Received { device_id: String, bytes: Vec<u8> },
    /// Link dropped by the peer or the radio.
    PeerDisconnected { device_id: String },
}

pub type EventSink = mpsc::UnboundedSender<RadioEvent>;

#[async_trait]
pub trait Radio: Send + Sync {
    /// Begin reporting `Discovered` events.
    async fn start_scan(&self) -> Result<(), LinkError>;
    async fn stop_scan(&self) -> Result<(), LinkError>;
    async fn connect(&self, device_id: &str) -> Result<(), LinkError>;
    async fn disconnect(&self, device_id: &str) -> Result<(), LinkError>;
    /// Write up to one link MTU of frame bytes to the peer's TX characteristic.
    async fn write(&self, device_id: &str, bytes: &[u8]) -> Result<(), LinkError>;
    /// Where to deliver events. Replaces any earlier sink.
    fn on_receive(&self, sink: EventSink);
}

/// Backend selection; comes from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioBackend {
    #[default]
    Simulated,
    Ble,
}

/// Open the hardware backend on the first adapter.
#[cfg(feature = "ble")]
pub async fn open_ble() -> Result<Arc<dyn Radio>, LinkError> {
    Ok(Arc::new(ble::BleRadio::open().await?))
}

/// Open the hardware backend on the first adapter.
#[cfg(not(feature = "ble"))]
pub async fn open_ble() -> Result<Arc<dyn Radio>, LinkError> {
    Err(LinkError::RadioUnavailable(
        "built without the `ble` feature".into(),
    ))
}
