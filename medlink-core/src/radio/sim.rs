//! Deterministic simulated radio. Nodes join a shared [`SimulatedAir`]; discovery, links and
//! writes are delivered in order through each node's event sink. Fault knobs cover the
//! failure modes the transport has to handle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{DiscoveredDevice, EventSink, Radio, RadioEvent};
use crate::error::LinkError;

/// The shared medium.
#[derive(Clone, Default)]
pub struct SimulatedAir {
    inner: Arc<Mutex<AirState>>,
}

#[derive(Default)]
struct AirState {
    nodes: BTreeMap<String, Node>,
}

struct Node {
    name: Option<String>,
    rssi: i16,
    advertising: bool,
    scanning: bool,
    sink: Option<EventSink>,
    links: BTreeSet<String>,
    faults: Faults,
    writes: usize,
}

#[derive(Default)]
struct Faults {
    powered_off: bool,
    permission_denied: bool,
    reject_connect: bool,
    connect_delay: Option<Duration>,
    write_delay: Option<Duration>,
    fail_write_at: Option<usize>,
}

impl Node {
    fn ready(&self) -> Result<(), LinkError> {
        if self.faults.permission_denied {
            return Err(LinkError::PermissionDenied);
        }
        if self.faults.powered_off {
            return Err(LinkError::RadioUnavailable("powered off".into()));
        }
        Ok(())
    }

    fn emit(&self, event: RadioEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }
}

impl AirState {
    fn node(&self, id: &str) -> Result<&Node, LinkError> {
        self.nodes
            .get(id)
            .ok_or_else(|| LinkError::DeviceNotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut Node, LinkError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| LinkError::DeviceNotFound(id.to_string()))
    }

    fn advert(&self, id: &str) -> Option<DiscoveredDevice> {
        let node = self.nodes.get(id)?;
        node.advertising.then(|| DiscoveredDevice {
            id: id.to_string(),
            name: node.name.clone(),
            rssi: Some(node.rssi),
        })
    }
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AirState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an advertising node and return its radio.
    pub fn join(&self, id: &str, name: Option<&str>) -> SimulatedRadio {
        let rssi = -40 - i16::try_from(self.state().nodes.len() % 50).unwrap_or(0);
        self.state().nodes.insert(
            id.to_string(),
            Node {
                name: name.map(str::to_string),
                rssi,
                advertising: true,
                scanning: false,
                sink: None,
                links: BTreeSet::new(),
                faults: Faults::default(),
                writes: 0,
            },
        );
        SimulatedRadio {
            id: id.to_string(),
            air: self.clone(),
        }
    }

    /// Re-announce a node to every scanning node (e.g. a device walking into range).
    pub fn advertise(&self, id: &str) {
        let state = self.state();
        let Some(advert) = state.advert(id) else {
            return;
        };
        for (other_id, other) in &state.nodes {
            if other_id != id && other.scanning {
                other.emit(RadioEvent::Discovered(advert.clone()));
            }
        }
    }

    /// Stop advertising (device out of range for new scans).
    pub fn set_advertising(&self, id: &str, advertising: bool) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.advertising = advertising;
        }
    }

    /// Break the link between two nodes as if the radio lost it.
    pub fn drop_link(&self, a: &str, b: &str) {
        let mut state = self.state();
        let mut was_linked = false;
        if let Some(node) = state.nodes.get_mut(a) {
            was_linked |= node.links.remove(b);
        }
        if let Some(node) = state.nodes.get_mut(b) {
            was_linked |= node.links.remove(a);
        }
        if !was_linked {
            return;
        }
        if let Some(node) = state.nodes.get(a) {
            node.emit(RadioEvent::PeerDisconnected {
                device_id: b.to_string(),
            });
        }
        if let Some(node) = state.nodes.get(b) {
            node.emit(RadioEvent::PeerDisconnected {
                device_id: a.to_string(),
            });
        }
    }
}

/// One node's view of the simulated medium.
#[derive(Clone)]
pub struct SimulatedRadio {
    id: String,
    air: SimulatedAir,
}

impl SimulatedRadio {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn with_node<T>(&self, f: impl FnOnce(&mut Node) -> T) -> Option<T> {
        self.air.state().nodes.get_mut(&self.id).map(f)
    }

    pub fn set_powered(&self, on: bool) {
        self.with_node(|n| n.faults.powered_off = !on);
    }

    pub fn set_permission_granted(&self, granted: bool) {
        self.with_node(|n| n.faults.permission_denied = !granted);
    }

    /// Refuse incoming connection attempts.
    pub fn reject_connections(&self, reject: bool) {
        self.with_node(|n| n.faults.reject_connect = reject);
    }

    /// Delay each outgoing connection attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.with_node(|n| n.faults.connect_delay = delay);
    }

    /// Delay each write, as a link waiting on the peer's acknowledgement would.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.with_node(|n| n.faults.write_delay = delay);
    }

    /// Make this node's n-th write (1-based, counted from now) fail.
    pub fn fail_write_at(&self, n: usize) {
        self.with_node(|node| node.faults.fail_write_at = Some(node.writes + n));
    }

    /// Writes attempted by this node so far.
    pub fn writes(&self) -> usize {
        self.with_node(|n| n.writes).unwrap_or(0)
    }

    pub fn is_linked_to(&self, other: &str) -> bool {
        self.with_node(|n| n.links.contains(other)).unwrap_or(false)
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn start_scan(&self) -> Result<(), LinkError> {
        let mut state = self.air.state();
        state.node(&self.id)?.ready()?;
        let adverts: Vec<DiscoveredDevice> = state
            .nodes
            .keys()
            .filter(|id| **id != self.id)
            .filter_map(|id| state.advert(id))
            .collect();
        let me = state.node_mut(&self.id)?;
        me.scanning = true;
        for advert in adverts {
            me.emit(RadioEvent::Discovered(advert));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.with_node(|n| n.scanning = false);
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let delay = {
            let state = self.air.state();
            let me = state.node(&self.id)?;
            me.ready()?;
            me.faults.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.air.state();
        if device_id == self.id || state.advert(device_id).is_none() {
            return Err(LinkError::DeviceNotFound(device_id.to_string()));
        }
        let target = state.node_mut(device_id)?;
        if target.faults.reject_connect {
            return Err(LinkError::ConnectionFailed {
                device_id: device_id.to_string(),
                reason: "rejected by peer".into(),
            });
        }
        target.links.insert(self.id.clone());
        target.emit(RadioEvent::PeerConnected {
            device_id: self.id.clone(),
        });
        state.node_mut(&self.id)?.links.insert(device_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), LinkError> {
        let mut state = self.air.state();
        let was_linked = state.node_mut(&self.id)?.links.remove(device_id);
        if let Some(target) = state.nodes.get_mut(device_id) {
            target.links.remove(&self.id);
            if was_linked {
                target.emit(RadioEvent::PeerDisconnected {
                    device_id: self.id.clone(),
                });
            }
        }
        Ok(())
    }

    async fn write(&self, device_id: &str, bytes: &[u8]) -> Result<(), LinkError> {
        if let Some(delay) = self.with_node(|n| n.faults.write_delay).flatten() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.air.state();
        let me = state.node_mut(&self.id)?;
        me.ready()?;
        if !me.links.contains(device_id) {
            return Err(LinkError::NotConnected(device_id.to_string()));
        }
        me.writes += 1;
        if me.faults.fail_write_at == Some(me.writes) {
            return Err(LinkError::WriteFailed {
                device_id: device_id.to_string(),
                reason: "simulated write failure".into(),
            });
        }
        state.node(device_id)?.emit(RadioEvent::Received {
            device_id: self.id.clone(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn on_receive(&self, sink: EventSink) {
        self.with_node(|n| n.sink = Some(sink));
    }
}
