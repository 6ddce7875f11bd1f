//! Trust store: public key -> trusted device record, insertion-ordered, add-if-absent.
//!
//! Persisted as JSON by the host; the store itself is plain data so whoever owns it
//! is the single mutation point. Other components read through [`SharedTrustStore`].

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::identity::PublicKey;

/// A peer accepted out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDevice {
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Handle for read-mostly sharing with the transport.
pub type SharedTrustStore = Arc<RwLock<TrustStore>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    devices: Vec<TrustedDevice>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedTrustStore {
        Arc::new(RwLock::new(self))
    }

    /// Insert unless the key is already present. Returns true if inserted.
    /// An existing record is left as is (no update of the display name).
    pub fn add(&mut self, candidate: TrustedDevice) -> bool {
        if self.is_trusted(&candidate.public_key) {
            return false;
        }
        tracing::info!(
            fingerprint = %candidate.public_key.fingerprint(),
            name = candidate.display_name.as_deref().unwrap_or("-"),
            "trusted new device"
        );
        self.devices.push(candidate);
        true
    }

    pub fn is_trusted(&self, public_key: &PublicKey) -> bool {
        self.devices.iter().any(|d| &d.public_key == public_key)
    }

    pub fn get(&self, public_key: &PublicKey) -> Option<&TrustedDevice> {
        self.devices.iter().find(|d| &d.public_key == public_key)
    }

    /// Trusted devices in insertion order.
    pub fn list(&self) -> &[TrustedDevice] {
        &self.devices
    }

    /// Revoke a device. Returns true if it was present.
    pub fn remove(&mut self, public_key: &PublicKey) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| &d.public_key != public_key);
        before != self.devices.len()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Load from a JSON file. Missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let loaded: TrustStore = serde_json::from_str(&data)
            .map_err(|e| StoreError::Serialization(format!("trust store: {e}")))?;
        // Files edited by hand may repeat a key; keep the first record.
        let mut store = TrustStore::new();
        for device in loaded.devices {
            if !store.is_trusted(&device.public_key) {
                store.devices.push(device);
            }
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
