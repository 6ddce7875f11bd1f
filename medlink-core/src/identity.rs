//! Device identity: long-term Ed25519 signing keypair, base64 key encoding, key persistence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Private key length in bytes (seed followed by public key).
pub const PRIVATE_KEY_LEN: usize = 64;

/// Device public key (32 bytes, Ed25519). The identity key of a peer in the trust store.
/// Serializes as a base64 string.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        PublicKey(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse a base64-encoded key. Fails on bad base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, KeyDecodeError> {
        let raw = BASE64.decode(s.trim()).map_err(|_| KeyDecodeError::Base64)?;
        let bytes: [u8; PUBLIC_KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeyDecodeError::Length {
                expected: PUBLIC_KEY_LEN,
                actual: raw.len(),
            })?;
        Ok(PublicKey(bytes))
    }

    /// Short hex fingerprint (first 8 bytes of SHA-256) for logs and listings.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Curve point for signature checks. `None` if the bytes are not a valid key.
    pub(crate) fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PublicKey::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyDecodeError {
    #[error("key is not valid base64")]
    Base64,
    #[error("expected {expected} key bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("key bytes do not form a valid keypair")]
    Invalid,
}

/// The local device's long-term signing keypair. The private half never leaves this type
/// except through [`DeviceIdentity::to_stored`] for the key store.
pub struct DeviceIdentity {
    signing: SigningKey,
    public: PublicKey,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("public", &self.public.to_base64())
            .field("private", &"[REDACTED]")
            .finish()
    }
}

impl DeviceIdentity {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Rebuild from 64 keypair bytes (seed || public). Rejects a mismatched public half.
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self, KeyDecodeError> {
        let arr: [u8; PRIVATE_KEY_LEN] = bytes.try_into().map_err(|_| KeyDecodeError::Length {
            expected: PRIVATE_KEY_LEN,
            actual: bytes.len(),
        })?;
        let signing = SigningKey::from_keypair_bytes(&arr).map_err(|_| KeyDecodeError::Invalid)?;
        Ok(Self::from_signing_key(signing))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Text form for the external key store.
    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            public_key: self.public.to_base64(),
            private_key: BASE64.encode(self.signing.to_keypair_bytes()),
        }
    }

    pub fn from_stored(stored: &StoredIdentity) -> Result<Self, KeyDecodeError> {
        let raw = BASE64
            .decode(stored.private_key.trim())
            .map_err(|_| KeyDecodeError::Base64)?;
        let identity = Self::from_keypair_bytes(&raw)?;
        if identity.public != PublicKey::from_base64(&stored.public_key)? {
            return Err(KeyDecodeError::Invalid);
        }
        Ok(identity)
    }
}

/// Identity as persisted by a [`KeyStore`]: both halves base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentity {
    pub public_key: String,
    pub private_key: String,
}

impl fmt::Debug for StoredIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredIdentity")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Storage collaborator for the identity. The medium is up to the host.
pub trait KeyStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredIdentity>, StoreError>;
    fn save(&self, identity: &StoredIdentity) -> Result<(), StoreError>;
}

/// Process-lifetime key store.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    slot: Mutex<Option<StoredIdentity>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<StoredIdentity>, StoreError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
        Ok(())
    }
}

/// JSON file key store. Written owner-only on Unix.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<StoredIdentity>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let stored = serde_json::from_str(&data)
            .map_err(|e| StoreError::Serialization(format!("identity file: {e}")))?;
        Ok(Some(stored))
    }

    fn save(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(identity)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Owns the local identity. Takes its store as an explicit dependency.
pub struct IdentityManager<S: KeyStore> {
    store: S,
    current: Option<Arc<DeviceIdentity>>,
}

impl<S: KeyStore> IdentityManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            current: None,
        }
    }

    /// Generate a fresh identity, persist it and make it current.
    pub fn generate_identity(&mut self) -> Result<Arc<DeviceIdentity>, StoreError> {
        let identity = Arc::new(DeviceIdentity::generate());
        self.store.save(&identity.to_stored())?;
        tracing::info!(fingerprint = %identity.public_key().fingerprint(), "generated device identity");
        self.current = Some(identity.clone());
        Ok(identity)
    }

    /// Currently held identity, if any.
    pub fn identity(&self) -> Option<Arc<DeviceIdentity>> {
        self.current.clone()
    }

    /// First-run path: load from the store, or generate and persist once.
    pub fn load_or_generate(&mut self) -> Result<Arc<DeviceIdentity>, StoreError> {
        if let Some(identity) = &self.current {
            return Ok(identity.clone());
        }
        match self.store.load()? {
            Some(stored) => {
                let identity = DeviceIdentity::from_stored(&stored)
                    .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
                let identity = Arc::new(identity);
                self.current = Some(identity.clone());
                Ok(identity)
            }
            None => self.generate_identity(),
        }
    }
}
