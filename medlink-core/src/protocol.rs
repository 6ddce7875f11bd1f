//! Application message envelope and link-level commands.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;

/// Current protocol version. Carried in every chunk frame.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Data,
    Command,
}

/// Envelope exchanged after reassembly. JSON on the link; payload is base64 in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    pub sender: String,
    pub kind: MessageKind,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl Message {
    /// New message with a fresh id and the current time.
    pub fn new(sender: impl Into<String>, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            sender: sender.into(),
            kind,
            payload,
        }
    }

    pub fn text(sender: impl Into<String>, text: &str) -> Self {
        Self::new(sender, MessageKind::Text, text.as_bytes().to_vec())
    }

    pub fn data(sender: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(sender, MessageKind::Data, payload)
    }

    pub fn command(
        sender: impl Into<String>,
        command: &LinkCommand,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            sender,
            MessageKind::Command,
            serde_json::to_vec(command)?,
        ))
    }

    /// Payload as UTF-8 text, if it is.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Link command carried by a command message. `None` for other kinds or foreign commands.
    pub fn link_command(&self) -> Option<LinkCommand> {
        if self.kind != MessageKind::Command {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Commands the transport itself handles inside `command` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LinkCommand {
    /// Verifier -> prover: sign this nonce.
    Challenge { nonce: String },
    /// Prover -> verifier: signature over the nonce and the key that made it.
    #[serde(rename_all = "camelCase")]
    Response {
        nonce: String,
        public_key: PublicKey,
        signature: String,
    },
}
