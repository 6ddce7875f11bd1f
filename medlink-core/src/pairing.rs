//! Out-of-band exchange payload: `{"publicKey": "<base64>", "name": "<string>"}`.
//!
//! Encoding carries no private material. Decoding yields a candidate only; the caller
//! decides whether to put it in the trust store.

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceIdentity, PublicKey};
use crate::trust::TrustedDevice;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangePayload<'a> {
    public_key: String,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScannedPayload {
    public_key: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("exchange payload is not valid JSON: {0}")]
    Parse(String),
    #[error("exchange payload has no publicKey")]
    MissingPublicKey,
    #[error("exchange payload publicKey is invalid: {0}")]
    InvalidPublicKey(String),
}

/// Payload to render as a scannable code.
pub fn encode_for_sharing(identity: &DeviceIdentity, display_name: &str) -> String {
    let payload = ExchangePayload {
        public_key: identity.public_key().to_base64(),
        name: display_name,
    };
    // Two string fields: serialization cannot fail.
    serde_json::to_string(&payload).unwrap_or_default()
}

/// Parse a scanned payload into a candidate record.
pub fn decode_from_scan(payload: &str) -> Result<TrustedDevice, PairingError> {
    let scanned: ScannedPayload =
        serde_json::from_str(payload).map_err(|e| PairingError::Parse(e.to_string()))?;
    let raw = scanned.public_key.ok_or(PairingError::MissingPublicKey)?;
    let public_key =
        PublicKey::from_base64(&raw).map_err(|e| PairingError::InvalidPublicKey(e.to_string()))?;
    let display_name = scanned.name.filter(|n| !n.trim().is_empty());
    Ok(TrustedDevice {
        public_key,
        display_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_exactly_public_key_and_name() {
        let id = DeviceIdentity::generate();
        let payload = encode_for_sharing(&id, "Field Tablet 3");
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["publicKey"], id.public_key().to_base64());
        assert_eq!(obj["name"], "Field Tablet 3");
        assert!(!payload.contains(&id.to_stored().private_key));
    }

    #[test]
    fn decode_yields_candidate() {
        let id = DeviceIdentity::generate();
        let candidate = decode_from_scan(&encode_for_sharing(&id, "Bob")).unwrap();
        assert_eq!(&candidate.public_key, id.public_key());
        assert_eq!(candidate.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn decode_without_name() {
        let id = DeviceIdentity::generate();
        let json = format!(r#"{{"publicKey":"{}"}}"#, id.public_key().to_base64());
        let candidate = decode_from_scan(&json).unwrap();
        assert_eq!(candidate.display_name, None);
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(
            decode_from_scan("hello there"),
            Err(PairingError::Parse(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_public_key() {
        assert_eq!(
            decode_from_scan(r#"{"name":"Bob"}"#),
            Err(PairingError::MissingPublicKey)
        );
    }

    #[test]
    fn decode_rejects_bad_key() {
        assert!(matches!(
            decode_from_scan(r#"{"publicKey":"AAAA","name":"Bob"}"#),
            Err(PairingError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn decode_rejects_non_object() {
        assert!(matches!(
            decode_from_scan("[1,2,3]"),
            Err(PairingError::Parse(_))
        ));
    }
}
