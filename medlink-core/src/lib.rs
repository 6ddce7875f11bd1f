//! Offline device trust and messaging over a short-range radio link.
//! Identity keys, out-of-band pairing, a trust store, challenge-response authentication,
//! chunked message transport and the radio backends it runs on.

pub mod challenge;
pub mod chunk;
pub mod error;
pub mod identity;
pub mod pairing;
pub mod protocol;
pub mod radio;
pub mod transport;
pub mod trust;
pub mod wire;

pub use challenge::{ChallengeError, ChallengeVerifier};
pub use error::{LinkError, StoreError};
pub use identity::{DeviceIdentity, FileKeyStore, IdentityManager, KeyStore, PublicKey};
pub use pairing::{decode_from_scan, encode_for_sharing, PairingError};
pub use protocol::{Message, MessageKind, PROTOCOL_VERSION};
pub use radio::{Radio, RadioBackend};
pub use transport::{ConnectionState, Incoming, TransportConfig, TransportManager};
pub use trust::{SharedTrustStore, TrustStore, TrustedDevice};
pub use wire::{decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError};
