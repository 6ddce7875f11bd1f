//! Challenge-response: single-use random nonces, signing, verification with consumed-nonce tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::{DeviceIdentity, PublicKey};

/// Random bytes per nonce (256 bits).
pub const NONCE_BYTES: usize = 32;

/// How long an issued challenge may be answered.
pub const DEFAULT_CHALLENGE_VALIDITY: Duration = Duration::from_secs(30);

/// One authentication attempt's nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    nonce: String,
    issued_at: Instant,
}

impl Challenge {
    /// Wrap a nonce received from a peer (or chosen by the caller).
    pub fn from_nonce(nonce: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
            issued_at: Instant::now(),
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// Fresh challenge from the OS random source.
pub fn create_challenge() -> Challenge {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    Challenge::from_nonce(URL_SAFE_NO_PAD.encode(bytes))
}

/// Sign the nonce's UTF-8 bytes with the device's private key. Deterministic (Ed25519).
pub fn respond(challenge: &Challenge, identity: &DeviceIdentity) -> Signature {
    identity.sign(challenge.nonce.as_bytes())
}

/// Check a signature over the challenge against the claimed key.
/// Malformed signatures or keys yield `false`.
pub fn verify(challenge: &Challenge, signature: &[u8], public_key: &PublicKey) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    let Some(key) = public_key.verifying_key() else {
        return false;
    };
    key.verify(challenge.nonce.as_bytes(), &signature).is_ok()
}

pub fn encode_signature(signature: &Signature) -> String {
    BASE64.encode(signature.to_bytes())
}

/// Decode a base64 signature. Garbage decodes to an empty vector, which never verifies.
pub fn decode_signature(s: &str) -> Vec<u8> {
    BASE64.decode(s.trim()).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeError {
    #[error("signature did not match the claimed key")]
    VerificationFailed,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("challenge already used")]
    ChallengeReused,
    #[error("challenge was never issued")]
    UnknownChallenge,
}

/// Per-attempt state: Idle -> ChallengeIssued -> Verified | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    ChallengeIssued,
    Verified,
    Failed,
}

/// Verifier side of the protocol. Tracks issued and consumed nonces so each is checked once.
#[derive(Debug)]
pub struct ChallengeVerifier {
    validity: Duration,
    issued: HashMap<String, Instant>,
    /// nonce -> (consumed at, verified)
    consumed: HashMap<String, (Instant, bool)>,
}

impl ChallengeVerifier {
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            issued: HashMap::new(),
            consumed: HashMap::new(),
        }
    }

    /// Create and track a new challenge.
    pub fn issue(&mut self) -> Challenge {
        let challenge = create_challenge();
        self.track(&challenge);
        challenge
    }

    /// Track a challenge created elsewhere. A consumed nonce stays consumed.
    pub fn track(&mut self, challenge: &Challenge) {
        if self.consumed.contains_key(&challenge.nonce) {
            return;
        }
        self.issued
            .insert(challenge.nonce.clone(), challenge.issued_at);
    }

    pub fn state(&self, nonce: &str) -> AttemptState {
        if let Some((_, verified)) = self.consumed.get(nonce) {
            return if *verified {
                AttemptState::Verified
            } else {
                AttemptState::Failed
            };
        }
        if self.issued.contains_key(nonce) {
            AttemptState::ChallengeIssued
        } else {
            AttemptState::Idle
        }
    }

    pub fn verify(
        &mut self,
        challenge: &Challenge,
        signature: &[u8],
        public_key: &PublicKey,
    ) -> Result<(), ChallengeError> {
        self.verify_at(challenge, signature, public_key, Instant::now())
    }

    /// Consume the nonce and check the signature. Any second call for the same nonce fails.
    pub fn verify_at(
        &mut self,
        challenge: &Challenge,
        signature: &[u8],
        public_key: &PublicKey,
        now: Instant,
    ) -> Result<(), ChallengeError> {
        if self.consumed.contains_key(&challenge.nonce) {
            return Err(ChallengeError::ChallengeReused);
        }
        let issued_at = self
            .issued
            .remove(&challenge.nonce)
            .ok_or(ChallengeError::UnknownChallenge)?;

        let result = if now.saturating_duration_since(issued_at) > self.validity {
            Err(ChallengeError::ChallengeExpired)
        } else if verify(challenge, signature, public_key) {
            Ok(())
        } else {
            Err(ChallengeError::VerificationFailed)
        };
        self.consumed
            .insert(challenge.nonce.clone(), (now, result.is_ok()));
        result
    }

    /// Give up on an outstanding challenge; it ends Failed.
    pub fn abandon(&mut self, nonce: &str) {
        if self.issued.remove(nonce).is_some() {
            self.consumed
                .insert(nonce.to_string(), (Instant::now(), false));
        }
    }

    /// Fail challenges past their window and forget old consumed entries.
    /// Returns how many outstanding challenges expired.
    pub fn prune(&mut self, now: Instant) -> usize {
        let validity = self.validity;
        let expired: Vec<String> = self
            .issued
            .iter()
            .filter(|(_, &at)| now.saturating_duration_since(at) > validity)
            .map(|(n, _)| n.clone())
            .collect();
        for nonce in &expired {
            self.issued.remove(nonce);
            self.consumed.insert(nonce.clone(), (now, false));
        }
        // A nonce forgotten here can no longer be verified either: it is no longer issued.
        self.consumed
            .retain(|_, (at, _)| now.saturating_duration_since(*at) <= validity * 2);
        expired.len()
    }
}

impl Default for ChallengeVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHALLENGE_VALIDITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nonces_are_unique_and_long() {
        let a = create_challenge();
        let b = create_challenge();
        assert_ne!(a.nonce(), b.nonce());
        assert_eq!(URL_SAFE_NO_PAD.decode(a.nonce()).unwrap().len(), NONCE_BYTES);
    }

    #[test]
    fn sign_and_verify() {
        let id = DeviceIdentity::generate();
        let c = create_challenge();
        let sig = respond(&c, &id);
        assert!(verify(&c, &sig.to_bytes(), id.public_key()));
    }

    #[test]
    fn signature_is_deterministic() {
        let id = DeviceIdentity::generate();
        let c = Challenge::from_nonce("abc123");
        assert_eq!(respond(&c, &id), respond(&c, &id));
    }

    #[test]
    fn mismatched_keypair_fails() {
        let signer = DeviceIdentity::generate();
        let other = DeviceIdentity::generate();
        let c = create_challenge();
        let sig = respond(&c, &signer);
        assert!(!verify(&c, &sig.to_bytes(), other.public_key()));
    }

    #[test]
    fn signature_over_other_nonce_fails() {
        let id = DeviceIdentity::generate();
        let sig = respond(&Challenge::from_nonce("one"), &id);
        assert!(!verify(
            &Challenge::from_nonce("two"),
            &sig.to_bytes(),
            id.public_key()
        ));
    }

    #[test]
    fn malformed_inputs_return_false() {
        let id = DeviceIdentity::generate();
        let c = create_challenge();
        assert!(!verify(&c, &[], id.public_key()));
        assert!(!verify(&c, &[0u8; 10], id.public_key()));
        assert!(!verify(&c, &decode_signature("%%%"), id.public_key()));
        let sig = respond(&c, &id);
        let bogus_key = PublicKey::from_bytes([0xff; 32]);
        assert!(!verify(&c, &sig.to_bytes(), &bogus_key));
    }

    #[test]
    fn signature_text_roundtrip() {
        let id = DeviceIdentity::generate();
        let c = create_challenge();
        let text = encode_signature(&respond(&c, &id));
        assert!(verify(&c, &decode_signature(&text), id.public_key()));
    }

    #[test]
    fn verifier_state_machine() {
        let id = DeviceIdentity::generate();
        let mut verifier = ChallengeVerifier::default();
        let c = verifier.issue();
        assert_eq!(verifier.state(c.nonce()), AttemptState::ChallengeIssued);
        let sig = respond(&c, &id).to_bytes();
        assert_eq!(verifier.verify(&c, &sig, id.public_key()), Ok(()));
        assert_eq!(verifier.state(c.nonce()), AttemptState::Verified);
        assert_eq!(verifier.state("never"), AttemptState::Idle);
    }

    #[test]
    fn verified_nonce_cannot_be_reused() {
        let id = DeviceIdentity::generate();
        let mut verifier = ChallengeVerifier::default();
        let c = verifier.issue();
        let sig = respond(&c, &id).to_bytes();
        assert!(verifier.verify(&c, &sig, id.public_key()).is_ok());
        assert_eq!(
            verifier.verify(&c, &sig, id.public_key()),
            Err(ChallengeError::ChallengeReused)
        );
    }

    #[test]
    fn failed_nonce_cannot_be_retried_with_valid_signature() {
        let id = DeviceIdentity::generate();
        let impostor = DeviceIdentity::generate();
        let mut verifier = ChallengeVerifier::default();
        let c = verifier.issue();
        let bad = respond(&c, &impostor).to_bytes();
        assert_eq!(
            verifier.verify(&c, &bad, id.public_key()),
            Err(ChallengeError::VerificationFailed)
        );
        assert_eq!(verifier.state(c.nonce()), AttemptState::Failed);
        let good = respond(&c, &id).to_bytes();
        assert_eq!(
            verifier.verify(&c, &good, id.public_key()),
            Err(ChallengeError::ChallengeReused)
        );
        // Re-tracking does not revive it.
        verifier.track(&c);
        assert_eq!(
            verifier.verify(&c, &good, id.public_key()),
            Err(ChallengeError::ChallengeReused)
        );
    }

    #[test]
    fn expired_challenge_is_rejected() {
        let id = DeviceIdentity::generate();
        let mut verifier = ChallengeVerifier::new(Duration::from_secs(5));
        let c = verifier.issue();
        let sig = respond(&c, &id).to_bytes();
        let late = c.issued_at() + Duration::from_secs(6);
        assert_eq!(
            verifier.verify_at(&c, &sig, id.public_key(), late),
            Err(ChallengeError::ChallengeExpired)
        );
        assert_eq!(verifier.state(c.nonce()), AttemptState::Failed);
    }

    #[test]
    fn untracked_challenge_is_unknown() {
        let id = DeviceIdentity::generate();
        let mut verifier = ChallengeVerifier::default();
        let c = create_challenge();
        let sig = respond(&c, &id).to_bytes();
        assert_eq!(
            verifier.verify(&c, &sig, id.public_key()),
            Err(ChallengeError::UnknownChallenge)
        );
    }

    #[test]
    fn prune_fails_stale_challenges() {
        let mut verifier = ChallengeVerifier::new(Duration::from_secs(1));
        let c = verifier.issue();
        let expired = verifier.prune(c.issued_at() + Duration::from_secs(2));
        assert_eq!(expired, 1);
        assert_eq!(verifier.state(c.nonce()), AttemptState::Failed);
    }

    #[test]
    fn abandon_marks_failed() {
        let mut verifier = ChallengeVerifier::default();
        let c = verifier.issue();
        verifier.abandon(c.nonce());
        assert_eq!(verifier.state(c.nonce()), AttemptState::Failed);
    }

    fn identity_from_seed(seed: [u8; 32]) -> DeviceIdentity {
        let keypair = ed25519_dalek::SigningKey::from_bytes(&seed).to_keypair_bytes();
        DeviceIdentity::from_keypair_bytes(&keypair).unwrap()
    }

    proptest! {
        #[test]
        fn any_keypair_verifies_only_its_own_signature(
            seed in any::<[u8; 32]>(),
            other in any::<[u8; 32]>(),
            nonce in proptest::collection::vec(any::<u8>(), 1..48),
        ) {
            prop_assume!(seed != other);
            let signer = identity_from_seed(seed);
            let stranger = identity_from_seed(other);
            let c = Challenge::from_nonce(URL_SAFE_NO_PAD.encode(nonce));
            let sig = respond(&c, &signer);
            prop_assert!(verify(&c, &sig.to_bytes(), signer.public_key()));
            prop_assert!(verify(&c, &decode_signature(&encode_signature(&sig)), signer.public_key()));
            prop_assert!(!verify(&c, &sig.to_bytes(), stranger.public_key()));
        }
    }
}
