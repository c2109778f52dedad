//! Signed-envelope verification for inbound scan submissions.
//!
//! Verification is synchronous, stateless, and constant-time against the
//! signature comparison (delegated to `ed25519-dalek`, which compares the
//! recomputed scalar rather than bytewise `signature` fields).

use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use mesh_core::MeshError;

const ADMIT_CLOCK_SKEW_SECS: i64 = 300;

/// The wire shape of one inbound submission (§6).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Envelope {
    pub data: String,
    pub public_key: String,
    pub signature: String,
    pub timestamp: i64,
}

/// A verified envelope, ready for ingestion.
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    pub data: Vec<u8>,
    pub public_key: [u8; 32],
    pub observation_time: DateTime<Utc>,
}

/// Optional revocation check, injected by the caller so this crate stays
/// free of any particular storage backend.
pub trait RevocationCheck {
    fn is_revoked(&self, public_key: &[u8; 32]) -> bool;
}

impl RevocationCheck for () {
    fn is_revoked(&self, _public_key: &[u8; 32]) -> bool {
        false
    }
}

/// Verify one envelope against the given admit window, using `now` as the
/// reference clock (so tests can pin it instead of racing the wall clock).
pub fn verify(
    envelope: &Envelope,
    now: DateTime<Utc>,
    revocation: &impl RevocationCheck,
) -> Result<VerifiedEnvelope, MeshError> {
    verify_with_skew(envelope, now, ADMIT_CLOCK_SKEW_SECS, revocation)
}

pub fn verify_with_skew(
    envelope: &Envelope,
    now: DateTime<Utc>,
    admit_clock_skew_secs: i64,
    revocation: &impl RevocationCheck,
) -> Result<VerifiedEnvelope, MeshError> {
    let public_key_bytes = decode_fixed::<32>(&envelope.public_key)
        .map_err(|_| MeshError::AuthMalformed("public_key is not valid base64(32 bytes)".into()))?;
    let signature_bytes = decode_fixed::<64>(&envelope.signature)
        .map_err(|_| MeshError::AuthMalformed("signature is not valid base64(64 bytes)".into()))?;

    let skew = (now.timestamp() - envelope.timestamp).abs();
    if skew > admit_clock_skew_secs {
        return Err(MeshError::AuthStale);
    }

    let verifying_key = VerifyingKey::from_bytes(&public_key_bytes)
        .map_err(|_| MeshError::AuthMalformed("public_key is not a valid Ed25519 point".into()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let mut signed_bytes = envelope.timestamp.to_string().into_bytes();
    signed_bytes.extend_from_slice(envelope.data.as_bytes());

    verifying_key
        .verify(&signed_bytes, &signature)
        .map_err(|_| MeshError::AuthBadSig)?;

    if revocation.is_revoked(&public_key_bytes) {
        return Err(MeshError::AuthRevoked);
    }

    let observation_time = DateTime::from_timestamp(envelope.timestamp, 0)
        .ok_or_else(|| MeshError::AuthMalformed("timestamp out of range".into()))?;

    Ok(VerifiedEnvelope {
        data: envelope.data.clone().into_bytes(),
        public_key: public_key_bytes,
        observation_time,
    })
}

fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N], ()> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ())?;
    decoded.try_into().map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use ed25519_dalek::rand_core::OsRng;

    fn sign(signing_key: &SigningKey, timestamp: i64, data: &str) -> Envelope {
        let mut signed_bytes = timestamp.to_string().into_bytes();
        signed_bytes.extend_from_slice(data.as_bytes());
        let signature = signing_key.sign(&signed_bytes);

        Envelope {
            data: data.to_string(),
            public_key: base64::engine::general_purpose::STANDARD
                .encode(signing_key.verifying_key().to_bytes()),
            signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
            timestamp,
        }
    }

    #[test]
    fn valid_envelope_within_window_verifies() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let envelope = sign(&signing_key, now.timestamp(), "scan-data");

        let verified = verify(&envelope, now, &()).expect("should verify");
        assert_eq!(verified.data, b"scan-data");
    }

    #[test]
    fn exact_edge_of_admit_window_is_accepted() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let ts = now.timestamp() - ADMIT_CLOCK_SKEW_SECS;
        let envelope = sign(&signing_key, ts, "scan-data");

        assert!(verify(&envelope, now, &()).is_ok());
    }

    #[test]
    fn one_second_past_admit_window_is_stale() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let ts = now.timestamp() - ADMIT_CLOCK_SKEW_SECS - 1;
        let envelope = sign(&signing_key, ts, "scan-data");

        assert!(matches!(verify(&envelope, now, &()), Err(MeshError::AuthStale)));
    }

    #[test]
    fn flipped_data_bit_fails_bad_sig() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let mut envelope = sign(&signing_key, now.timestamp(), "scan-data");
        envelope.data = "scbn-data".to_string();

        assert!(matches!(verify(&envelope, now, &()), Err(MeshError::AuthBadSig)));
    }

    #[test]
    fn malformed_base64_public_key_is_malformed() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let mut envelope = sign(&signing_key, now.timestamp(), "scan-data");
        envelope.public_key = "not-base64!!".to_string();

        assert!(matches!(verify(&envelope, now, &()), Err(MeshError::AuthMalformed(_))));
    }

    struct AlwaysRevoked;
    impl RevocationCheck for AlwaysRevoked {
        fn is_revoked(&self, _public_key: &[u8; 32]) -> bool {
            true
        }
    }

    #[test]
    fn revoked_key_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = Utc::now();
        let envelope = sign(&signing_key, now.timestamp(), "scan-data");

        assert!(matches!(
            verify(&envelope, now, &AlwaysRevoked),
            Err(MeshError::AuthRevoked)
        ));
    }
}
