// keys: fixed-seed ed25519 fixtures for signature tests.
//
// All test signatures come from one deterministic key so fixtures stay
// byte-stable across runs; trust stores are built from its public half.

use aegis_updates::{SignatureEnvelope, SigningMetadata, encode_envelopes};
use ed25519_dalek::SigningKey;

/// Signer name used across all test fixtures.
pub const TEST_SIGNER: &str = "release";

/// The deterministic test signing key.
pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// Hex public key for config / trust-store construction.
pub fn public_key_hex() -> String {
    hex::encode(signing_key().verifying_key().to_bytes())
}

/// Produce `.sig` bytes binding `data` to a resource identifier + version.
pub fn sign_resource(data: &[u8], identifier: &str, version: &str) -> Vec<u8> {
    let meta = SigningMetadata::resource(identifier, version);
    let envelope = SignatureEnvelope::create(&signing_key(), TEST_SIGNER, data, &meta);
    encode_envelopes(&[envelope]).expect("encode envelope")
}

/// Produce `.sig` bytes for an index file fetched under `wire_path`.
pub fn sign_index(data: &[u8], wire_path: &str) -> Vec<u8> {
    let meta = SigningMetadata::index(wire_path);
    let envelope = SignatureEnvelope::create(&signing_key(), TEST_SIGNER, data, &meta);
    encode_envelopes(&[envelope]).expect("encode envelope")
}
