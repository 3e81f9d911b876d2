//! Detached signature verification for indexes and artifacts.
//!
//! A companion `<file>.sig` holds one or more JSON-line envelopes. Each
//! envelope carries a labeled sha256 hash, the signing metadata the signature
//! is bound to, and an ed25519 signature over the canonical payload. At least
//! one envelope must verify against a trusted signer; when several envelopes
//! are present they must all agree on the labeled hash.
//!
//! Two policies are applied independently: one while fetching from a mirror,
//! one when loading an existing file from storage. The download policy must
//! be at least as strict as the disk-load policy.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{UpdateError, UpdateResult};

/// Length of an ed25519 signature in bytes.
const SIGNATURE_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// What to do when signature verification fails.
///
/// Ordered by strictness: `Disable < Warn < Require`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Fetch and store signatures, never block on failures.
    Disable,
    /// Log failures and carry on.
    Warn,
    /// Propagate failures to the caller.
    Require,
}

impl fmt::Display for SignaturePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignaturePolicy::Disable => write!(f, "disable"),
            SignaturePolicy::Warn => write!(f, "warn"),
            SignaturePolicy::Require => write!(f, "require"),
        }
    }
}

/// Apply a policy to a verification outcome.
///
/// `Require` propagates the error; `Warn` logs and succeeds; `Disable`
/// swallows the failure entirely.
pub(crate) fn apply_policy(
    policy: SignaturePolicy,
    subject: &str,
    result: UpdateResult<()>,
) -> UpdateResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => match policy {
            SignaturePolicy::Require => Err(err),
            SignaturePolicy::Warn => {
                warn!(subject, error = %err, "signature verification failed, continuing per policy");
                Ok(())
            }
            SignaturePolicy::Disable => Ok(()),
        },
    }
}

// ---------------------------------------------------------------------------
// Trust store
// ---------------------------------------------------------------------------

/// Named ed25519 public keys the registry accepts signatures from.
#[derive(Debug, Default, Clone)]
pub struct TrustStore {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signer with a hex-encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// Fails when the hex does not decode to a valid ed25519 public key.
    pub fn add_signer(&mut self, name: impl Into<String>, public_key_hex: &str) -> UpdateResult<()> {
        let name = name.into();
        let raw = hex::decode(public_key_hex)
            .map_err(|e| UpdateError::signature(name.as_str(), format!("bad public key hex: {e}")))?;
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| UpdateError::signature(name.as_str(), "public key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|e| UpdateError::signature(name.as_str(), format!("bad public key: {e}")))?;
        self.keys.insert(name, key);
        Ok(())
    }

    pub fn get(&self, signer: &str) -> Option<&VerifyingKey> {
        self.keys.get(signer)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Verification options
// ---------------------------------------------------------------------------

/// Trust store plus the two policies governing a prefix of the identifier
/// space.
#[derive(Debug, Clone)]
pub struct VerificationOptions {
    trust_store: Arc<TrustStore>,
    download_policy: SignaturePolicy,
    disk_load_policy: SignaturePolicy,
}

impl VerificationOptions {
    /// Build options, enforcing that the download policy is at least as
    /// strict as the disk-load policy.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::PolicyOrdering` when the ordering is violated.
    pub fn new(
        trust_store: Arc<TrustStore>,
        download_policy: SignaturePolicy,
        disk_load_policy: SignaturePolicy,
    ) -> UpdateResult<Self> {
        if download_policy < disk_load_policy {
            return Err(UpdateError::PolicyOrdering);
        }
        Ok(Self {
            trust_store,
            download_policy,
            disk_load_policy,
        })
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust_store
    }

    pub fn download_policy(&self) -> SignaturePolicy {
        self.download_policy
    }

    pub fn disk_load_policy(&self) -> SignaturePolicy {
        self.disk_load_policy
    }
}

// ---------------------------------------------------------------------------
// Signing metadata
// ---------------------------------------------------------------------------

/// The identifier and version a signature is bound to.
///
/// Index signatures use the index path as `id` with an empty `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningMetadata {
    pub id: String,
    pub version: String,
}

impl SigningMetadata {
    pub fn resource(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    pub fn index(path: impl Into<String>) -> Self {
        Self {
            id: path.into(),
            version: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Signature envelopes
// ---------------------------------------------------------------------------

/// One signature envelope, serialized as a single JSON line inside the
/// `.sig` companion file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub signer: String,
    pub scheme: String,
    pub labeled_hash: String,
    pub meta: SigningMetadata,
    pub signature: String,
}

impl SignatureEnvelope {
    /// Sign `data` on behalf of `signer`, producing a complete envelope.
    ///
    /// Used by release tooling and test fixtures; the registry itself only
    /// verifies.
    pub fn create(
        key: &SigningKey,
        signer: impl Into<String>,
        data: &[u8],
        meta: &SigningMetadata,
    ) -> Self {
        let labeled_hash = labeled_sha256(data);
        let payload = canonical_payload(&labeled_hash, meta);
        let signature = key.sign(payload.as_bytes());
        Self {
            signer: signer.into(),
            scheme: "ed25519".to_owned(),
            labeled_hash,
            meta: meta.clone(),
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// Serialize envelopes as JSON Lines, the on-disk `.sig` format.
pub fn encode_envelopes(envelopes: &[SignatureEnvelope]) -> UpdateResult<Vec<u8>> {
    let mut out = Vec::new();
    for envelope in envelopes {
        let line = serde_json::to_string(envelope)
            .map_err(|e| UpdateError::signature(envelope.signer.as_str(), e.to_string()))?;
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

/// Parse the JSON-line envelopes of a `.sig` file.
///
/// # Errors
///
/// Fails when the file holds no envelope or any line is malformed.
pub fn parse_envelopes(sig_bytes: &[u8], subject: &str) -> UpdateResult<Vec<SignatureEnvelope>> {
    let text = std::str::from_utf8(sig_bytes)
        .map_err(|_| UpdateError::signature(subject, "signature file is not UTF-8"))?;

    let mut envelopes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let envelope: SignatureEnvelope = serde_json::from_str(line)
            .map_err(|e| UpdateError::signature(subject, format!("bad envelope: {e}")))?;
        envelopes.push(envelope);
    }
    if envelopes.is_empty() {
        return Err(UpdateError::signature(subject, "no signature envelopes"));
    }
    Ok(envelopes)
}

/// Verify envelopes against the trust store and the expected metadata,
/// returning the agreed labeled hash.
///
/// All envelopes must carry the same labeled hash; at least one trusted
/// signer is required and every present envelope must verify.
pub fn verify_envelopes(
    envelopes: &[SignatureEnvelope],
    expected: &SigningMetadata,
    trust_store: &TrustStore,
    subject: &str,
) -> UpdateResult<String> {
    let first_hash = match envelopes.first() {
        Some(envelope) => envelope.labeled_hash.clone(),
        None => return Err(UpdateError::signature(subject, "no signature envelopes")),
    };

    for envelope in envelopes {
        if envelope.labeled_hash != first_hash {
            return Err(UpdateError::signature(
                subject,
                "signature envelopes disagree on the labeled hash",
            ));
        }
        if envelope.scheme != "ed25519" {
            return Err(UpdateError::signature(
                subject,
                format!("unsupported signature scheme {:?}", envelope.scheme),
            ));
        }
        if envelope.meta != *expected {
            return Err(UpdateError::signature(
                subject,
                format!(
                    "signature bound to {}@{:?}, expected {}@{:?}",
                    envelope.meta.id, envelope.meta.version, expected.id, expected.version
                ),
            ));
        }

        let key = trust_store.get(&envelope.signer).ok_or_else(|| {
            UpdateError::signature(subject, format!("untrusted signer {:?}", envelope.signer))
        })?;

        let raw = hex::decode(&envelope.signature)
            .map_err(|e| UpdateError::signature(subject, format!("bad signature hex: {e}")))?;
        let raw: [u8; SIGNATURE_LEN] = raw.try_into().map_err(|_| {
            UpdateError::signature(subject, "signature must be 64 bytes")
        })?;
        let signature = Signature::from_bytes(&raw);

        let payload = canonical_payload(&envelope.labeled_hash, expected);
        key.verify(payload.as_bytes(), &signature).map_err(|_| {
            UpdateError::signature(
                subject,
                format!("signature by {:?} does not verify", envelope.signer),
            )
        })?;
    }

    Ok(first_hash)
}

/// Verify `data` against the envelopes of its `.sig` companion bytes.
pub fn verify_bytes(
    data: &[u8],
    sig_bytes: &[u8],
    expected: &SigningMetadata,
    trust_store: &TrustStore,
    subject: &str,
) -> UpdateResult<()> {
    let envelopes = parse_envelopes(sig_bytes, subject)?;
    let labeled_hash = verify_envelopes(&envelopes, expected, trust_store, subject)?;
    if labeled_hash != labeled_sha256(data) {
        return Err(UpdateError::signature(
            subject,
            "content does not match the signed hash",
        ));
    }
    Ok(())
}

/// Verify an on-disk file against its `.sig` companion.
pub fn verify_file(
    path: &Path,
    expected: &SigningMetadata,
    trust_store: &TrustStore,
) -> UpdateResult<()> {
    let subject = path.display().to_string();
    let data = std::fs::read(path).map_err(|e| UpdateError::io("reading file", path, e))?;
    let sig = sig_path(path);
    let sig_bytes =
        std::fs::read(&sig).map_err(|e| UpdateError::io("reading signature", &sig, e))?;
    verify_bytes(&data, &sig_bytes, expected, trust_store, &subject)
}

/// Companion signature path: `<path>.sig`.
pub fn sig_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".sig");
    PathBuf::from(os)
}

/// `sha256:<hex>` label over the given bytes.
pub fn labeled_sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn canonical_payload(labeled_hash: &str, meta: &SigningMetadata) -> String {
    format!(
        "{labeled_hash}\nid={}\nversion={}\n",
        meta.id, meta.version
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn test_store(name: &str, key: &SigningKey) -> TrustStore {
        let mut store = TrustStore::new();
        store
            .add_signer(name, &hex::encode(key.verifying_key().to_bytes()))
            .unwrap();
        store
    }

    #[test]
    fn policy_ordering_is_by_strictness() {
        assert!(SignaturePolicy::Require > SignaturePolicy::Warn);
        assert!(SignaturePolicy::Warn > SignaturePolicy::Disable);
    }

    #[test]
    fn options_reject_lenient_download_policy() {
        let store = Arc::new(TrustStore::new());
        let err = VerificationOptions::new(store, SignaturePolicy::Warn, SignaturePolicy::Require);
        assert!(matches!(err, Err(UpdateError::PolicyOrdering)));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let key = test_key();
        let store = test_store("ops", &key);
        let meta = SigningMetadata::resource("core/name", "1.2.3");
        let data = b"artifact bytes";

        let envelope = SignatureEnvelope::create(&key, "ops", data, &meta);
        let sig_bytes = encode_envelopes(&[envelope]).unwrap();
        verify_bytes(data, &sig_bytes, &meta, &store, "core/name").unwrap();
    }

    #[test]
    fn tampered_content_fails() {
        let key = test_key();
        let store = test_store("ops", &key);
        let meta = SigningMetadata::resource("core/name", "1.2.3");

        let envelope = SignatureEnvelope::create(&key, "ops", b"original", &meta);
        let sig_bytes = encode_envelopes(&[envelope]).unwrap();
        let err = verify_bytes(b"tampered", &sig_bytes, &meta, &store, "core/name");
        assert!(matches!(err, Err(UpdateError::Signature { .. })));
    }

    #[test]
    fn untrusted_signer_fails() {
        let key = test_key();
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let store = test_store("ops", &key);
        let meta = SigningMetadata::resource("core/name", "1.2.3");

        let envelope = SignatureEnvelope::create(&other, "rogue", b"data", &meta);
        let sig_bytes = encode_envelopes(&[envelope]).unwrap();
        let err = verify_bytes(b"data", &sig_bytes, &meta, &store, "core/name");
        assert!(matches!(err, Err(UpdateError::Signature { .. })));
    }

    #[test]
    fn mismatched_metadata_fails() {
        let key = test_key();
        let store = test_store("ops", &key);
        let signed_for = SigningMetadata::resource("core/name", "1.2.3");
        let expected = SigningMetadata::resource("core/name", "9.9.9");

        let envelope = SignatureEnvelope::create(&key, "ops", b"data", &signed_for);
        let sig_bytes = encode_envelopes(&[envelope]).unwrap();
        let err = verify_bytes(b"data", &sig_bytes, &expected, &store, "core/name");
        assert!(matches!(err, Err(UpdateError::Signature { .. })));
    }

    #[test]
    fn disagreeing_hashes_fail() {
        let key = test_key();
        let store = test_store("ops", &key);
        let meta = SigningMetadata::resource("core/name", "1.2.3");

        let a = SignatureEnvelope::create(&key, "ops", b"data", &meta);
        let b = SignatureEnvelope::create(&key, "ops", b"other", &meta);
        let sig_bytes = encode_envelopes(&[a, b]).unwrap();
        let err = verify_bytes(b"data", &sig_bytes, &meta, &store, "core/name");
        assert!(matches!(err, Err(UpdateError::Signature { .. })));
    }

    #[test]
    fn multiple_agreeing_signers_verify() {
        let key_a = test_key();
        let key_b = SigningKey::from_bytes(&[11u8; 32]);
        let mut store = TrustStore::new();
        store
            .add_signer("ops", &hex::encode(key_a.verifying_key().to_bytes()))
            .unwrap();
        store
            .add_signer("release", &hex::encode(key_b.verifying_key().to_bytes()))
            .unwrap();
        let meta = SigningMetadata::resource("core/name", "1.2.3");

        let a = SignatureEnvelope::create(&key_a, "ops", b"data", &meta);
        let b = SignatureEnvelope::create(&key_b, "release", b"data", &meta);
        let sig_bytes = encode_envelopes(&[a, b]).unwrap();
        verify_bytes(b"data", &sig_bytes, &meta, &store, "core/name").unwrap();
    }

    #[test]
    fn warn_policy_swallows_failures() {
        let result: UpdateResult<()> = Err(UpdateError::signature("x", "boom"));
        assert!(apply_policy(SignaturePolicy::Warn, "x", result).is_ok());

        let result: UpdateResult<()> = Err(UpdateError::signature("x", "boom"));
        assert!(apply_policy(SignaturePolicy::Require, "x", result).is_err());
    }
}
