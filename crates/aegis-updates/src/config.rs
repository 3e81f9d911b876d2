//! Registry configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `storage.root`
//!
//! # Verification section
//! `[[verification.signers]]` entries carry hex-encoded ed25519 public
//! keys. `[[verification.scopes]]` entries map identifier prefixes to the
//! shared trust store; `enabled = false` switches verification off for the
//! prefix. The download policy must be at least as strict as the disk-load
//! policy.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::index::IndexSpec;
use crate::registry::{RegistryConfig, RetryBudget};
use crate::verify::{SignaturePolicy, TrustStore, VerificationOptions};

/// Error type for config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    storage: Option<RawStorage>,
    network: Option<RawNetwork>,
    indexes: Option<Vec<RawIndex>>,
    flags: Option<RawFlags>,
    mandatory: Option<Vec<String>>,
    auto_unpack: Option<Vec<String>>,
    retry: Option<RawRetry>,
    verification: Option<RawVerification>,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    root: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    mirrors: Option<Vec<String>>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIndex {
    path: Option<String>,
    auto_download: Option<bool>,
    pre_release: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawFlags {
    online: Option<bool>,
    dev_mode: Option<bool>,
    use_prereleases: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    bulk: Option<u32>,
    get_file: Option<u32>,
    index: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawVerification {
    download_policy: Option<String>,
    disk_load_policy: Option<String>,
    signers: Option<Vec<RawSigner>>,
    scopes: Option<Vec<RawScope>>,
}

#[derive(Debug, Deserialize)]
struct RawSigner {
    name: Option<String>,
    public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawScope {
    prefix: Option<String>,
    enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load registry config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<RegistryConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load registry config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RegistryConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let storage_root = raw
        .storage
        .and_then(|s| s.root)
        .ok_or_else(|| ConfigError::MissingField("storage.root".to_owned()))?;

    let mut cfg = RegistryConfig::new(storage_root);

    if let Some(network) = raw.network {
        cfg.mirrors = network.mirrors.unwrap_or_default();
        if let Some(user_agent) = network.user_agent {
            cfg.user_agent = user_agent;
        }
    }

    if let Some(indexes) = raw.indexes {
        for (i, raw_index) in indexes.into_iter().enumerate() {
            let path = raw_index
                .path
                .ok_or_else(|| ConfigError::MissingField(format!("indexes[{i}].path")))?;
            cfg.indexes.push(IndexSpec {
                path,
                auto_download: raw_index.auto_download.unwrap_or(false),
                pre_release: raw_index.pre_release.unwrap_or(false),
            });
        }
    }

    if let Some(flags) = raw.flags {
        cfg.online = flags.online.unwrap_or(true);
        cfg.dev_mode = flags.dev_mode.unwrap_or(false);
        cfg.use_prereleases = flags.use_prereleases.unwrap_or(false);
    }

    cfg.mandatory = raw.mandatory.unwrap_or_default();
    cfg.auto_unpack = raw.auto_unpack.unwrap_or_default();

    if let Some(retry) = raw.retry {
        let defaults = RetryBudget::default();
        cfg.retry = RetryBudget {
            bulk: retry.bulk.unwrap_or(defaults.bulk),
            get_file: retry.get_file.unwrap_or(defaults.get_file),
            index: retry.index.unwrap_or(defaults.index),
        };
    }

    if let Some(verification) = raw.verification {
        cfg.verification = build_verification(verification)?;
    }

    Ok(cfg)
}

fn build_verification(
    raw: RawVerification,
) -> Result<BTreeMap<String, Option<VerificationOptions>>, ConfigError> {
    let signers = raw
        .signers
        .ok_or_else(|| ConfigError::MissingField("verification.signers".to_owned()))?;
    if signers.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[verification.signers]] entry is required".to_owned(),
        ));
    }

    let mut trust_store = TrustStore::new();
    for (i, signer) in signers.into_iter().enumerate() {
        let name = signer
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("verification.signers[{i}].name")))?;
        let public_key = signer.public_key.ok_or_else(|| {
            ConfigError::MissingField(format!("verification.signers[{i}].public_key"))
        })?;
        trust_store
            .add_signer(name, &public_key)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
    }
    let trust_store = Arc::new(trust_store);

    let download_policy = parse_policy(
        raw.download_policy.as_deref().unwrap_or("require"),
        "verification.download_policy",
    )?;
    let disk_load_policy = parse_policy(
        raw.disk_load_policy.as_deref().unwrap_or("warn"),
        "verification.disk_load_policy",
    )?;

    // Default scope: everything, unless explicit scopes are given.
    let scopes = raw.scopes.unwrap_or_else(|| {
        vec![RawScope {
            prefix: Some(String::new()),
            enabled: Some(true),
        }]
    });

    let mut map = BTreeMap::new();
    for (i, scope) in scopes.into_iter().enumerate() {
        let prefix = scope
            .prefix
            .ok_or_else(|| ConfigError::MissingField(format!("verification.scopes[{i}].prefix")))?;
        let rule = if scope.enabled.unwrap_or(true) {
            let options =
                VerificationOptions::new(Arc::clone(&trust_store), download_policy, disk_load_policy)
                    .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
            Some(options)
        } else {
            None
        };
        map.insert(prefix, rule);
    }
    Ok(map)
}

fn parse_policy(raw: &str, field: &str) -> Result<SignaturePolicy, ConfigError> {
    match raw {
        "require" => Ok(SignaturePolicy::Require),
        "warn" => Ok(SignaturePolicy::Warn),
        "disable" => Ok(SignaturePolicy::Disable),
        other => Err(ConfigError::InvalidValue(format!(
            "{field} must be one of require/warn/disable, got {other:?}"
        ))),
    }
}
