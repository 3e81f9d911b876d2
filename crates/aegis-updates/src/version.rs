//! Semantic version handling for registry resources.
//!
//! Versions are normalized on ingest: parse with `semver`, then use the
//! rendered form for equality, map keys, and display. `0.0.0` is the special
//! development version and is only ever selected in dev mode.

use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use crate::error::UpdateError;

/// The development version string.
pub const DEV_VERSION: &str = "0.0.0";

/// Accepted shape of a bare version string: `M.N.P` with an optional
/// lowercase pre-release tag.
static BARE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+(-[a-z]+)?$").unwrap());

/// Parse a raw version string, tolerating a leading `v`.
///
/// # Errors
///
/// Returns `UpdateError::InvalidVersion` if the string does not match the
/// accepted `M.N.P[-tag]` shape or fails semver parsing.
pub fn parse_version(raw: &str) -> Result<Version, UpdateError> {
    let trimmed = raw.trim().trim_start_matches('v');
    if !BARE_VERSION.is_match(trimmed) {
        return Err(UpdateError::InvalidVersion(raw.to_owned()));
    }
    Version::parse(trimmed).map_err(|_| UpdateError::InvalidVersion(raw.to_owned()))
}

/// Parse and render a version in its normalized form.
pub fn normalize(raw: &str) -> Result<String, UpdateError> {
    parse_version(raw).map(|v| v.to_string())
}

/// Whether this is the special development version `0.0.0`.
pub fn is_dev_version(v: &Version) -> bool {
    v.major == 0 && v.minor == 0 && v.patch == 0 && v.pre.is_empty()
}

/// Whether the version carries a pre-release tag.
pub fn is_pre_release(v: &Version) -> bool {
    !v.pre.is_empty()
}

/// Human-readable `<identifier> v<version>` form used in reports.
pub fn human_readable(identifier: &str, version: &str) -> String {
    format!("{identifier} v{version}")
}
