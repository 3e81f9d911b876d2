//! Channel index manifests.
//!
//! An index is a JSON file (`stable.json`, `beta.json`, ...) declaring the
//! current authoritative version per resource for its channel. Two wire
//! forms exist: the current structured form with channel and publish
//! timestamp, and a legacy flat `identifier -> version` map. An index may
//! only declare resources under its own directory prefix (its authority).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{UpdateError, UpdateResult};

// ---------------------------------------------------------------------------
// Index declaration
// ---------------------------------------------------------------------------

/// Static declaration of one channel index, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Path of the index file relative to the mirror root, e.g.
    /// `stable.json` or `intel/intel.json`.
    pub path: String,
    /// Whether resources on this channel are fetched proactively.
    pub auto_download: bool,
    /// Force-mark every version this index declares as a pre-release.
    pub pre_release: bool,
}

/// A configured channel index plus its refresh state.
#[derive(Debug, Clone)]
pub struct Index {
    spec: IndexSpec,
    channel: String,
    /// Highest `Published` timestamp accepted so far.
    last_release: Option<DateTime<Utc>>,
}

impl Index {
    pub fn new(spec: IndexSpec) -> Self {
        let channel = channel_from_path(&spec.path);
        Self {
            spec,
            channel,
            last_release: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.spec.path
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn auto_download(&self) -> bool {
        self.spec.auto_download
    }

    pub fn pre_release(&self) -> bool {
        self.spec.pre_release
    }

    pub fn last_release(&self) -> Option<DateTime<Utc>> {
        self.last_release
    }

    /// Directory prefix this index has authority over, with a trailing
    /// slash; empty for a root-level index.
    pub fn authority(&self) -> &str {
        match self.spec.path.rfind('/') {
            Some(slash) => &self.spec.path[..=slash],
            None => "",
        }
    }

    /// Whether an identifier lies inside this index's authority.
    pub fn has_authority_over(&self, identifier: &str) -> bool {
        identifier.starts_with(self.authority())
    }

    /// The filename fetched from mirrors and stored on disk.
    ///
    /// The signed format lives under `.v2.json`; the legacy unsigned format
    /// keeps the plain `.json` name.
    pub fn wire_path(&self, signed: bool) -> String {
        if signed {
            match self.spec.path.strip_suffix(".json") {
                Some(stem) => format!("{stem}.v2.json"),
                None => self.spec.path.clone(),
            }
        } else {
            self.spec.path.clone()
        }
    }

    /// Validate a parsed index file against this index's channel and
    /// refresh state.
    ///
    /// # Errors
    ///
    /// `IndexFromFuture`, `IndexIsOlder`, or `IndexChannelMismatch` per the
    /// rejection rules; legacy files (no channel, no timestamp) always pass.
    pub fn validate(&self, file: &IndexFile, now: DateTime<Utc>) -> UpdateResult<()> {
        if let Some(published) = file.published {
            if published > now {
                return Err(UpdateError::IndexFromFuture {
                    path: self.spec.path.clone(),
                    published: published.to_rfc3339(),
                });
            }
            if let Some(last) = self.last_release {
                if published < last {
                    return Err(UpdateError::IndexIsOlder {
                        path: self.spec.path.clone(),
                        published: published.to_rfc3339(),
                        last_release: last.to_rfc3339(),
                    });
                }
            }
        }
        if !file.channel.is_empty() && file.channel != self.channel {
            return Err(UpdateError::IndexChannelMismatch {
                path: self.spec.path.clone(),
                expected: self.channel.clone(),
                got: file.channel.clone(),
            });
        }
        Ok(())
    }

    /// Record the publish timestamp of an accepted index file.
    pub fn record_release(&mut self, file: &IndexFile) {
        if let Some(published) = file.published {
            if self.last_release.is_none_or(|last| published > last) {
                self.last_release = Some(published);
            }
        }
    }
}

/// Channel name from an index path: the basename without `.json` and
/// without a `.v2` marker.
fn channel_from_path(path: &str) -> String {
    let base = match path.rfind('/') {
        Some(slash) => &path[slash + 1..],
        None => path,
    };
    let stem = base.strip_suffix(".json").unwrap_or(base);
    let stem = stem.strip_suffix(".v2").unwrap_or(stem);
    stem.to_owned()
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// A parsed index file, either wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    /// Declared channel; empty for the legacy form.
    pub channel: String,
    /// Publish timestamp; `None` for the legacy form.
    pub published: Option<DateTime<Utc>>,
    /// Identifier to current version.
    pub releases: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawIndexFile {
    #[serde(rename = "Channel")]
    channel: Option<String>,
    #[serde(rename = "Published")]
    published: Option<DateTime<Utc>>,
    #[serde(rename = "Releases")]
    releases: Option<HashMap<String, String>>,
}

/// Parse index bytes, accepting both wire forms.
///
/// JSON with neither a `Channel` nor non-empty `Releases` is read as the
/// legacy flat map.
///
/// # Errors
///
/// `UpdateError::Parse` when the bytes fit neither form.
pub fn parse_index_file(bytes: &[u8], path: &str) -> UpdateResult<IndexFile> {
    if let Ok(raw) = serde_json::from_slice::<RawIndexFile>(bytes) {
        let has_channel = raw.channel.as_ref().is_some_and(|c| !c.is_empty());
        let has_releases = raw.releases.as_ref().is_some_and(|r| !r.is_empty());
        if has_channel || has_releases {
            return Ok(IndexFile {
                channel: raw.channel.unwrap_or_default(),
                published: raw.published,
                releases: raw.releases.unwrap_or_default(),
            });
        }
    }

    let releases: HashMap<String, String> = serde_json::from_slice(bytes)
        .map_err(|e| UpdateError::parse(path, format!("not a valid index file: {e}")))?;
    Ok(IndexFile {
        channel: String::new(),
        published: None,
        releases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stable() -> Index {
        Index::new(IndexSpec {
            path: "stable.json".to_owned(),
            auto_download: true,
            pre_release: false,
        })
    }

    #[test]
    fn channel_comes_from_basename() {
        assert_eq!(stable().channel(), "stable");
        let nested = Index::new(IndexSpec {
            path: "intel/intel.json".to_owned(),
            auto_download: false,
            pre_release: false,
        });
        assert_eq!(nested.channel(), "intel");
        let signed = channel_from_path("beta.v2.json");
        assert_eq!(signed, "beta");
    }

    #[test]
    fn authority_is_directory_prefix() {
        assert_eq!(stable().authority(), "");
        let nested = Index::new(IndexSpec {
            path: "a/b/stable.json".to_owned(),
            auto_download: true,
            pre_release: false,
        });
        assert_eq!(nested.authority(), "a/b/");
        assert!(nested.has_authority_over("a/b/x"));
        assert!(!nested.has_authority_over("a/c/y"));
    }

    #[test]
    fn wire_path_rewrites_for_signed_format() {
        assert_eq!(stable().wire_path(false), "stable.json");
        assert_eq!(stable().wire_path(true), "stable.v2.json");
    }

    #[test]
    fn parses_legacy_flat_map() {
        let file = parse_index_file(br#"{"core/name": "1.2.3"}"#, "stable.json").unwrap();
        assert_eq!(file.channel, "");
        assert_eq!(file.published, None);
        assert_eq!(file.releases.get("core/name").map(String::as_str), Some("1.2.3"));
    }

    #[test]
    fn parses_structured_form() {
        let file = parse_index_file(
            br#"{"Channel": "stable", "Published": "2022-01-02T00:00:00Z", "Releases": {"core/name": "1.2.3"}}"#,
            "stable.json",
        )
        .unwrap();
        assert_eq!(file.channel, "stable");
        assert_eq!(
            file.published,
            Some(Utc.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(file.releases.len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_index_file(b"not json", "stable.json").is_err());
        assert!(parse_index_file(br#"{"core/name": 3}"#, "stable.json").is_err());
    }

    #[test]
    fn future_published_is_rejected() {
        let index = stable();
        let now = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let file = IndexFile {
            channel: "stable".to_owned(),
            published: Some(Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap()),
            releases: HashMap::new(),
        };
        assert!(matches!(
            index.validate(&file, now),
            Err(UpdateError::IndexFromFuture { .. })
        ));
    }

    #[test]
    fn older_published_is_rejected() {
        let mut index = stable();
        let newer = IndexFile {
            channel: "stable".to_owned(),
            published: Some(Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap()),
            releases: HashMap::new(),
        };
        let now = Utc.with_ymd_and_hms(2022, 4, 1, 0, 0, 0).unwrap();
        index.validate(&newer, now).unwrap();
        index.record_release(&newer);

        let older = IndexFile {
            channel: "stable".to_owned(),
            published: Some(Utc.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap()),
            releases: HashMap::new(),
        };
        assert!(matches!(
            index.validate(&older, now),
            Err(UpdateError::IndexIsOlder { .. })
        ));
        // The known last release is unchanged by the rejection.
        assert_eq!(
            index.last_release(),
            Some(Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let index = stable();
        let file = IndexFile {
            channel: "beta".to_owned(),
            published: None,
            releases: HashMap::new(),
        };
        assert!(matches!(
            index.validate(&file, Utc::now()),
            Err(UpdateError::IndexChannelMismatch { .. })
        ));
    }

    #[test]
    fn legacy_form_always_validates() {
        let index = stable();
        let file = IndexFile {
            channel: String::new(),
            published: None,
            releases: HashMap::new(),
        };
        index.validate(&file, Utc::now()).unwrap();
    }
}
