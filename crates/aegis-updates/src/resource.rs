//! Per-resource version bookkeeping: flags, selection, blacklisting, purge,
//! and the one-shot upgrade notifier.
//!
//! A `Resource` owns all of its `ResourceVersion`s as plain values; anything
//! that needs registry-wide context (online flag, dev mode, storage root)
//! receives it as a parameter. The per-resource mutex is authoritative for
//! every per-resource field and is never held across await points.

use std::path::Path;
use std::sync::Mutex;

use semver::Version;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::filename;
use crate::verify::{self, VerificationOptions};
use crate::version;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Registry-wide flags that steer version selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub online: bool,
    pub dev_mode: bool,
    pub use_prereleases: bool,
}

/// Flags applied when ingesting a version. Flags only ever raise state;
/// `current_release` additionally clears the flag on all sibling versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddVersionOpts {
    pub available: bool,
    pub current_release: bool,
    pub pre_release: bool,
}

/// One known version of a resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceVersion {
    /// Normalized version string.
    pub version: String,
    #[serde(skip)]
    pub semver: Version,
    /// Artifact bytes exist in storage.
    pub available: bool,
    /// Companion signature exists in storage.
    pub sig_available: bool,
    /// Declared authoritative by the governing index.
    pub current_release: bool,
    pub pre_release: bool,
    pub blacklisted: bool,
}

impl ResourceVersion {
    fn new(normalized: String, semver: Version) -> Self {
        let pre_release = version::is_pre_release(&semver);
        Self {
            version: normalized,
            semver,
            available: false,
            sig_available: false,
            current_release: false,
            pre_release,
            blacklisted: false,
        }
    }
}

/// Snapshot of a resource for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceExport {
    pub identifier: String,
    pub selected_version: Option<String>,
    /// The selection came from the no-selectable-version fallback tier.
    pub selected_is_fallback: bool,
    pub active_version: Option<String>,
    pub versions: Vec<ResourceVersion>,
}

/// The slice of index state a resource needs for selection and downloads.
#[derive(Debug, Clone)]
pub(crate) struct IndexBinding {
    pub channel: String,
    pub auto_download: bool,
    pub pre_release: bool,
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

pub struct Resource {
    identifier: String,
    inner: Mutex<ResourceInner>,
}

struct ResourceInner {
    /// Sorted descending by semver.
    versions: Vec<ResourceVersion>,
    active_version: Option<Version>,
    selected_version: Option<Version>,
    selected_is_fallback: bool,
    index: Option<IndexBinding>,
    verification: Option<VerificationOptions>,
    /// One-shot upgrade notifier; replaced lazily after it fires.
    notifier: Option<watch::Sender<bool>>,
}

impl Resource {
    pub(crate) fn new(identifier: String, verification: Option<VerificationOptions>) -> Self {
        Self {
            identifier,
            inner: Mutex::new(ResourceInner {
                versions: Vec::new(),
                active_version: None,
                selected_version: None,
                selected_is_fallback: false,
                index: None,
                verification,
                notifier: None,
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn bind_index(&self, binding: IndexBinding) {
        self.lock().index = Some(binding);
    }

    pub(crate) fn index_binding(&self) -> Option<IndexBinding> {
        self.lock().index.clone()
    }

    pub(crate) fn verification(&self) -> Option<VerificationOptions> {
        self.lock().verification.clone()
    }

    /// Snapshot of all known versions, sorted descending.
    pub fn versions(&self) -> Vec<ResourceVersion> {
        self.lock().versions.clone()
    }

    pub fn selected_version(&self) -> Option<ResourceVersion> {
        let inner = self.lock();
        lookup(&inner.versions, inner.selected_version.as_ref()).cloned()
    }

    pub fn active_version(&self) -> Option<String> {
        self.lock().active_version.as_ref().map(Version::to_string)
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.lock().active_version.is_some()
    }

    pub(crate) fn has_local_version(&self) -> bool {
        self.lock().versions.iter().any(|v| v.available)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().versions.is_empty()
    }

    pub(crate) fn export(&self) -> ResourceExport {
        let inner = self.lock();
        ResourceExport {
            identifier: self.identifier.clone(),
            selected_version: inner.selected_version.as_ref().map(Version::to_string),
            selected_is_fallback: inner.selected_is_fallback,
            active_version: inner.active_version.as_ref().map(Version::to_string),
            versions: inner.versions.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Version ingest
    // -----------------------------------------------------------------------

    /// Ingest a version, creating it if unknown and raising flags
    /// idempotently. Returns the normalized version string.
    ///
    /// # Errors
    ///
    /// Rejects malformed version strings.
    pub(crate) fn add_version(
        &self,
        storage_root: &Path,
        raw: &str,
        opts: AddVersionOpts,
    ) -> UpdateResult<String> {
        let semver = version::parse_version(raw)?;
        let normalized = semver.to_string();

        let mut inner = self.lock();
        if opts.current_release {
            for v in &mut inner.versions {
                v.current_release = false;
            }
        }

        let verification_configured = inner.verification.is_some();
        let slot = match inner.versions.iter().position(|v| v.version == normalized) {
            Some(i) => i,
            None => {
                inner
                    .versions
                    .push(ResourceVersion::new(normalized.clone(), semver));
                inner.versions.len() - 1
            }
        };
        let entry = &mut inner.versions[slot];

        if opts.available {
            entry.available = true;
        }
        if opts.current_release {
            entry.current_release = true;
        }
        if opts.pre_release {
            entry.pre_release = true;
        }
        if entry.available && verification_configured && !entry.sig_available {
            let artifact = storage_root.join(filename::versioned_path(&self.identifier, &normalized));
            entry.sig_available = verify::sig_path(&artifact).exists();
        }

        inner.versions.sort_by(|a, b| b.semver.cmp(&a.semver));
        Ok(normalized)
    }

    /// Record that the artifact (and possibly its signature) landed in
    /// storage after a download.
    pub(crate) fn mark_available(&self, ver: &str, sig_present: bool) {
        let mut inner = self.lock();
        if let Some(entry) = inner.versions.iter_mut().find(|v| v.version == ver) {
            entry.available = true;
            if sig_present {
                entry.sig_available = true;
            }
        }
    }

    pub(crate) fn mark_active(&self, ver: &Version) {
        let mut inner = self.lock();
        inner.active_version = Some(ver.clone());
    }

    /// Drop availability for versions whose artifact no longer exists in
    /// storage. Run by the full storage scan.
    pub(crate) fn refresh_availability(&self, storage_root: &Path) {
        let mut inner = self.lock();
        for v in &mut inner.versions {
            if !v.available {
                continue;
            }
            let artifact =
                storage_root.join(filename::versioned_path(&self.identifier, &v.version));
            if !artifact.exists() {
                warn!(
                    identifier = %self.identifier,
                    version = %v.version,
                    "artifact vanished from storage"
                );
                v.available = false;
                v.sig_available = false;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Re-run version selection, firing the upgrade notifier when the
    /// resource is in use and the choice moved away from the active version.
    pub(crate) fn select_version(&self, ctx: SelectionContext) -> Option<ResourceVersion> {
        let mut inner = self.lock();
        let (chosen, is_fallback) = pick_version(&inner, ctx);

        if is_fallback {
            if let Some(ref v) = chosen {
                warn!(
                    identifier = %self.identifier,
                    version = %v,
                    "no selectable version, falling back to the numerically newest"
                );
            }
        }

        inner.selected_version = chosen;
        inner.selected_is_fallback = is_fallback;

        if let (Some(active), Some(selected)) =
            (inner.active_version.clone(), inner.selected_version.clone())
        {
            if active != selected {
                if let Some(tx) = inner.notifier.take() {
                    info!(
                        identifier = %self.identifier,
                        active = %active,
                        selected = %selected,
                        "upgrade available"
                    );
                    tx.send_replace(true);
                }
            }
        }

        lookup(&inner.versions, inner.selected_version.as_ref()).cloned()
    }

    /// Current selection, running selection first if none exists yet.
    pub(crate) fn selected_or_select(&self, ctx: SelectionContext) -> Option<ResourceVersion> {
        if let Some(current) = self.selected_version() {
            return Some(current);
        }
        self.select_version(ctx)
    }

    /// Subscribe to the upgrade notifier, allocating a fresh one when the
    /// previous instance has fired.
    pub(crate) fn upgrade_signal(&self) -> watch::Receiver<bool> {
        let mut inner = self.lock();
        match inner.notifier {
            Some(ref tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(false);
                inner.notifier = Some(tx);
                rx
            }
        }
    }

    // -----------------------------------------------------------------------
    // Blacklist
    // -----------------------------------------------------------------------

    /// Blacklist a version and re-select.
    ///
    /// # Errors
    ///
    /// Refuses to blacklist the last usable non-dev version, and rejects
    /// versions this resource does not know.
    pub(crate) fn blacklist(&self, ctx: SelectionContext, raw: &str) -> UpdateResult<()> {
        let normalized = version::normalize(raw)?;
        {
            let mut inner = self.lock();
            if !inner.versions.iter().any(|v| v.version == normalized) {
                return Err(UpdateError::VersionNotFound {
                    identifier: self.identifier.clone(),
                    version: normalized,
                });
            }
            let usable_others = inner
                .versions
                .iter()
                .filter(|v| {
                    v.version != normalized
                        && !v.blacklisted
                        && !version::is_dev_version(&v.semver)
                })
                .count();
            if usable_others == 0 {
                return Err(UpdateError::BlacklistLastVersion(self.identifier.clone()));
            }
            if let Some(entry) = inner.versions.iter_mut().find(|v| v.version == normalized) {
                entry.blacklisted = true;
            }
            info!(identifier = %self.identifier, version = %normalized, "version blacklisted");
        }
        self.select_version(ctx);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    /// Delete obsolete versions from storage, keeping the active version,
    /// the selected version, at least one stable version, and
    /// `max(keep_extra, 2)` more beyond the last of those.
    ///
    /// Does nothing while any version is blacklisted. Missing files are
    /// skipped silently; other deletion failures are logged and do not stop
    /// the purge. Returns the removed version strings.
    pub(crate) fn purge(&self, storage_root: &Path, keep_extra: usize) -> Vec<String> {
        let removed = {
            let mut inner = self.lock();
            if inner.versions.iter().any(|v| v.blacklisted) {
                info!(
                    identifier = %self.identifier,
                    "purge skipped: blacklisted versions present"
                );
                return Vec::new();
            }

            let mut seen_active = inner.active_version.is_none();
            let mut seen_selected = inner.selected_version.is_none();
            let mut seen_stable = false;
            let mut keep = keep_extra.max(2);
            let mut boundary = inner.versions.len();

            for (i, v) in inner.versions.iter().enumerate() {
                if !(seen_active && seen_selected && seen_stable) {
                    if inner.active_version.as_ref() == Some(&v.semver) {
                        seen_active = true;
                    }
                    if inner.selected_version.as_ref() == Some(&v.semver) {
                        seen_selected = true;
                    }
                    if !v.pre_release {
                        seen_stable = true;
                    }
                    continue;
                }
                if keep > 0 {
                    keep -= 1;
                    continue;
                }
                boundary = i;
                break;
            }

            inner.versions.split_off(boundary)
        };

        let mut removed_versions = Vec::with_capacity(removed.len());
        for v in &removed {
            let artifact =
                storage_root.join(filename::versioned_path(&self.identifier, &v.version));
            remove_file_quiet(&artifact);
            remove_file_quiet(&verify::sig_path(&artifact));
            if let Some(dir) = crate::unpack::unpacked_dir(&artifact) {
                remove_dir_quiet(&dir);
            }
            debug!(
                identifier = %self.identifier,
                version = %v.version,
                "purged version"
            );
            removed_versions.push(v.version.clone());
        }
        removed_versions
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResourceInner> {
        // A poisoned resource mutex means a panic mid-update; propagating it
        // here would poison every caller, so recover the inner state.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

/// Apply the tiered selection policy over the descending version list.
/// Returns the choice and whether it was the explicit fallback.
fn pick_version(inner: &ResourceInner, ctx: SelectionContext) -> (Option<Version>, bool) {
    let downloadable =
        ctx.online && inner.index.as_ref().is_some_and(|binding| binding.auto_download);
    let selectable =
        |v: &ResourceVersion| !v.blacklisted && (v.available || downloadable);

    // Dev override: version 0.0.0, if locally available, beats everything
    // and ignores the blacklist.
    if ctx.dev_mode {
        if let Some(dev) = inner
            .versions
            .iter()
            .find(|v| version::is_dev_version(&v.semver) && v.available)
        {
            return (Some(dev.semver.clone()), false);
        }
    }

    // The current release, if selectable. There is at most one.
    if let Some(current) = inner.versions.iter().find(|v| v.current_release) {
        if selectable(current) {
            return (Some(current.semver.clone()), false);
        }
    }

    // Newest selectable, pre-releases included.
    if ctx.use_prereleases {
        if let Some(newest) = inner.versions.iter().find(|v| selectable(v)) {
            return (Some(newest.semver.clone()), false);
        }
    }

    // Newest stable selectable.
    if let Some(stable) = inner
        .versions
        .iter()
        .find(|v| !v.pre_release && selectable(v))
    {
        return (Some(stable.semver.clone()), false);
    }

    // Fallback: the numerically newest version.
    (inner.versions.first().map(|v| v.semver.clone()), true)
}

fn lookup<'a>(
    versions: &'a [ResourceVersion],
    wanted: Option<&Version>,
) -> Option<&'a ResourceVersion> {
    let wanted = wanted?;
    versions.iter().find(|v| &v.semver == wanted)
}

fn remove_file_quiet(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete file during purge"),
    }
}

fn remove_dir_quiet(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete directory during purge");
        }
    }
}
