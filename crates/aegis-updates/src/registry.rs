//! The top-level resource registry.
//!
//! A `Registry` is a constructed value whose lifetime the caller manages;
//! nothing here is global. The registry lock protects the shape of the
//! resource map and the index list only; every per-resource field is
//! guarded by that resource's own mutex, acquired after the registry lock
//! when both are needed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::file::ResourceFile;
use crate::filename;
use crate::index::{Index, IndexFile, IndexSpec};
use crate::resource::{
    AddVersionOpts, IndexBinding, Resource, ResourceExport, SelectionContext,
};
use crate::state::{ActivityReport, RegistryState, StateReporter, StateObserver};
use crate::verify::{self, SigningMetadata, VerificationOptions};
use crate::version;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry attempt budgets. The defaults mirror long-standing behavior; they
/// are configurable but rarely worth changing.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    /// Attempts per artifact in a bulk download.
    pub bulk: u32,
    /// Attempts for a single on-demand `get_file` fetch.
    pub get_file: u32,
    /// Attempts per index refresh across the mirror list.
    pub index: u32,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            bulk: 3,
            get_file: 5,
            index: 3,
        }
    }
}

/// Static registry configuration.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Root of the on-disk storage tree.
    pub storage_root: PathBuf,
    /// Mirror base URLs, tried round-robin.
    pub mirrors: Vec<String>,
    pub user_agent: String,
    /// Channel indexes registered at startup; more can be added later.
    pub indexes: Vec<IndexSpec>,
    /// Identifiers treated as in-use even when no caller requested them.
    pub mandatory: Vec<String>,
    /// Identifiers whose archives are unpacked right after download.
    pub auto_unpack: Vec<String>,
    /// Identifier-prefix verification rules; `None` disables verification
    /// for everything under the prefix. Longest prefix wins.
    pub verification: BTreeMap<String, Option<VerificationOptions>>,
    pub retry: RetryBudget,
    pub online: bool,
    pub dev_mode: bool,
    pub use_prereleases: bool,
}

impl RegistryConfig {
    /// A config with sane defaults for the given storage root.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            user_agent: concat!("aegis-updates/", env!("CARGO_PKG_VERSION")).to_owned(),
            online: true,
            ..Default::default()
        }
    }

    /// Staging directory for atomic writes, inside the storage tree.
    pub fn tmp_dir(&self) -> PathBuf {
        self.storage_root.join("tmp")
    }

    /// The verification rule covering an identifier, longest prefix first.
    /// `None` means no rule covers it; `Some(None)` means verification is
    /// explicitly disabled for its prefix.
    pub(crate) fn verification_rule(
        &self,
        identifier: &str,
    ) -> Option<Option<&VerificationOptions>> {
        let mut best: Option<(&str, &Option<VerificationOptions>)> = None;
        for (prefix, rule) in &self.verification {
            if identifier.starts_with(prefix.as_str())
                && best.is_none_or(|(known, _)| prefix.len() > known.len())
            {
                best = Some((prefix, rule));
            }
        }
        best.map(|(_, rule)| rule.as_ref())
    }

    /// Effective verification options for an identifier, if any.
    pub(crate) fn verification_for(&self, identifier: &str) -> Option<&VerificationOptions> {
        self.verification_rule(identifier).flatten()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    pub(crate) cfg: RegistryConfig,
    pub(crate) http: reqwest::Client,
    resources: RwLock<HashMap<String, Arc<Resource>>>,
    pub(crate) indexes: RwLock<Vec<Index>>,
    pub(crate) reporter: StateReporter,
    pub(crate) cancel: CancellationToken,
    online: AtomicBool,
    dev_mode: AtomicBool,
    use_prereleases: AtomicBool,
}

impl Registry {
    /// Build a registry from its configuration.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(cfg: RegistryConfig) -> UpdateResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(UpdateError::HttpClient)?;
        let indexes = cfg.indexes.iter().cloned().map(Index::new).collect();
        let online = cfg.online;
        let dev_mode = cfg.dev_mode;
        let use_prereleases = cfg.use_prereleases;
        Ok(Self {
            cfg,
            http,
            resources: RwLock::new(HashMap::new()),
            indexes: RwLock::new(indexes),
            reporter: StateReporter::new(),
            cancel: CancellationToken::new(),
            online: AtomicBool::new(online),
            dev_mode: AtomicBool::new(dev_mode),
            use_prereleases: AtomicBool::new(use_prereleases),
        })
    }

    /// Create the storage layout and wipe the staging directory.
    pub fn initialize(&self) -> UpdateResult<()> {
        let root = &self.cfg.storage_root;
        std::fs::create_dir_all(root)
            .map_err(|e| UpdateError::io("creating storage root", root, e))?;
        crate::storage::clean_tmp(&self.cfg.tmp_dir())?;
        info!(storage = %root.display(), "registry initialized");
        Ok(())
    }

    /// Cancel in-flight work and wipe the staging directory.
    pub fn shutdown(&self) -> UpdateResult<()> {
        self.cancel.cancel();
        crate::storage::clean_tmp(&self.cfg.tmp_dir())
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    pub fn online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    pub fn set_dev_mode(&self, dev_mode: bool) {
        self.dev_mode.store(dev_mode, Ordering::Relaxed);
    }

    pub fn set_use_prereleases(&self, use_prereleases: bool) {
        self.use_prereleases.store(use_prereleases, Ordering::Relaxed);
    }

    pub(crate) fn selection_context(&self) -> SelectionContext {
        SelectionContext {
            online: self.online.load(Ordering::Relaxed),
            dev_mode: self.dev_mode.load(Ordering::Relaxed),
            use_prereleases: self.use_prereleases.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    /// Register an additional channel index. Later indexes override earlier
    /// ones for the resources they declare.
    pub fn add_index(&self, spec: IndexSpec) {
        self.indexes_write().push(Index::new(spec));
    }

    /// Replace the index list wholesale.
    pub fn reset_indexes(&self, specs: Vec<IndexSpec>) {
        *self.indexes_write() = specs.into_iter().map(Index::new).collect();
    }

    /// Drop all known resources.
    pub fn reset_resources(&self) {
        self.resources_write().clear();
    }

    /// Register the releases of a validated index file, dropping entries
    /// outside the index's authority. Returns the number registered.
    pub(crate) fn apply_index_file(&self, position: usize, file: &IndexFile) -> usize {
        let (authority, channel, auto_download, pre_release) = {
            let indexes = self.indexes_read();
            let Some(index) = indexes.get(position) else {
                return 0;
            };
            (
                index.authority().to_owned(),
                index.channel().to_owned(),
                index.auto_download(),
                index.pre_release(),
            )
        };

        let mut registered = 0;
        for (identifier, raw_version) in &file.releases {
            if !identifier.starts_with(&authority) {
                warn!(
                    channel = %channel,
                    identifier = %identifier,
                    authority = %authority,
                    "index entry outside authority, dropped"
                );
                continue;
            }
            let resource = self.get_or_create_resource(identifier);
            resource.bind_index(IndexBinding {
                channel: channel.clone(),
                auto_download,
                pre_release,
            });
            match resource.add_version(
                &self.cfg.storage_root,
                raw_version,
                AddVersionOpts {
                    available: false,
                    current_release: true,
                    pre_release,
                },
            ) {
                Ok(_) => registered += 1,
                Err(e) => warn!(
                    channel = %channel,
                    identifier = %identifier,
                    error = %e,
                    "index declares an invalid version, skipped"
                ),
            }
        }
        registered
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    pub fn get_resource(&self, identifier: &str) -> Option<Arc<Resource>> {
        self.resources_read().get(identifier).cloned()
    }

    /// Register a version of a resource directly, creating the resource when
    /// first seen. Hosts use this for bundled resources that never appear in
    /// an index.
    pub fn add_resource(
        &self,
        identifier: &str,
        raw_version: &str,
        opts: AddVersionOpts,
    ) -> UpdateResult<()> {
        let resource = self.get_or_create_resource(identifier);
        resource.add_version(&self.cfg.storage_root, raw_version, opts)?;
        Ok(())
    }

    pub(crate) fn get_or_create_resource(&self, identifier: &str) -> Arc<Resource> {
        if let Some(existing) = self.resources_read().get(identifier) {
            return Arc::clone(existing);
        }
        let mut map = self.resources_write();
        let entry = map.entry(identifier.to_owned()).or_insert_with(|| {
            let verification = self.cfg.verification_for(identifier).cloned();
            debug!(identifier, "resource registered");
            Arc::new(Resource::new(identifier.to_owned(), verification))
        });
        Arc::clone(entry)
    }

    pub(crate) fn resource_snapshot(&self) -> Vec<Arc<Resource>> {
        let mut all: Vec<_> = self.resources_read().values().cloned().collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        all
    }

    /// Re-run selection for every resource.
    pub fn select_versions(&self) {
        let ctx = self.selection_context();
        for resource in self.resource_snapshot() {
            resource.select_version(ctx);
        }
    }

    /// Identifier-sorted snapshot of all resources for status surfaces.
    pub fn export(&self) -> Vec<ResourceExport> {
        self.resource_snapshot()
            .iter()
            .map(|r| r.export())
            .collect()
    }

    /// Blacklist one version of a resource and re-select.
    pub fn blacklist(&self, identifier: &str, raw_version: &str) -> UpdateResult<()> {
        let resource = self
            .get_resource(identifier)
            .ok_or_else(|| UpdateError::NotFound(identifier.to_owned()))?;
        resource.blacklist(self.selection_context(), raw_version)
    }

    /// Purge obsolete versions of every resource, dropping resources that
    /// end up with no versions at all. Returns the number of versions
    /// removed.
    pub fn purge(&self, keep_extra: usize) -> usize {
        let mut removed = 0;
        for resource in self.resource_snapshot() {
            removed += resource.purge(&self.cfg.storage_root, keep_extra).len();
        }
        self.resources_write().retain(|_, r| !r.is_empty());
        removed
    }

    // -----------------------------------------------------------------------
    // File access
    // -----------------------------------------------------------------------

    /// Return a verified local file for the best version of a resource,
    /// downloading on demand when permitted.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown identifiers, `NotAvailableLocally` when
    /// offline without a local copy; verification and transport errors per
    /// policy and retry budget.
    pub async fn get_file(&self, identifier: &str) -> UpdateResult<ResourceFile> {
        let resource = self
            .get_resource(identifier)
            .ok_or_else(|| UpdateError::NotFound(identifier.to_owned()))?;
        let ctx = self.selection_context();
        let selected = resource
            .selected_or_select(ctx)
            .ok_or_else(|| UpdateError::NoSelectedVersion(identifier.to_owned()))?;

        if selected.available {
            return self.serve_local(&resource, &selected.version);
        }
        if !ctx.online {
            return Err(UpdateError::NotAvailableLocally(identifier.to_owned()));
        }

        {
            let _op = self.reporter.start_operation(RegistryState::Fetching).await;
            self.fetch_with_retries(&resource, &selected.version, self.cfg.retry.get_file)
                .await?;
        }
        self.serve_local(&resource, &selected.version)
    }

    /// Like [`get_file`](Self::get_file) but pinning an explicit version.
    pub async fn get_version(&self, identifier: &str, raw: &str) -> UpdateResult<ResourceFile> {
        let normalized = version::normalize(raw)?;
        let resource = self
            .get_resource(identifier)
            .ok_or_else(|| UpdateError::NotFound(identifier.to_owned()))?;
        let known = resource
            .versions()
            .into_iter()
            .find(|v| v.version == normalized)
            .ok_or_else(|| UpdateError::VersionNotFound {
                identifier: identifier.to_owned(),
                version: normalized.clone(),
            })?;

        if known.available {
            return self.serve_local(&resource, &normalized);
        }
        if !self.online() {
            return Err(UpdateError::NotAvailableLocally(identifier.to_owned()));
        }
        {
            let _op = self.reporter.start_operation(RegistryState::Fetching).await;
            self.fetch_with_retries(&resource, &normalized, self.cfg.retry.get_file)
                .await?;
        }
        self.serve_local(&resource, &normalized)
    }

    /// Verify the selected, locally available version of a resource against
    /// its stored signature, regardless of policy.
    ///
    /// # Errors
    ///
    /// `VerificationNotConfigured` when no prefix rule covers the
    /// identifier (or its rule disables verification).
    pub fn verify_resource(&self, identifier: &str) -> UpdateResult<()> {
        let rule = self
            .cfg
            .verification_rule(identifier)
            .flatten()
            .ok_or_else(|| UpdateError::VerificationNotConfigured(identifier.to_owned()))?;
        let resource = self
            .get_resource(identifier)
            .ok_or_else(|| UpdateError::NotFound(identifier.to_owned()))?;
        let selected = resource
            .selected_version()
            .ok_or_else(|| UpdateError::NoSelectedVersion(identifier.to_owned()))?;
        let (_, path) = self.storage_path_for(identifier, &selected.version);
        let meta = SigningMetadata::resource(identifier, &selected.version);
        verify::verify_file(&path, &meta, rule.trust_store())
    }

    fn serve_local(&self, resource: &Arc<Resource>, ver: &str) -> UpdateResult<ResourceFile> {
        let identifier = resource.identifier();
        let (versioned, path) = self.storage_path_for(identifier, ver);

        let semver = version::parse_version(ver)?;
        resource.mark_active(&semver);

        if let Some(opts) = resource.verification() {
            let meta = SigningMetadata::resource(identifier, ver);
            let outcome = verify::verify_file(&path, &meta, opts.trust_store());
            verify::apply_policy(opts.disk_load_policy(), &versioned, outcome)?;
        }

        let upgrade = resource.upgrade_signal();
        Ok(ResourceFile::new(
            Arc::clone(resource),
            ver.to_owned(),
            versioned,
            path,
            upgrade,
        ))
    }

    pub(crate) fn storage_path_for(&self, identifier: &str, ver: &str) -> (String, PathBuf) {
        let versioned = filename::versioned_path(identifier, ver);
        let path = self.cfg.storage_root.join(&versioned);
        (versioned, path)
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn state(&self) -> RegistryState {
        self.reporter.state()
    }

    pub fn on_state_change(&self, observer: StateObserver) {
        self.reporter.on_state_change(observer);
    }

    pub fn last_update_check(&self) -> Option<ActivityReport> {
        self.reporter.last_update_check()
    }

    pub fn last_download(&self) -> Option<ActivityReport> {
        self.reporter.last_download()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.reporter.last_success()
    }

    // -----------------------------------------------------------------------
    // Lock helpers
    // -----------------------------------------------------------------------

    fn resources_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Resource>>> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn resources_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Resource>>> {
        self.resources.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn indexes_read(&self) -> RwLockReadGuard<'_, Vec<Index>> {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn indexes_write(&self) -> RwLockWriteGuard<'_, Vec<Index>> {
        self.indexes.write().unwrap_or_else(PoisonError::into_inner)
    }
}
