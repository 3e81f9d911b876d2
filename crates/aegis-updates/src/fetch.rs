//! Mirror client, index refresh, and the download pipeline.
//!
//! Every fetch walks the mirror list round-robin by attempt index. Artifact
//! and index bytes are staged in the tmp directory and land with a single
//! rename. Cancellation is observed between and inside network calls;
//! writes already committed are not rolled back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::index;
use crate::registry::Registry;
use crate::resource::Resource;
use crate::state::RegistryState;
use crate::storage;
use crate::verify::{self, SigningMetadata, VerificationOptions};
use crate::version;

/// File mode for downloaded artifacts; resources are mostly executables.
const ARTIFACT_MODE: u32 = 0o755;
/// World-readable mode for indexes and signatures.
const METADATA_MODE: u32 = 0o644;

enum PendingKind {
    /// The current release is not in storage yet.
    Artifact,
    /// The artifact exists but its signature is missing.
    Signature,
}

struct PendingDownload {
    resource: Arc<Resource>,
    version: String,
    kind: PendingKind,
}

impl Registry {
    // -----------------------------------------------------------------------
    // Mirror client
    // -----------------------------------------------------------------------

    /// Fetch one file from the mirror picked by `attempt` (round-robin).
    pub(crate) async fn fetch_bytes(&self, wire_path: &str, attempt: u32) -> UpdateResult<Vec<u8>> {
        if self.cfg.mirrors.is_empty() {
            return Err(UpdateError::NoMirrors);
        }
        let mirror = &self.cfg.mirrors[attempt as usize % self.cfg.mirrors.len()];
        let url = format!("{}/{}", mirror.trim_end_matches('/'), wire_path);
        debug!(url = %url, "fetching");

        let response = tokio::select! {
            () = self.cancel.cancelled() => return Err(UpdateError::Cancelled),
            r = self.http.get(&url).send() => r.map_err(|e| UpdateError::Transport {
                url: url.clone(),
                source: e,
            })?,
        };
        if !response.status().is_success() {
            return Err(UpdateError::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        let bytes = tokio::select! {
            () = self.cancel.cancelled() => return Err(UpdateError::Cancelled),
            b = response.bytes() => b.map_err(|e| UpdateError::Transport {
                url: url.clone(),
                source: e,
            })?,
        };
        Ok(bytes.to_vec())
    }

    async fn backoff(&self, attempt: u32) -> UpdateResult<()> {
        let delay = Duration::from_millis(200u64.saturating_mul(1 << attempt.min(6)));
        tokio::select! {
            () = self.cancel.cancelled() => Err(UpdateError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Artifact download
    // -----------------------------------------------------------------------

    /// Download one version with retries and exponential backoff.
    pub(crate) async fn fetch_with_retries(
        &self,
        resource: &Arc<Resource>,
        ver: &str,
        budget: u32,
    ) -> UpdateResult<()> {
        let mut last_err = None;
        for attempt in 0..budget.max(1) {
            if attempt > 0 {
                self.backoff(attempt).await?;
            }
            match self.download_version(resource, ver, attempt).await {
                Ok(()) => return Ok(()),
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => {
                    warn!(
                        identifier = resource.identifier(),
                        version = ver,
                        attempt,
                        error = %e,
                        "download attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(UpdateError::NoMirrors))
    }

    /// One download attempt: fetch, verify per the download policy, write
    /// atomically, mark available, auto-unpack.
    async fn download_version(
        &self,
        resource: &Arc<Resource>,
        ver: &str,
        attempt: u32,
    ) -> UpdateResult<()> {
        let identifier = resource.identifier();
        let (versioned, dest) = self.storage_path_for(identifier, ver);
        let bytes = self.fetch_bytes(&versioned, attempt).await?;

        let mut sig_bytes: Option<Vec<u8>> = None;
        if let Some(opts) = resource.verification() {
            let sig_wire = format!("{versioned}.sig");
            match self.fetch_bytes(&sig_wire, attempt).await {
                Ok(sig) => sig_bytes = Some(sig),
                Err(e) => {
                    verify::apply_policy(opts.download_policy(), &sig_wire, Err(e))?;
                }
            }
            if let Some(ref sig) = sig_bytes {
                let meta = SigningMetadata::resource(identifier, ver);
                let outcome =
                    verify::verify_bytes(&bytes, sig, &meta, opts.trust_store(), &versioned);
                verify::apply_policy(opts.download_policy(), &versioned, outcome)?;
            }
        }

        let tmp = self.cfg.tmp_dir();
        storage::write_atomic(&tmp, &dest, &bytes, ARTIFACT_MODE)?;
        if let Some(ref sig) = sig_bytes {
            storage::write_atomic(&tmp, &verify::sig_path(&dest), sig, METADATA_MODE)?;
        }
        resource.mark_available(ver, sig_bytes.is_some());
        info!(identifier, version = ver, bytes = bytes.len(), "downloaded");

        self.maybe_auto_unpack(identifier, &versioned, &dest);
        Ok(())
    }

    /// Fetch the missing signature of an already downloaded artifact.
    async fn fetch_missing_signature(
        &self,
        resource: &Arc<Resource>,
        ver: &str,
        attempt: u32,
    ) -> UpdateResult<()> {
        let Some(opts) = resource.verification() else {
            return Ok(());
        };
        let identifier = resource.identifier();
        let (versioned, dest) = self.storage_path_for(identifier, ver);
        let sig = self.fetch_bytes(&format!("{versioned}.sig"), attempt).await?;

        let data =
            std::fs::read(&dest).map_err(|e| UpdateError::io("reading artifact", &dest, e))?;
        let meta = SigningMetadata::resource(identifier, ver);
        let outcome = verify::verify_bytes(&data, &sig, &meta, opts.trust_store(), &versioned);
        verify::apply_policy(opts.download_policy(), &versioned, outcome)?;

        storage::write_atomic(&self.cfg.tmp_dir(), &verify::sig_path(&dest), &sig, METADATA_MODE)?;
        resource.mark_available(ver, true);
        info!(identifier, version = ver, "fetched missing signature");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Index refresh
    // -----------------------------------------------------------------------

    /// Refresh every configured index.
    ///
    /// Individual failures are logged; the call fails only when all
    /// configured indexes failed. Emits an update-check report either way.
    pub async fn update_indexes(&self) -> UpdateResult<()> {
        let _op = self.reporter.start_operation(RegistryState::Checking).await;

        let count = self.indexes_read().len();
        let mut failures = 0;
        let mut last_err: Option<UpdateError> = None;
        for position in 0..count {
            match self.refresh_index(position).await {
                Ok(()) => {}
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => {
                    failures += 1;
                    last_err = Some(e);
                }
            }
        }
        self.select_versions();

        let pending = self.pending_update_lines();
        self.reporter
            .record_update_check(pending, last_err.as_ref().map(ToString::to_string));

        if count > 0 && failures == count {
            return Err(last_err.unwrap_or(UpdateError::NoMirrors));
        }
        Ok(())
    }

    /// Load all indexes from storage, downloading any that are missing
    /// (when online).
    pub async fn load_indexes(&self) -> UpdateResult<()> {
        let count = self.indexes_read().len();
        let mut failures = 0;
        let mut last_err: Option<UpdateError> = None;
        for position in 0..count {
            let loaded = match self.load_index_from_disk(position) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(error = %e, "loading index from disk failed");
                    failures += 1;
                    last_err = Some(e);
                    continue;
                }
            };
            if loaded {
                continue;
            }
            if !self.online() {
                debug!(position, "index not on disk and registry is offline");
                continue;
            }
            match self.refresh_index(position).await {
                Ok(()) => {}
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => {
                    failures += 1;
                    last_err = Some(e);
                }
            }
        }
        self.select_versions();

        if count > 0 && failures == count {
            return Err(last_err.unwrap_or(UpdateError::NoMirrors));
        }
        Ok(())
    }

    /// Refresh one index with retries across the mirror list.
    pub(crate) async fn refresh_index(&self, position: usize) -> UpdateResult<()> {
        let (config_path, wire, channel) = {
            let indexes = self.indexes_read();
            let Some(idx) = indexes.get(position) else {
                return Ok(());
            };
            let signed = self.cfg.verification_for(idx.path()).is_some();
            (
                idx.path().to_owned(),
                idx.wire_path(signed),
                idx.channel().to_owned(),
            )
        };

        let budget = self.cfg.retry.index.max(1);
        let mut last_err = None;
        for attempt in 0..budget {
            match self
                .try_refresh_index(position, &config_path, &wire, attempt)
                .await
            {
                Ok(registered) => {
                    info!(channel = %channel, registered, "index refreshed");
                    return Ok(());
                }
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => {
                    warn!(channel = %channel, attempt, error = %e, "index refresh attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(UpdateError::NoMirrors))
    }

    async fn try_refresh_index(
        &self,
        position: usize,
        config_path: &str,
        wire: &str,
        attempt: u32,
    ) -> UpdateResult<usize> {
        let bytes = self.fetch_bytes(wire, attempt).await?;

        let mut sig_bytes: Option<Vec<u8>> = None;
        if let Some(opts) = self.cfg.verification_for(config_path) {
            let sig = self.fetch_bytes(&format!("{wire}.sig"), attempt).await;
            let outcome = match sig {
                Ok(sig) => {
                    let checked = verify_index_bytes(&bytes, &sig, wire, opts);
                    if checked.is_ok() {
                        sig_bytes = Some(sig);
                    }
                    checked
                }
                Err(e) => Err(e),
            };
            verify::apply_policy(opts.download_policy(), wire, outcome)?;
        }

        let file = index::parse_index_file(&bytes, wire)?;
        {
            let indexes = self.indexes_read();
            if let Some(idx) = indexes.get(position) {
                idx.validate(&file, Utc::now())?;
            }
        }
        {
            let mut indexes = self.indexes_write();
            if let Some(idx) = indexes.get_mut(position) {
                idx.record_release(&file);
            }
        }
        let registered = self.apply_index_file(position, &file);

        let dest = self.cfg.storage_root.join(wire);
        let tmp = self.cfg.tmp_dir();
        storage::write_atomic(&tmp, &dest, &bytes, METADATA_MODE)?;
        if let Some(sig) = sig_bytes {
            storage::write_atomic(&tmp, &verify::sig_path(&dest), &sig, METADATA_MODE)?;
        }
        Ok(registered)
    }

    /// Load one index from storage; `Ok(false)` when it is not on disk.
    fn load_index_from_disk(&self, position: usize) -> UpdateResult<bool> {
        let (config_path, wire) = {
            let indexes = self.indexes_read();
            let Some(idx) = indexes.get(position) else {
                return Ok(false);
            };
            let signed = self.cfg.verification_for(idx.path()).is_some();
            (idx.path().to_owned(), idx.wire_path(signed))
        };

        let disk_path = self.cfg.storage_root.join(&wire);
        let bytes = match std::fs::read(&disk_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(UpdateError::io("reading index", &disk_path, e)),
        };

        if let Some(opts) = self.cfg.verification_for(&config_path) {
            let outcome = std::fs::read(verify::sig_path(&disk_path))
                .map_err(|e| UpdateError::io("reading index signature", &disk_path, e))
                .and_then(|sig| verify_index_bytes(&bytes, &sig, &wire, opts));
            verify::apply_policy(opts.disk_load_policy(), &wire, outcome)?;
        }

        let file = index::parse_index_file(&bytes, &wire)?;
        {
            let indexes = self.indexes_read();
            if let Some(idx) = indexes.get(position) {
                idx.validate(&file, Utc::now())?;
            }
        }
        {
            let mut indexes = self.indexes_write();
            if let Some(idx) = indexes.get_mut(position) {
                idx.record_release(&file);
            }
        }
        self.apply_index_file(position, &file);
        debug!(index = %wire, "index loaded from disk");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Bulk downloads
    // -----------------------------------------------------------------------

    /// Download every pending current release, plus missing signatures.
    ///
    /// Partial failures are logged and reported; the batch itself only
    /// fails on cancellation.
    pub async fn download_updates(&self, include_manual: bool) -> UpdateResult<()> {
        let _op = self
            .reporter
            .start_operation(RegistryState::Downloading)
            .await;

        let queue = self.pending_downloads(include_manual);
        info!(pending = queue.len(), "starting bulk download");

        let mut done = Vec::new();
        let mut last_err: Option<UpdateError> = None;
        for job in queue {
            let mut result = Ok(());
            for attempt in 0..self.cfg.retry.bulk.max(1) {
                if attempt > 0 {
                    self.backoff(attempt).await?;
                }
                result = match job.kind {
                    PendingKind::Artifact => {
                        self.download_version(&job.resource, &job.version, attempt).await
                    }
                    PendingKind::Signature => {
                        self.fetch_missing_signature(&job.resource, &job.version, attempt)
                            .await
                    }
                };
                match &result {
                    Ok(()) => break,
                    Err(UpdateError::Cancelled) => {
                        self.reporter
                            .record_download(done, Some("cancelled".to_owned()));
                        return Err(UpdateError::Cancelled);
                    }
                    Err(_) => {}
                }
            }
            match result {
                Ok(()) => done.push(version::human_readable(
                    job.resource.identifier(),
                    &job.version,
                )),
                Err(e) => {
                    warn!(
                        identifier = job.resource.identifier(),
                        version = %job.version,
                        error = %e,
                        "bulk download failed for resource"
                    );
                    last_err = Some(e);
                }
            }
        }
        self.select_versions();

        self.reporter
            .record_download(done, last_err.as_ref().map(ToString::to_string));
        Ok(())
    }

    /// Compute the pending download queue, identifier-sorted.
    fn pending_downloads(&self, include_manual: bool) -> Vec<PendingDownload> {
        let mut queue = Vec::new();
        for resource in self.resource_snapshot() {
            let Some(binding) = resource.index_binding() else {
                continue;
            };
            if !(binding.auto_download || include_manual) {
                continue;
            }
            let identifier = resource.identifier();
            let mandatory = self.cfg.mandatory.iter().any(|id| id == identifier);
            if !(resource.is_in_use() || resource.has_local_version() || mandatory) {
                continue;
            }
            let verification_configured = resource.verification().is_some();
            for v in resource.versions() {
                if !v.current_release {
                    continue;
                }
                if !v.available {
                    queue.push(PendingDownload {
                        resource: Arc::clone(&resource),
                        version: v.version,
                        kind: PendingKind::Artifact,
                    });
                } else if verification_configured && !v.sig_available {
                    queue.push(PendingDownload {
                        resource: Arc::clone(&resource),
                        version: v.version,
                        kind: PendingKind::Signature,
                    });
                }
            }
        }
        queue
    }

    /// Current releases not yet available locally, as report lines.
    fn pending_update_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for resource in self.resource_snapshot() {
            for v in resource.versions() {
                if v.current_release && !v.available {
                    lines.push(version::human_readable(resource.identifier(), &v.version));
                }
            }
        }
        lines
    }
}

/// Verify index bytes against their signature envelopes; a hash mismatch is
/// reported as `IndexChecksumMismatch` so callers retry another mirror.
fn verify_index_bytes(
    bytes: &[u8],
    sig: &[u8],
    wire: &str,
    opts: &VerificationOptions,
) -> UpdateResult<()> {
    let meta = SigningMetadata::index(wire);
    let envelopes = verify::parse_envelopes(sig, wire)?;
    let labeled = verify::verify_envelopes(&envelopes, &meta, opts.trust_store(), wire)?;
    if labeled != verify::labeled_sha256(bytes) {
        return Err(UpdateError::IndexChecksumMismatch(wire.to_owned()));
    }
    Ok(())
}
