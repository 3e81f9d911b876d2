//! The handle returned to callers that request a resource.
//!
//! A `ResourceFile` is an immutable snapshot of one served version plus a
//! shared reference to the resource it came from. The handle stays valid
//! when a newer version is selected later; the upgrade signal tells the
//! caller when that happens.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;

use crate::resource::Resource;

pub struct ResourceFile {
    resource: Arc<Resource>,
    version: String,
    versioned_path: String,
    storage_path: PathBuf,
    upgrade: watch::Receiver<bool>,
}

impl ResourceFile {
    pub(crate) fn new(
        resource: Arc<Resource>,
        version: String,
        versioned_path: String,
        storage_path: PathBuf,
        upgrade: watch::Receiver<bool>,
    ) -> Self {
        Self {
            resource,
            version,
            versioned_path,
            storage_path,
            upgrade,
        }
    }

    pub fn identifier(&self) -> &str {
        self.resource.identifier()
    }

    /// The served version, normalized.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Storage-relative versioned filename.
    pub fn versioned_path(&self) -> &str {
        &self.versioned_path
    }

    /// Absolute path of the artifact in storage.
    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    /// Whether a newer selection has replaced this handle's version.
    pub fn upgrade_available(&self) -> bool {
        *self.upgrade.borrow()
    }

    /// Wait until an upgrade becomes available. Returns immediately when the
    /// signal already fired.
    pub async fn wait_for_upgrade(&mut self) {
        // The sender is dropped once it fires, so an error from `changed`
        // means the value is final; check the flag either way.
        let _ = self.upgrade.wait_for(|fired| *fired).await;
    }

    /// Subscribe to the upgrade signal without consuming the handle.
    pub fn upgrade_signal(&self) -> watch::Receiver<bool> {
        self.upgrade.clone()
    }

    /// Human-readable `<identifier> v<version>` form.
    pub fn human_readable(&self) -> String {
        crate::version::human_readable(self.identifier(), &self.version)
    }
}

impl std::fmt::Debug for ResourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceFile")
            .field("identifier", &self.identifier())
            .field("version", &self.version)
            .field("storage_path", &self.storage_path)
            .finish()
    }
}
