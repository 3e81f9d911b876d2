//! aegis-updates: versioned, signature-verified resource distribution.
//!
//! The registry maps slash-separated identifiers to locally stored,
//! cryptographically verified artifact versions. Channel indexes (stable,
//! beta, staging, support, intel) declare the authoritative version per
//! resource; the registry downloads from a mirror list, verifies detached
//! signatures, unpacks archives, selects the best version per policy, and
//! hands callers a path that is guaranteed to exist.
//!
//! A [`Registry`] is a plain constructed value; typical lifecycle:
//!
//! ```no_run
//! # async fn run() -> Result<(), aegis_updates::UpdateError> {
//! use aegis_updates::{Registry, RegistryConfig};
//!
//! let mut cfg = RegistryConfig::new("/var/lib/aegis/updates");
//! cfg.mirrors = vec!["https://updates.example.com".to_owned()];
//! let registry = Registry::new(cfg)?;
//!
//! registry.initialize()?;
//! registry.load_indexes().await?;
//! registry.scan_storage(None)?;
//! registry.select_versions();
//!
//! let file = registry.get_file("linux_amd64/core/portd").await?;
//! println!("serving {}", file.path().display());
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
mod fetch;
mod file;
mod filename;
mod index;
mod registry;
mod resource;
mod state;
mod storage;
mod unpack;
mod verify;
mod version;

pub use error::{UpdateError, UpdateResult};
pub use file::ResourceFile;
pub use filename::{parse_versioned_path, versioned_path};
pub use index::{Index, IndexFile, IndexSpec, parse_index_file};
pub use registry::{Registry, RegistryConfig, RetryBudget};
pub use resource::{AddVersionOpts, Resource, ResourceExport, ResourceVersion};
pub use state::{ActivityReport, RegistryState, StateObserver};
pub use verify::{
    SignatureEnvelope, SignaturePolicy, SigningMetadata, TrustStore, VerificationOptions,
    encode_envelopes, labeled_sha256, sig_path,
};
pub use version::{DEV_VERSION, human_readable, normalize, parse_version};

/// Exit code a cooperating supervisor treats as "restart me".
pub const EXIT_RESTART: i32 = 23;

/// Exit code a cooperating supervisor treats as "controlled failure, do not
/// retry".
pub const EXIT_CONTROLLED_FAILURE: i32 = 24;
