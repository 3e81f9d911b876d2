//! Shared helpers for aegis-updates integration tests: an in-memory mock
//! mirror served over local HTTP, and fixed-seed signing fixtures.

pub mod keys;
pub mod mirror;

pub use keys::{public_key_hex, sign_index, sign_resource, signing_key, TEST_SIGNER};
pub use mirror::MockMirror;
