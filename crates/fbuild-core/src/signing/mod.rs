//! Ephemeral iOS signing credentials.
//!
//! This module provides functionality for:
//! - deriving a per-build identifier that namespaces every created file
//! - provisioning a temporary keychain and installing a provisioning profile
//! - writing the export-options plist used by `flutter build ipa`
//! - guaranteed cleanup, including on SIGINT/SIGTERM

pub mod export_options;
pub mod guard;
pub mod identifier;
pub mod keychain;
pub mod manager;
pub mod profile;
pub mod registry;

pub use export_options::ExportOptions;
pub use guard::{TerminationGuard, TerminationSignal};
pub use keychain::TemporaryKeychain;
pub use manager::{CleanupGuard, CreatedPaths, CredentialManager, CredentialManagerBuilder};
pub use profile::ProfileMetadata;
pub use registry::CleanupRegistry;
