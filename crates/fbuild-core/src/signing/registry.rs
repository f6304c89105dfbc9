//! Cleanup registry for build-scoped signing resources.
//!
//! The registry is the only authority that deletes a registered resource.
//! Removing an identifier's entry from the map is the single-flight point:
//! whichever caller (normal cleanup, error rollback, termination guard)
//! takes the entry performs the deletions, later callers see no entry and
//! return success.

use dashmap::DashMap;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use crate::error::{FbuildError, Result};
use crate::executor::CommandExecutor;
use crate::models::{ManagedResource, ResourceKind};
use crate::signing::keychain;

/// Concurrency-safe ledger of resources created per build identifier.
pub struct CleanupRegistry {
    entries: DashMap<String, Vec<ManagedResource>>,
    executor: Arc<dyn CommandExecutor>,
}

impl CleanupRegistry {
    /// Creates an empty registry that deletes keychains through `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            entries: DashMap::new(),
            executor,
        }
    }

    /// Associates `resources` with `identifier`, replacing any previous list.
    pub fn register(&self, identifier: &str, resources: Vec<ManagedResource>) {
        tracing::info!(
            "Registered {} cleanup resource(s) for {}",
            resources.len(),
            identifier
        );
        self.entries.insert(identifier.to_string(), resources);
    }

    /// Deletes every resource registered for `identifier`, in order.
    ///
    /// Individual failures do not stop the remaining deletions. The entry is
    /// forgotten even when some deletions fail, so a repeat call is a no-op.
    pub async fn cleanup(&self, identifier: &str) -> Result<()> {
        let Some(resources) = self.take(identifier) else {
            return Ok(());
        };

        let mut errors = Vec::new();
        for resource in &resources {
            if let Err(e) = remove_resource(self.executor.as_ref(), resource).await {
                tracing::error!("Failed to remove {}: {}", resource.description, e);
                errors.push(e);
            }
        }

        if errors.is_empty() {
            tracing::info!("Cleaned up resources for {}", identifier);
        }

        FbuildError::aggregate(identifier, errors)
    }

    /// Removes and returns the entry for `identifier` without deleting anything.
    ///
    /// The caller that receives `Some` becomes responsible for the deletions.
    pub fn take(&self, identifier: &str) -> Option<Vec<ManagedResource>> {
        self.entries.remove(identifier).map(|(_, resources)| resources)
    }

    /// Cleans up every registered identifier, aggregating failures.
    pub async fn cleanup_all(&self) -> Result<()> {
        let identifiers: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut errors = Vec::new();
        for identifier in identifiers {
            if let Err(e) = self.cleanup(&identifier).await {
                errors.push(e);
            }
        }

        FbuildError::aggregate("all registered builds", errors)
    }

    /// Returns a snapshot of the registered resources.
    pub fn registered_resources(&self) -> HashMap<String, Vec<ManagedResource>> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("entries", &self.registered_resources())
            .finish()
    }
}

/// Deletes one resource according to its kind.
///
/// A resource that no longer exists counts as removed.
pub async fn remove_resource(executor: &dyn CommandExecutor, resource: &ManagedResource) -> Result<()> {
    match resource.kind {
        ResourceKind::Keychain => keychain::delete_keychain(executor, &resource.path).await,
        ResourceKind::ProvisioningProfile | ResourceKind::PlistFile => {
            remove_path(&resource.path, false, &resource.description).await
        }
        ResourceKind::TempDirectory => remove_path(&resource.path, true, &resource.description).await,
    }
}

/// Removes a file or directory, treating "not found" as success.
pub(crate) async fn remove_path(path: &Path, recursive: bool, description: &str) -> Result<()> {
    let result = if recursive {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => {
            tracing::info!("Removed {}: {}", description, path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FbuildError::Signing(format!(
            "Failed to remove {} {}: {}",
            description,
            path.display(),
            e
        ))),
    }
}
