//! Temporary keychain management for iOS code signing.
//!
//! Each build gets its own keychain file, named after the build identifier,
//! which is prepended to the user's keychain search list so `codesign` finds
//! the imported identity without losing access to the existing keychains.

use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};

use crate::error::{FbuildError, Result};
use crate::executor::{CommandExecutor, CommandLine};
use crate::models::BuildIdentifier;
use crate::signing::registry::remove_path;

/// Partition list granting non-interactive access to Apple tooling.
const KEY_PARTITION_LIST: &str = "apple-tool:,apple:";

/// Returns the keychain file path for a build inside `keychains_dir`.
pub fn keychain_path(keychains_dir: &Path, identifier: &BuildIdentifier) -> PathBuf {
    keychains_dir.join(format!("flutter_{}.keychain", identifier))
}

/// A per-build keychain created through the `security` tool.
#[derive(Debug, Clone)]
pub struct TemporaryKeychain {
    path: PathBuf,
}

impl TemporaryKeychain {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_arg(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Creates, unlocks and registers the keychain, then imports the certificate.
    ///
    /// Stops at the first failing step. The search list is only ever
    /// prepended to, so a failure after that step leaves the user's original
    /// keychains reachable; deleting this keychain removes the extra entry.
    pub async fn provision(
        &self,
        executor: &dyn CommandExecutor,
        certificate: &Path,
        password: &SecretString,
        cwd: &Path,
    ) -> Result<()> {
        self.create(executor, password, cwd).await?;
        self.unlock(executor, password, cwd).await?;
        self.add_to_search_list(executor, cwd).await?;

        tracing::info!("Importing P12 certificate into temporary keychain");
        self.import_certificate(executor, certificate, password, cwd)
            .await?;
        self.allow_codesign_access(executor, password, cwd).await?;

        tracing::info!("P12 certificate imported into {}", self.path.display());
        Ok(())
    }

    /// Creates the keychain file protected by `password`.
    pub async fn create(
        &self,
        executor: &dyn CommandExecutor,
        password: &SecretString,
        cwd: &Path,
    ) -> Result<()> {
        tracing::info!("Creating temporary keychain: {}", self.path.display());

        let cmd = CommandLine::new("security")
            .args(["create-keychain", "-p"])
            .secret_arg(password.expose_secret())
            .arg(self.path_arg());
        executor
            .run(&cmd, cwd)
            .await
            .map_err(|e| FbuildError::setup("create keychain", e))
    }

    pub async fn unlock(
        &self,
        executor: &dyn CommandExecutor,
        password: &SecretString,
        cwd: &Path,
    ) -> Result<()> {
        let cmd = CommandLine::new("security")
            .args(["unlock-keychain", "-p"])
            .secret_arg(password.expose_secret())
            .arg(self.path_arg());
        executor
            .run(&cmd, cwd)
            .await
            .map_err(|e| FbuildError::setup("unlock keychain", e))
    }

    /// Prepends this keychain to the user search list.
    ///
    /// Returns the list as it was before the change.
    pub async fn add_to_search_list(
        &self,
        executor: &dyn CommandExecutor,
        cwd: &Path,
    ) -> Result<Vec<String>> {
        let list_cmd = CommandLine::new("security").args(["list-keychains", "-d", "user"]);
        let output = executor
            .run_with_output(&list_cmd, cwd)
            .await
            .map_err(|e| FbuildError::setup("read keychain search list", e))?;

        let current = parse_keychain_list(&output);
        if !current.is_empty() {
            tracing::debug!("Current keychain search list:\n{}", current.join("\n"));
        }

        let set_cmd = CommandLine::new("security")
            .args(["list-keychains", "-d", "user", "-s"])
            .arg(self.path_arg())
            .args(current.iter().cloned());
        executor
            .run(&set_cmd, cwd)
            .await
            .map_err(|e| FbuildError::setup("set keychain search list", e))?;

        tracing::debug!("Added keychain to search list: {}", self.path.display());
        Ok(current)
    }

    /// Imports a P12 bundle, granting `codesign` access to its key.
    pub async fn import_certificate(
        &self,
        executor: &dyn CommandExecutor,
        certificate: &Path,
        password: &SecretString,
        cwd: &Path,
    ) -> Result<()> {
        let cmd = CommandLine::new("security")
            .arg("import")
            .arg(certificate.to_string_lossy())
            .arg("-k")
            .arg(self.path_arg())
            .arg("-P")
            .secret_arg(password.expose_secret())
            .args(["-T", "/usr/bin/codesign"]);
        executor
            .run(&cmd, cwd)
            .await
            .map_err(|e| FbuildError::setup("import P12 certificate", e))
    }

    /// Sets the key partition list so signing never prompts for access.
    pub async fn allow_codesign_access(
        &self,
        executor: &dyn CommandExecutor,
        password: &SecretString,
        cwd: &Path,
    ) -> Result<()> {
        let cmd = CommandLine::new("security")
            .args(["set-key-partition-list", "-S", KEY_PARTITION_LIST, "-s", "-k"])
            .secret_arg(password.expose_secret())
            .arg(self.path_arg());
        executor
            .run(&cmd, cwd)
            .await
            .map_err(|e| FbuildError::setup("set key partition list", e))
    }
}

/// Deletes a keychain by path.
///
/// A missing file is already clean. If `security delete-keychain` fails the
/// file is removed directly; only a failure of that fallback is an error.
/// macOS drops a deleted keychain from the search list on its own.
pub async fn delete_keychain(executor: &dyn CommandExecutor, path: &Path) -> Result<()> {
    if let Ok(false) = tokio::fs::try_exists(path).await {
        return Ok(());
    }

    let cwd = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let cmd = CommandLine::new("security")
        .arg("delete-keychain")
        .arg(path.to_string_lossy());

    match executor.run(&cmd, &cwd).await {
        Ok(()) => {
            tracing::info!("Deleted keychain: {}", path.display());
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Failed to delete keychain {}: {}", path.display(), e);
            remove_path(path, false, "keychain file").await
        }
    }
}

/// Parses `security list-keychains` output into plain paths.
pub fn parse_keychain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
