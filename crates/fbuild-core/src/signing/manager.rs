//! Credential lifecycle orchestration for one build.
//!
//! A [`CredentialManager`] provisions the temporary keychain and provisioning
//! profile a build signs with, writes the export-options plist the packaging
//! step reads, and removes all of it afterwards. Every path is recorded
//! before the step that creates it and cleared only once it has been deleted,
//! so rollback, normal cleanup and the termination guard all see the same
//! picture of what may exist on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use secrecy::SecretString;

use crate::error::{FbuildError, Result};
use crate::executor::{CommandExecutor, SystemExecutor};
use crate::models::{BuildIdentifier, ManagedResource, ResourceKind, SigningMaterial};
use crate::signing::export_options::{self, ExportOptions};
use crate::signing::guard::TerminationGuard;
use crate::signing::identifier;
use crate::signing::keychain::{self, TemporaryKeychain};
use crate::signing::profile::{self, PROFILES_SUBDIR};
use crate::signing::registry::{CleanupRegistry, remove_resource};

/// Keychains live here relative to the home directory.
const KEYCHAINS_SUBDIR: &str = "Library/Keychains";

/// Paths of resources this manager may have created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedPaths {
    pub keychain: Option<PathBuf>,
    pub provisioning_profile: Option<PathBuf>,
    pub export_options: Option<PathBuf>,
}

impl CreatedPaths {
    fn slot(&mut self, kind: ResourceKind) -> Option<&mut Option<PathBuf>> {
        match kind {
            ResourceKind::Keychain => Some(&mut self.keychain),
            ResourceKind::ProvisioningProfile => Some(&mut self.provisioning_profile),
            ResourceKind::PlistFile => Some(&mut self.export_options),
            ResourceKind::TempDirectory => None,
        }
    }

    fn resources(&self) -> Vec<ManagedResource> {
        let mut resources = Vec::new();
        if let Some(path) = &self.keychain {
            resources.push(ManagedResource::new(ResourceKind::Keychain, path, "temporary keychain"));
        }
        if let Some(path) = &self.provisioning_profile {
            resources.push(ManagedResource::new(
                ResourceKind::ProvisioningProfile,
                path,
                "provisioning profile",
            ));
        }
        if let Some(path) = &self.export_options {
            resources.push(ManagedResource::new(
                ResourceKind::PlistFile,
                path,
                "export options plist",
            ));
        }
        resources
    }

    pub fn is_empty(&self) -> bool {
        self.keychain.is_none() && self.provisioning_profile.is_none() && self.export_options.is_none()
    }
}

/// Builder for [`CredentialManager`].
pub struct CredentialManagerBuilder {
    material: SigningMaterial,
    project_root: PathBuf,
    executor: Option<Arc<dyn CommandExecutor>>,
    registry: Option<Arc<CleanupRegistry>>,
    home_dir: Option<PathBuf>,
    termination_guard: bool,
}

impl CredentialManagerBuilder {
    /// Runs commands through `executor` instead of the host.
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Shares a registry with other managers in the same process.
    pub fn registry(mut self, registry: Arc<CleanupRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Overrides the home directory keychains and profiles are placed under.
    pub fn home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    /// Whether setup installs the signal-driven cleanup guard. Defaults to `true`.
    pub fn termination_guard(mut self, enabled: bool) -> Self {
        self.termination_guard = enabled;
        self
    }

    pub fn build(self) -> Result<CredentialManager> {
        let home_dir = match self.home_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| FbuildError::Configuration("No home directory found".to_string()))?,
        };

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SystemExecutor::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CleanupRegistry::new(executor.clone())));

        let identifier = self
            .material
            .team_id()
            .map(|team_id| identifier::generate(team_id, self.material.bundle_id().unwrap_or("")));

        Ok(CredentialManager {
            inner: Arc::new(Inner {
                material: self.material,
                project_root: self.project_root,
                identifier,
                executor,
                registry,
                keychains_dir: home_dir.join(KEYCHAINS_SUBDIR),
                profiles_dir: home_dir.join(PROFILES_SUBDIR),
                paths: Mutex::new(CreatedPaths::default()),
                termination_guard: self.termination_guard,
            }),
        })
    }
}

struct Inner {
    material: SigningMaterial,
    project_root: PathBuf,
    identifier: Option<BuildIdentifier>,
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<CleanupRegistry>,
    keychains_dir: PathBuf,
    profiles_dir: PathBuf,
    paths: Mutex<CreatedPaths>,
    termination_guard: bool,
}

/// Provisions and tears down the signing identity of a single build.
///
/// Cheap to clone; clones share state, which is how the termination guard
/// reaches the same recorded paths as the build that installed it.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("identifier", &self.inner.identifier)
            .field("project_root", &self.inner.project_root)
            .field("paths", &self.created_paths())
            .finish()
    }
}

impl CredentialManager {
    /// Creates a manager that runs real commands under the user's home directory.
    pub fn new(material: SigningMaterial, project_root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(material, project_root).build()
    }

    pub fn builder(
        material: SigningMaterial,
        project_root: impl Into<PathBuf>,
    ) -> CredentialManagerBuilder {
        CredentialManagerBuilder {
            material,
            project_root: project_root.into(),
            executor: None,
            registry: None,
            home_dir: None,
            termination_guard: true,
        }
    }

    /// The build identifier, or `None` when no team ID is configured.
    pub fn unique_identifier(&self) -> Option<&BuildIdentifier> {
        self.inner.identifier.as_ref()
    }

    pub fn material(&self) -> &SigningMaterial {
        &self.inner.material
    }

    pub fn project_root(&self) -> &Path {
        &self.inner.project_root
    }

    pub fn registry(&self) -> &Arc<CleanupRegistry> {
        &self.inner.registry
    }

    /// Snapshot of the paths that may currently exist.
    pub fn created_paths(&self) -> CreatedPaths {
        self.lock_paths().clone()
    }

    /// Provisions the keychain and profile for this build.
    ///
    /// Does nothing without a team ID. Every planned resource is registered
    /// before anything is created, and any failure rolls back everything via
    /// [`force_cleanup_all`](Self::force_cleanup_all) before it is returned.
    pub async fn setup_certificates(&self) -> Result<()> {
        let Some(identifier) = self.inner.identifier.clone() else {
            tracing::debug!("No team ID configured, skipping signing setup");
            return Ok(());
        };

        tracing::info!("Setting up signing credentials for {}", identifier);

        self.inner
            .registry
            .register(identifier.as_str(), self.planned_resources(&identifier));
        self.watch_for_termination();

        if let Err(e) = self.provision(&identifier).await {
            tracing::error!("Signing setup failed, rolling back: {}", e);
            if let Err(cleanup_err) = self.force_cleanup_all().await {
                tracing::error!("Rollback incomplete: {}", cleanup_err);
            }
            return Err(e);
        }

        tracing::info!("Signing credentials ready for {}", identifier);
        Ok(())
    }

    /// Every resource this build will create, in deletion order.
    fn planned_resources(&self, identifier: &BuildIdentifier) -> Vec<ManagedResource> {
        let material = &self.inner.material;
        let mut resources = Vec::new();

        if material.has_certificate() {
            resources.push(ManagedResource::new(
                ResourceKind::Keychain,
                keychain::keychain_path(&self.inner.keychains_dir, identifier),
                "temporary keychain",
            ));
        }
        if material.has_profile() {
            resources.push(ManagedResource::new(
                ResourceKind::ProvisioningProfile,
                profile::installed_profile_path(&self.inner.profiles_dir, identifier),
                "provisioning profile",
            ));
        }
        resources.push(ManagedResource::new(
            ResourceKind::PlistFile,
            export_options::export_options_path(&self.inner.project_root, identifier),
            "export options plist",
        ));

        resources
    }

    async fn provision(&self, identifier: &BuildIdentifier) -> Result<()> {
        let material = &self.inner.material;

        if let Some((certificate, password)) = material.certificate() {
            self.create_keychain(identifier, certificate, password).await?;
        }

        if let Some(source) = &material.provisioning_profile_path {
            let destination = profile::installed_profile_path(&self.inner.profiles_dir, identifier);
            self.record(ResourceKind::ProvisioningProfile, &destination);
            profile::install_profile(source, &destination)
                .await
                .map_err(|e| FbuildError::setup("install provisioning profile", e))?;
        }

        Ok(())
    }

    async fn create_keychain(
        &self,
        identifier: &BuildIdentifier,
        certificate: &Path,
        password: &SecretString,
    ) -> Result<()> {
        let path = keychain::keychain_path(&self.inner.keychains_dir, identifier);
        self.record(ResourceKind::Keychain, &path);

        TemporaryKeychain::new(path)
            .provision(
                self.inner.executor.as_ref(),
                certificate,
                password,
                &self.inner.project_root,
            )
            .await
    }

    /// Writes the export-options plist and returns its path.
    pub async fn create_export_options_plist(&self) -> Result<PathBuf> {
        let (Some(identifier), Some(team_id)) =
            (&self.inner.identifier, self.inner.material.team_id())
        else {
            return Err(FbuildError::Configuration(
                "No signing material configured".to_string(),
            ));
        };

        let path = export_options::export_options_path(&self.inner.project_root, identifier);
        self.record(ResourceKind::PlistFile, &path);

        ExportOptions {
            method: self.inner.material.export_method,
            team_id,
            bundle_id: self.inner.material.bundle_id(),
            profile_name: identifier.as_str(),
        }
        .write(&path)
        .await?;

        tracing::info!("Created export options plist: {}", path.display());
        Ok(path)
    }

    /// Post-build cleanup.
    pub async fn cleanup_certificates(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.force_cleanup_all().await;
        tracing::info!("Signing cleanup finished in {:?}", started.elapsed());
        result
    }

    /// Removes every recorded resource and the registry entry.
    ///
    /// Each resource is attempted independently; failures are aggregated
    /// into one [`FbuildError::Cleanup`]. Safe to call repeatedly and from
    /// several tasks at once.
    pub async fn force_cleanup_all(&self) -> Result<()> {
        let Some(identifier) = &self.inner.identifier else {
            return Ok(());
        };

        // Recorded paths first, then whatever the registry still holds.
        // Each path is attempted once per pass.
        let recorded = self.created_paths().resources();
        let registered = self
            .inner
            .registry
            .take(identifier.as_str())
            .unwrap_or_default();

        let mut attempted = HashSet::new();
        let mut errors = Vec::new();

        for resource in recorded.into_iter().chain(registered) {
            if !attempted.insert(resource.path.clone()) {
                continue;
            }
            match remove_resource(self.inner.executor.as_ref(), &resource).await {
                Ok(()) => self.clear(resource.kind, &resource.path),
                Err(e) => {
                    tracing::error!("Failed to remove {}: {}", resource.description, e);
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            TerminationGuard::global().unwatch(self);
        }

        FbuildError::aggregate(identifier.as_str(), errors)
    }

    /// Returns a guard that cleans up when dropped.
    pub fn cleanup_guard(&self) -> CleanupGuard {
        CleanupGuard {
            manager: Some(self.clone()),
        }
    }

    fn watch_for_termination(&self) {
        if !self.inner.termination_guard {
            return;
        }

        if let Err(e) = TerminationGuard::global().watch(self) {
            tracing::warn!("Failed to install termination guard: {}", e);
        }
    }

    /// Identity of the shared state, stable across clones.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn lock_paths(&self) -> std::sync::MutexGuard<'_, CreatedPaths> {
        self.inner.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, kind: ResourceKind, path: &Path) {
        if let Some(slot) = self.lock_paths().slot(kind) {
            *slot = Some(path.to_path_buf());
        }
    }

    /// Clears a slot, unless it was re-recorded with another path meanwhile.
    fn clear(&self, kind: ResourceKind, path: &Path) {
        let mut paths = self.lock_paths();
        if let Some(slot) = paths.slot(kind) {
            if slot.as_deref() == Some(path) {
                *slot = None;
            }
        }
    }
}

/// Runs [`CredentialManager::cleanup_certificates`] when dropped.
///
/// Prefer [`cleanup`](Self::cleanup) on the normal path; the drop fallback
/// covers early returns and panics.
pub struct CleanupGuard {
    manager: Option<CredentialManager>,
}

impl CleanupGuard {
    /// Performs cleanup and consumes the guard.
    pub async fn cleanup(mut self) -> Result<()> {
        match self.manager.take() {
            Some(manager) => manager.cleanup_certificates().await,
            None => Ok(()),
        }
    }

    /// Gives up responsibility for cleanup.
    pub fn disarm(mut self) -> Option<CredentialManager> {
        self.manager.take()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };

        // Block until cleanup completes; a runtime cannot be entered from
        // within another, so it runs on its own thread.
        let handle = std::thread::spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(async {
                    if let Err(e) = manager.cleanup_certificates().await {
                        tracing::error!("Signing cleanup failed in drop: {}", e);
                    }
                }),
                Err(e) => tracing::error!("Failed to create runtime for signing cleanup: {}", e),
            }
        });

        if handle.join().is_err() {
            tracing::error!("Signing cleanup thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::models::ExportMethod;

    struct Fixture {
        home: tempfile::TempDir,
        project: tempfile::TempDir,
        sources: tempfile::TempDir,
        executor: Arc<RecordingExecutor>,
    }

    impl Fixture {
        fn new() -> Self {
            let sources = tempfile::tempdir().unwrap();
            std::fs::write(sources.path().join("dist.p12"), b"p12").unwrap();
            std::fs::write(sources.path().join("app.mobileprovision"), b"profile").unwrap();
            Self {
                home: tempfile::tempdir().unwrap(),
                project: tempfile::tempdir().unwrap(),
                sources,
                executor: Arc::new(RecordingExecutor::new()),
            }
        }

        fn material(&self) -> SigningMaterial {
            SigningMaterial {
                certificate_path: Some(self.sources.path().join("dist.p12")),
                certificate_password: Some(SecretString::from("secret".to_string())),
                provisioning_profile_path: Some(self.sources.path().join("app.mobileprovision")),
                team_id: Some("ABCD123456".to_string()),
                bundle_id: Some("com.example.app".to_string()),
                export_method: ExportMethod::AdHoc,
            }
        }

        fn manager(&self, material: SigningMaterial) -> CredentialManager {
            CredentialManager::builder(material, self.project.path())
                .executor(self.executor.clone())
                .home_dir(self.home.path())
                .termination_guard(false)
                .build()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_setup_without_team_id_is_a_no_op() {
        let fixture = Fixture::new();
        let manager = fixture.manager(SigningMaterial::default());

        manager.setup_certificates().await.unwrap();

        assert!(manager.unique_identifier().is_none());
        assert!(manager.registry().is_empty());
        assert!(fixture.executor.commands().is_empty());
        assert!(manager.force_cleanup_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_plist_without_team_id_is_configuration_error() {
        let fixture = Fixture::new();
        let manager = fixture.manager(SigningMaterial::default());

        let err = manager.create_export_options_plist().await.unwrap_err();
        assert!(matches!(err, FbuildError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_setup_registers_before_creating() {
        let fixture = Fixture::new();
        let manager = fixture.manager(fixture.material());

        manager.setup_certificates().await.unwrap();

        let id = manager.unique_identifier().unwrap().clone();
        let registered = manager.registry().registered_resources();
        let kinds: Vec<ResourceKind> = registered[id.as_str()].iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Keychain,
                ResourceKind::ProvisioningProfile,
                ResourceKind::PlistFile,
            ]
        );

        let paths = manager.created_paths();
        assert!(paths.keychain.as_ref().unwrap().exists());
        assert!(paths.provisioning_profile.as_ref().unwrap().exists());
        assert!(paths.export_options.is_none());
    }

    #[tokio::test]
    async fn test_profile_only_material_skips_keychain() {
        let fixture = Fixture::new();
        let mut material = fixture.material();
        material.certificate_password = None;
        let manager = fixture.manager(material);

        manager.setup_certificates().await.unwrap();

        assert!(fixture.executor.commands().is_empty());
        let paths = manager.created_paths();
        assert!(paths.keychain.is_none());
        assert!(paths.provisioning_profile.is_some());
    }

    #[tokio::test]
    async fn test_empty_password_skips_keychain() {
        let fixture = Fixture::new();
        let mut material = fixture.material();
        material.certificate_password = Some(SecretString::from(String::new()));
        let manager = fixture.manager(material);

        manager.setup_certificates().await.unwrap();

        assert!(fixture.executor.commands().is_empty());
        let id = manager.unique_identifier().unwrap().clone();
        let registered = manager.registry().registered_resources();
        assert!(registered[id.as_str()]
            .iter()
            .all(|r| r.kind != ResourceKind::Keychain));
        assert!(manager.created_paths().keychain.is_none());
    }

    #[tokio::test]
    async fn test_keychain_failure_rolls_back_partial_creation() {
        let fixture = Fixture::new();
        let executor = Arc::new(RecordingExecutor::new().failing_on("unlock-keychain"));
        let manager = CredentialManager::builder(fixture.material(), fixture.project.path())
            .executor(executor.clone())
            .home_dir(fixture.home.path())
            .termination_guard(false)
            .build()
            .unwrap();

        let err = manager.setup_certificates().await.unwrap_err();
        assert!(err.to_string().contains("unlock keychain"));

        let keychain = fixture.home.path().join(KEYCHAINS_SUBDIR);
        assert_eq!(std::fs::read_dir(&keychain).unwrap().count(), 0);
        assert!(manager.created_paths().is_empty());
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deletion_is_reported_once() {
        let fixture = Fixture::new();
        let executor = Arc::new(RecordingExecutor::new().failing_on("delete-keychain"));
        let manager = CredentialManager::builder(fixture.material(), fixture.project.path())
            .executor(executor)
            .home_dir(fixture.home.path())
            .termination_guard(false)
            .build()
            .unwrap();
        manager.setup_certificates().await.unwrap();

        // A non-empty directory defeats both `security` and the file fallback.
        let keychain = manager.created_paths().keychain.unwrap();
        std::fs::remove_file(&keychain).unwrap();
        std::fs::create_dir_all(keychain.join("child")).unwrap();

        match manager.force_cleanup_all().await.unwrap_err() {
            FbuildError::Cleanup { failures, .. } => {
                assert_eq!(failures.len(), 1, "{failures:?}");
                assert!(failures[0].contains("keychain"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(manager.registry().is_empty());
        assert!(manager.created_paths().provisioning_profile.is_none());
        assert_eq!(manager.created_paths().keychain, Some(keychain));
    }

    #[tokio::test]
    async fn test_setup_watches_until_cleaned_up() {
        let fixture = Fixture::new();
        let manager = CredentialManager::builder(fixture.material(), fixture.project.path())
            .executor(fixture.executor.clone())
            .home_dir(fixture.home.path())
            .build()
            .unwrap();

        manager.setup_certificates().await.unwrap();
        assert!(TerminationGuard::global().is_watching(&manager));
        assert!(TerminationGuard::global().is_listening());

        manager.cleanup_certificates().await.unwrap();
        assert!(!TerminationGuard::global().is_watching(&manager));
    }

    #[tokio::test]
    async fn test_cleanup_guard_cleans_on_drop() {
        let fixture = Fixture::new();
        let manager = fixture.manager(fixture.material());
        manager.setup_certificates().await.unwrap();
        let keychain = manager.created_paths().keychain.unwrap();

        {
            let _guard = manager.cleanup_guard();
        }

        assert!(!keychain.exists());
        assert!(manager.created_paths().is_empty());
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_resources() {
        let fixture = Fixture::new();
        let manager = fixture.manager(fixture.material());
        manager.setup_certificates().await.unwrap();

        let guard = manager.cleanup_guard();
        assert!(guard.disarm().is_some());
        assert!(manager.created_paths().keychain.unwrap().exists());

        manager.cleanup_certificates().await.unwrap();
    }

    #[test]
    fn test_clear_ignores_rerecorded_slot() {
        let fixture = Fixture::new();
        let manager = fixture.manager(fixture.material());

        manager.record(ResourceKind::PlistFile, Path::new("/build/second.plist"));
        manager.clear(ResourceKind::PlistFile, Path::new("/build/first.plist"));
        assert_eq!(
            manager.created_paths().export_options.as_deref(),
            Some(Path::new("/build/second.plist"))
        );

        manager.clear(ResourceKind::PlistFile, Path::new("/build/second.plist"));
        assert!(manager.created_paths().is_empty());
    }
}
