//! Signing material and build-scoped resource models.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Build Identifier
// ============================================================================

/// Namespace for every resource created on behalf of one build.
///
/// Derived from the team and bundle IDs by
/// [`identifier::generate`](crate::signing::identifier::generate).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildIdentifier(pub(crate) String);

impl BuildIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for BuildIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<BuildIdentifier> for String {
    fn from(id: BuildIdentifier) -> Self {
        id.0
    }
}

impl std::fmt::Display for BuildIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Export Method
// ============================================================================

/// Distribution method written to the export-options plist.
///
/// Also used to classify provisioning profiles, since each profile kind
/// supports exactly one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportMethod {
    #[default]
    AppStore,
    AdHoc,
    Enterprise,
    Development,
}

impl ExportMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportMethod::AppStore => "app-store",
            ExportMethod::AdHoc => "ad-hoc",
            ExportMethod::Enterprise => "enterprise",
            ExportMethod::Development => "development",
        }
    }
}

impl std::str::FromStr for ExportMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "app-store" | "appstore" => Ok(ExportMethod::AppStore),
            "ad-hoc" | "adhoc" => Ok(ExportMethod::AdHoc),
            "enterprise" => Ok(ExportMethod::Enterprise),
            "development" => Ok(ExportMethod::Development),
            _ => Err(format!("Unknown export method: {}", s)),
        }
    }
}

impl std::fmt::Display for ExportMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Signing Material
// ============================================================================

/// Everything needed to provision a signing identity for one build.
///
/// All fields are optional. Without a team ID no credential lifecycle runs;
/// without a certificate and password no keychain is created; without a
/// profile path nothing is installed.
#[derive(Debug, Default)]
pub struct SigningMaterial {
    /// Path to the P12 certificate bundle.
    pub certificate_path: Option<PathBuf>,
    /// Password of the P12 bundle, also used for the temporary keychain.
    pub certificate_password: Option<SecretString>,
    /// Path to the `.mobileprovision` file.
    pub provisioning_profile_path: Option<PathBuf>,
    /// Apple developer team ID.
    pub team_id: Option<String>,
    /// Bundle ID of the app being exported.
    pub bundle_id: Option<String>,
    /// Distribution method for the exported archive.
    pub export_method: ExportMethod,
}

impl SigningMaterial {
    /// Returns the team ID when a credential lifecycle is required.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref().filter(|t| !t.is_empty())
    }

    pub fn bundle_id(&self) -> Option<&str> {
        self.bundle_id.as_deref().filter(|b| !b.is_empty())
    }

    /// The certificate and its password, when a keychain should be created.
    ///
    /// An empty password counts as absent.
    pub fn certificate(&self) -> Option<(&Path, &SecretString)> {
        let password = self
            .certificate_password
            .as_ref()
            .filter(|p| !p.expose_secret().is_empty())?;
        Some((self.certificate_path.as_deref()?, password))
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate().is_some()
    }

    pub fn has_profile(&self) -> bool {
        self.provisioning_profile_path.is_some()
    }
}

// ============================================================================
// Managed Resources
// ============================================================================

/// Kind of external resource created for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Keychain,
    ProvisioningProfile,
    PlistFile,
    TempDirectory,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Keychain => "keychain",
            ResourceKind::ProvisioningProfile => "provisioning_profile",
            ResourceKind::PlistFile => "plist_file",
            ResourceKind::TempDirectory => "temp_directory",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An external resource owned by the cleanup registry once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub kind: ResourceKind,
    pub path: PathBuf,
    pub description: String,
}

impl ManagedResource {
    pub fn new(kind: ResourceKind, path: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            description: description.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_method_round_trips_through_str() {
        for method in [
            ExportMethod::AppStore,
            ExportMethod::AdHoc,
            ExportMethod::Enterprise,
            ExportMethod::Development,
        ] {
            assert_eq!(method.as_str().parse::<ExportMethod>(), Ok(method));
        }
    }

    #[test]
    fn test_export_method_accepts_legacy_spellings() {
        assert_eq!("appstore".parse(), Ok(ExportMethod::AppStore));
        assert_eq!("AD_HOC".parse(), Ok(ExportMethod::AdHoc));
        assert!("release-testing-x".parse::<ExportMethod>().is_err());
    }

    #[test]
    fn test_signing_material_empty_team_id_means_no_lifecycle() {
        let material = SigningMaterial {
            team_id: Some(String::new()),
            ..Default::default()
        };
        assert!(material.team_id().is_none());
    }

    #[test]
    fn test_has_certificate_requires_password() {
        let mut material = SigningMaterial {
            certificate_path: Some(PathBuf::from("/tmp/cert.p12")),
            ..Default::default()
        };
        assert!(!material.has_certificate());

        material.certificate_password = Some(SecretString::from("pw".to_string()));
        assert!(material.has_certificate());
    }

    #[test]
    fn test_empty_password_means_no_keychain() {
        let material = SigningMaterial {
            certificate_path: Some(PathBuf::from("/tmp/cert.p12")),
            certificate_password: Some(SecretString::from(String::new())),
            ..Default::default()
        };
        assert!(!material.has_certificate());
        assert!(material.certificate().is_none());
    }
}
