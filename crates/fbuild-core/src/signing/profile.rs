//! Provisioning profile installation and inspection.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{FbuildError, Result};
use crate::executor::{CommandExecutor, CommandLine};
use crate::models::{BuildIdentifier, ExportMethod};

/// Location of installed profiles relative to the user's home directory.
pub const PROFILES_SUBDIR: &str = "Library/MobileDevice/Provisioning Profiles";

/// Returns the installed profile path for a build inside `profiles_dir`.
pub fn installed_profile_path(profiles_dir: &Path, identifier: &BuildIdentifier) -> PathBuf {
    profiles_dir.join(format!("{}.mobileprovision", identifier))
}

/// Copies a profile byte-for-byte to `destination`, creating its directory.
pub async fn install_profile(source: &Path, destination: &Path) -> Result<()> {
    if let Some(dir) = destination.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            FbuildError::Signing(format!(
                "Failed to create profiles directory {}: {}",
                dir.display(),
                e
            ))
        })?;
    }

    tokio::fs::copy(source, destination).await.map_err(|e| {
        FbuildError::Signing(format!(
            "Failed to copy provisioning profile {} to {}: {}",
            source.display(),
            destination.display(),
            e
        ))
    })?;

    tracing::info!("Installed provisioning profile: {}", destination.display());
    Ok(())
}

/// Metadata extracted from a provisioning profile.
#[derive(Debug, Clone)]
pub struct ProfileMetadata {
    /// Profile name.
    pub name: String,
    /// Profile UUID.
    pub uuid: String,
    /// Team ID.
    pub team_id: Option<String>,
    /// Bundle identifier pattern, without the team prefix.
    pub bundle_identifier: Option<String>,
    /// Export method this profile supports.
    pub export_method: ExportMethod,
    /// Profile expiration date.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProfileMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Decodes a `.mobileprovision` with `security cms` and parses its plist.
pub async fn inspect_profile(
    executor: &dyn CommandExecutor,
    path: &Path,
    cwd: &Path,
) -> Result<ProfileMetadata> {
    let cmd = CommandLine::new("security")
        .args(["cms", "-D", "-i"])
        .arg(path.to_string_lossy());
    let content = executor.run_with_output(&cmd, cwd).await?;
    parse_profile_plist(content.as_bytes())
}

/// The fields of a decoded profile this crate reads. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DecodedProfile {
    name: Option<String>,
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(default)]
    team_identifier: Vec<String>,
    expiration_date: Option<plist::Date>,
    #[serde(default)]
    entitlements: Entitlements,
    #[serde(default)]
    provisioned_devices: Vec<String>,
    #[serde(default)]
    provisions_all_devices: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Entitlements {
    /// `<TEAM>.<bundle id>`
    application_identifier: Option<String>,
    #[serde(default)]
    get_task_allow: bool,
}

impl DecodedProfile {
    /// The distribution a profile allows, checked from broadest to narrowest.
    fn export_method(&self) -> ExportMethod {
        if self.provisions_all_devices {
            ExportMethod::Enterprise
        } else if self.entitlements.get_task_allow {
            ExportMethod::Development
        } else if !self.provisioned_devices.is_empty() {
            ExportMethod::AdHoc
        } else {
            ExportMethod::AppStore
        }
    }

    fn into_metadata(self) -> ProfileMetadata {
        let export_method = self.export_method();
        let bundle_identifier = self.entitlements.application_identifier.map(|app_id| {
            match app_id.split_once('.') {
                Some((_, bundle)) => bundle.to_string(),
                None => app_id,
            }
        });

        ProfileMetadata {
            name: self.name.unwrap_or_else(|| "Unnamed Profile".to_string()),
            uuid: self.uuid,
            team_id: self.team_identifier.into_iter().next(),
            bundle_identifier,
            export_method,
            expires_at: self
                .expiration_date
                .map(|date| DateTime::<Utc>::from(SystemTime::from(date))),
        }
    }
}

/// Parses decoded profile plist content.
pub fn parse_profile_plist(content: &[u8]) -> Result<ProfileMetadata> {
    let decoded: DecodedProfile = plist::from_bytes(content)
        .map_err(|e| FbuildError::Signing(format!("Failed to parse profile plist: {}", e)))?;
    Ok(decoded.into_metadata())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::identifier;

    const PROFILE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Name</key>
    <string>Example App Store</string>
    <key>UUID</key>
    <string>3f1c5a2e-1111-2222-3333-444455556666</string>
    <key>TeamIdentifier</key>
    <array><string>ABCD123456</string></array>
    <key>ExpirationDate</key>
    <date>2030-01-01T00:00:00Z</date>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key>
        <string>ABCD123456.com.example.app</string>
        <key>get-task-allow</key>
        <false/>
    </dict>
</dict>
</plist>"#;

    #[test]
    fn test_installed_profile_path() {
        let id = identifier::generate("ABCD123456", "com.example.app");
        let path = installed_profile_path(Path::new("/profiles"), &id);
        assert_eq!(path, Path::new("/profiles/abcd123456_com_example_app.mobileprovision"));
    }

    #[test]
    fn test_parse_profile_plist() {
        let meta = parse_profile_plist(PROFILE_XML.as_bytes()).unwrap();
        assert_eq!(meta.name, "Example App Store");
        assert_eq!(meta.uuid, "3f1c5a2e-1111-2222-3333-444455556666");
        assert_eq!(meta.team_id.as_deref(), Some("ABCD123456"));
        assert_eq!(meta.bundle_identifier.as_deref(), Some("com.example.app"));
        assert_eq!(meta.export_method, ExportMethod::AppStore);
        assert_eq!(
            meta.expires_at.map(|d| d.to_rfc3339()),
            Some("2030-01-01T00:00:00+00:00".to_string())
        );
        assert!(!meta.is_expired(DateTime::from_timestamp(0, 0).unwrap()));
    }

    #[test]
    fn test_parse_profile_missing_uuid() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>Name</key><string>x</string></dict></plist>"#;
        let err = parse_profile_plist(xml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("UUID"));
    }

    #[test]
    fn test_export_method_classification() {
        let development = DecodedProfile {
            entitlements: Entitlements {
                get_task_allow: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(development.export_method(), ExportMethod::Development);

        let ad_hoc = DecodedProfile {
            provisioned_devices: vec!["device1".to_string()],
            ..Default::default()
        };
        assert_eq!(ad_hoc.export_method(), ExportMethod::AdHoc);

        let enterprise = DecodedProfile {
            provisions_all_devices: true,
            provisioned_devices: vec!["device1".to_string()],
            ..Default::default()
        };
        assert_eq!(enterprise.export_method(), ExportMethod::Enterprise);

        assert_eq!(DecodedProfile::default().export_method(), ExportMethod::AppStore);
    }

    #[test]
    fn test_parse_ignores_unrelated_entitlements() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
    <key>UUID</key><string>u-1</string>
    <key>Entitlements</key>
    <dict>
        <key>keychain-access-groups</key><array><string>ABCD123456.*</string></array>
        <key>application-identifier</key><string>ABCD123456.*</string>
    </dict>
    <key>ProvisionedDevices</key><array><string>device1</string></array>
</dict></plist>"#;

        let meta = parse_profile_plist(xml.as_bytes()).unwrap();
        assert_eq!(meta.name, "Unnamed Profile");
        assert_eq!(meta.bundle_identifier.as_deref(), Some("*"));
        assert!(meta.team_id.is_none());
        assert!(meta.expires_at.is_none());
        assert_eq!(meta.export_method, ExportMethod::AdHoc);
    }

    #[tokio::test]
    async fn test_install_profile_copies_bytes_and_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.mobileprovision");
        std::fs::write(&source, b"\x30\x82profile-bytes").unwrap();
        let destination = dir.path().join("Library/MobileDevice/Provisioning Profiles/x.mobileprovision");

        install_profile(&source, &destination).await.unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"\x30\x82profile-bytes");
    }

    #[tokio::test]
    async fn test_install_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = install_profile(&dir.path().join("nope"), &dir.path().join("out/x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to copy provisioning profile"));
    }
}
