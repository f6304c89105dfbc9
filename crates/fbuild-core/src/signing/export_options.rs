//! Export-options property list generation for `flutter build ipa`.

use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

use crate::error::{FbuildError, Result};
use crate::models::{BuildIdentifier, ExportMethod};

/// Returns the plist path for a build under `<project>/build`.
pub fn export_options_path(project_root: &Path, identifier: &BuildIdentifier) -> PathBuf {
    project_root
        .join("build")
        .join(format!("export_options_{}.plist", identifier))
}

/// Inputs describing how the archive should be exported.
#[derive(Debug, Clone)]
pub struct ExportOptions<'a> {
    pub method: ExportMethod,
    pub team_id: &'a str,
    pub bundle_id: Option<&'a str>,
    /// Name the packaging tool uses to look up the provisioning profile.
    pub profile_name: &'a str,
}

impl ExportOptions<'_> {
    /// Builds the plist dictionary.
    ///
    /// Manual signing and the profile mapping are only emitted when a bundle
    /// ID is known; otherwise the packaging tool picks the profile itself.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("method".to_string(), Value::String(self.method.as_str().to_string()));
        dict.insert("teamID".to_string(), Value::String(self.team_id.to_string()));
        dict.insert("uploadSymbols".to_string(), Value::Boolean(false));

        if let Some(bundle_id) = self.bundle_id {
            let mut profiles = Dictionary::new();
            profiles.insert(
                bundle_id.to_string(),
                Value::String(self.profile_name.to_string()),
            );
            dict.insert("signingStyle".to_string(), Value::String("manual".to_string()));
            dict.insert("provisioningProfiles".to_string(), Value::Dictionary(profiles));
        }

        dict
    }

    /// Writes the options as an XML plist, creating the parent directory.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(self.to_dictionary()))?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                FbuildError::Signing(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        tokio::fs::write(path, buf).await.map_err(|e| {
            FbuildError::Signing(format!("Failed to write {}: {}", path.display(), e))
        })?;

        tracing::debug!("Wrote export options: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(bundle_id: Option<&str>) -> ExportOptions<'_> {
        ExportOptions {
            method: ExportMethod::AppStore,
            team_id: "ABCD123456",
            bundle_id,
            profile_name: "abcd123456_com_example_app",
        }
    }

    #[test]
    fn test_dictionary_without_bundle_id() {
        let dict = options(None).to_dictionary();
        assert_eq!(dict.get("teamID").and_then(|v| v.as_string()), Some("ABCD123456"));
        assert_eq!(dict.get("method").and_then(|v| v.as_string()), Some("app-store"));
        assert_eq!(dict.get("uploadSymbols").and_then(|v| v.as_boolean()), Some(false));
        assert!(dict.get("provisioningProfiles").is_none());
        assert!(dict.get("signingStyle").is_none());
    }

    #[test]
    fn test_dictionary_with_bundle_id() {
        let dict = options(Some("com.example.app")).to_dictionary();
        assert_eq!(dict.get("signingStyle").and_then(|v| v.as_string()), Some("manual"));

        let profiles = dict
            .get("provisioningProfiles")
            .and_then(|v| v.as_dictionary())
            .unwrap();
        assert_eq!(
            profiles.get("com.example.app").and_then(|v| v.as_string()),
            Some("abcd123456_com_example_app")
        );
    }

    #[test]
    fn test_export_options_path() {
        let id = crate::signing::identifier::generate("ABCD123456", "com.example.app");
        assert_eq!(
            export_options_path(Path::new("/work/app"), &id),
            Path::new("/work/app/build/export_options_abcd123456_com_example_app.plist")
        );
    }

    #[tokio::test]
    async fn test_write_produces_parseable_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build/export.plist");

        options(Some("com.example.app")).write(&path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("<?xml"));
        assert!(content.contains("<key>provisioningProfiles</key>"));

        let value: plist::Value = plist::from_file(&path).unwrap();
        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict.get("teamID").and_then(|v| v.as_string()), Some("ABCD123456"));
    }
}
