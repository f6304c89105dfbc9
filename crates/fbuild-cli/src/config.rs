//! CLI configuration loading and resolution.
//!
//! Supports named signing profiles from `~/.fbuild/config.huml` with
//! priority order: CLI flags > environment variables > config file > defaults.
//! The certificate password is never read from the config file.

use anyhow::{bail, Context, Result};
use clap::Args;
use fbuild_core::models::{ExportMethod, SigningMaterial};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// CLI configuration loaded from config.huml file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CliConfig {
    /// Name of the default profile to use.
    pub default_profile: String,
    /// Map of profile name to profile configuration.
    pub profiles: HashMap<String, Profile>,
}

/// A named profile holding the non-secret parts of the signing material.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    /// Path to the P12 certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p12_cert: Option<PathBuf>,
    /// Path to the `.mobileprovision` file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_profile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_method: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Profile::default());
        Self {
            default_profile: "default".to_string(),
            profiles,
        }
    }
}

/// Signing flags shared by the commands that need signing material.
#[derive(Debug, Clone, Default, Args)]
pub struct SigningArgs {
    /// Apple developer team ID
    #[arg(long)]
    pub team_id: Option<String>,

    /// Bundle ID of the app
    #[arg(long)]
    pub bundle_id: Option<String>,

    /// Path to the P12 certificate
    #[arg(long, value_name = "PATH")]
    pub p12_cert: Option<PathBuf>,

    /// Password of the P12 certificate (prefer FBUILD_CERT_PASSWORD)
    #[arg(long)]
    pub cert_password: Option<String>,

    /// Path to the provisioning profile
    #[arg(long, value_name = "PATH")]
    pub provisioning_profile: Option<PathBuf>,

    /// Export method: app-store, ad-hoc, enterprise or development
    #[arg(long)]
    pub export_method: Option<ExportMethod>,
}

/// Returns the config file path (`FBUILD_CONFIG` or ~/.fbuild/config.huml).
pub fn config_path() -> Result<PathBuf> {
    match std::env::var("FBUILD_CONFIG") {
        Ok(p) if !p.is_empty() => Ok(PathBuf::from(p)),
        _ => default_config_path(),
    }
}

/// Returns the default config file path (~/.fbuild/config.huml).
pub fn default_config_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(".fbuild/config.huml"))
        .context("Could not determine home directory")
}

/// Load configuration from the config file.
///
/// Returns `Ok(None)` if the config file doesn't exist.
/// Returns an error if the file exists but is invalid.
pub fn load_config() -> Result<Option<CliConfig>> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Option<CliConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let config: CliConfig = huml_rs::serde::from_str(&content)
        .with_context(|| format!("Invalid HUML in {}", path.display()))?;

    validate_config(&config)?;
    check_file_permissions(path);

    Ok(Some(config))
}

/// Validate that the default profile exists and every export method parses.
fn validate_config(config: &CliConfig) -> Result<()> {
    if config.profiles.is_empty() {
        bail!("Config file must contain at least one profile");
    }

    if !config.profiles.contains_key(&config.default_profile) {
        bail!(
            "Default profile '{}' not found in profiles",
            config.default_profile
        );
    }

    for (name, profile) in &config.profiles {
        if let Some(method) = &profile.export_method {
            if let Err(e) = method.parse::<ExportMethod>() {
                bail!("Profile '{}': {}", name, e);
            }
        }
    }

    Ok(())
}

/// Warn if config file has overly permissive permissions (on Unix).
#[cfg(unix)]
fn check_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                "{} has overly permissive permissions ({:o}). Consider running: chmod 600 {}",
                path.display(),
                mode & 0o777,
                path.display()
            );
        }
    }
}

#[cfg(not(unix))]
fn check_file_permissions(_path: &Path) {}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn flag(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Resolve signing material by applying priority rules.
///
/// Priority order (highest to lowest):
/// 1. CLI flags (`--team-id`, `--p12-cert`, ...)
/// 2. Environment variables (`FBUILD_TEAM_ID`, `FBUILD_CERT_PASSWORD`, ...)
/// 3. Config file profile
/// 4. Defaults (no signing, `app-store` export)
pub fn resolve_signing(
    profile_flag: Option<&str>,
    args: &SigningArgs,
    file_config: Option<CliConfig>,
) -> Result<SigningMaterial> {
    let mut profile = Profile::default();

    if let Some(config) = file_config {
        let profile_name = profile_flag.unwrap_or(&config.default_profile);
        if let Some(found) = config.profiles.get(profile_name) {
            profile = found.clone();
        } else if profile_flag.is_some() {
            bail!(
                "Profile '{}' not found. Run 'fbuild config profiles' to see available profiles.",
                profile_name
            );
        }
    } else if let Some(requested_profile) = profile_flag {
        if requested_profile != "default" {
            bail!(
                "Profile '{}' not found. No config file exists. Run 'fbuild config init' to create one.",
                requested_profile
            );
        }
    }

    // Environment variables
    if let Some(v) = env_var("FBUILD_TEAM_ID") {
        profile.team_id = Some(v);
    }
    if let Some(v) = env_var("FBUILD_BUNDLE_ID") {
        profile.bundle_id = Some(v);
    }
    if let Some(v) = env_var("FBUILD_P12_CERT") {
        profile.p12_cert = Some(PathBuf::from(v));
    }
    if let Some(v) = env_var("FBUILD_PROVISIONING_PROFILE") {
        profile.provisioning_profile = Some(PathBuf::from(v));
    }
    if let Some(v) = env_var("FBUILD_EXPORT_METHOD") {
        profile.export_method = Some(v);
    }
    let mut password = env_var("FBUILD_CERT_PASSWORD");

    // CLI flags; an empty value counts as not given
    if let Some(v) = flag(args.team_id.as_deref()) {
        profile.team_id = Some(v.to_string());
    }
    if let Some(v) = flag(args.bundle_id.as_deref()) {
        profile.bundle_id = Some(v.to_string());
    }
    if let Some(v) = args.p12_cert.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        profile.p12_cert = Some(v.clone());
    }
    if let Some(v) = args
        .provisioning_profile
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        profile.provisioning_profile = Some(v.clone());
    }
    if let Some(v) = flag(args.cert_password.as_deref()) {
        password = Some(v.to_string());
    }

    let export_method = match (args.export_method, profile.export_method.as_deref()) {
        (Some(method), _) => method,
        (None, Some(method)) => method
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("Invalid export method")?,
        (None, None) => ExportMethod::default(),
    };

    Ok(SigningMaterial {
        certificate_path: profile.p12_cert,
        certificate_password: password.map(SecretString::from),
        provisioning_profile_path: profile.provisioning_profile,
        team_id: profile.team_id,
        bundle_id: profile.bundle_id,
        export_method,
    })
}
