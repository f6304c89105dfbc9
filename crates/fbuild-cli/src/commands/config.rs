//! `fbuild config` commands for managing signing profiles.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use fbuild_core::models::ExportMethod;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::config::{config_path, load_config, CliConfig, Profile};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Create a new config file with a default profile
    Init {
        #[command(flatten)]
        values: ProfileValues,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Set profile values (creates profile if it doesn't exist)
    Set {
        /// Profile name to update (defaults to "default")
        #[arg(long, default_value = "default")]
        profile: String,

        #[command(flatten)]
        values: ProfileValues,

        /// Set this profile as the default
        #[arg(long)]
        default: bool,
    },

    /// Show current configuration
    Show,

    /// List all available profiles
    Profiles,

    /// Show config file path
    Path,
}

/// Profile fields settable from the command line. Passwords are not accepted.
#[derive(Debug, Default, clap::Args)]
pub struct ProfileValues {
    /// Apple developer team ID
    #[arg(long)]
    pub team_id: Option<String>,

    /// Bundle ID of the app
    #[arg(long)]
    pub bundle_id: Option<String>,

    /// Path to the P12 certificate
    #[arg(long, value_name = "PATH")]
    pub p12_cert: Option<PathBuf>,

    /// Path to the provisioning profile
    #[arg(long, value_name = "PATH")]
    pub provisioning_profile: Option<PathBuf>,

    /// Export method: app-store, ad-hoc, enterprise or development
    #[arg(long)]
    pub export_method: Option<ExportMethod>,
}

impl ProfileValues {
    /// Copies every given value into `profile`; returns whether anything changed.
    fn apply(self, profile: &mut Profile) -> bool {
        let mut updated = false;
        if let Some(v) = self.team_id {
            profile.team_id = Some(v);
            updated = true;
        }
        if let Some(v) = self.bundle_id {
            profile.bundle_id = Some(v);
            updated = true;
        }
        if let Some(v) = self.p12_cert {
            profile.p12_cert = Some(v);
            updated = true;
        }
        if let Some(v) = self.provisioning_profile {
            profile.provisioning_profile = Some(v);
            updated = true;
        }
        if let Some(v) = self.export_method {
            profile.export_method = Some(v.as_str().to_string());
            updated = true;
        }
        updated
    }
}

pub fn handle_config_command(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Init { values, force } => init_config(values, force),
        ConfigCommands::Set {
            profile,
            values,
            default,
        } => set_config(profile, values, default),
        ConfigCommands::Show => show_config(),
        ConfigCommands::Profiles => list_profiles(),
        ConfigCommands::Path => show_path(),
    }
}

/// Create a new config file.
fn init_config(values: ProfileValues, force: bool) -> Result<()> {
    let path = config_path()?;

    if path.exists() && !force {
        bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    let mut profile = Profile::default();
    values.apply(&mut profile);

    let mut profiles = HashMap::new();
    profiles.insert("default".to_string(), profile);
    let config = CliConfig {
        default_profile: "default".to_string(),
        profiles,
    };

    write_config(&path, &config)?;

    println!("Created config file at {}", path.display());
    println!();
    println!("To add more profiles:");
    println!("  fbuild config set --profile release --team-id ABCD123456 --bundle-id com.example.app");
    println!();
    println!("The certificate password is never stored; set FBUILD_CERT_PASSWORD instead.");

    Ok(())
}

/// Update profile values.
fn set_config(profile_name: String, values: ProfileValues, set_default: bool) -> Result<()> {
    let path = config_path()?;

    let mut config = load_config()?.unwrap_or_else(|| CliConfig {
        default_profile: "default".to_string(),
        profiles: HashMap::new(),
    });

    let profile = config.profiles.entry(profile_name.clone()).or_default();
    let updated = values.apply(profile);

    if set_default && config.default_profile != profile_name {
        config.default_profile = profile_name.clone();
    }

    if !updated && !set_default {
        println!("No changes specified. Use --team-id, --bundle-id, --p12-cert, --provisioning-profile, --export-method or --default.");
        return Ok(());
    }

    // A fresh file must still name an existing default profile.
    if !config.profiles.contains_key(&config.default_profile) {
        config.default_profile = profile_name.clone();
    }

    write_config(&path, &config)?;

    println!("Updated profile '{}'", profile_name);
    if set_default {
        println!("Set '{}' as default profile", profile_name);
    }

    Ok(())
}

/// Display current configuration.
fn show_config() -> Result<()> {
    let path = config_path()?;

    let config = match load_config()? {
        Some(c) => c,
        None => {
            println!("No config file found at {}", path.display());
            println!();
            println!("Run 'fbuild config init' to create a config file.");
            return Ok(());
        }
    };

    println!("Config file: {}", path.display());
    println!("Default profile: {}", config.default_profile);
    println!();

    let mut names: Vec<_> = config.profiles.keys().collect();
    names.sort();

    for name in names {
        let profile = &config.profiles[name];
        let marker = if name == &config.default_profile { " *" } else { "" };

        println!("[{}]{}", name, marker);
        println!("  Team ID:              {}", profile.team_id.as_deref().unwrap_or("(not set)"));
        println!("  Bundle ID:            {}", profile.bundle_id.as_deref().unwrap_or("(not set)"));
        println!("  P12 certificate:      {}", display_path(profile.p12_cert.as_deref()));
        println!(
            "  Provisioning profile: {}",
            display_path(profile.provisioning_profile.as_deref())
        );
        println!(
            "  Export method:        {}",
            profile.export_method.as_deref().unwrap_or("app-store")
        );
        println!();
    }

    Ok(())
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

/// List all available profiles.
fn list_profiles() -> Result<()> {
    let config = match load_config()? {
        Some(c) => c,
        None => {
            println!("No config file found. Run 'fbuild config init' to create one.");
            return Ok(());
        }
    };

    let mut names: Vec<_> = config.profiles.keys().collect();
    names.sort();

    println!("Available profiles:");
    for name in names {
        if name == &config.default_profile {
            println!("  {} *", name);
        } else {
            println!("  {}", name);
        }
    }
    println!();
    println!("* = default profile");

    Ok(())
}

/// Show the config file path.
fn show_path() -> Result<()> {
    println!("{}", config_path()?.display());

    if let Ok(env_path) = std::env::var("FBUILD_CONFIG") {
        println!();
        println!("Note: FBUILD_CONFIG is set to: {}", env_path);
    }

    Ok(())
}

/// Write config to file with proper HUML formatting and secure permissions.
fn write_config(path: &Path, config: &CliConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            #[cfg(unix)]
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }

    let content = serialize_to_huml(config);
    fs::write(path, &content).with_context(|| format!("Failed to write {}", path.display()))?;

    // Owner read/write only
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Serialize config to HUML format.
///
/// huml-rs only deserializes, so the document is generated by hand.
fn serialize_to_huml(config: &CliConfig) -> String {
    let mut output = String::new();

    output.push_str("%HUML v0.2.0\n");
    output.push_str(&format!("default_profile: {}\n", quote(&config.default_profile)));
    output.push('\n');
    output.push_str("profiles::\n");

    let mut profile_names: Vec<_> = config.profiles.keys().collect();
    profile_names.sort();

    for name in profile_names {
        let profile = &config.profiles[name];
        let fields = [
            ("team_id", profile.team_id.clone()),
            ("bundle_id", profile.bundle_id.clone()),
            ("p12_cert", profile.p12_cert.as_ref().map(|p| p.display().to_string())),
            (
                "provisioning_profile",
                profile.provisioning_profile.as_ref().map(|p| p.display().to_string()),
            ),
            ("export_method", profile.export_method.clone()),
        ];

        if fields.iter().all(|(_, v)| v.is_none()) {
            output.push_str(&format!("  {}:: {{}}\n", name));
        } else {
            output.push_str(&format!("  {}::\n", name));
            for (key, value) in fields {
                if let Some(value) = value {
                    output.push_str(&format!("    {}: {}\n", key, quote(&value)));
                }
            }
        }
        output.push('\n');
    }

    output
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_serialize_to_huml() {
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Profile::default());
        profiles.insert(
            "release".to_string(),
            Profile {
                team_id: Some("ABCD123456".to_string()),
                bundle_id: Some("com.example.app".to_string()),
                p12_cert: Some(PathBuf::from("/certs/dist.p12")),
                provisioning_profile: None,
                export_method: Some("ad-hoc".to_string()),
            },
        );

        let config = CliConfig {
            default_profile: "release".to_string(),
            profiles,
        };

        let huml = serialize_to_huml(&config);

        assert!(huml.starts_with("%HUML v0.2.0\n"));
        assert!(huml.contains("default_profile: \"release\""));
        assert!(huml.contains("  default:: {}\n"));
        assert!(huml.contains("    team_id: \"ABCD123456\"\n"));
        assert!(huml.contains("    p12_cert: \"/certs/dist.p12\"\n"));
        assert!(huml.contains("    export_method: \"ad-hoc\"\n"));
        assert!(!huml.contains("provisioning_profile"));
        assert!(!huml.contains("password"));
    }

    #[test]
    fn test_profile_values_apply() {
        let mut profile = Profile::default();
        assert!(!ProfileValues::default().apply(&mut profile));

        let values = ProfileValues {
            team_id: Some("ABCD123456".to_string()),
            export_method: Some(ExportMethod::Enterprise),
            ..Default::default()
        };
        assert!(values.apply(&mut profile));
        assert_eq!(profile.team_id.as_deref(), Some("ABCD123456"));
        assert_eq!(profile.export_method.as_deref(), Some("enterprise"));
    }

    #[test]
    fn test_write_config_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.huml");

        write_config(&path, &CliConfig::default()).unwrap();

        assert!(path.exists());
        #[cfg(unix)]
        {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
