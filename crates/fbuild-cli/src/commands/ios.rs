//! `fbuild ios` command: package an IPA inside a signing credential lifecycle.

use anyhow::{bail, Context, Result};
use clap::Args;
use fbuild_core::executor::{CommandExecutor, CommandLine, SystemExecutor};
use fbuild_core::models::SigningMaterial;
use fbuild_core::preflight::PreflightChecker;
use fbuild_core::signing::CredentialManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::check::print_report;
use crate::config::SigningArgs;

#[derive(Args)]
pub struct IosArgs {
    /// Flutter project directory
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    #[command(flatten)]
    pub signing: SigningArgs,

    /// Set up signing and write the export options, but skip packaging
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the preflight check
    #[arg(long)]
    pub skip_preflight: bool,

    /// Packaging command (defaults to `flutter build ipa --release`)
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

pub async fn handle_ios_command(args: IosArgs, material: SigningMaterial) -> Result<()> {
    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", args.project.display()))?;
    let executor: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor::new());

    if !args.skip_preflight {
        let report = PreflightChecker::new(executor.clone())
            .check_ios(&project, &material)
            .await;
        print_report(&report);
        if report.has_errors() {
            bail!("Preflight check failed");
        }
    }

    let manager = CredentialManager::builder(material, &project)
        .executor(executor.clone())
        .build()?;

    run_ios_build(&manager, executor.as_ref(), &args).await
}

/// Runs setup, plist generation and packaging, cleaning up on every path.
///
/// A cleanup failure is logged rather than returned, so it never masks the
/// outcome of the build itself.
pub async fn run_ios_build(
    manager: &CredentialManager,
    executor: &dyn CommandExecutor,
    args: &IosArgs,
) -> Result<()> {
    let guard = manager.cleanup_guard();
    let result = package(manager, executor, args).await;

    if let Err(e) = guard.cleanup().await {
        tracing::warn!("Signing cleanup incomplete: {}", e);
    }

    result
}

async fn package(
    manager: &CredentialManager,
    executor: &dyn CommandExecutor,
    args: &IosArgs,
) -> Result<()> {
    manager
        .setup_certificates()
        .await
        .context("Failed to set up signing credentials")?;

    let plist = match manager.unique_identifier() {
        Some(id) => {
            tracing::info!("Build identifier: {}", id);
            Some(manager.create_export_options_plist().await?)
        }
        None => {
            tracing::info!("No team ID configured, building without signing credentials");
            None
        }
    };

    let command = packaging_command(&args.command, plist.as_deref())?;

    if args.dry_run {
        // The plist is removed with the rest of the credentials, so show its content.
        let export_options = match &plist {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
            ),
            None => None,
        };
        print!("{}", dry_run_summary(&command, export_options.as_deref()));
        return Ok(());
    }

    println!("Running: {}", command);
    executor
        .run(&command, manager.project_root())
        .await
        .context("Packaging command failed")?;

    println!("iOS build completed");
    Ok(())
}

fn dry_run_summary(command: &CommandLine, export_options: Option<&str>) -> String {
    let mut summary = String::new();
    if let Some(xml) = export_options {
        summary.push_str("Export options:\n");
        summary.push_str(xml.trim_end());
        summary.push('\n');
    }
    summary.push_str(&format!("Would run: {}\n", command));
    summary
}

/// The user's command verbatim, or `flutter build ipa` wired to the plist.
fn packaging_command(user_command: &[String], plist: Option<&Path>) -> Result<CommandLine> {
    if !user_command.is_empty() {
        return Ok(CommandLine::from_argv(user_command)?);
    }

    let mut command = CommandLine::new("flutter").args(["build", "ipa", "--release"]);
    if let Some(plist) = plist {
        command = command.arg(format!("--export-options-plist={}", plist.display()));
    }
    Ok(command)
}
