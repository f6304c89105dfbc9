//! `fbuild check` command.

use anyhow::{bail, Result};
use clap::Args;
use fbuild_core::executor::SystemExecutor;
use fbuild_core::models::SigningMaterial;
use fbuild_core::preflight::{PreflightChecker, PreflightReport, Severity};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::SigningArgs;

#[derive(Args)]
pub struct CheckArgs {
    /// Flutter project directory
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    #[command(flatten)]
    pub signing: SigningArgs,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_check_command(args: CheckArgs, material: SigningMaterial) -> Result<()> {
    let checker = PreflightChecker::new(Arc::new(SystemExecutor::new()));
    let report = checker.check_ios(&args.project, &material).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        print_report(&report);
    }

    if report.has_errors() {
        bail!("Preflight check failed");
    }
    Ok(())
}

/// Prints findings one per line, followed by the decoded profile if any.
pub fn print_report(report: &PreflightReport) {
    for finding in &report.findings {
        let marker = match finding.severity {
            Severity::Ok => "ok",
            Severity::Warning => "warn",
            Severity::Error => "FAIL",
        };
        println!("[{:>4}] {}", marker, finding.message);
    }

    if let Some(profile) = &report.profile {
        println!();
        println!("Provisioning profile:");
        println!("  Name:    {}", profile.name);
        println!("  UUID:    {}", profile.uuid);
        println!("  Team:    {}", profile.team_id.as_deref().unwrap_or("-"));
        println!("  App ID:  {}", profile.bundle_identifier.as_deref().unwrap_or("-"));
        println!("  Method:  {}", profile.export_method);
        match profile.expires_at {
            Some(at) => println!("  Expires: {}", at.format("%Y-%m-%d")),
            None => println!("  Expires: -"),
        }
    }
}

fn report_json(report: &PreflightReport) -> serde_json::Value {
    let findings: Vec<serde_json::Value> = report
        .findings
        .iter()
        .map(|f| serde_json::json!({ "severity": f.severity.as_str(), "message": f.message }))
        .collect();

    let profile = report.profile.as_ref().map(|p| {
        serde_json::json!({
            "name": p.name,
            "uuid": p.uuid,
            "team_id": p.team_id,
            "bundle_identifier": p.bundle_identifier,
            "export_method": p.export_method.as_str(),
            "expires_at": p.expires_at.map(|at| at.to_rfc3339()),
        })
    });

    serde_json::json!({
        "ok": !report.has_errors(),
        "findings": findings,
        "profile": profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbuild_core::executor::RecordingExecutor;

    #[tokio::test]
    async fn test_report_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let report = PreflightChecker::new(Arc::new(RecordingExecutor::new()))
            .with_host_os("macos")
            .check_ios(dir.path(), &SigningMaterial::default())
            .await;

        let json = report_json(&report);
        assert_eq!(json["ok"], false);
        assert!(json["profile"].is_null());
        let findings = json["findings"].as_array().unwrap();
        assert!(findings.iter().any(|f| f["severity"] == "error"));
    }
}
