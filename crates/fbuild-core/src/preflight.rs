//! Pre-build checks for Flutter iOS projects.
//!
//! Catches the usual misconfigurations (no Xcode project, wrong host, a
//! profile issued to another team) before any credential is provisioned.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use crate::executor::CommandExecutor;
use crate::models::SigningMaterial;
use crate::signing::profile::{self, ProfileMetadata};

/// Severity of a single preflight finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

/// Outcome of a preflight run.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub findings: Vec<Finding>,
    /// Decoded provisioning profile, when one was given and could be read.
    pub profile: Option<ProfileMetadata>,
}

impl PreflightReport {
    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Ok => tracing::debug!("{}", message),
            Severity::Warning => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        }
        self.findings.push(Finding { severity, message });
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }
}

/// Runs preflight checks for an iOS build.
pub struct PreflightChecker {
    executor: Arc<dyn CommandExecutor>,
    host_os: &'static str,
}

impl PreflightChecker {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            host_os: std::env::consts::OS,
        }
    }

    /// Overrides the detected host OS (`std::env::consts::OS` values).
    pub fn with_host_os(mut self, host_os: &'static str) -> Self {
        self.host_os = host_os;
        self
    }

    /// Checks the project layout and the signing material.
    ///
    /// Never fails; problems are reported as findings. Only findings with
    /// [`Severity::Error`] should block a build.
    pub async fn check_ios(&self, project_root: &Path, material: &SigningMaterial) -> PreflightReport {
        let mut report = PreflightReport::default();

        if project_root.join("pubspec.yaml").exists() {
            report.push(Severity::Ok, "Flutter project detected");
        } else {
            report.push(
                Severity::Warning,
                format!("No pubspec.yaml in {}", project_root.display()),
            );
        }

        if project_root.join("ios/Runner.xcodeproj").exists() {
            report.push(Severity::Ok, "iOS project configuration found");
        } else {
            report.push(
                Severity::Error,
                format!("iOS project not found: {}", project_root.join("ios/Runner.xcodeproj").display()),
            );
        }

        if self.host_os != "macos" {
            report.push(
                Severity::Warning,
                format!("iOS builds require macOS (host is {})", self.host_os),
            );
        }

        if let Some(cert) = &material.certificate_path {
            if !cert.is_file() {
                report.push(
                    Severity::Error,
                    format!("Certificate not found: {}", cert.display()),
                );
            } else if !material.has_certificate() {
                report.push(
                    Severity::Warning,
                    "Certificate given without a password; no keychain will be created",
                );
            }
        }

        if let Some(path) = &material.provisioning_profile_path {
            if path.is_file() {
                self.check_profile(&mut report, path, project_root, material)
                    .await;
            } else {
                report.push(
                    Severity::Error,
                    format!("Provisioning profile not found: {}", path.display()),
                );
            }
        }

        if material.has_certificate() && material.team_id().is_none() {
            report.push(
                Severity::Warning,
                "Signing material given without a team ID; it will not be used",
            );
        }

        report
    }

    async fn check_profile(
        &self,
        report: &mut PreflightReport,
        path: &Path,
        cwd: &Path,
        material: &SigningMaterial,
    ) {
        let meta = match profile::inspect_profile(self.executor.as_ref(), path, cwd).await {
            Ok(meta) => meta,
            Err(e) => {
                report.push(
                    Severity::Warning,
                    format!("Could not decode provisioning profile: {}", e),
                );
                return;
            }
        };

        report.push(
            Severity::Ok,
            format!("Provisioning profile '{}' ({})", meta.name, meta.export_method),
        );

        if let (Some(expected), Some(actual)) = (material.team_id(), meta.team_id.as_deref()) {
            if expected != actual {
                report.push(
                    Severity::Warning,
                    format!(
                        "Provisioning profile belongs to team {} but team ID is {}",
                        actual, expected
                    ),
                );
            }
        }

        if meta.is_expired(Utc::now()) {
            report.push(
                Severity::Warning,
                format!("Provisioning profile '{}' has expired", meta.name),
            );
        }

        if let (Some(expected), Some(actual)) =
            (material.bundle_id(), meta.bundle_identifier.as_deref())
        {
            if actual != "*" && actual != expected {
                report.push(
                    Severity::Warning,
                    format!(
                        "Provisioning profile is for {} but bundle ID is {}",
                        actual, expected
                    ),
                );
            }
        }

        report.profile = Some(meta);
    }
}
