//! External command execution.
//!
//! Every toolchain and `security` invocation goes through [`CommandExecutor`],
//! so the global keychain state is only ever touched via this seam.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{FbuildError, Result};

/// A program plus arguments, some of which may be secret.
///
/// Secret arguments are passed to the process verbatim but render as `***`
/// whenever the command line is displayed or embedded in an error.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    secret: Vec<bool>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret: Vec::new(),
        }
    }

    /// Appends a plain argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self.secret.push(false);
        self
    }

    /// Appends several plain arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Appends an argument that must never appear in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self.secret.push(true);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Full argv including the program, with secrets in the clear.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Builds a command line from a pre-split argv (e.g. a user-supplied command).
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| FbuildError::Configuration("Command cannot be empty".to_string()))?;
        Ok(Self::new(program.clone()).args(rest.iter().cloned()))
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for (arg, secret) in self.args.iter().zip(&self.secret) {
            if *secret {
                write!(f, " ***")?;
            } else if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandLine({})", self)
    }
}

/// Trait for running external commands.
///
/// Implementations can be:
/// - SystemExecutor: spawns real processes on the host
/// - RecordingExecutor: records command lines and simulates `security` (tests only)
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs a command to completion, streaming its output to the console.
    async fn run(&self, command: &CommandLine, cwd: &Path) -> Result<()>;

    /// Runs a command to completion and returns its trimmed stdout.
    async fn run_with_output(&self, command: &CommandLine, cwd: &Path) -> Result<String>;
}

/// Host process executor.
///
/// Arguments are passed directly to the program, never through a shell.
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(command: &CommandLine, cwd: &Path) -> Command {
        let mut cmd = Command::new(command.program());
        cmd.args(command.arguments()).current_dir(cwd);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, command: &CommandLine, cwd: &Path) -> Result<()> {
        tracing::debug!("Running `{}` in {}", command, cwd.display());

        let status = Self::command(command, cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| FbuildError::CommandFailed {
                command: command.to_string(),
                message: format!("failed to spawn: {}", e),
            })?;

        if !status.success() {
            return Err(FbuildError::CommandFailed {
                command: command.to_string(),
                message: format!("{} (working directory: {})", status, cwd.display()),
            });
        }

        Ok(())
    }

    async fn run_with_output(&self, command: &CommandLine, cwd: &Path) -> Result<String> {
        tracing::debug!("Running `{}` in {}", command, cwd.display());

        let output = Self::command(command, cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FbuildError::CommandFailed {
                command: command.to_string(),
                message: format!("failed to spawn: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FbuildError::CommandFailed {
                command: command.to_string(),
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingExecutor;

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const DEFAULT_KEYCHAIN_LIST: &str =
        "    \"/Users/ci/Library/Keychains/login.keychain-db\"\n    \"/Library/Keychains/System.keychain\"";

    /// Executor that records every command line instead of touching the host.
    ///
    /// `security create-keychain` and `security delete-keychain` are simulated
    /// on the filesystem so cleanup behaviour can be observed. `security cms`
    /// prints the file it is pointed at, so plain XML plists stand in for
    /// signed profiles.
    #[derive(Debug, Default)]
    pub struct RecordingExecutor {
        commands: Mutex<Vec<Vec<String>>>,
        fail_on: Mutex<Vec<String>>,
        keychain_list: Mutex<Option<String>>,
    }

    impl RecordingExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes any command whose argv contains `needle` as an argument fail.
        pub fn failing_on(self, needle: &str) -> Self {
            self.fail_on
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(needle.to_string());
            self
        }

        /// Overrides the output of `security list-keychains -d user`.
        pub fn with_keychain_list(self, output: &str) -> Self {
            *self.keychain_list.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(output.to_string());
            self
        }

        /// All recorded argvs, in invocation order.
        pub fn commands(&self) -> Vec<Vec<String>> {
            self.commands
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        /// Recorded argvs whose second element (the subcommand) equals `subcommand`.
        pub fn commands_for(&self, subcommand: &str) -> Vec<Vec<String>> {
            self.commands()
                .into_iter()
                .filter(|argv| argv.get(1).map(String::as_str) == Some(subcommand))
                .collect()
        }

        fn dispatch(&self, command: &CommandLine) -> Result<String> {
            let argv = command.argv();
            self.commands
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(argv.clone());

            let should_fail = self
                .fail_on
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .any(|needle| argv.iter().any(|a| a == needle));
            if should_fail {
                return Err(FbuildError::CommandFailed {
                    command: command.to_string(),
                    message: "exit status: 1".to_string(),
                });
            }

            let args: Vec<&str> = argv.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["security", "create-keychain", .., path] => {
                    let path = PathBuf::from(path);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, b"keychain")?;
                    Ok(String::new())
                }
                ["security", "delete-keychain", path] => {
                    std::fs::remove_file(path).map_err(|e| FbuildError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    })?;
                    Ok(String::new())
                }
                ["security", "list-keychains", "-d", "user"] => Ok(self
                    .keychain_list
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or_else(|| DEFAULT_KEYCHAIN_LIST.to_string())),
                ["security", "cms", "-D", "-i", path] => Ok(std::fs::read_to_string(path)?),
                _ => Ok(String::new()),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, command: &CommandLine, _cwd: &Path) -> Result<()> {
            self.dispatch(command).map(|_| ())
        }

        async fn run_with_output(&self, command: &CommandLine, _cwd: &Path) -> Result<String> {
            self.dispatch(command).map(|out| out.trim().to_string())
        }
    }
}
