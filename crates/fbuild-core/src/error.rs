//! Error types for the fbuild core library.

use thiserror::Error;

/// Core error type for signing credential management.
#[derive(Error, Debug)]
pub enum FbuildError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command failed: {command}: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Signing error: {0}")]
    Signing(String),

    /// A setup step failed; everything created so far has been rolled back.
    #[error("Failed to {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: Box<FbuildError>,
    },

    /// One or more resources could not be removed.
    ///
    /// The registry entry is forgotten regardless, so retrying is a no-op.
    #[error("Cleanup failed for {identifier}: {}", failures.join("; "))]
    Cleanup {
        identifier: String,
        failures: Vec<String>,
    },
}

impl FbuildError {
    /// Wraps an error with the name of the setup step it came from.
    pub fn setup(step: &'static str, source: FbuildError) -> Self {
        FbuildError::Setup {
            step,
            source: Box::new(source),
        }
    }

    /// Flattens a list of errors into a single cleanup error, or `Ok` if empty.
    pub fn aggregate(identifier: &str, errors: Vec<FbuildError>) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }

        let failures = errors
            .into_iter()
            .flat_map(|e| match e {
                FbuildError::Cleanup { failures, .. } => failures,
                other => vec![other.to_string()],
            })
            .collect();

        Err(FbuildError::Cleanup {
            identifier: identifier.to_string(),
            failures,
        })
    }
}

/// Result type alias for fbuild operations.
pub type Result<T> = std::result::Result<T, FbuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(FbuildError::aggregate("abc", Vec::new()).is_ok());
    }

    #[test]
    fn test_aggregate_flattens_nested_cleanup_errors() {
        let nested = FbuildError::Cleanup {
            identifier: "inner".to_string(),
            failures: vec!["first".to_string(), "second".to_string()],
        };
        let io = FbuildError::Signing("third".to_string());

        let err = FbuildError::aggregate("outer", vec![nested, io]).unwrap_err();
        match err {
            FbuildError::Cleanup {
                identifier,
                failures,
            } => {
                assert_eq!(identifier, "outer");
                assert_eq!(failures.len(), 3);
                assert_eq!(failures[2], "Signing error: third");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_setup_error_message_names_step() {
        let err = FbuildError::setup(
            "install provisioning profile",
            FbuildError::Signing("missing file".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Failed to install provisioning profile: Signing error: missing file"
        );
    }
}
