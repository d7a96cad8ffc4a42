//! Error types for the autoclicker.
//!
//! Component modules own their own error enums; this type folds them into the
//! categories the control loop reasons about (transient vs. terminal).

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::input::InputError;
use crate::locator::DetectionError;
use thiserror::Error;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing/unreadable templates or invalid options. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Screen grab failed. The tick is skipped.
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(#[from] CaptureError),

    /// Template matching failed. Treated as "not present" for the tick.
    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    /// The OS refused a click or keystroke. The tick is skipped.
    #[error("Input rejected: {0}")]
    InputRejected(#[from] InputError),

    /// Corner fail-safe or signal. Ends the loop cleanly.
    #[error("Aborted by user: {0}")]
    AbortedByUser(String),

    /// Anything else. Ends the loop with a non-zero exit code.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Create an aborted-by-user error with a reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Error::AbortedByUser(reason.into())
    }

    /// Create an unexpected error with context.
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Error::Unexpected(msg.into())
    }

    /// Transient errors never escape a tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::CaptureUnavailable(_) | Error::Detection(_) | Error::InputRejected(_)
        )
    }

    /// Terminal, but the process should still exit with status 0.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Error::AbortedByUser(_))
    }

    /// Short category name used in log lines.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::CaptureUnavailable(_) => "CaptureUnavailable",
            Error::Detection(_) => "DetectionError",
            Error::InputRejected(_) => "InputRejected",
            Error::AbortedByUser(_) => "AbortedByUser",
            Error::Unexpected(_) => "UnexpectedError",
        }
    }

    /// Process exit code for this error when it ends the program.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::AbortedByUser(_) => 0,
            Error::Configuration(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::aborted("cursor reached screen corner (0, 0)");
        assert_eq!(
            err.to_string(),
            "Aborted by user: cursor reached screen corner (0, 0)"
        );
    }

    #[test]
    fn test_error_classification() {
        let capture: Error = CaptureError::NotAvailable.into();
        assert!(capture.is_transient());
        assert!(!capture.is_clean_exit());
        assert_eq!(capture.category(), "CaptureUnavailable");

        let abort = Error::aborted("signal");
        assert!(!abort.is_transient());
        assert!(abort.is_clean_exit());
        assert_eq!(abort.exit_code(), 0);

        let config: Error = ConfigError::InvalidValue("tick_interval_seconds".into()).into();
        assert!(!config.is_transient());
        assert_eq!(config.exit_code(), 2);

        assert_eq!(Error::unexpected("boom").exit_code(), 1);
    }
}
