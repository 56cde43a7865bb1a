//! Error Catalog for hostctl
//!
//! Every failure surfaced to an operator carries a stable code in the
//! `HCT-Exxx` format together with remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category  | Description                                   |
//! |------------|-----------|-----------------------------------------------|
//! | E001-E099  | Config    | Configuration and environment errors          |
//! | E100-E199  | Session   | Console/telnet/SSH session errors             |
//! | E200-E299  | Host      | Host lifecycle and state-transition errors    |
//! | E300-E399  | Recovery  | Teardown/recovery registry errors             |
//! | E500-E599  | Internal  | Internal/unexpected errors                    |
//!
//! # Example
//!
//! ```rust
//! use hostctl_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::HostStateTimeout.entry();
//! println!("Error {}: {}", entry.code, entry.message);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering hostctl failure scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Explicit config path does not exist
    ConfigNotFound,
    /// Config path exists but is unreadable
    ConfigReadError,
    /// Config is not valid TOML for the schema
    ConfigParseError,
    /// A value is out of range or inconsistent
    ConfigValidationError,
    /// A HOSTCTL_* override could not be parsed
    ConfigEnvError,

    // =========================================================================
    // Session Errors (E100-E199)
    // =========================================================================
    /// Transport could not be established
    SessionConnectFailed,
    /// Login credentials were refused
    SessionAuthDenied,
    /// Transport was lost mid-session
    SessionLost,
    /// Expected output never appeared
    SessionExpectTimeout,
    /// Prompt or expect pattern is not a valid regex
    SessionInvalidPattern,
    /// Remote shell produced output that could not be interpreted
    SessionUnexpectedOutput,

    // =========================================================================
    // Host Errors (E200-E299)
    // =========================================================================
    /// Host did not reach the expected state in time
    HostStateTimeout,
    /// Operation accepted but end state never materialised
    HostPostCheckFailed,
    /// Platform CLI rejected the request
    HostCommandRejected,
    /// Platform CLI output could not be parsed
    HostParseFailed,
    /// Host name not present in the host list
    HostUnknown,
    /// Polling cancelled by a shared cancel signal
    HostCancelled,

    // =========================================================================
    // Recovery Errors (E300-E399)
    // =========================================================================
    /// One or more recovery entries could not be restored
    RecoveryIncomplete,
    /// Scopes entered or exited out of nesting order
    RecoveryScopeOrder,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Caller passed an invalid argument
    InternalInvalidArgument,
    /// Logging could not be initialised
    InternalLoggingError,
}

impl ErrorCode {
    /// Returns the numeric portion of the error code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,

            Self::SessionConnectFailed => 100,
            Self::SessionAuthDenied => 101,
            Self::SessionLost => 102,
            Self::SessionExpectTimeout => 103,
            Self::SessionInvalidPattern => 104,
            Self::SessionUnexpectedOutput => 105,

            Self::HostStateTimeout => 200,
            Self::HostPostCheckFailed => 201,
            Self::HostCommandRejected => 202,
            Self::HostParseFailed => 203,
            Self::HostUnknown => 204,
            Self::HostCancelled => 205,

            Self::RecoveryIncomplete => 300,
            Self::RecoveryScopeOrder => 301,

            Self::InternalInvalidArgument => 500,
            Self::InternalLoggingError => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "HCT-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("HCT-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Session,
            200..=299 => ErrorCategory::Host,
            300..=399 => ErrorCategory::Recovery,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Config file does not exist",
            Self::ConfigReadError => "Config file could not be read",
            Self::ConfigParseError => "Config file is not valid TOML",
            Self::ConfigValidationError => "Config holds an invalid value",
            Self::ConfigEnvError => "HOSTCTL_* environment override is invalid",

            Self::SessionConnectFailed => "Could not connect to the lab endpoint",
            Self::SessionAuthDenied => "Login credentials were denied",
            Self::SessionLost => "Session to the lab was lost",
            Self::SessionExpectTimeout => "Expected output did not appear in time",
            Self::SessionInvalidPattern => "Prompt or expect pattern is not a valid regex",
            Self::SessionUnexpectedOutput => "Remote shell output could not be interpreted",

            Self::HostStateTimeout => "Host did not reach the expected state in time",
            Self::HostPostCheckFailed => "Operation was accepted but did not complete",
            Self::HostCommandRejected => "Platform rejected the request",
            Self::HostParseFailed => "Platform CLI output could not be parsed",
            Self::HostUnknown => "Host is not known to the platform",
            Self::HostCancelled => "Polling was cancelled",

            Self::RecoveryIncomplete => "Some hosts or resources could not be restored",
            Self::RecoveryScopeOrder => "Test scopes were entered or exited out of order",

            Self::InternalInvalidArgument => "Invalid argument",
            Self::InternalLoggingError => "Logging could not be initialised",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Create ~/.config/hostctl/config.toml",
                "Or pass --config <path>",
            ],
            Self::ConfigReadError => &["Check file permissions on the config file"],
            Self::ConfigParseError => &["Validate the TOML syntax of the config file"],
            Self::ConfigValidationError => &["Run 'hostctl config validate' for details"],
            Self::ConfigEnvError => &["Check HOSTCTL_* environment variables"],

            Self::SessionConnectFailed => &[
                "Verify the lab floating IP or console server is reachable",
                "Check the transport kind and port in [lab]",
                "Increase session.retry_timeout_secs if the lab is rebooting",
            ],
            Self::SessionAuthDenied => &["Verify lab.user and lab.password"],
            Self::SessionLost => &[
                "The host may be rebooting or swacting; reconnect and retry",
            ],
            Self::SessionExpectTimeout => &[
                "Check that lab.initial_prompt matches the shell prompt",
                "The command may take longer than the expect timeout",
            ],
            Self::SessionInvalidPattern => &["Fix the regex in the prompt configuration"],
            Self::SessionUnexpectedOutput => &["Inspect the session log for the raw output"],

            Self::HostStateTimeout => &[
                "Check 'system host-show <host>' for a stuck task",
                "Check active alarms with 'fm alarm-list'",
                "Raise the matching [timeouts] value if the lab is slow",
            ],
            Self::HostPostCheckFailed => &[
                "Verify both controllers are enabled before swacting",
                "Check 'system servicegroup-list' on the new active controller",
            ],
            Self::HostCommandRejected => &["Read the rejection message for the platform's reason"],
            Self::HostParseFailed => &["The platform CLI output format may have changed"],
            Self::HostUnknown => &["Check the host name against 'system host-list'"],
            Self::HostCancelled => &["Another worker requested cancellation"],

            Self::RecoveryIncomplete => &[
                "Inspect the listed entries and restore them manually",
                "Subsequent tests may run against a degraded lab",
            ],
            Self::RecoveryScopeOrder => &["Close inner scopes before outer scopes"],

            Self::InternalInvalidArgument => &["This is likely a bug in the calling test"],
            Self::InternalLoggingError => &["Check the log directory is writable"],
        }
    }

    /// Returns all defined error codes.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::SessionConnectFailed,
            Self::SessionAuthDenied,
            Self::SessionLost,
            Self::SessionExpectTimeout,
            Self::SessionInvalidPattern,
            Self::SessionUnexpectedOutput,
            Self::HostStateTimeout,
            Self::HostPostCheckFailed,
            Self::HostCommandRejected,
            Self::HostParseFailed,
            Self::HostUnknown,
            Self::HostCancelled,
            Self::RecoveryIncomplete,
            Self::RecoveryScopeOrder,
            Self::InternalInvalidArgument,
            Self::InternalLoggingError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and environment errors (E001-E099)
    Config,
    /// Console/telnet/SSH session errors (E100-E199)
    Session,
    /// Host lifecycle errors (E200-E299)
    Host,
    /// Teardown recovery errors (E300-E399)
    Recovery,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Session => "Session",
            Self::Host => "Host",
            Self::Recovery => "Recovery",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "HCT-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(
                seen.insert(num),
                "Duplicate error code number: {} for {:?}",
                num,
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "HCT-E001");
        assert_eq!(ErrorCode::SessionConnectFailed.code_string(), "HCT-E100");
        assert_eq!(ErrorCode::HostStateTimeout.code_string(), "HCT-E200");
        assert_eq!(ErrorCode::RecoveryIncomplete.code_string(), "HCT-E300");
        assert_eq!(ErrorCode::InternalInvalidArgument.code_string(), "HCT-E500");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::ConfigNotFound.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::SessionLost.category(), ErrorCategory::Session);
        assert_eq!(ErrorCode::HostCancelled.category(), ErrorCategory::Host);
        assert_eq!(
            ErrorCode::RecoveryScopeOrder.category(),
            ErrorCategory::Recovery
        );
        assert_eq!(
            ErrorCode::InternalLoggingError.category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_every_code_has_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.remediation().is_empty(), "{code:?} has no remediation");
        }
    }

    #[test]
    fn test_format_full_numbers_steps() {
        let entry = ErrorCode::HostStateTimeout.entry();
        let full = entry.format_full();
        assert!(full.starts_with("[HCT-E200]"));
        assert!(full.contains("  1. "));
        assert_eq!(entry.to_string(), entry.format_brief());
    }
}
