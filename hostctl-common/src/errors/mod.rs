//! Error taxonomy for hostctl.
//!
//! Three layers, matching the three core components:
//!
//! | Type            | Raised by              | Policy                                   |
//! |-----------------|------------------------|------------------------------------------|
//! | `SessionError`  | `Session`, transports  | Always propagates; fatal to the session  |
//! | `HostError`     | `HostStateController`  | State waits are caller-decided (fail_ok) |
//! | `RecoveryError` | `RecoveryRegistry`     | Aggregated after every entry is tried    |
//!
//! Every variant maps to a catalog code (see [`catalog`]).

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use crate::recovery::{RecoveryEntry, Scope};
use crate::types::{HostState, StateCriteria};
use std::time::Duration;
use thiserror::Error;

/// Errors from a terminal session or its transport.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport could not be established within the retry budget.
    #[error("connection to {endpoint} failed after {attempts} attempt(s): {reason}")]
    Connection {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// Remote side refused the credentials. Never retried.
    #[error("login to {endpoint} as '{user}' was denied")]
    AuthenticationDenied { endpoint: String, user: String },

    /// Transport was lost mid-session.
    #[error("connection to {endpoint} lost: {reason}")]
    Disconnected { endpoint: String, reason: String },

    /// Operation attempted without an open transport.
    #[error("session to {endpoint} is not connected")]
    NotConnected { endpoint: String },

    /// None of the expected patterns appeared before the deadline.
    #[error("timed out after {timeout:?} waiting for {patterns:?}; last output: {tail:?}")]
    ExpectTimeout {
        patterns: Vec<String>,
        timeout: Duration,
        tail: String,
    },

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unexpected output from '{command}': {detail}")]
    UnexpectedOutput { command: String, detail: String },
}

impl SessionError {
    /// Whether the transport is gone and the session must reconnect.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::AuthenticationDenied { .. }
                | Self::Disconnected { .. }
                | Self::NotConnected { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExpectTimeout { .. })
    }
}

/// Errors from host lifecycle operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Polled state transition did not complete in time.
    #[error(
        "timed out after {elapsed:?} waiting for {hosts:?} to reach {expected}; observed: {}",
        format_observed(.observed)
    )]
    StateTimeout {
        hosts: Vec<String>,
        expected: StateCriteria,
        observed: Vec<(String, Option<HostState>)>,
        elapsed: Duration,
    },

    /// CLI accepted the request but the expected end state never materialised.
    #[error("post-check failed for {host} after {elapsed:?}: {detail}")]
    PostCheckFailed {
        host: String,
        detail: String,
        elapsed: Duration,
    },

    /// Remote CLI rejected the request.
    #[error("'{command}' rejected with code {code}: {output}")]
    CommandRejected {
        command: String,
        code: i32,
        output: String,
    },

    #[error("could not parse output of '{command}': {detail}")]
    Parse { command: String, detail: String },

    #[error("host {0} is not known to the platform")]
    UnknownHost(String),

    #[error("polling cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn format_observed(observed: &[(String, Option<HostState>)]) -> String {
    if observed.is_empty() {
        return "<nothing>".to_string();
    }
    observed
        .iter()
        .map(|(host, state)| match state {
            Some(state) => format!("{host}={state}"),
            None => format!("{host}=<unknown>"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// One entry that could not be restored during a drain.
#[derive(Debug, Clone)]
pub struct EntryFailure {
    pub entry: RecoveryEntry,
    pub error: String,
}

/// Errors from the recovery registry and scope stack.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Some entries could not be restored. All entries were still attempted.
    #[error("{} of {attempted} {scope}-scope recovery entries failed: {}", .failures.len(), format_failures(.failures))]
    Aggregate {
        scope: Scope,
        attempted: usize,
        failures: Vec<EntryFailure>,
    },

    /// Scope entered out of nesting order.
    #[error("cannot enter {entering} scope while {open} scope is open")]
    ScopeOrder { open: Scope, entering: Scope },

    /// Scope exited while not the innermost open scope.
    #[error("cannot exit {scope} scope: innermost open scope is {innermost:?}")]
    ScopeNotOpen {
        scope: Scope,
        innermost: Option<Scope>,
    },

    /// Several scopes failed while closing the whole stack.
    #[error("{} scope(s) failed to recover", .0.len())]
    Multiple(Vec<RecoveryError>),
}

fn format_failures(failures: &[EntryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.entry, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl RecoveryError {
    /// Every entry failure contained in this error, flattened.
    pub fn failures(&self) -> Vec<&EntryFailure> {
        match self {
            Self::Aggregate { failures, .. } => failures.iter().collect(),
            Self::Multiple(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            _ => Vec::new(),
        }
    }
}

/// Map an error onto its catalog code.
pub trait Cataloged {
    fn error_code(&self) -> ErrorCode;
}

impl Cataloged for SessionError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection { .. } => ErrorCode::SessionConnectFailed,
            Self::AuthenticationDenied { .. } => ErrorCode::SessionAuthDenied,
            Self::Disconnected { .. } | Self::NotConnected { .. } => ErrorCode::SessionLost,
            Self::ExpectTimeout { .. } => ErrorCode::SessionExpectTimeout,
            Self::InvalidPattern { .. } => ErrorCode::SessionInvalidPattern,
            Self::UnexpectedOutput { .. } => ErrorCode::SessionUnexpectedOutput,
        }
    }
}

impl Cataloged for HostError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Session(e) => e.error_code(),
            Self::StateTimeout { .. } => ErrorCode::HostStateTimeout,
            Self::PostCheckFailed { .. } => ErrorCode::HostPostCheckFailed,
            Self::CommandRejected { .. } => ErrorCode::HostCommandRejected,
            Self::Parse { .. } => ErrorCode::HostParseFailed,
            Self::UnknownHost(_) => ErrorCode::HostUnknown,
            Self::Cancelled => ErrorCode::HostCancelled,
            Self::InvalidArgument(_) => ErrorCode::InternalInvalidArgument,
        }
    }
}

impl Cataloged for RecoveryError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Aggregate { .. } | Self::Multiple(_) => ErrorCode::RecoveryIncomplete,
            Self::ScopeOrder { .. } | Self::ScopeNotOpen { .. } => ErrorCode::RecoveryScopeOrder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdminState, AvailState, OperState};

    #[test]
    fn test_state_timeout_message_names_host_expected_and_observed() {
        let err = HostError::StateTimeout {
            hosts: vec!["compute-0".to_string()],
            expected: StateCriteria::new().availability(AvailState::Available),
            observed: vec![(
                "compute-0".to_string(),
                Some(HostState::new(
                    AdminState::Unlocked,
                    OperState::Disabled,
                    AvailState::Offline,
                )),
            )],
            elapsed: Duration::from_secs(840),
        };
        let msg = err.to_string();
        assert!(msg.contains("compute-0"));
        assert!(msg.contains("availability=available"));
        assert!(msg.contains("unlocked/disabled/offline"));
        assert!(msg.contains("840s"));
    }

    #[test]
    fn test_transport_fatal_classification() {
        let lost = SessionError::Disconnected {
            endpoint: "10.10.10.2:23".into(),
            reason: "eof".into(),
        };
        let timeout = SessionError::ExpectTimeout {
            patterns: vec!["\\$ $".into()],
            timeout: Duration::from_secs(3),
            tail: String::new(),
        };
        assert!(lost.is_transport_fatal());
        assert!(!timeout.is_transport_fatal());
        assert!(timeout.is_timeout());
    }

    #[test]
    fn test_host_error_inherits_session_code() {
        let err = HostError::from(SessionError::NotConnected {
            endpoint: "lab".into(),
        });
        assert_eq!(err.error_code(), ErrorCode::SessionLost);
    }

    #[test]
    fn test_aggregate_failures_flatten() {
        let failure = EntryFailure {
            entry: RecoveryEntry::host("compute-1"),
            error: "boom".into(),
        };
        let inner = RecoveryError::Aggregate {
            scope: Scope::Function,
            attempted: 2,
            failures: vec![failure.clone()],
        };
        let outer = RecoveryError::Multiple(vec![inner]);
        assert_eq!(outer.failures().len(), 1);
        assert!(outer.to_string().contains("1 scope(s)"));
        assert_eq!(outer.error_code(), ErrorCode::RecoveryIncomplete);
    }
}
