//! Result convention for lifecycle operations.

use crate::errors::HostError;
use crate::types::{HostState, StateCriteria};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Outcome code of a lifecycle operation. Negative-path tests assert on
/// these, so the numeric values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum OpCode {
    /// Command issued; the caller asked not to wait.
    Dispatched = -2,
    AlreadyInState = -1,
    Success = 0,
    /// The platform CLI refused the request.
    Rejected = 1,
    StateTimeout = 2,
    /// The CLI accepted the request but the end state never materialised.
    PostCheckFailed = 3,
    Cancelled = 4,
}

impl OpCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Success, already-in-state, or dispatched.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::AlreadyInState | Self::Dispatched)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::AlreadyInState => "already_in_state",
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::StateTimeout => "state_timeout",
            Self::PostCheckFailed => "post_check_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// `(code, message)` result of a lifecycle operation, plus context.
#[derive(Debug)]
pub struct OpResult {
    pub code: OpCode,
    pub message: String,
    pub host: Option<String>,
    pub elapsed: Duration,
    cause: Option<HostError>,
}

impl OpResult {
    pub fn new(code: OpCode, host: Option<&str>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            code,
            message: message.into(),
            host: host.map(str::to_string),
            elapsed,
            cause: None,
        }
    }

    /// Failure result carrying the error `into_result` will return.
    pub fn failure(code: OpCode, host: Option<&str>, cause: HostError, elapsed: Duration) -> Self {
        Self {
            code,
            message: cause.to_string(),
            host: host.map(str::to_string),
            elapsed,
            cause: Some(cause),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_ok()
    }

    /// The error behind a failed result, if any.
    pub fn cause(&self) -> Option<&HostError> {
        self.cause.as_ref()
    }

    /// Convert failure codes into a [`HostError`] for `?` callers.
    pub fn into_result(self) -> Result<Self, HostError> {
        if self.code.is_ok() {
            return Ok(self);
        }
        if let Some(cause) = self.cause {
            return Err(cause);
        }
        let host = self.host.unwrap_or_default();
        Err(match self.code {
            OpCode::Rejected => HostError::CommandRejected {
                command: String::new(),
                code: OpCode::Rejected.code(),
                output: self.message,
            },
            OpCode::StateTimeout => HostError::StateTimeout {
                hosts: vec![host],
                expected: StateCriteria::default(),
                observed: Vec::new(),
                elapsed: self.elapsed,
            },
            OpCode::Cancelled => HostError::Cancelled,
            _ => HostError::PostCheckFailed {
                host,
                detail: self.message,
                elapsed: self.elapsed,
            },
        })
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "[{}] {host}: {} ({:.1?})", self.code, self.message, self.elapsed),
            None => write!(f, "[{}] {} ({:.1?})", self.code, self.message, self.elapsed),
        }
    }
}

/// Result of [`wait_for_states`](super::HostStateController::wait_for_states).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub satisfied: bool,
    /// Last observed state per host; `None` if never observed.
    pub states: BTreeMap<String, Option<HostState>>,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(OpCode::Dispatched.code(), -2);
        assert_eq!(OpCode::AlreadyInState.code(), -1);
        assert_eq!(OpCode::Success.code(), 0);
        assert_eq!(OpCode::Rejected.code(), 1);
        assert_eq!(OpCode::StateTimeout.code(), 2);
        assert_eq!(OpCode::PostCheckFailed.code(), 3);
        assert_eq!(OpCode::Cancelled.code(), 4);
    }

    #[test]
    fn test_into_result_passes_ok_codes() {
        let r = OpResult::new(OpCode::AlreadyInState, Some("compute-0"), "already locked", Duration::ZERO);
        assert!(r.into_result().is_ok());
    }

    #[test]
    fn test_into_result_returns_cause() {
        let r = OpResult::failure(
            OpCode::PostCheckFailed,
            Some("controller-0"),
            HostError::PostCheckFailed {
                host: "controller-0".into(),
                detail: "no new active".into(),
                elapsed: Duration::from_secs(600),
            },
            Duration::from_secs(600),
        );
        assert!(r.message.contains("no new active"));
        assert!(matches!(r.into_result(), Err(HostError::PostCheckFailed { .. })));
    }

    #[test]
    fn test_into_result_synthesises_rejection() {
        let r = OpResult::new(OpCode::Rejected, Some("controller-0"), "Cannot lock", Duration::ZERO);
        match r.into_result() {
            Err(HostError::CommandRejected { output, code, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(output, "Cannot lock");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_display_includes_host_and_code() {
        let r = OpResult::new(OpCode::Success, Some("compute-1"), "unlocked", Duration::from_secs(3));
        let text = r.to_string();
        assert!(text.contains("success (0)"));
        assert!(text.contains("compute-1"));
    }
}
