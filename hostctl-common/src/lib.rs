//! Shared library for hostctl.
//!
//! Three layers, bottom up:
//!
//! - [`session`]: a pattern-matching terminal session over telnet or ssh.
//! - [`controller`]: host lifecycle operations (lock, unlock, reboot, swact)
//!   and state polling on top of a session.
//! - [`recovery`]: a scoped registry of hosts and resources that tests
//!   changed, drained at scope exit to put the lab back.
//!
//! [`mock`] provides an in-process platform for exercising all three
//! without a lab.

pub mod config;
pub mod controller;
pub mod errors;
pub mod logging;
pub mod mock;
pub mod parser;
pub mod recovery;
pub mod session;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{ConfigError, HarnessConfig};
pub use controller::{
    CancelSignal, HostStateController, HostTimeouts, LockOptions, OpCode, OpResult, RebootOptions,
    SwactOptions, UnlockOptions, WaitOptions, WaitOutcome,
};
pub use errors::{Cataloged, ErrorCode, HostError, RecoveryError, SessionError};
pub use logging::{LoggingConfig, init_logging};
pub use recovery::{
    DrainReport, RecoveryEntry, RecoveryRegistry, ResourceKind, ResourceRef, RestoreAction,
    Restorer, Scope, ScopeStack,
};
pub use session::{
    CommandOutput, Credentials, Endpoint, NestedConnector, OutputWait, Session, SessionOptions,
    TransportKind,
};
pub use types::{AdminState, AvailState, HostRecord, HostState, OperState, Personality, StateCriteria};
