//! Common types used across hostctl components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a state word from the platform CLI is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {field} value '{value}'")]
pub struct UnknownStateValue {
    pub field: &'static str,
    pub value: String,
}

macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every value, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStateValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownStateValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

state_enum! {
    /// Whether a host is intentionally withdrawn from service.
    AdminState, "administrative" {
        Locked => "locked",
        Unlocked => "unlocked",
    }
}

state_enum! {
    /// Whether platform software on the host is functioning.
    OperState, "operational" {
        Enabled => "enabled",
        Disabled => "disabled",
    }
}

state_enum! {
    /// Fine-grained host health as reported by maintenance.
    AvailState, "availability" {
        Available => "available",
        Degraded => "degraded",
        Offline => "offline",
        Failed => "failed",
        Online => "online",
        /// Host is running its post-boot self tests.
        InTest => "intest",
    }
}

state_enum! {
    /// Role a host plays in the cluster.
    Personality, "personality" {
        Controller => "controller",
        Compute => "compute",
        Storage => "storage",
    }
}

impl AvailState {
    /// States a rebooting host passes through once it has actually gone down.
    pub const DOWN: &'static [AvailState] = &[AvailState::Offline, AvailState::Failed];

    /// States an unlocked host may rest in after a successful unlock.
    pub const IN_SERVICE: &'static [AvailState] = &[AvailState::Available, AvailState::Degraded];
}

/// Composite host state: (administrative, operational, availability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostState {
    pub administrative: AdminState,
    pub operational: OperState,
    pub availability: AvailState,
}

impl HostState {
    pub fn new(administrative: AdminState, operational: OperState, availability: AvailState) -> Self {
        Self {
            administrative,
            operational,
            availability,
        }
    }

    /// Whether this tuple is a state a host can settle in.
    ///
    /// Anything else is only ever observed mid-transition (for example
    /// unlocked+disabled+available, or locked+enabled).
    pub fn is_resting(&self) -> bool {
        use AdminState::*;
        use AvailState::*;
        use OperState::*;

        match (self.administrative, self.operational, self.availability) {
            (Unlocked, Enabled, Available | Degraded) => true,
            (Unlocked, Disabled, Offline | Failed | InTest) => true,
            (Locked, Disabled, Online | Offline | Failed) => true,
            _ => false,
        }
    }

    /// Unlocked, enabled and available or degraded.
    pub fn is_in_service(&self) -> bool {
        self.administrative == AdminState::Unlocked
            && self.operational == OperState::Enabled
            && AvailState::IN_SERVICE.contains(&self.availability)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.administrative, self.operational, self.availability
        )
    }
}

/// One row of `system host-list`, typed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: String,
    pub personality: Personality,
    pub state: HostState,
    /// Free-form maintenance task (e.g. "Locking", "Rebooting"); empty when idle.
    #[serde(default)]
    pub task: String,
}

impl HostRecord {
    pub fn is_controller(&self) -> bool {
        self.personality == Personality::Controller
    }
}

/// Set of values accepted for one state field.
///
/// Built from a single value or a list, so callers can write either
/// `AdminState::Locked` or `[AvailState::Available, AvailState::Degraded]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted<T>(Vec<T>);

impl<T: PartialEq + Copy> Accepted<T> {
    pub fn contains(&self, value: T) -> bool {
        self.0.contains(&value)
    }

    pub fn values(&self) -> &[T] {
        &self.0
    }
}

impl<T> From<T> for Accepted<T> {
    fn from(value: T) -> Self {
        Self(vec![value])
    }
}

impl<T: Copy, const N: usize> From<[T; N]> for Accepted<T> {
    fn from(values: [T; N]) -> Self {
        Self(values.to_vec())
    }
}

impl<T: Copy> From<&[T]> for Accepted<T> {
    fn from(values: &[T]) -> Self {
        Self(values.to_vec())
    }
}

impl<T> From<Vec<T>> for Accepted<T> {
    fn from(values: Vec<T>) -> Self {
        Self(values)
    }
}

impl<T: fmt::Display> fmt::Display for Accepted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        f.write_str("[")?;
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("|")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str("]")
    }
}

/// Target condition for [`wait_for_states`](crate::controller::HostStateController::wait_for_states).
///
/// Fields left unset are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCriteria {
    pub administrative: Option<Accepted<AdminState>>,
    pub operational: Option<Accepted<OperState>>,
    pub availability: Option<Accepted<AvailState>>,
}

impl StateCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn administrative(mut self, accepted: impl Into<Accepted<AdminState>>) -> Self {
        self.administrative = Some(accepted.into());
        self
    }

    pub fn operational(mut self, accepted: impl Into<Accepted<OperState>>) -> Self {
        self.operational = Some(accepted.into());
        self
    }

    pub fn availability(mut self, accepted: impl Into<Accepted<AvailState>>) -> Self {
        self.availability = Some(accepted.into());
        self
    }

    /// Unlocked, enabled, and available or degraded.
    pub fn in_service() -> Self {
        Self::new()
            .administrative(AdminState::Unlocked)
            .operational(OperState::Enabled)
            .availability(AvailState::IN_SERVICE)
    }

    pub fn is_empty(&self) -> bool {
        self.administrative.is_none() && self.operational.is_none() && self.availability.is_none()
    }

    pub fn matches(&self, state: &HostState) -> bool {
        self.administrative
            .as_ref()
            .is_none_or(|a| a.contains(state.administrative))
            && self
                .operational
                .as_ref()
                .is_none_or(|o| o.contains(state.operational))
            && self
                .availability
                .as_ref()
                .is_none_or(|a| a.contains(state.availability))
    }
}

impl fmt::Display for StateCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(a) = &self.administrative {
            parts.push(format!("administrative={a}"));
        }
        if let Some(o) = &self.operational {
            parts.push(format!("operational={o}"));
        }
        if let Some(a) = &self.availability {
            parts.push(format!("availability={a}"));
        }
        if parts.is_empty() {
            f.write_str("<any>")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}
