//! Teardown recovery.
//!
//! Tests register every host they disturb and every resource they create
//! with a [`RecoveryRegistry`] under a [`Scope`]. When the scope closes the
//! registry restores each entry through a [`Restorer`]: locked hosts are
//! unlocked and waited on, leftover resources are deleted. Every entry is
//! attempted even when earlier ones fail; failures are reported together.

mod scope;

pub use scope::{Scope, ScopeStack};

use crate::errors::{EntryFailure, HostError, RecoveryError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Kinds of cloud resources a test can leave behind.
///
/// Declaration order is deletion order: instances go before the volumes
/// attached to them, volumes before their types, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Volume,
    VolumeType,
    QosSpec,
    Flavor,
    Image,
    ServerGroup,
    FloatingIp,
    Router,
    Subnet,
    HeatStack,
}

impl ResourceKind {
    pub const ALL: &'static [ResourceKind] = &[
        Self::Instance,
        Self::Volume,
        Self::VolumeType,
        Self::QosSpec,
        Self::Flavor,
        Self::Image,
        Self::ServerGroup,
        Self::FloatingIp,
        Self::Router,
        Self::Subnet,
        Self::HeatStack,
    ];

    /// Noun used on the `openstack` command line.
    pub fn cli_noun(self) -> &'static str {
        match self {
            Self::Instance => "server",
            Self::Volume => "volume",
            Self::VolumeType => "volume type",
            Self::QosSpec => "volume qos",
            Self::Flavor => "flavor",
            Self::Image => "image",
            Self::ServerGroup => "server group",
            Self::FloatingIp => "floating ip",
            Self::Router => "router",
            Self::Subnet => "subnet",
            Self::HeatStack => "stack",
        }
    }

    pub fn from_cli_noun(noun: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.cli_noun() == noun)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cli_noun())
    }
}

/// A resource by kind and id. Orders by kind (deletion order), then id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn show_command(&self) -> String {
        format!("openstack {} show {}", self.kind.cli_noun(), self.id)
    }

    pub fn delete_command(&self) -> String {
        match self.kind {
            ResourceKind::HeatStack => format!("openstack stack delete --yes {}", self.id),
            kind => format!("openstack {} delete {}", kind.cli_noun(), self.id),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// One cleanup obligation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum RecoveryEntry {
    Host(String),
    Resource(ResourceRef),
}

impl RecoveryEntry {
    pub fn host(name: impl Into<String>) -> Self {
        Self::Host(name.into())
    }

    pub fn resource(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::Resource(ResourceRef::new(kind, id))
    }
}

impl From<ResourceRef> for RecoveryEntry {
    fn from(resource: ResourceRef) -> Self {
        Self::Resource(resource)
    }
}

impl fmt::Display for RecoveryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(name) => write!(f, "host {name}"),
            Self::Resource(r) => write!(f, "{r}"),
        }
    }
}

/// What restoring one entry took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreAction {
    /// Host was locked and has been unlocked back into service.
    Unlocked,
    /// Host was unlocked but mid-transition; waited until in service.
    Settled,
    AlreadyHealthy,
    Deleted,
    AlreadyAbsent,
}

/// Performs the actual restoration. Implemented by
/// [`HostStateController`](crate::controller::HostStateController).
#[async_trait]
pub trait Restorer: Send {
    /// Called once before a non-empty drain, e.g. to re-establish a session.
    async fn prepare(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    async fn restore_host(&mut self, host: &str) -> Result<RestoreAction, HostError>;

    async fn remove_resource(&mut self, resource: &ResourceRef) -> Result<RestoreAction, HostError>;
}

/// Outcome of draining one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub scope: Scope,
    pub outcomes: Vec<(RecoveryEntry, RestoreAction)>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn count(&self, action: RestoreAction) -> usize {
        self.outcomes.iter().filter(|(_, a)| *a == action).count()
    }

    pub fn action_for(&self, entry: &RecoveryEntry) -> Option<RestoreAction> {
        self.outcomes.iter().find(|(e, _)| e == entry).map(|(_, a)| *a)
    }
}

/// Per-scope cleanup lists, shared between test workers.
#[derive(Debug, Default)]
pub struct RecoveryRegistry {
    scopes: [Mutex<Vec<RecoveryEntry>>; 4],
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, scope: Scope) -> MutexGuard<'_, Vec<RecoveryEntry>> {
        self.scopes[scope.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register `entry` for cleanup when `scope` closes. Duplicates are fine.
    pub fn add(&self, entry: impl Into<RecoveryEntry>, scope: Scope) {
        let entry = entry.into();
        debug!(%entry, %scope, "recovery entry added");
        self.list(scope).push(entry);
    }

    pub fn add_host(&self, host: impl Into<String>, scope: Scope) {
        self.add(RecoveryEntry::host(host), scope);
    }

    pub fn add_resource(&self, kind: ResourceKind, id: impl Into<String>, scope: Scope) {
        self.add(RecoveryEntry::resource(kind, id), scope);
    }

    /// Remove one occurrence of `entry`. Returns whether it was present.
    pub fn remove(&self, entry: &RecoveryEntry, scope: Scope) -> bool {
        let mut list = self.list(scope);
        match list.iter().position(|e| e == entry) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Distinct entries for `scope`, in the order a drain processes them.
    pub fn pending(&self, scope: Scope) -> Vec<RecoveryEntry> {
        drain_order(self.list(scope).iter().cloned())
    }

    /// Raw entry count, duplicates included.
    pub fn len(&self, scope: Scope) -> usize {
        self.list(scope).len()
    }

    pub fn is_empty(&self, scope: Scope) -> bool {
        self.list(scope).is_empty()
    }

    /// Restore every distinct entry of `scope` without clearing the list.
    pub async fn drain(&self, scope: Scope, restorer: &mut dyn Restorer) -> Result<DrainReport, RecoveryError> {
        let entries = self.pending(scope);
        restore_all(scope, entries, restorer).await
    }

    /// Clear `scope`'s list.
    pub fn reset(&self, scope: Scope) {
        let dropped = std::mem::take(&mut *self.list(scope));
        if !dropped.is_empty() {
            debug!(%scope, count = dropped.len(), "recovery scope reset");
        }
    }

    /// Drain and reset as one step.
    ///
    /// The list is taken atomically before restoring starts, so entries
    /// added by other workers meanwhile stay queued for the next close
    /// instead of being cleared unprocessed. The scope is empty afterwards
    /// whether or not restoring failed.
    pub async fn close(&self, scope: Scope, restorer: &mut dyn Restorer) -> Result<DrainReport, RecoveryError> {
        let taken = std::mem::take(&mut *self.list(scope));
        restore_all(scope, drain_order(taken), restorer).await
    }
}

/// Deduplicate; resources first in kind order, then hosts by name.
fn drain_order(entries: impl IntoIterator<Item = RecoveryEntry>) -> Vec<RecoveryEntry> {
    let unique: BTreeSet<RecoveryEntry> = entries.into_iter().collect();
    let (hosts, resources): (Vec<_>, Vec<_>) = unique
        .into_iter()
        .partition(|e| matches!(e, RecoveryEntry::Host(_)));
    resources.into_iter().chain(hosts).collect()
}

async fn restore_all(
    scope: Scope,
    entries: Vec<RecoveryEntry>,
    restorer: &mut dyn Restorer,
) -> Result<DrainReport, RecoveryError> {
    let attempted = entries.len();
    let mut report = DrainReport {
        scope,
        outcomes: Vec::with_capacity(attempted),
    };
    if attempted == 0 {
        return Ok(report);
    }
    info!(%scope, entries = attempted, "recovering scope");

    if let Err(e) = restorer.prepare().await {
        warn!(%scope, error = %e, "restorer unavailable; no entry can be recovered");
        let error = e.to_string();
        let failures = entries
            .into_iter()
            .map(|entry| EntryFailure {
                entry,
                error: error.clone(),
            })
            .collect();
        return Err(RecoveryError::Aggregate {
            scope,
            attempted,
            failures,
        });
    }

    let mut failures = Vec::new();
    for entry in entries {
        let result = match &entry {
            RecoveryEntry::Host(host) => restorer.restore_host(host).await,
            RecoveryEntry::Resource(resource) => restorer.remove_resource(resource).await,
        };
        match result {
            Ok(action) => {
                debug!(%entry, ?action, "recovered");
                report.outcomes.push((entry, action));
            }
            Err(e) => {
                warn!(%entry, error = %e, "recovery failed; continuing with remaining entries");
                failures.push(EntryFailure {
                    entry,
                    error: e.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        info!(%scope, entries = attempted, "scope recovered");
        Ok(report)
    } else {
        Err(RecoveryError::Aggregate {
            scope,
            attempted,
            failures,
        })
    }
}
