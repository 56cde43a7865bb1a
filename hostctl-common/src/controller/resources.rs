//! Cloud resource show/delete through the `openstack` CLI.

use super::{HostStateController, OpCode, OpResult};
use crate::errors::HostError;
use crate::recovery::ResourceRef;
use tokio::time::Instant;
use tracing::{info, warn};

/// Output fragments the `openstack` client prints for missing resources.
const NOT_FOUND_MARKERS: &[&str] = &["not found", "no such", "could not be found"];

pub(crate) fn is_not_found(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // "No volume with a name or ID of 'x' exists."
    lower.contains("no ") && lower.contains(" exists")
}

impl HostStateController {
    /// Whether `resource` still exists. Output that is neither a success
    /// nor a recognisable not-found is an error.
    pub async fn resource_exists(&mut self, resource: &ResourceRef) -> Result<bool, HostError> {
        let command = resource.show_command();
        let out = self.run(&command).await?;
        if out.success() {
            return Ok(true);
        }
        if is_not_found(&out.output) {
            return Ok(false);
        }
        Err(HostError::CommandRejected {
            command,
            code: out.code,
            output: out.output.trim().to_string(),
        })
    }

    /// Delete `resource`. A resource that is already gone is `AlreadyInState`.
    pub async fn delete_resource(&mut self, resource: &ResourceRef) -> Result<OpResult, HostError> {
        let start = Instant::now();
        let command = resource.delete_command();
        info!(resource = %resource, "deleting resource");
        let out = self.run(&command).await?;

        if out.success() {
            return Ok(OpResult::new(
                OpCode::Success,
                None,
                format!("{resource} deleted"),
                start.elapsed(),
            ));
        }
        if is_not_found(&out.output) {
            return Ok(OpResult::new(
                OpCode::AlreadyInState,
                None,
                format!("{resource} already absent"),
                start.elapsed(),
            ));
        }

        let output = out.output.trim().to_string();
        warn!(resource = %resource, code = out.code, output = %output, "resource delete rejected");
        let cause = HostError::CommandRejected {
            command,
            code: out.code,
            output,
        };
        Ok(OpResult::failure(OpCode::Rejected, None, cause, start.elapsed()))
    }
}
