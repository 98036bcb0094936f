//! Structured Events
//!
//! One function per event so field names stay consistent across the node.
//!
//! Event types:
//! - `registration_requested` - Registration request published
//! - `node_registered` - Registration accepted
//! - `registration_rejected` - Registration answered with an error
//! - `module_provisioned` - Module entry created and relay attached
//! - `module_rejected` - Create request or program refused
//! - `module_started` - Execution context spawned
//! - `module_finished` - Execution context completed
//! - `termination_requested` - Quit raised on a running module
//! - `migration_dispatched` - Resume request sent to the destination node
//! - `message_dropped` - Inbound message ignored
//! - `module_output` - Line of module stdout seen on the debug topic

use tracing::{debug, info, warn};

pub fn registration_requested(node_id: &str, transaction_id: &str, attempt: u32) {
    info!(
        event_type = "registration_requested",
        node_id = %node_id,
        transaction_id = %transaction_id,
        attempt = attempt,
        "Registration requested"
    );
}

pub fn node_registered(node_id: &str, realm: &str, flushed: usize) {
    info!(
        event_type = "node_registered",
        node_id = %node_id,
        realm = %realm,
        flushed_requests = flushed,
        "Node registered"
    );
}

pub fn registration_rejected(node_id: &str, details: &str) {
    warn!(
        event_type = "registration_rejected",
        node_id = %node_id,
        details = %details,
        "Registration rejected, will retry"
    );
}

pub fn module_provisioned(module_id: &str, name: &str, filetype: &str) {
    info!(
        event_type = "module_provisioned",
        module_id = %module_id,
        name = %name,
        filetype = %filetype,
        "Module provisioned"
    );
}

pub fn module_rejected(module_id: &str, reason: &str) {
    warn!(
        event_type = "module_rejected",
        module_id = %module_id,
        reason = %reason,
        "Module rejected"
    );
}

pub fn module_started(module_id: &str, instance: u64, resumed: bool) {
    info!(
        event_type = "module_started",
        module_id = %module_id,
        instance = instance,
        resumed = resumed,
        "Module started"
    );
}

pub fn module_finished(module_id: &str, instance: u64, exit_code: Option<i32>) {
    info!(
        event_type = "module_finished",
        module_id = %module_id,
        instance = instance,
        exit_code = ?exit_code,
        "Module finished"
    );
}

pub fn termination_requested(module_id: &str, redirect_to: Option<&str>) {
    info!(
        event_type = "termination_requested",
        module_id = %module_id,
        redirect_to = ?redirect_to,
        "Module termination requested"
    );
}

pub fn migration_dispatched(module_id: &str, destination: &str, snapshot_bytes: usize, local: bool) {
    info!(
        event_type = "migration_dispatched",
        module_id = %module_id,
        destination = %destination,
        snapshot_bytes = snapshot_bytes,
        local = local,
        "Migration dispatched"
    );
}

pub fn message_dropped(reason: &str, detail: &str) {
    warn!(
        event_type = "message_dropped",
        reason = %reason,
        detail = %detail,
        "Message dropped"
    );
}

pub fn module_output(module_id: &str, output: &str) {
    debug!(
        event_type = "module_output",
        module_id = %module_id,
        output = %output,
        "Module output"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        registration_requested("node-1", "tx-1", 1);
        node_registered("node-1", "realm", 2);
        registration_rejected("node-1", "realm full");
        module_provisioned("mod-1", "ns/app", "WA");
        module_rejected("mod-1", "capacity_exceeded");
        module_started("mod-1", 1, false);
        module_finished("mod-1", 1, Some(0));
        termination_requested("mod-1", Some("node-2"));
        migration_dispatched("mod-1", "node-2", 128, false);
        message_dropped("unknown_module", "mod-9");
        module_output("mod-1", "hello");
    }
}
