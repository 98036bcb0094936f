//! Termination and Migration
//!
//! A module delete raises quit on the module and records where, if anywhere,
//! it should continue. The module table entry is only torn down when the
//! execution context reports completion; at that point the captured snapshot
//! is forwarded as a create request to the destination node, or handled in
//! place when the destination is this node.

use super::registry::ModuleState;
use super::{Completion, Orchestrator};
use crate::config::Topics;
use crate::execution::ExecutionEventKind;
use crate::observability::{events, metrics};
use modfleet_core::{ControlMessage, ParentRef, Signal};
use std::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

impl Orchestrator {
    pub(super) fn handle_module_delete(&mut self, uuid: Uuid, redirect_to: Option<String>) {
        let Some(entry) = self.registry.get_mut(&uuid) else {
            metrics::record_message_dropped("unknown_module");
            events::message_dropped("unknown_module", &uuid.to_string());
            return;
        };

        let state = entry.state;
        match state {
            ModuleState::Provisioning => {
                // never started, nothing to hand over
                if redirect_to.is_some() {
                    warn!(module_id = %uuid, "Module deleted before it started, redirect ignored");
                }
                self.registry.remove(&uuid);
                self.relay.detach(uuid);
                debug!(module_id = %uuid, "Removed module awaiting state");
            }
            ModuleState::Terminating => {
                metrics::record_message_dropped("duplicate_delete");
                events::message_dropped("duplicate_delete", &uuid.to_string());
            }
            ModuleState::Running => {
                entry.redirect_to = redirect_to;
                entry.termination_started_at = Some(Instant::now());
                entry.state = ModuleState::Terminating;
                entry.raise(Signal::Quit);
                events::termination_requested(&uuid.to_string(), entry.redirect_to.as_deref());
            }
        }
    }

    /// Handle an event from an execution context.
    pub fn on_completion(&mut self, completion: Completion) {
        let Completion { instance, event } = completion;
        let (memory, exit_code) = match event.kind {
            ExecutionEventKind::Finished { memory, exit_code } => (memory, exit_code),
            ExecutionEventKind::Started => {
                trace!(module_id = %event.uuid, instance, "Execution context started");
                return;
            }
        };

        let uuid = event.uuid;
        let Some(mut entry) = self.registry.remove_instance(&uuid, instance) else {
            metrics::record_message_dropped("unknown_completion");
            events::message_dropped("unknown_completion", &format!("{uuid} instance {instance}"));
            return;
        };

        if let Err(e) = self.bus.unsubscribe(&entry.topics.stdout) {
            warn!(module_id = %uuid, error = %e, "Failed to unsubscribe from module stdout");
        }
        if let Some(mut context) = entry.context.take() {
            context.stop();
        }
        self.relay.detach(uuid);
        metrics::record_module_finished();
        events::module_finished(&uuid.to_string(), instance, exit_code);

        let Some(destination) = entry.redirect_to.take() else {
            return;
        };

        let snapshot_bytes = memory.as_ref().map_or(0, Vec::len);
        let mut module = entry.spec;
        module.memory = memory;
        module.wait_state = false;
        if module.parent.is_some() {
            module.parent = Some(ParentRef {
                uuid: destination.clone(),
            });
        }
        let resume = ControlMessage::module_migration(module, chrono::Utc::now().timestamp_millis());

        if let Some(started) = entry.termination_started_at {
            metrics::record_migration(started.elapsed());
        }
        let local = destination == self.config.node_id;
        events::migration_dispatched(&uuid.to_string(), &destination, snapshot_bytes, local);

        if local {
            self.handle_control_message(resume);
        } else {
            let topic = Topics::node_control(&self.config.realm, &destination);
            self.publish(&topic, &resume);
        }
    }
}
