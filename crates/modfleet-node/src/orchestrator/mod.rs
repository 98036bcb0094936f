//! Module Orchestrator
//!
//! Owns the node's module table and is driven exclusively by the node
//! control loop, so every mutation happens on one task.
//!
//! Responsibilities:
//! - Drive registration and flush requests queued before it completed
//! - Turn program requests into placement requests
//! - Provision, start and supervise hosted modules
//! - Terminate modules on delete and forward their state when redirected
//! - Withdraw client-instantiated modules on shutdown

pub mod migration;
pub mod provision;
pub mod registry;

use crate::bus::{BusMessage, MessageBus};
use crate::config::{NodeConfig, Topics};
use crate::error::ProvisionError;
use crate::execution::{ExecutionEngine, ExecutionEvent, StartInstruction};
use crate::observability::{events, metrics};
use crate::registrar::{Registrar, RegistrationState, ResponseOutcome};
use crate::relay::{IoRelay, RelayAssignment};
use modfleet_core::{
    duplex, CodecError, ControlMessage, Instantiation, IoChannel, ModuleEndpoint, ModuleSpec, PortMessage,
    ProgramRequest, RelayEndpoint, Signal,
};
use provision::ProvisionContext;
use registry::{ModuleEntry, ModuleRegistry, ModuleState, ModuleSummary, ModuleTopics};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An execution event tagged with the instance that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub instance: u64,
    pub event: ExecutionEvent,
}

/// Point-in-time view of the node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub realm: String,
    pub registration: RegistrationState,
    pub modules: Vec<ModuleSummary>,
    pub pending_requests: usize,
    pub client_modules: usize,
}

pub type RegisteredCallback = Box<dyn FnOnce() + Send>;

pub struct Orchestrator {
    config: NodeConfig,
    topics: Topics,
    bus: Arc<dyn MessageBus>,
    engine: Arc<dyn ExecutionEngine>,
    relay: IoRelay,
    registrar: Registrar,
    registry: ModuleRegistry,
    /// Program requests received before registration, in arrival order
    pending: VecDeque<ProgramRequest>,
    /// Client-instantiated modules created from this node
    client_modules: Vec<ModuleSpec>,
    completions: mpsc::UnboundedSender<Completion>,
    registration: watch::Sender<RegistrationState>,
    on_registered: Option<RegisteredCallback>,
    next_instance: u64,
}

impl Orchestrator {
    pub fn new(
        config: NodeConfig,
        bus: Arc<dyn MessageBus>,
        engine: Arc<dyn ExecutionEngine>,
        relay: IoRelay,
        completions: mpsc::UnboundedSender<Completion>,
        registration: watch::Sender<RegistrationState>,
        on_registered: Option<RegisteredCallback>,
    ) -> Self {
        let topics = config.topics();
        let registrar = Registrar::new(
            config.node_record(),
            topics.registration.clone(),
            topics.control.clone(),
        );
        Self {
            config,
            topics,
            bus,
            engine,
            relay,
            registrar,
            registry: ModuleRegistry::new(),
            pending: VecDeque::new(),
            client_modules: Vec::new(),
            completions,
            registration,
            on_registered,
            next_instance: 0,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registrar.is_registered()
    }

    pub fn begin_registration(&mut self) -> Result<(), CodecError> {
        self.registrar.begin(self.bus.as_ref())?;
        self.registration.send_replace(self.registrar.state());
        Ok(())
    }

    pub fn retry_registration(&mut self) {
        self.registrar.retry(self.bus.as_ref());
    }

    fn publish(&self, topic: &str, message: &ControlMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, message = %message, "Failed to encode control message");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, payload) {
            warn!(error = %e, topic = %topic, message = %message, "Failed to publish control message");
        }
    }

    /// Entry point for everything arriving on the node's bus session.
    pub fn handle_bus_message(&mut self, message: BusMessage) {
        if let Some(module_id) = message.topic.strip_prefix(&self.topics.stdout_prefix()) {
            events::module_output(module_id, String::from_utf8_lossy(&message.payload).trim_end());
            return;
        }
        match ControlMessage::decode(&message.payload) {
            Ok(control) => self.handle_control_message(control),
            Err(e) => {
                metrics::record_message_dropped("malformed");
                events::message_dropped("malformed", &format!("{}: {e}", message.topic));
            }
        }
    }

    pub fn handle_control_message(&mut self, message: ControlMessage) {
        metrics::record_control_message(message.kind());
        match message {
            ControlMessage::Response { object_id, outcome, .. } => {
                match self.registrar.on_response(&object_id, &outcome, self.bus.as_ref()) {
                    ResponseOutcome::Registered => self.on_registered(),
                    ResponseOutcome::Duplicate => debug!(object_id = %object_id, "Duplicate registration response"),
                    ResponseOutcome::Rejected => {}
                    ResponseOutcome::Ignored => debug!(object_id = %object_id, "Ignoring unrelated response"),
                }
            }
            ControlMessage::ModuleCreate {
                module,
                migration_started_at,
                ..
            } => self.handle_module_create(module, migration_started_at),
            ControlMessage::ModuleDelete { module, redirect_to, .. } => {
                self.handle_module_delete(module.uuid, redirect_to)
            }
            ControlMessage::NodeCreate { object_id, .. } | ControlMessage::NodeDelete { object_id, .. } => {
                debug!(object_id = %object_id, "Ignoring node request")
            }
        }
    }

    fn on_registered(&mut self) {
        let queued: Vec<ProgramRequest> = self.pending.drain(..).collect();
        events::node_registered(&self.config.node_id, &self.config.realm, queued.len());
        for request in queued {
            self.create_module(request);
        }
        if let Some(callback) = self.on_registered.take() {
            callback();
        }
        self.registration.send_replace(RegistrationState::Registered);
    }

    /// Turn a program request into a placement request.
    pub fn create_module(&mut self, request: ProgramRequest) {
        if !self.is_registered() {
            debug!(object_id = %request.object_id, queued = self.pending.len() + 1, "Not registered yet, queueing program request");
            self.pending.push_back(request);
            return;
        }

        let ctx = ProvisionContext {
            node_id: &self.config.node_id,
            store_root: &self.config.store_root,
            session: &self.config.session,
        };
        let module = match provision::plan(&request, &ctx) {
            Ok(module) => module,
            Err(e) => {
                events::module_rejected(&request.object_id, &e.to_string());
                return;
            }
        };

        if request.data.instantiate == Instantiation::Client {
            self.client_modules.push(module.clone());
        }
        info!(module_id = %module.uuid, name = %module.name, "Requesting module placement");
        self.publish(&self.topics.placement, &ControlMessage::module_create(module));
    }

    fn admit(&self, module: &ModuleSpec) -> Result<(), ProvisionError> {
        if !self.config.supported_kinds.contains(&module.filetype) {
            return Err(ProvisionError::UnsupportedModuleKind(module.filetype.clone()));
        }
        if self.registry.len() >= self.config.max_modules {
            return Err(ProvisionError::CapacityExceeded {
                max: self.config.max_modules,
            });
        }
        Ok(())
    }

    fn handle_module_create(&mut self, mut module: ModuleSpec, migration_started_at: Option<i64>) {
        let uuid = module.uuid;
        if let Some(started_at) = migration_started_at {
            let elapsed_ms = chrono::Utc::now().timestamp_millis().saturating_sub(started_at).max(0);
            metrics::record_migration_arrival(Duration::from_millis(elapsed_ms as u64));
            debug!(module_id = %uuid, elapsed_ms, "Migrated module arrived");
        }

        match self.registry.get(&uuid).map(|entry| entry.state) {
            None => {
                if let Err(e) = self.admit(&module) {
                    metrics::record_message_dropped(e.reason());
                    events::module_rejected(&uuid.to_string(), &e.to_string());
                    return;
                }
                self.provision(&module);
            }
            Some(ModuleState::Provisioning) if !module.wait_state => {}
            Some(state) => {
                metrics::record_message_dropped("duplicate_create");
                events::message_dropped("duplicate_create", &format!("{uuid} is {state}"));
                return;
            }
        }

        if module.wait_state {
            debug!(module_id = %uuid, "Module waiting for state before start");
            return;
        }
        let memory = module.memory.take();
        self.start(module, memory);
    }

    /// Register the module and attach its relay.
    fn provision(&mut self, module: &ModuleSpec) {
        let uuid = module.uuid;
        let topics = ModuleTopics::new(&self.topics, &uuid);
        let channel = IoChannel::new(self.config.ring_capacity);
        let (module_port, relay_port) = duplex();

        self.relay.attach(
            RelayAssignment {
                uuid,
                notify_topic: topics.notify.clone(),
                stdin_topic: topics.stdin.clone(),
                credentials: self.config.credentials.clone(),
            },
            RelayEndpoint {
                io: channel.relay,
                port: relay_port,
            },
        );

        let mut spec = module.clone();
        spec.memory = None;
        spec.wait_state = false;
        self.registry.insert(ModuleEntry::new(
            spec,
            topics,
            ModuleEndpoint {
                io: channel.module,
                port: module_port,
            },
            channel.signals,
        ));
        events::module_provisioned(&uuid.to_string(), &module.name, module.filetype.as_str());
    }

    fn start(&mut self, module: ModuleSpec, memory: Option<Vec<u8>>) {
        let uuid = module.uuid;
        self.next_instance += 1;
        let instance = self.next_instance;

        let Some(entry) = self.registry.get_mut(&uuid) else {
            return;
        };
        let Some(endpoint) = entry.endpoint.take() else {
            events::message_dropped("duplicate_create", &uuid.to_string());
            return;
        };

        endpoint.port.send(PortMessage::Bind {
            stdout_topic: entry.topics.stdout.clone(),
            channels: module.channels.clone(),
        });

        let resumed = memory.is_some();
        let start = StartInstruction {
            uuid,
            binary_ref: module.filename.clone(),
            stdout_topic: entry.topics.stdout.clone(),
            stdin_topic: entry.topics.stdin.clone(),
            args: module.args.clone(),
            env: module.env.clone(),
            channels: module.channels.clone(),
            wait_state: module.wait_state,
            injected_memory: memory,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = self.engine.spawn(start, endpoint, events_tx);
        tokio::spawn(forward_events(instance, events_rx, self.completions.clone()));

        entry.spec = ModuleSpec {
            memory: None,
            wait_state: false,
            ..module
        };
        entry.context = Some(context);
        entry.instance = Some(instance);
        entry.state = ModuleState::Running;

        if let Err(e) = self.bus.subscribe(&entry.topics.stdout) {
            warn!(module_id = %uuid, error = %e, "Failed to subscribe to module stdout");
        }
        metrics::record_module_started();
        events::module_started(&uuid.to_string(), instance, resumed);
    }

    /// Deliver an out-of-band signal to a hosted module.
    pub fn signal(&mut self, uuid: Uuid, signal: Signal) {
        match self.registry.get(&uuid) {
            Some(entry) => entry.raise(signal),
            None => debug!(module_id = %uuid, ?signal, "Signal for unknown module"),
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.config.node_id.clone(),
            realm: self.config.realm.clone(),
            registration: self.registrar.state(),
            modules: self.registry.summaries(),
            pending_requests: self.pending.len(),
            client_modules: self.client_modules.len(),
        }
    }

    /// Withdraw client modules and release every execution context.
    pub fn shutdown(&mut self) {
        info!(
            node_id = %self.config.node_id,
            client_modules = self.client_modules.len(),
            hosted_modules = self.registry.len(),
            "Shutting down node"
        );
        for module in std::mem::take(&mut self.client_modules) {
            let delete = ControlMessage::module_delete(ModuleSpec::new(module.uuid), None);
            self.publish(&self.topics.placement, &delete);
        }

        let entries: Vec<ModuleEntry> = self.registry.drain().collect();
        for mut entry in entries {
            if let Some(mut context) = entry.context.take() {
                context.stop();
                metrics::record_module_finished();
            }
            self.relay.detach(entry.spec.uuid);
        }
    }
}

async fn forward_events(
    instance: u64,
    mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(event) = events.recv().await {
        if completions.send(Completion { instance, event }).is_err() {
            break;
        }
    }
}
