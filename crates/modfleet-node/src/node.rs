//! Node Lifecycle
//!
//! `Node::start` connects to the bus, begins registration and spawns the
//! control loop. The loop is the only owner of the orchestrator; callers
//! interact through a cloneable `NodeHandle`.
//!
//! Loop inputs:
//! - handle commands (program requests, signals, snapshots, shutdown)
//! - the node's bus inbox
//! - execution completions, tagged per instance
//! - the registration retry timer, armed until registered

use crate::bus::{BusConnector, BusMessage, BusSession, ConnectOptions};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::execution::ExecutionEngine;
use crate::orchestrator::{Completion, NodeSnapshot, Orchestrator, RegisteredCallback};
use crate::registrar::RegistrationState;
use crate::relay::IoRelay;
use modfleet_core::{ControlMessage, ProgramRequest, Signal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;
use uuid::Uuid;

enum NodeCommand {
    Provision(ProgramRequest),
    Signal { uuid: Uuid, signal: Signal },
    Snapshot(oneshot::Sender<NodeSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: String,
    commands: mpsc::UnboundedSender<NodeCommand>,
    registration: watch::Receiver<RegistrationState>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Submit a program request. Requests made before registration are
    /// queued and published in order once it completes.
    pub fn create_module(&self, request: ProgramRequest) -> Result<(), NodeError> {
        self.send(NodeCommand::Provision(request))
    }

    pub fn signal(&self, uuid: Uuid, signal: Signal) -> Result<(), NodeError> {
        self.send(NodeCommand::Signal { uuid, signal })
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Snapshot(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub fn registration(&self) -> watch::Receiver<RegistrationState> {
        self.registration.clone()
    }

    pub fn is_registered(&self) -> bool {
        *self.registration.borrow() == RegistrationState::Registered
    }

    pub async fn wait_registered(&self) -> Result<(), NodeError> {
        let mut rx = self.registration.clone();
        rx.wait_for(|state| *state == RegistrationState::Registered)
            .await
            .map(|_| ())
            .map_err(|_| NodeError::Stopped)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Withdraw client modules, stop hosted modules and end the control loop.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(NodeCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: NodeCommand) -> Result<(), NodeError> {
        self.commands.send(command).map_err(|_| NodeError::Stopped)
    }
}

pub struct NodeBuilder {
    config: NodeConfig,
    on_registered: Option<RegisteredCallback>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            on_registered: None,
        }
    }

    /// Run `callback` once, right after the first successful registration.
    pub fn on_registered(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_registered = Some(Box::new(callback));
        self
    }

    pub async fn start(
        self,
        connector: Arc<dyn BusConnector>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Result<NodeHandle, NodeError> {
        let config = self.config;
        let topics = config.topics();
        let will = ControlMessage::node_delete(config.node_record()).encode()?;

        let options = ConnectOptions {
            client_id: config.node_id.clone(),
            username: config.credentials.username.clone(),
            token: config.credentials.token.clone(),
            last_will: Some(BusMessage::new(topics.registration.clone(), will)),
        };
        let BusSession { client, inbox } = connector.connect(options).await?;
        client.subscribe(&topics.registration)?;

        let (relay, _relay_task) = IoRelay::spawn(connector);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RegistrationState::Unregistered);

        let node_id = config.node_id.clone();
        let retry_every = config.reg_timeout;
        info!(node_id = %node_id, realm = %config.realm, "Starting node");

        let mut orchestrator = Orchestrator::new(
            config,
            client,
            engine,
            relay,
            completion_tx,
            state_tx,
            self.on_registered,
        );
        orchestrator.begin_registration()?;

        tokio::spawn(run(orchestrator, command_rx, inbox, completion_rx, retry_every));

        Ok(NodeHandle {
            node_id,
            commands: command_tx,
            registration: state_rx,
        })
    }
}

pub struct Node;

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub async fn start(
        config: NodeConfig,
        connector: Arc<dyn BusConnector>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Result<NodeHandle, NodeError> {
        NodeBuilder::new(config).start(connector, engine).await
    }
}

async fn run(
    mut orchestrator: Orchestrator,
    mut commands: mpsc::UnboundedReceiver<NodeCommand>,
    mut inbox: mpsc::UnboundedReceiver<BusMessage>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    retry_every: Duration,
) {
    let mut retry = tokio::time::interval_at(Instant::now() + retry_every, retry_every);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(NodeCommand::Provision(request)) => orchestrator.create_module(request),
                Some(NodeCommand::Signal { uuid, signal }) => orchestrator.signal(uuid, signal),
                Some(NodeCommand::Snapshot(reply)) => {
                    let _ = reply.send(orchestrator.snapshot());
                }
                Some(NodeCommand::Shutdown(done)) => {
                    orchestrator.shutdown();
                    let _ = done.send(());
                    break;
                }
                None => {
                    orchestrator.shutdown();
                    break;
                }
            },
            Some(message) = inbox.recv() => orchestrator.handle_bus_message(message),
            Some(completion) = completions.recv() => orchestrator.on_completion(completion),
            _ = retry.tick(), if !orchestrator.is_registered() => orchestrator.retry_registration(),
        }
    }
    info!("Node control loop stopped");
}
