//! I/O Relay
//!
//! Bridges each module's channel endpoint to the bus through a dedicated
//! session opened with the module's credentials:
//! - stdin topic -> stdin ring
//! - stdout ring -> stdout topic (announced by `PortMessage::Bind`)
//! - `Publish` on a writable channel path -> the channel's topic
//! - messages on readable channel topics -> `Deliver` to the module
//!
//! When the module end of the port closes, remaining stdout is flushed and
//! a module delete notice goes to the notify topic.
//!
//! The relay only ever sees the assignment and the relay end of the channel,
//! never the node's module table.

use crate::bus::{topic_matches, BusConnector, BusSession, ConnectOptions, MessageBus};
use crate::config::Credentials;
use crate::observability::metrics;
use modfleet_core::{ChannelBinding, ControlMessage, ModuleSpec, PortMessage, RelayEndpoint, RingReader, RingWriter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

const STDOUT_CHUNK: usize = 4096;

/// Stdin messages buffered per module while its stdin ring is full. Further
/// messages are dropped until the module reads.
const STDIN_QUEUE: usize = 32;

/// How long a detached relay may keep flushing before it is aborted.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// What the relay is told about a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAssignment {
    pub uuid: Uuid,
    pub notify_topic: String,
    pub stdin_topic: String,
    pub credentials: Credentials,
}

enum RelayCommand {
    Attach {
        assignment: RelayAssignment,
        endpoint: RelayEndpoint,
    },
    Detach {
        uuid: Uuid,
    },
}

/// Handle to the relay task.
#[derive(Clone)]
pub struct IoRelay {
    commands: mpsc::UnboundedSender<RelayCommand>,
}

impl IoRelay {
    pub fn spawn(connector: Arc<dyn BusConnector>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(connector, rx));
        (Self { commands: tx }, task)
    }

    pub fn attach(&self, assignment: RelayAssignment, endpoint: RelayEndpoint) {
        if self.commands.send(RelayCommand::Attach { assignment, endpoint }).is_err() {
            warn!("I/O relay has stopped, module I/O will not be bridged");
        }
    }

    /// Stop tracking a module's relay. It keeps running until the module
    /// end of its port closes, bounded by a grace period.
    pub fn detach(&self, uuid: Uuid) {
        let _ = self.commands.send(RelayCommand::Detach { uuid });
    }
}

async fn run(connector: Arc<dyn BusConnector>, mut commands: mpsc::UnboundedReceiver<RelayCommand>) {
    let mut relays: HashMap<Uuid, JoinHandle<()>> = HashMap::new();
    let mut generation: u64 = 0;

    while let Some(command) = commands.recv().await {
        match command {
            RelayCommand::Attach { assignment, endpoint } => {
                generation += 1;
                let uuid = assignment.uuid;
                if let Some(previous) = relays.remove(&uuid) {
                    previous.abort();
                }
                debug!(module_id = %uuid, generation, "Attaching relay");
                let task = tokio::spawn(relay_module(connector.clone(), assignment, endpoint, generation));
                relays.insert(uuid, task);
            }
            RelayCommand::Detach { uuid } => {
                if let Some(task) = relays.remove(&uuid) {
                    debug!(module_id = %uuid, "Detaching relay");
                    tokio::spawn(drain(uuid, task));
                }
            }
        }
    }

    for task in relays.values() {
        task.abort();
    }
}

async fn drain(uuid: Uuid, mut task: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
        debug!(module_id = %uuid, "Relay did not drain in time");
        task.abort();
    }
}

async fn relay_module(
    connector: Arc<dyn BusConnector>,
    assignment: RelayAssignment,
    endpoint: RelayEndpoint,
    generation: u64,
) {
    let uuid = assignment.uuid;
    let options = ConnectOptions {
        client_id: format!("{uuid}-io-{generation}"),
        username: assignment.credentials.username.clone(),
        token: assignment.credentials.token.clone(),
        last_will: None,
    };
    let BusSession { client, mut inbox } = match connector.connect(options).await {
        Ok(session) => session,
        Err(e) => {
            warn!(module_id = %uuid, error = %e, "Relay failed to connect");
            return;
        }
    };
    if let Err(e) = client.subscribe(&assignment.stdin_topic) {
        warn!(module_id = %uuid, error = %e, "Relay failed to subscribe to stdin topic");
    }

    let RelayEndpoint { io, mut port } = endpoint;
    let mut pumps = JoinSet::new();
    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
    pumps.spawn(pump_stdin(stdin_rx, io.stdin));
    let mut stdout = Some(io.stdout);
    let mut bindings: Vec<ChannelBinding> = Vec::new();

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Some(message) if message.topic == assignment.stdin_topic => {
                    if let Err(mpsc::error::TrySendError::Full(dropped)) = stdin_tx.try_send(message.payload) {
                        metrics::record_message_dropped("stdin_overflow");
                        debug!(module_id = %uuid, bytes = dropped.len(), "Stdin queue full, dropping input");
                    }
                }
                Some(message) => {
                    for binding in bindings
                        .iter()
                        .filter(|b| b.mode.readable() && topic_matches(&b.params.topic, &message.topic))
                    {
                        port.send(PortMessage::Deliver {
                            path: binding.path.clone(),
                            payload: message.payload.clone(),
                        });
                    }
                }
                None => {
                    debug!(module_id = %uuid, "Relay bus session ended");
                    return;
                }
            },
            message = port.rx.recv() => match message {
                Some(PortMessage::Bind { stdout_topic, channels }) => {
                    if let Some(reader) = stdout.take() {
                        pumps.spawn(pump_stdout(reader, client.clone(), stdout_topic));
                    }
                    for binding in channels {
                        if binding.mode.readable() {
                            if let Err(e) = client.subscribe(&binding.params.topic) {
                                warn!(module_id = %uuid, topic = %binding.params.topic, error = %e, "Relay failed to subscribe to channel");
                            }
                        }
                        bindings.push(binding);
                    }
                }
                Some(PortMessage::Publish { path, payload }) => {
                    match bindings.iter().find(|b| b.path == path && b.mode.writable()) {
                        Some(binding) => {
                            if let Err(e) = client.publish(&binding.params.topic, payload) {
                                warn!(module_id = %uuid, error = %e, "Relay failed to publish channel output");
                            }
                        }
                        None => debug!(module_id = %uuid, path = %path, "No writable channel bound to path"),
                    }
                }
                Some(PortMessage::Deliver { path, .. }) => {
                    debug!(module_id = %uuid, path = %path, "Ignoring deliver sent by module");
                }
                None => break,
            },
        }
    }

    // module gone: let stdout drain, then announce the exit
    drop(stdin_tx);
    while pumps.join_next().await.is_some() {}
    announce_exit(client.as_ref(), &assignment);
}

fn announce_exit(client: &dyn MessageBus, assignment: &RelayAssignment) {
    let notice = ControlMessage::module_delete(ModuleSpec::new(assignment.uuid), None);
    match notice.encode() {
        Ok(payload) => {
            if let Err(e) = client.publish(&assignment.notify_topic, payload) {
                warn!(module_id = %assignment.uuid, error = %e, "Failed to publish module exit notice");
            }
        }
        Err(e) => warn!(module_id = %assignment.uuid, error = %e, "Failed to encode module exit notice"),
    }
}

async fn pump_stdin(mut chunks: mpsc::Receiver<Vec<u8>>, mut ring: RingWriter) {
    while let Some(chunk) = chunks.recv().await {
        if ring.write_all(&chunk).await.is_err() {
            break;
        }
    }
}

async fn pump_stdout(mut ring: RingReader, client: Arc<dyn MessageBus>, topic: String) {
    let mut buf = vec![0u8; STDOUT_CHUNK];
    loop {
        match ring.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = client.publish(&topic, buf[..n].to_vec()) {
                    warn!(topic = %topic, error = %e, "Failed to publish module output");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, LocalBroker};
    use modfleet_core::{duplex, ChannelMode, IoChannel, ModuleEndpoint};
    use std::time::Duration;

    struct Harness {
        relay: IoRelay,
        module: ModuleEndpoint,
        uuid: Uuid,
    }

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.to_string(),
            username: "non_auth".to_string(),
            token: None,
            last_will: None,
        }
    }

    async fn wait_connected(broker: &LocalBroker, sessions: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.session_count() < sessions {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    async fn harness(broker: LocalBroker) -> Harness {
        harness_with_ring(broker, 256).await
    }

    async fn harness_with_ring(broker: LocalBroker, ring_capacity: usize) -> Harness {
        let (relay, _task) = IoRelay::spawn(Arc::new(broker.clone()));
        let uuid = Uuid::new_v4();
        let channel = IoChannel::new(ring_capacity);
        let (module_port, relay_port) = duplex();
        let before = broker.session_count();
        relay.attach(
            RelayAssignment {
                uuid,
                notify_topic: "realm/proc/reg".to_string(),
                stdin_topic: format!("realm/proc/debug/stdin/{uuid}"),
                credentials: Credentials::default(),
            },
            RelayEndpoint {
                io: channel.relay,
                port: relay_port,
            },
        );
        wait_connected(&broker, before + 1).await;
        Harness {
            relay,
            module: ModuleEndpoint {
                io: channel.module,
                port: module_port,
            },
            uuid,
        }
    }

    #[tokio::test]
    async fn test_stdin_topic_feeds_ring() {
        let broker = LocalBroker::new();
        let publisher = broker.connect(options("publisher")).await.unwrap();
        let mut h = harness(broker).await;

        publisher
            .client
            .publish(&format!("realm/proc/debug/stdin/{}", h.uuid), b"input".to_vec())
            .unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), h.module.io.stdin.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"input");
    }

    #[tokio::test]
    async fn test_stdin_flood_is_bounded_while_module_is_idle() {
        let broker = LocalBroker::new();
        let publisher = broker.connect(options("publisher")).await.unwrap();
        let mut h = harness_with_ring(broker, 16).await;
        let topic = format!("realm/proc/debug/stdin/{}", h.uuid);

        for i in 0..100u8 {
            publisher.client.publish(&topic, vec![i; 16]).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(200), h.module.io.stdin.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        // ring + queue + the chunk the pump is holding
        assert!(received.len() <= (STDIN_QUEUE + 2) * 16, "got {} bytes", received.len());
        assert!(received.len() >= 16);
        assert_eq!(&received[..16], &[0u8; 16]);
        assert_eq!(received.len() % 16, 0);
    }

    #[tokio::test]
    async fn test_stdout_and_channels_after_bind() {
        let broker = LocalBroker::new();
        let mut spy = broker.connect(options("spy")).await.unwrap();
        spy.client.subscribe("realm/out/#").unwrap();
        let mut h = harness(broker.clone()).await;

        h.module.port.send(PortMessage::Bind {
            stdout_topic: "realm/out/stdout".to_string(),
            channels: vec![
                ChannelBinding::pubsub("/w", ChannelMode::Write, "realm/out/chan"),
                ChannelBinding::pubsub("/r", ChannelMode::Read, "realm/in/chan"),
            ],
        });
        h.module.io.stdout.write_all(b"line\n").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), spy.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, BusMessage::new("realm/out/stdout", b"line\n".to_vec()));

        h.module.port.send(PortMessage::Publish {
            path: "/w".to_string(),
            payload: b"frame".to_vec(),
        });
        // read-only path is not published
        h.module.port.send(PortMessage::Publish {
            path: "/r".to_string(),
            payload: b"nope".to_vec(),
        });
        let got = spy.inbox.recv().await.unwrap();
        assert_eq!(got, BusMessage::new("realm/out/chan", b"frame".to_vec()));

        spy.client.publish("realm/in/chan", b"cmd".to_vec()).unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), h.module.port.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            delivered,
            PortMessage::Deliver {
                path: "/r".to_string(),
                payload: b"cmd".to_vec()
            }
        );
        assert!(spy.inbox.try_recv().is_err());
        drop(h.relay);
    }

    #[tokio::test]
    async fn test_exit_notice_after_module_closes() {
        let broker = LocalBroker::new();
        let mut spy = broker.connect(options("spy")).await.unwrap();
        spy.client.subscribe("realm/proc/reg").unwrap();
        let h = harness(broker).await;
        let uuid = h.uuid;

        drop(h.module);
        let notice = tokio::time::timeout(Duration::from_secs(2), spy.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        match ControlMessage::decode(&notice.payload).unwrap() {
            ControlMessage::ModuleDelete { module, redirect_to, .. } => {
                assert_eq!(module.uuid, uuid);
                assert!(redirect_to.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
