//! Standalone Scheduler
//!
//! Minimal in-process stand-in for the realm's placement service, used when
//! a node runs on its own:
//! - acknowledges node registrations with `ok`
//! - routes placement requests to the module's parent node, or to the
//!   first registered node
//! - routes deletes to the node hosting the module
//! - forgets modules whose exit notice arrives and nodes whose delete arrives

use crate::bus::{BusConnector, BusError, BusMessage, BusSession, ConnectOptions, MessageBus};
use crate::config::Topics;
use modfleet_core::{Action, ControlMessage, ObjectType, Outcome, ResultCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CLIENT_ID: &str = "modfleet-devsched";

pub struct DevScheduler {
    client: Arc<dyn MessageBus>,
    registration_topic: String,
    placement_topic: String,
    realm: String,
    nodes: Vec<String>,
    placements: HashMap<Uuid, String>,
}

impl DevScheduler {
    /// Connect and start serving registration and placement topics.
    pub async fn spawn(connector: &dyn BusConnector, realm: &str) -> Result<JoinHandle<()>, BusError> {
        let BusSession { client, inbox } = connector
            .connect(ConnectOptions {
                client_id: CLIENT_ID.to_string(),
                username: "non_auth".to_string(),
                token: None,
                last_will: None,
            })
            .await?;

        let topics = Topics::new(realm, CLIENT_ID);
        client.subscribe(&topics.registration)?;
        client.subscribe(&topics.placement)?;
        info!(realm = %realm, "Standalone scheduler started");

        let scheduler = Self {
            client,
            registration_topic: topics.registration,
            placement_topic: topics.placement,
            realm: realm.to_string(),
            nodes: Vec::new(),
            placements: HashMap::new(),
        };
        Ok(tokio::spawn(scheduler.run(inbox)))
    }

    async fn run(mut self, mut inbox: tokio::sync::mpsc::UnboundedReceiver<BusMessage>) {
        while let Some(message) = inbox.recv().await {
            match ControlMessage::decode(&message.payload) {
                Ok(control) => self.handle(&message, control),
                Err(e) => debug!(topic = %message.topic, error = %e, "Scheduler ignoring undecodable message"),
            }
        }
        debug!("Standalone scheduler stopped");
    }

    fn handle(&mut self, message: &BusMessage, control: ControlMessage) {
        let on_registration = message.topic == self.registration_topic;
        match control {
            ControlMessage::NodeCreate { object_id, node } if on_registration => {
                if !self.nodes.contains(&node.uuid) {
                    info!(node_id = %node.uuid, name = %node.name, "Scheduler registered node");
                    self.nodes.push(node.uuid);
                }
                let response = ControlMessage::response(
                    object_id,
                    Action::Create,
                    Outcome {
                        object_type: ObjectType::Node,
                        result: ResultCode::Ok,
                        details: None,
                    },
                );
                self.send(&self.registration_topic, &response);
            }
            ControlMessage::NodeDelete { node, .. } if on_registration => {
                self.nodes.retain(|n| n != &node.uuid);
                self.placements.retain(|_, host| host != &node.uuid);
                info!(node_id = %node.uuid, "Scheduler dropped node");
            }
            ControlMessage::ModuleDelete { module, .. } if on_registration => {
                self.placements.remove(&module.uuid);
            }
            ControlMessage::ModuleCreate { ref module, .. } if message.topic == self.placement_topic => {
                let target = module
                    .parent
                    .as_ref()
                    .map(|p| p.uuid.clone())
                    .or_else(|| self.nodes.first().cloned());
                match target {
                    Some(node_id) => {
                        self.placements.insert(module.uuid, node_id.clone());
                        self.forward(&node_id, message);
                    }
                    None => warn!(module_id = %module.uuid, "No node available for placement"),
                }
            }
            ControlMessage::ModuleDelete { ref module, .. } if message.topic == self.placement_topic => {
                match self.placements.remove(&module.uuid) {
                    Some(node_id) => self.forward(&node_id, message),
                    None => debug!(module_id = %module.uuid, "Delete for unplaced module"),
                }
            }
            _ => {}
        }
    }

    fn forward(&self, node_id: &str, message: &BusMessage) {
        let topic = Topics::node_control(&self.realm, node_id);
        if let Err(e) = self.client.publish(&topic, message.payload.clone()) {
            warn!(topic = %topic, error = %e, "Scheduler failed to forward request");
        }
    }

    fn send(&self, topic: &str, message: &ControlMessage) {
        match message.encode() {
            Ok(payload) => {
                if let Err(e) = self.client.publish(topic, payload) {
                    warn!(topic = %topic, error = %e, "Scheduler failed to publish");
                }
            }
            Err(e) => warn!(error = %e, "Scheduler failed to encode response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBroker;
    use modfleet_core::{ModuleSpec, NodeRecord, ParentRef};
    use std::time::Duration;

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.to_string(),
            username: "non_auth".to_string(),
            token: None,
            last_will: None,
        }
    }

    fn record(id: &str) -> NodeRecord {
        NodeRecord {
            uuid: id.to_string(),
            name: id.to_string(),
            realm: "realm".to_string(),
            apis: vec![],
            max_nmodules: 1,
        }
    }

    async fn next(session: &mut BusSession) -> BusMessage {
        tokio::time::timeout(Duration::from_secs(2), session.inbox.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_acknowledges_registration() {
        let broker = LocalBroker::new();
        let _task = DevScheduler::spawn(&broker, "realm").await.unwrap();
        let mut node = broker.connect(options("node-a")).await.unwrap();
        node.client.subscribe("realm/proc/reg").unwrap();

        let request = ControlMessage::node_create(record("node-a"));
        node.client.publish("realm/proc/reg", request.encode().unwrap()).unwrap();

        // first our own request, then the response
        let _echo = next(&mut node).await;
        let reply = ControlMessage::decode(&next(&mut node).await.payload).unwrap();
        match reply {
            ControlMessage::Response { object_id, outcome, .. } => {
                assert_eq!(object_id, request.object_id());
                assert!(outcome.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_routes_placement_to_parent_then_default() {
        let broker = LocalBroker::new();
        let _task = DevScheduler::spawn(&broker, "realm").await.unwrap();
        let mut a = broker.connect(options("node-a")).await.unwrap();
        a.client.subscribe("realm/proc/control/node-a/#").unwrap();
        let mut b = broker.connect(options("node-b")).await.unwrap();
        b.client.subscribe("realm/proc/control/node-b/#").unwrap();

        let reg = ControlMessage::node_create(record("node-a"));
        a.client.publish("realm/proc/reg", reg.encode().unwrap()).unwrap();

        let mut pinned = ModuleSpec::new(Uuid::new_v4());
        pinned.parent = Some(ParentRef {
            uuid: "node-b".to_string(),
        });
        let create = ControlMessage::module_create(pinned.clone());
        a.client.publish("realm/proc/control", create.encode().unwrap()).unwrap();
        let got = ControlMessage::decode(&next(&mut b).await.payload).unwrap();
        assert_eq!(got, create);

        let free = ControlMessage::module_create(ModuleSpec::new(Uuid::new_v4()));
        b.client.publish("realm/proc/control", free.encode().unwrap()).unwrap();
        let got = ControlMessage::decode(&next(&mut a).await.payload).unwrap();
        assert_eq!(got, free);

        let delete = ControlMessage::module_delete(ModuleSpec::new(pinned.uuid), None);
        a.client.publish("realm/proc/control", delete.encode().unwrap()).unwrap();
        let got = ControlMessage::decode(&next(&mut b).await.payload).unwrap();
        assert_eq!(got, delete);
    }
}
