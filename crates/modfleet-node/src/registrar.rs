//! Node Registration
//!
//! Announces the node to the realm and waits for the matching response.
//!
//! State machine: Unregistered -> Registering -> Registered
//!
//! - `begin` publishes a node create request and remembers its transaction id
//! - `retry` republishes the identical payload while no ok has arrived
//! - `on_response` ignores responses for other transactions; the first ok
//!   switches subscriptions from the registration topic to the node's
//!   control topic
//!
//! The retry timer itself lives in the node control loop.

use crate::bus::MessageBus;
use crate::observability::{events, metrics};
use modfleet_core::{CodecError, ControlMessage, NodeRecord, Outcome};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

/// What a response did to the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Not our transaction.
    Ignored,
    /// Error result; retries continue.
    Rejected,
    /// First ok for our transaction.
    Registered,
    /// Ok received again after registration.
    Duplicate,
}

pub struct Registrar {
    node: NodeRecord,
    registration_topic: String,
    control_topic: String,
    state: RegistrationState,
    transaction_id: Option<String>,
    request: Option<Vec<u8>>,
    attempts: u32,
}

impl Registrar {
    pub fn new(node: NodeRecord, registration_topic: String, control_topic: String) -> Self {
        Self {
            node,
            registration_topic,
            control_topic,
            state: RegistrationState::Unregistered,
            transaction_id: None,
            request: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Build the registration request and publish it.
    pub fn begin(&mut self, bus: &dyn MessageBus) -> Result<(), CodecError> {
        let request = ControlMessage::node_create(self.node.clone());
        self.transaction_id = Some(request.object_id().to_string());
        self.request = Some(request.encode()?);
        self.state = RegistrationState::Registering;
        self.publish(bus);
        Ok(())
    }

    /// Republish the stored request unless already registered.
    pub fn retry(&mut self, bus: &dyn MessageBus) {
        if self.state != RegistrationState::Registering {
            return;
        }
        debug!(node_id = %self.node.uuid, attempt = self.attempts + 1, "Registration timed out, retrying");
        self.publish(bus);
    }

    fn publish(&mut self, bus: &dyn MessageBus) {
        let (Some(tx), Some(payload)) = (&self.transaction_id, &self.request) else {
            return;
        };
        self.attempts += 1;
        events::registration_requested(&self.node.uuid, tx, self.attempts);
        metrics::record_registration_attempt();
        if let Err(e) = bus.publish(&self.registration_topic, payload.clone()) {
            warn!(error = %e, topic = %self.registration_topic, "Failed to publish registration request");
        }
    }

    pub fn on_response(&mut self, object_id: &str, outcome: &Outcome, bus: &dyn MessageBus) -> ResponseOutcome {
        if self.transaction_id.as_deref() != Some(object_id) {
            return ResponseOutcome::Ignored;
        }
        if !outcome.is_ok() {
            if self.state == RegistrationState::Registered {
                return ResponseOutcome::Ignored;
            }
            events::registration_rejected(&self.node.uuid, outcome.details.as_deref().unwrap_or("no details"));
            return ResponseOutcome::Rejected;
        }
        if self.state == RegistrationState::Registered {
            return ResponseOutcome::Duplicate;
        }

        self.state = RegistrationState::Registered;
        if let Err(e) = bus.unsubscribe(&self.registration_topic) {
            warn!(error = %e, "Failed to unsubscribe from registration topic");
        }
        if let Err(e) = bus.subscribe(&self.control_topic) {
            warn!(error = %e, topic = %self.control_topic, "Failed to subscribe to control topic");
        }
        ResponseOutcome::Registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConnector, ConnectOptions, LocalBroker};
    use modfleet_core::{ObjectType, ResultCode};

    fn record() -> NodeRecord {
        NodeRecord {
            uuid: "node-a".to_string(),
            name: "edge-a".to_string(),
            realm: "realm".to_string(),
            apis: vec![],
            max_nmodules: 4,
        }
    }

    fn outcome(result: ResultCode) -> Outcome {
        Outcome {
            object_type: ObjectType::Node,
            result,
            details: None,
        }
    }

    fn options(client_id: &str) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.to_string(),
            username: "non_auth".to_string(),
            token: None,
            last_will: None,
        }
    }

    fn registrar() -> Registrar {
        Registrar::new(
            record(),
            "realm/proc/reg".to_string(),
            "realm/proc/control/node-a/#".to_string(),
        )
    }

    #[tokio::test]
    async fn test_retry_republishes_identical_payload() {
        let broker = LocalBroker::new();
        let mut spy = broker.connect(options("spy")).await.unwrap();
        spy.client.subscribe("realm/proc/reg").unwrap();
        let node = broker.connect(options("node-a")).await.unwrap();

        let mut registrar = registrar();
        registrar.begin(node.client.as_ref()).unwrap();
        registrar.retry(node.client.as_ref());

        let first = spy.inbox.recv().await.unwrap();
        let second = spy.inbox.recv().await.unwrap();
        assert_eq!(first.payload, second.payload);
        let decoded = ControlMessage::decode(&first.payload).unwrap();
        assert_eq!(Some(decoded.object_id()), registrar.transaction_id());
    }

    #[tokio::test]
    async fn test_only_matching_ok_registers() {
        let broker = LocalBroker::new();
        let node = broker.connect(options("node-a")).await.unwrap();
        let bus = node.client.as_ref();

        let mut registrar = registrar();
        registrar.begin(bus).unwrap();
        let tx = registrar.transaction_id().unwrap().to_string();

        assert_eq!(registrar.on_response("other", &outcome(ResultCode::Ok), bus), ResponseOutcome::Ignored);
        assert_eq!(registrar.on_response(&tx, &outcome(ResultCode::Error), bus), ResponseOutcome::Rejected);
        assert_eq!(registrar.state(), RegistrationState::Registering);

        assert_eq!(registrar.on_response(&tx, &outcome(ResultCode::Ok), bus), ResponseOutcome::Registered);
        assert!(registrar.is_registered());
        assert_eq!(registrar.on_response(&tx, &outcome(ResultCode::Ok), bus), ResponseOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_retry_stops_after_registration() {
        let broker = LocalBroker::new();
        let mut spy = broker.connect(options("spy")).await.unwrap();
        spy.client.subscribe("realm/proc/reg").unwrap();
        let node = broker.connect(options("node-a")).await.unwrap();
        let bus = node.client.as_ref();

        let mut registrar = registrar();
        registrar.begin(bus).unwrap();
        let tx = registrar.transaction_id().unwrap().to_string();
        registrar.on_response(&tx, &outcome(ResultCode::Ok), bus);
        registrar.retry(bus);

        assert!(spy.inbox.recv().await.is_some());
        assert!(spy.inbox.try_recv().is_err());
    }
}
