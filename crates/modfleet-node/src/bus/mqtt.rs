//! MQTT connector
//!
//! Opens bus sessions against an external MQTT broker. Each session owns a
//! `rumqttc` event loop task feeding the inbox and a writer task that
//! serializes publish/subscribe requests, so `MessageBus` calls never block.
//! Filters are remembered per session and re-subscribed after a reconnect.
//!
//! Accepted broker uris: `mqtt://`, `mqtts://`, `ws://` and `wss://`, with
//! an optional port and, for websockets, a path.

use super::{BusConnector, BusError, BusMessage, BusSession, ConnectOptions, MessageBus};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, Transport};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 256;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Mqtt => 1883,
            Scheme::Mqtts => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    fn is_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl BusEndpoint {
    pub fn parse(uri: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidUri(uri.to_string());
        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Scheme::Mqtt,
            "mqtts" | "ssl" => Scheme::Mqtts,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            _ => return Err(invalid()),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, scheme.default_port()),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut options = if self.scheme.is_websocket() {
            let prefix = if self.scheme == Scheme::Wss { "wss" } else { "ws" };
            let url = format!("{prefix}://{}:{}{}", self.host, self.port, self.path);
            MqttOptions::new(client_id, url, self.port)
        } else {
            MqttOptions::new(client_id, self.host.clone(), self.port)
        };
        match self.scheme {
            Scheme::Mqtt => {}
            Scheme::Mqtts => {
                options.set_transport(Transport::tls_with_default_config());
            }
            Scheme::Ws => {
                options.set_transport(Transport::Ws);
            }
            Scheme::Wss => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }
        options
    }
}

impl std::fmt::Display for BusEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Mqtt => "mqtt",
            Scheme::Mqtts => "mqtts",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        write!(f, "{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Connector for an external MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    endpoint: BusEndpoint,
}

impl MqttConnector {
    pub fn new(endpoint: BusEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &BusEndpoint {
        &self.endpoint
    }
}

impl BusConnector for MqttConnector {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'static, Result<BusSession, BusError>> {
        let endpoint = self.endpoint.clone();
        Box::pin(async move { open_session(endpoint, options).await })
    }
}

enum Request {
    Publish { topic: String, payload: Vec<u8> },
    Subscribe(String),
    Unsubscribe(String),
}

struct MqttClient {
    requests: mpsc::UnboundedSender<Request>,
    filters: Arc<Mutex<BTreeSet<String>>>,
}

impl MessageBus for MqttClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.requests
            .send(Request::Publish {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BusError::SessionClosed)
    }

    fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        self.requests
            .send(Request::Subscribe(filter.to_string()))
            .map_err(|_| BusError::SessionClosed)?;
        if let Ok(mut filters) = self.filters.lock() {
            filters.insert(filter.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        self.requests
            .send(Request::Unsubscribe(filter.to_string()))
            .map_err(|_| BusError::SessionClosed)?;
        if let Ok(mut filters) = self.filters.lock() {
            filters.remove(filter);
        }
        Ok(())
    }
}

async fn open_session(endpoint: BusEndpoint, options: ConnectOptions) -> Result<BusSession, BusError> {
    let mut mqtt = endpoint.mqtt_options(&options.client_id);
    mqtt.set_keep_alive(KEEP_ALIVE);
    mqtt.set_clean_session(true);
    mqtt.set_credentials(options.username.clone(), options.token.clone().unwrap_or_default());
    if let Some(will) = &options.last_will {
        mqtt.set_last_will(LastWill::new(&will.topic, will.payload.clone(), QoS::AtLeastOnce, false));
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
    match tokio::time::timeout(CONNECT_TIMEOUT, wait_connack(&mut eventloop)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(BusError::Refused(e.to_string())),
        Err(_) => return Err(BusError::Refused(format!("no answer from {endpoint} within {CONNECT_TIMEOUT:?}"))),
    }
    info!(client_id = %options.client_id, broker = %endpoint, "Connected to MQTT broker");

    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let filters = Arc::new(Mutex::new(BTreeSet::new()));

    tokio::spawn(write_requests(client, requests_rx, options.client_id.clone()));
    tokio::spawn(poll_events(
        eventloop,
        inbox_tx,
        requests_tx.downgrade(),
        filters.clone(),
        options.client_id,
    ));

    Ok(BusSession {
        client: Arc::new(MqttClient {
            requests: requests_tx,
            filters,
        }),
        inbox,
    })
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Runs until every handle to the session is dropped, then disconnects.
async fn write_requests(client: AsyncClient, mut requests: mpsc::UnboundedReceiver<Request>, client_id: String) {
    while let Some(request) = requests.recv().await {
        let result = match request {
            Request::Publish { topic, payload } => client.publish(topic, QoS::AtLeastOnce, false, payload).await,
            Request::Subscribe(filter) => client.subscribe(filter, QoS::AtLeastOnce).await,
            Request::Unsubscribe(filter) => client.unsubscribe(filter).await,
        };
        if let Err(e) = result {
            debug!(client_id = %client_id, error = %e, "MQTT event loop gone, stopping writer");
            return;
        }
    }
    let _ = client.disconnect().await;
}

async fn poll_events(
    mut eventloop: EventLoop,
    inbox: mpsc::UnboundedSender<BusMessage>,
    requests: mpsc::WeakUnboundedSender<Request>,
    filters: Arc<Mutex<BTreeSet<String>>>,
    client_id: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if inbox.send(BusMessage::new(publish.topic, publish.payload.to_vec())).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(client_id = %client_id, session_present = ack.session_present, "Reconnected to MQTT broker");
                if !ack.session_present {
                    resubscribe(&requests, &filters);
                }
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                if inbox.is_closed() {
                    break;
                }
                warn!(client_id = %client_id, error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!(client_id = %client_id, "MQTT session ended");
}

fn resubscribe(requests: &mpsc::WeakUnboundedSender<Request>, filters: &Mutex<BTreeSet<String>>) {
    let Some(requests) = requests.upgrade() else {
        return;
    };
    let Ok(filters) = filters.lock() else {
        return;
    };
    for filter in filters.iter() {
        let _ = requests.send(Request::Subscribe(filter.clone()));
    }
}
