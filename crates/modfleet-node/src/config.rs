//! Node Configuration
//!
//! Centralized configuration for a modfleet node with environment variable
//! overrides. Topic names are derived from the realm and node id.

use modfleet_core::{FileType, NodeRecord};
use std::time::Duration;
use uuid::Uuid;

/// Bus credentials presented by the node and by each module's relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: Option<String>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "non_auth".to_string(),
            token: None,
        }
    }
}

/// Session context available to program argument substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionVars {
    /// Scene the node was launched for (env: MODFLEET_SCENE)
    pub scene: Option<String>,
    /// Camera identifier of the owning client (env: MODFLEET_CAMERA_ID)
    pub camera_id: Option<String>,
    /// Display name of the owning user (env: MODFLEET_USERNAME)
    pub username: Option<String>,
    /// Bus endpoint the node is attached to (env: MODFLEET_BUS_HOST)
    pub bus_host: Option<String>,
    /// Extra variables, later entries win (env: MODFLEET_VARS, `k=v,k=v`)
    pub overrides: Vec<(String, String)>,
}

/// Control-plane topics for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Registration requests and responses, node last will
    pub registration: String,
    /// Filter for requests addressed to this node
    pub control: String,
    /// Where module create/delete requests go for placement
    pub placement: String,
    /// Root of the per-module stdin/stdout topics
    pub debug: String,
}

impl Topics {
    pub fn new(realm: &str, node_id: &str) -> Self {
        Self {
            registration: format!("{realm}/proc/reg"),
            control: format!("{}/#", Self::node_control(realm, node_id)),
            placement: format!("{realm}/proc/control"),
            debug: format!("{realm}/proc/debug"),
        }
    }

    /// Control topic of a specific node.
    pub fn node_control(realm: &str, node_id: &str) -> String {
        format!("{realm}/proc/control/{node_id}")
    }

    pub fn stdin(&self, module: &Uuid) -> String {
        format!("{}/stdin/{module}", self.debug)
    }

    pub fn stdout(&self, module: &Uuid) -> String {
        format!("{}/stdout/{module}", self.debug)
    }

    pub fn stdout_prefix(&self) -> String {
        format!("{}/stdout/", self.debug)
    }
}

/// Node configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Namespace prefixing every topic (env: MODFLEET_REALM)
    pub realm: String,
    /// Stable node identifier (env: MODFLEET_NODE_ID)
    pub node_id: String,
    /// Human-readable node name (env: MODFLEET_NODE_NAME)
    pub name: String,
    /// Runtime interfaces offered to modules (env: MODFLEET_APIS, comma-separated)
    pub apis: Vec<String>,
    /// Capacity announced at registration and enforced on create (env: MODFLEET_MAX_MODULES)
    pub max_modules: usize,
    /// Registration retry interval (env: MODFLEET_REG_TIMEOUT_SECS)
    pub reg_timeout: Duration,
    /// Root of the program store (env: MODFLEET_STORE_ROOT)
    pub store_root: String,
    /// Bus credentials (env: MODFLEET_BUS_USERNAME, MODFLEET_BUS_TOKEN)
    pub credentials: Credentials,
    /// Byte capacity of each stdin/stdout ring (env: MODFLEET_RING_CAPACITY)
    pub ring_capacity: usize,
    /// Module kinds this node can execute (env: MODFLEET_SUPPORTED_KINDS)
    pub supported_kinds: Vec<FileType>,
    /// Runner prepended to store-hosted binaries (env: MODFLEET_WASM_RUNNER)
    pub wasm_runner: Option<String>,
    /// HTTP listen address (env: MODFLEET_HTTP_ADDR)
    pub http_addr: String,
    /// Run an in-process scheduler stub (env: MODFLEET_STANDALONE)
    pub standalone: bool,
    /// External MQTT broker, e.g. `wss://host/mqtt/` (env: MODFLEET_BUS_URI)
    pub bus_uri: Option<String>,
    pub session: SessionVars,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let node_id = Uuid::new_v4().to_string();
        Self {
            realm: "realm".to_string(),
            name: format!("node-{}", &node_id[..8]),
            node_id,
            apis: vec!["wasi:unstable".to_string()],
            max_modules: 10,
            reg_timeout: Duration::from_secs(30),
            store_root: "/store/users/".to_string(),
            credentials: Credentials::default(),
            ring_capacity: modfleet_core::ioring::DEFAULT_CAPACITY,
            supported_kinds: vec![FileType::Wasm],
            wasm_runner: None,
            http_addr: "0.0.0.0:8080".to_string(),
            standalone: false,
            bus_uri: None,
            session: SessionVars::default(),
        }
    }
}

impl NodeConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(realm) = get("MODFLEET_REALM") {
            config.realm = realm;
        }
        if let Some(node_id) = get("MODFLEET_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(name) = get("MODFLEET_NODE_NAME") {
            config.name = name;
        }
        if let Some(apis) = get("MODFLEET_APIS") {
            config.apis = split_list(&apis);
        }
        if let Some(max) = get("MODFLEET_MAX_MODULES").and_then(|v| v.parse().ok()) {
            config.max_modules = max;
        }
        if let Some(secs) = get("MODFLEET_REG_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            config.reg_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(root) = get("MODFLEET_STORE_ROOT") {
            config.store_root = root;
        }
        if let Some(username) = get("MODFLEET_BUS_USERNAME") {
            config.credentials.username = username;
        }
        if let Some(token) = get("MODFLEET_BUS_TOKEN") {
            config.credentials.token = Some(token);
        }
        if let Some(capacity) = get("MODFLEET_RING_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            config.ring_capacity = capacity.max(1);
        }
        if let Some(kinds) = get("MODFLEET_SUPPORTED_KINDS") {
            config.supported_kinds = split_list(&kinds).into_iter().map(FileType::from).collect();
        }
        if let Some(runner) = get("MODFLEET_WASM_RUNNER") {
            config.wasm_runner = Some(runner);
        }
        if let Some(addr) = get("MODFLEET_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(standalone) = get("MODFLEET_STANDALONE") {
            config.standalone = matches!(standalone.as_str(), "1" | "true" | "yes");
        }

        config.session.scene = get("MODFLEET_SCENE");
        config.session.camera_id = get("MODFLEET_CAMERA_ID");
        config.session.username = get("MODFLEET_USERNAME");
        config.bus_uri = get("MODFLEET_BUS_URI").filter(|uri| !uri.trim().is_empty());
        config.session.bus_host = get("MODFLEET_BUS_HOST").or_else(|| config.bus_uri.clone());
        if let Some(vars) = get("MODFLEET_VARS") {
            config.session.overrides = split_list(&vars)
                .into_iter()
                .filter_map(|pair| {
                    pair.split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                })
                .collect();
        }

        config
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.realm, &self.node_id)
    }

    /// Announcement published at registration.
    pub fn node_record(&self) -> NodeRecord {
        NodeRecord {
            uuid: self.node_id.clone(),
            name: self.name.clone(),
            realm: self.realm.clone(),
            apis: self.apis.clone(),
            max_nmodules: self.max_modules,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
