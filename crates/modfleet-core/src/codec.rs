//! Control Message Codec
//!
//! Builds and parses the JSON envelope exchanged on the control plane:
//!
//! ```text
//! { "object_id": "...", "type": "request" | "response",
//!   "action": "create" | "delete",
//!   "data": { "type": "node" | "module", ... },
//!   "send_to_runtime": "...",         (module delete only)
//!   "migratetx_start": 1700000000000  (module create only, epoch ms) }
//! ```
//!
//! Decoding produces a typed `ControlMessage`; combinations that do not
//! map onto a variant are rejected instead of falling through.

use crate::model::{ModuleSpec, NodeRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown object type `{0}`")]
    UnknownObjectType(String),
    #[error("control message data is not an object")]
    DataNotObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Node,
    Module,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Node => "node",
            ObjectType::Module => "module",
        }
    }
}

/// Result code of a response. Anything other than `ok` counts as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    Ok,
    #[serde(other)]
    Error,
}

/// Payload of a response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub result: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.result == ResultCode::Ok
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    NodeCreate {
        object_id: String,
        node: NodeRecord,
    },
    NodeDelete {
        object_id: String,
        node: NodeRecord,
    },
    ModuleCreate {
        object_id: String,
        module: ModuleSpec,
        migration_started_at: Option<i64>,
    },
    ModuleDelete {
        object_id: String,
        module: ModuleSpec,
        redirect_to: Option<String>,
    },
    Response {
        object_id: String,
        action: Action,
        outcome: Outcome,
    },
}

#[derive(Serialize, Deserialize)]
struct Wire {
    object_id: String,
    #[serde(rename = "type")]
    kind: MessageType,
    action: Action,
    data: Value,
    #[serde(
        rename = "send_to_runtime",
        alias = "redirect_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    redirect_to: Option<String>,
    #[serde(
        rename = "migratetx_start",
        alias = "migration_started_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    migration_started_at: Option<i64>,
}

fn fresh_object_id() -> String {
    Uuid::new_v4().to_string()
}

fn tagged<T: Serialize>(object_type: ObjectType, value: &T) -> Result<Value, CodecError> {
    let mut data = serde_json::to_value(value)?;
    match data.as_object_mut() {
        Some(map) => {
            map.insert("type".to_string(), Value::from(object_type.as_str()));
            Ok(data)
        }
        None => Err(CodecError::DataNotObject),
    }
}

fn object_type_of(data: &Value) -> Result<ObjectType, CodecError> {
    let tag = data
        .as_object()
        .ok_or(CodecError::DataNotObject)?
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match tag {
        "node" => Ok(ObjectType::Node),
        "module" => Ok(ObjectType::Module),
        other => Err(CodecError::UnknownObjectType(other.to_string())),
    }
}

impl ControlMessage {
    pub fn node_create(node: NodeRecord) -> Self {
        ControlMessage::NodeCreate {
            object_id: fresh_object_id(),
            node,
        }
    }

    pub fn node_delete(node: NodeRecord) -> Self {
        ControlMessage::NodeDelete {
            object_id: fresh_object_id(),
            node,
        }
    }

    pub fn module_create(module: ModuleSpec) -> Self {
        ControlMessage::ModuleCreate {
            object_id: fresh_object_id(),
            module,
            migration_started_at: None,
        }
    }

    /// Create request for a module resuming elsewhere; `started_at` is epoch ms.
    pub fn module_migration(module: ModuleSpec, started_at: i64) -> Self {
        ControlMessage::ModuleCreate {
            object_id: fresh_object_id(),
            module,
            migration_started_at: Some(started_at),
        }
    }

    pub fn module_delete(module: ModuleSpec, redirect_to: Option<String>) -> Self {
        ControlMessage::ModuleDelete {
            object_id: fresh_object_id(),
            module,
            redirect_to,
        }
    }

    pub fn response(object_id: impl Into<String>, action: Action, outcome: Outcome) -> Self {
        ControlMessage::Response {
            object_id: object_id.into(),
            action,
            outcome,
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            ControlMessage::NodeCreate { object_id, .. }
            | ControlMessage::NodeDelete { object_id, .. }
            | ControlMessage::ModuleCreate { object_id, .. }
            | ControlMessage::ModuleDelete { object_id, .. }
            | ControlMessage::Response { object_id, .. } => object_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::Response { .. } => MessageType::Response,
            _ => MessageType::Request,
        }
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::NodeCreate { .. } => "node_create",
            ControlMessage::NodeDelete { .. } => "node_delete",
            ControlMessage::ModuleCreate { .. } => "module_create",
            ControlMessage::ModuleDelete { .. } => "module_delete",
            ControlMessage::Response { .. } => "response",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = match self {
            ControlMessage::NodeCreate { object_id, node } => Wire {
                object_id: object_id.clone(),
                kind: MessageType::Request,
                action: Action::Create,
                data: tagged(ObjectType::Node, node)?,
                redirect_to: None,
                migration_started_at: None,
            },
            ControlMessage::NodeDelete { object_id, node } => Wire {
                object_id: object_id.clone(),
                kind: MessageType::Request,
                action: Action::Delete,
                data: tagged(ObjectType::Node, node)?,
                redirect_to: None,
                migration_started_at: None,
            },
            ControlMessage::ModuleCreate {
                object_id,
                module,
                migration_started_at,
            } => Wire {
                object_id: object_id.clone(),
                kind: MessageType::Request,
                action: Action::Create,
                data: tagged(ObjectType::Module, module)?,
                redirect_to: None,
                migration_started_at: *migration_started_at,
            },
            ControlMessage::ModuleDelete {
                object_id,
                module,
                redirect_to,
            } => Wire {
                object_id: object_id.clone(),
                kind: MessageType::Request,
                action: Action::Delete,
                data: tagged(ObjectType::Module, module)?,
                redirect_to: redirect_to.clone(),
                migration_started_at: None,
            },
            ControlMessage::Response {
                object_id,
                action,
                outcome,
            } => Wire {
                object_id: object_id.clone(),
                kind: MessageType::Response,
                action: *action,
                data: serde_json::to_value(outcome)?,
                redirect_to: None,
                migration_started_at: None,
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: Wire = serde_json::from_slice(bytes)?;
        let object_type = object_type_of(&wire.data)?;

        let message = match (wire.kind, object_type, wire.action) {
            (MessageType::Response, _, action) => ControlMessage::Response {
                object_id: wire.object_id,
                action,
                outcome: serde_json::from_value(wire.data)?,
            },
            (MessageType::Request, ObjectType::Node, Action::Create) => ControlMessage::NodeCreate {
                object_id: wire.object_id,
                node: serde_json::from_value(wire.data)?,
            },
            (MessageType::Request, ObjectType::Node, Action::Delete) => ControlMessage::NodeDelete {
                object_id: wire.object_id,
                node: serde_json::from_value(wire.data)?,
            },
            (MessageType::Request, ObjectType::Module, Action::Create) => {
                ControlMessage::ModuleCreate {
                    object_id: wire.object_id,
                    module: serde_json::from_value(wire.data)?,
                    migration_started_at: wire.migration_started_at,
                }
            }
            (MessageType::Request, ObjectType::Module, Action::Delete) => {
                ControlMessage::ModuleDelete {
                    object_id: wire.object_id,
                    module: serde_json::from_value(wire.data)?,
                    redirect_to: wire.redirect_to,
                }
            }
        };
        Ok(message)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.object_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelBinding, ChannelMode, FileType};

    fn node() -> NodeRecord {
        NodeRecord {
            uuid: "node-a".to_string(),
            name: "edge-a".to_string(),
            realm: "realm".to_string(),
            apis: vec!["wasi:unstable".to_string()],
            max_nmodules: 10,
        }
    }

    #[test]
    fn test_node_create_wire_shape() {
        let message = ControlMessage::node_create(node());
        let value: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["action"], "create");
        assert_eq!(value["data"]["type"], "node");
        assert_eq!(value["data"]["max_nmodules"], 10);
        assert_eq!(value["object_id"], message.object_id());
    }

    #[test]
    fn test_decode_response() {
        let raw = br#"{"object_id":"tx-1","type":"response","action":"create","data":{"type":"node","result":"ok"}}"#;
        match ControlMessage::decode(raw).unwrap() {
            ControlMessage::Response {
                object_id,
                action,
                outcome,
            } => {
                assert_eq!(object_id, "tx-1");
                assert_eq!(action, Action::Create);
                assert!(outcome.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_result_is_error() {
        let raw = br#"{"object_id":"tx-1","type":"response","action":"create","data":{"type":"node","result":"denied","details":"realm full"}}"#;
        let ControlMessage::Response { outcome, .. } = ControlMessage::decode(raw).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(outcome.result, ResultCode::Error);
        assert_eq!(outcome.details.as_deref(), Some("realm full"));
    }

    #[test]
    fn test_rejects_unknown_variants() {
        let bad_type = br#"{"object_id":"x","type":"request","action":"create","data":{"type":"scene"}}"#;
        assert!(matches!(
            ControlMessage::decode(bad_type),
            Err(CodecError::UnknownObjectType(t)) if t == "scene"
        ));

        let bad_action = br#"{"object_id":"x","type":"request","action":"update","data":{"type":"module"}}"#;
        assert!(matches!(
            ControlMessage::decode(bad_action),
            Err(CodecError::Malformed(_))
        ));

        assert!(ControlMessage::decode(b"not json").is_err());
    }

    #[test]
    fn test_module_create_carries_memory_and_timestamp() {
        let mut module = ModuleSpec::new(Uuid::new_v4());
        module.name = "ns/app".to_string();
        module.filetype = FileType::Wasm;
        module.memory = Some(vec![1, 2, 3]);
        module
            .channels
            .push(ChannelBinding::pubsub("/out", ChannelMode::Write, "realm/s/out"));

        let sent = ControlMessage::module_migration(module.clone(), 1_700_000_000_000);
        let decoded = ControlMessage::decode(&sent.encode().unwrap()).unwrap();
        assert_eq!(decoded, sent);
        let ControlMessage::ModuleCreate { module: got, migration_started_at, .. } = decoded else {
            panic!("expected module create");
        };
        assert_eq!(got.memory, Some(vec![1, 2, 3]));
        assert_eq!(migration_started_at, Some(1_700_000_000_000));
    }

    #[test]
    fn test_module_delete_redirect_is_top_level() {
        let uuid = Uuid::new_v4();
        let message = ControlMessage::module_delete(ModuleSpec::new(uuid), Some("node-b".to_string()));
        let value: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["send_to_runtime"], "node-b");
        assert!(value.get("redirect_to").is_none());
        assert_eq!(value["data"]["uuid"], uuid.to_string());

        // a bare uuid is enough to decode a delete
        let raw = format!(
            r#"{{"object_id":"d","type":"request","action":"delete","data":{{"type":"module","uuid":"{uuid}"}}}}"#
        );
        let ControlMessage::ModuleDelete { module, redirect_to, .. } =
            ControlMessage::decode(raw.as_bytes()).unwrap()
        else {
            panic!("expected module delete");
        };
        assert_eq!(module.uuid, uuid);
        assert!(redirect_to.is_none());
    }

    #[test]
    fn test_decodes_placement_service_migration_keys() {
        let uuid = Uuid::new_v4();
        let delete = format!(
            r#"{{"object_id":"d","type":"request","action":"delete","send_to_runtime":"node-b","data":{{"type":"module","uuid":"{uuid}"}}}}"#
        );
        let ControlMessage::ModuleDelete { redirect_to, .. } = ControlMessage::decode(delete.as_bytes()).unwrap() else {
            panic!("expected module delete");
        };
        assert_eq!(redirect_to.as_deref(), Some("node-b"));

        let create = format!(
            r#"{{"object_id":"c","type":"request","action":"create","migratetx_start":1700000000000,"data":{{"type":"module","uuid":"{uuid}"}}}}"#
        );
        let ControlMessage::ModuleCreate { migration_started_at, .. } =
            ControlMessage::decode(create.as_bytes()).unwrap()
        else {
            panic!("expected module create");
        };
        assert_eq!(migration_started_at, Some(1_700_000_000_000));

        // long-form keys are still understood
        let legacy = format!(
            r#"{{"object_id":"d","type":"request","action":"delete","redirect_to":"node-c","data":{{"type":"module","uuid":"{uuid}"}}}}"#
        );
        let ControlMessage::ModuleDelete { redirect_to, .. } = ControlMessage::decode(legacy.as_bytes()).unwrap() else {
            panic!("expected module delete");
        };
        assert_eq!(redirect_to.as_deref(), Some("node-c"));
    }
}
