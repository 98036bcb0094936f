//! Data Model
//!
//! Descriptors exchanged on the control plane:
//! - `ModuleSpec`: the module descriptor carried by create/delete requests
//! - `NodeRecord`: the node announcement sent during registration
//! - `ProgramRequest`: a stored program definition, the input to provisioning

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Placement hint for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affinity {
    #[default]
    Any,
    Single,
    Client,
}

/// How many instances of a program may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instantiation {
    Single,
    Client,
    #[default]
    Multiple,
}

/// Executable kind of a module binary.
///
/// Kinds this build knows about get their own variant; anything else is
/// carried through verbatim so it can be rejected by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileType {
    Wasm,
    Python,
    Other(String),
}

impl FileType {
    pub fn as_str(&self) -> &str {
        match self {
            FileType::Wasm => "WA",
            FileType::Python => "PY",
            FileType::Other(kind) => kind,
        }
    }

    /// Binaries of this kind live in the program store and get a store path.
    pub fn is_store_hosted(&self) -> bool {
        matches!(self, FileType::Wasm)
    }
}

impl Default for FileType {
    fn default() -> Self {
        FileType::Other(String::new())
    }
}

impl From<String> for FileType {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "WA" => FileType::Wasm,
            "PY" => FileType::Python,
            _ => FileType::Other(kind),
        }
    }
}

impl From<&str> for FileType {
    fn from(kind: &str) -> Self {
        FileType::from(kind.to_string())
    }
}

impl From<FileType> for String {
    fn from(kind: FileType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel transport. Only pub/sub is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelTransport {
    #[default]
    Pubsub,
}

/// Direction of a channel binding as seen by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl ChannelMode {
    pub fn readable(self) -> bool {
        matches!(self, ChannelMode::Read | ChannelMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, ChannelMode::Write | ChannelMode::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelParams {
    #[serde(default)]
    pub topic: String,
}

/// Binding of a module-local path to a bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub path: String,
    #[serde(rename = "type", default)]
    pub transport: ChannelTransport,
    pub mode: ChannelMode,
    #[serde(default)]
    pub params: ChannelParams,
}

impl ChannelBinding {
    pub fn pubsub(path: impl Into<String>, mode: ChannelMode, topic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            transport: ChannelTransport::Pubsub,
            mode,
            params: ChannelParams {
                topic: topic.into(),
            },
        }
    }
}

/// Reference to the node a module is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub uuid: String,
}

/// Module descriptor carried inside module create/delete requests.
///
/// Delete requests usually carry only the uuid, so every other field
/// defaults when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
    /// Binary reference: a store path for store-hosted kinds, otherwise as given.
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub filetype: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelBinding>,
    /// Do not start on create; wait for a follow-up create carrying state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_state: bool,
    /// Opaque execution snapshot captured from a previous instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Vec<u8>>,
}

impl ModuleSpec {
    /// Descriptor that only identifies a module, as used by delete requests.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            name: String::new(),
            filename: String::new(),
            filetype: FileType::default(),
            parent: None,
            args: None,
            env: None,
            channels: Vec::new(),
            wait_state: false,
            memory: None,
        }
    }
}

/// Node announcement published on registration and in the last will.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub uuid: String,
    pub name: String,
    pub realm: String,
    #[serde(default)]
    pub apis: Vec<String>,
    pub max_nmodules: usize,
}

/// Stored program definition submitted to the node for placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRequest {
    pub object_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub data: ProgramSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: String,
    #[serde(default)]
    pub instantiate: Instantiation,
    pub filename: String,
    pub filetype: FileType,
    #[serde(default)]
    pub affinity: Affinity,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_wire() {
        assert_eq!(FileType::from("WA"), FileType::Wasm);
        assert_eq!(FileType::from("PY"), FileType::Python);
        assert_eq!(FileType::from("EXE"), FileType::Other("EXE".to_string()));
        assert!(FileType::Wasm.is_store_hosted());
        assert!(!FileType::Python.is_store_hosted());
    }

    #[test]
    fn test_program_request_defaults() {
        let request: ProgramRequest = serde_json::from_str(
            r#"{"object_id":"p1","data":{"name":"ns/app","filename":"main.py","filetype":"PY"}}"#,
        )
        .unwrap();
        assert_eq!(request.data.instantiate, Instantiation::Multiple);
        assert_eq!(request.data.affinity, Affinity::Any);
        assert!(request.data.args.is_empty());
        assert!(request.data.channels.is_empty());
    }

    #[test]
    fn test_channel_binding_shape() {
        let binding: ChannelBinding = serde_json::from_str(
            r#"{"path":"/ch/in","type":"pubsub","mode":"rw","params":{"topic":"realm/s/in"}}"#,
        )
        .unwrap();
        assert_eq!(binding.mode, ChannelMode::ReadWrite);
        assert!(binding.mode.readable() && binding.mode.writable());
        assert_eq!(binding.params.topic, "realm/s/in");
    }

    #[test]
    fn test_delete_descriptor_omits_empty_fields() {
        let spec = ModuleSpec::new(Uuid::nil());
        let value = serde_json::to_value(&spec).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("uuid"));
        assert!(!object.contains_key("memory"));
        assert!(!object.contains_key("wait_state"));
        assert!(!object.contains_key("channels"));
    }
}
