//! Wire payloads of the manager REST API.
//!
//! The manager wraps every response in an envelope: `sync` responses carry
//! their result in `metadata`, `async` responses point at a background
//! operation, `error` responses carry an error code and message.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response envelope common to all manager endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    /// Path of the background operation for `async` responses.
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ResponseEnvelope {
    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }

    pub fn is_async(&self) -> bool {
        self.kind == "async"
    }
}

/// A background operation as reported by the manager.
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Operation status codes used by the manager.
pub mod operation_status {
    pub const RUNNING: i64 = 103;
    pub const CANCELLING: i64 = 104;
    pub const SUCCESS: i64 = 200;
    pub const FAILURE: i64 = 400;
    pub const CANCELLED: i64 = 401;
}

impl Operation {
    pub fn is_final(&self) -> bool {
        self.status_code >= 200
    }
}

/// Container record returned by the manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Live process state of a container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub pid: i64,
}

/// Source for creating a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ContainerSource {
    pub fn from_alias(alias: &str) -> Self {
        Self {
            kind: "image".to_string(),
            alias: Some(alias.to_string()),
            fingerprint: None,
        }
    }

    pub fn from_fingerprint(fingerprint: &str) -> Self {
        Self {
            kind: "image".to_string(),
            alias: None,
            fingerprint: Some(fingerprint.to_string()),
        }
    }
}

/// Body of `POST /1.0/containers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainersPost {
    pub name: String,
    pub source: ContainerSource,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// Body of `PUT /1.0/containers/<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerPut {
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// Body of `PUT /1.0/containers/<name>/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatePut {
    pub action: String,
    /// Graceful timeout in seconds; -1 waits indefinitely.
    pub timeout: i64,
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /1.0/containers/<name>/exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerExecPost {
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Image record returned by the manager's image store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Image {
    pub fingerprint: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub aliases: Vec<ImageAlias>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAlias {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Source for `POST /1.0/images` (download into the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Body of `POST /1.0/images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesPost {
    pub source: ImageSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<ImageAlias>,
}
