//! In-process fake manager for CRI lifecycle tests.
//!
//! A stateful mini-manager behind the real REST protocol: containers with
//! config/devices/ETags, state transitions, background operations, files,
//! and an image store with aliases. Enough surface for the sandbox and
//! container lifecycle paths to run end to end.

// Each test binary uses a different slice of the fake.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    pub status: String,
    pub pid: i64,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub profiles: Vec<String>,
    pub etag: u64,
    pub files: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct FakeImage {
    fingerprint: String,
    size: u64,
    aliases: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeOperation {
    status_code: i64,
    err: String,
    metadata: Value,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    images: HashMap<String, FakeImage>,
    aliases: HashMap<String, String>,
    operations: HashMap<String, FakeOperation>,
    op_counter: u64,
    pull_count: usize,
}

pub struct FakeManager {
    pub socket_path: PathBuf,
    state: Arc<Mutex<State>>,
    _dir: tempfile::TempDir,
}

impl FakeManager {
    pub async fn start() -> Self {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let socket_path = dir.path().join("manager.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind fake manager");
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, conn_state).await;
                });
            }
        });

        Self {
            socket_path,
            state,
            _dir: dir,
        }
    }

    pub fn add_image(&self, fingerprint: &str, size: u64, aliases: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.images.insert(
            fingerprint.to_string(),
            FakeImage {
                fingerprint: fingerprint.to_string(),
                size,
                aliases: aliases.iter().map(|s| s.to_string()).collect(),
            },
        );
        for alias in aliases {
            state
                .aliases
                .insert(alias.to_string(), fingerprint.to_string());
        }
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().unwrap().pull_count
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let (method, path, headers, body) = read_request(&mut stream).await?;
    let (status, response_headers, response_body) = route(&method, &path, &headers, &body, &state);

    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        status,
        if status < 400 { "OK" } else { "Error" },
        response_body.len()
    );
    for (name, value) in response_headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response_body).await?;
    stream.shutdown().await
}

async fn read_request(
    stream: &mut UnixStream,
) -> std::io::Result<(String, String, HashMap<String, String>, Vec<u8>)> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break raw.len();
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body: Vec<u8> = raw[header_end + 4.min(raw.len() - header_end)..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Ok((method, path, headers, body))
}

fn sync_response(metadata: Value) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let body = json!({
        "type": "sync",
        "status": "Success",
        "status_code": 200,
        "metadata": metadata,
    });
    (200, Vec::new(), body.to_string().into_bytes())
}

fn error_response(code: u16, message: &str) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let body = json!({
        "type": "error",
        "error": message,
        "error_code": code,
    });
    (code, Vec::new(), body.to_string().into_bytes())
}

fn async_response(state: &mut State, op: FakeOperation) -> (u16, Vec<(String, String)>, Vec<u8>) {
    state.op_counter += 1;
    let id = format!("op{}", state.op_counter);
    state.operations.insert(id.clone(), op);
    let body = json!({
        "type": "async",
        "status": "Operation created",
        "status_code": 100,
        "operation": format!("/1.0/operations/{}", id),
        "metadata": {},
    });
    (202, Vec::new(), body.to_string().into_bytes())
}

fn success_op() -> FakeOperation {
    FakeOperation {
        status_code: 200,
        err: String::new(),
        metadata: json!({}),
    }
}

fn failed_op(err: &str) -> FakeOperation {
    FakeOperation {
        status_code: 400,
        err: err.to_string(),
        metadata: json!({}),
    }
}

fn string_map(value: &Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn container_json(name: &str, c: &FakeContainer) -> Value {
    json!({
        "name": name,
        "status": c.status,
        "status_code": if c.status == "Running" { 103 } else { 102 },
        "config": c.config,
        "devices": c.devices,
        "profiles": c.profiles,
        "ephemeral": false,
    })
}

fn route(
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
    state: &Arc<Mutex<State>>,
) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut state = state.lock().unwrap();
    let (path, query) = path.split_once('?').unwrap_or((path, ""));
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["1.0"]) => sync_response(json!({"api_version": "1.0"})),

        ("GET", ["1.0", "containers"]) => {
            let list: Vec<Value> = state
                .containers
                .iter()
                .map(|(name, c)| container_json(name, c))
                .collect();
            sync_response(json!(list))
        }
        ("POST", ["1.0", "containers"]) => {
            let request: Value = serde_json::from_slice(body).unwrap_or_default();
            let name = request["name"].as_str().unwrap_or_default().to_string();
            if name.is_empty() {
                return error_response(400, "container name required");
            }
            if state.containers.contains_key(&name) {
                return error_response(409, "container already exists");
            }
            let devices = request["devices"]
                .as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), string_map(v)))
                        .collect()
                })
                .unwrap_or_default();
            state.containers.insert(
                name,
                FakeContainer {
                    status: "Stopped".to_string(),
                    pid: 0,
                    config: string_map(&request["config"]),
                    devices,
                    profiles: vec!["default".to_string()],
                    etag: 1,
                    files: HashMap::new(),
                },
            );
            async_response(&mut state, success_op())
        }
        ("GET", ["1.0", "containers", name]) => match state.containers.get(*name) {
            Some(c) => {
                let etag = format!("\"v{}\"", c.etag);
                let (status, mut hdrs, body) = sync_response(container_json(name, c));
                hdrs.push(("Etag".to_string(), etag));
                (status, hdrs, body)
            }
            None => error_response(404, "not found"),
        },
        ("PUT", ["1.0", "containers", name]) => {
            let current_etag = match state.containers.get(*name) {
                Some(c) => format!("\"v{}\"", c.etag),
                None => return error_response(404, "not found"),
            };
            if let Some(sent) = headers.get("if-match") {
                if *sent != current_etag {
                    return error_response(412, "ETag mismatch");
                }
            }
            let request: Value = serde_json::from_slice(body).unwrap_or_default();
            let container = state.containers.get_mut(*name).unwrap();
            if request["config"].is_object() {
                container.config = string_map(&request["config"]);
            }
            container.etag += 1;
            async_response(&mut state, success_op())
        }
        ("DELETE", ["1.0", "containers", name]) => {
            if state.containers.remove(*name).is_none() {
                return error_response(404, "not found");
            }
            async_response(&mut state, success_op())
        }
        ("GET", ["1.0", "containers", name, "state"]) => match state.containers.get(*name) {
            Some(c) => sync_response(json!({
                "status": c.status,
                "status_code": if c.status == "Running" { 103 } else { 102 },
                "pid": c.pid,
            })),
            None => error_response(404, "not found"),
        },
        ("PUT", ["1.0", "containers", name, "state"]) => {
            let request: Value = serde_json::from_slice(body).unwrap_or_default();
            let action = request["action"].as_str().unwrap_or_default();
            let name = name.to_string();

            if !state.containers.contains_key(&name) {
                return error_response(404, "not found");
            }

            match action {
                "start" => {
                    let container = state.containers.get_mut(&name).unwrap();
                    container.status = "Running".to_string();
                    if container.pid == 0 {
                        container.pid = 4242;
                    }
                    async_response(&mut state, success_op())
                }
                "stop" => {
                    let container = state.containers.get_mut(&name).unwrap();
                    if container.status == "Stopped" {
                        return async_response(
                            &mut state,
                            failed_op("The container is already stopped"),
                        );
                    }
                    container.status = "Stopped".to_string();
                    container.pid = 0;
                    async_response(&mut state, success_op())
                }
                other => error_response(400, &format!("unknown action {}", other)),
            }
        }

        ("POST", ["1.0", "containers", name, "files"]) => {
            let file_path = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("path="))
                .unwrap_or_default()
                .to_string();
            match state.containers.get_mut(*name) {
                Some(c) => {
                    c.files.insert(file_path, body.to_vec());
                    sync_response(json!({}))
                }
                None => error_response(404, "not found"),
            }
        }
        ("GET", ["1.0", "containers", name, "files"]) => {
            let file_path = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("path="))
                .unwrap_or_default();
            match state
                .containers
                .get(*name)
                .and_then(|c| c.files.get(file_path))
            {
                Some(content) => (200, Vec::new(), content.clone()),
                None => error_response(404, "not found"),
            }
        }

        ("GET", ["1.0", "operations", id, "wait"]) | ("GET", ["1.0", "operations", id]) => {
            match state.operations.get(*id) {
                Some(op) => sync_response(json!({
                    "id": id,
                    "class": "task",
                    "status": if op.status_code == 200 { "Success" } else { "Failure" },
                    "status_code": op.status_code,
                    "err": op.err,
                    "metadata": op.metadata,
                })),
                None => error_response(404, "not found"),
            }
        }
        ("DELETE", ["1.0", "operations", _id]) => sync_response(json!({})),

        ("GET", ["1.0", "images"]) => {
            let list: Vec<Value> = state
                .images
                .values()
                .map(|img| {
                    json!({
                        "fingerprint": img.fingerprint,
                        "size": img.size,
                        "aliases": img.aliases.iter().map(|a| json!({"name": a, "description": ""})).collect::<Vec<_>>(),
                    })
                })
                .collect();
            sync_response(json!(list))
        }
        ("POST", ["1.0", "images"]) => {
            state.pull_count += 1;
            let request: Value = serde_json::from_slice(body).unwrap_or_default();
            let alias = request["source"]["alias"]
                .as_str()
                .unwrap_or("anonymous")
                .to_string();
            let fingerprint = format!("fp{:08x}", fnv_hash(&alias));
            state.images.insert(
                fingerprint.clone(),
                FakeImage {
                    fingerprint: fingerprint.clone(),
                    size: 1024,
                    aliases: vec![alias.clone()],
                },
            );
            state.aliases.insert(alias, fingerprint.clone());
            let op = FakeOperation {
                status_code: 200,
                err: String::new(),
                metadata: json!({"fingerprint": fingerprint}),
            };
            async_response(&mut state, op)
        }
        ("GET", ["1.0", "images", "aliases", name]) => match state.aliases.get(*name) {
            Some(target) => sync_response(json!({"name": name, "target": target})),
            None => error_response(404, "not found"),
        },
        ("GET", ["1.0", "images", fingerprint]) => match state.images.get(*fingerprint) {
            Some(img) => sync_response(json!({
                "fingerprint": img.fingerprint,
                "size": img.size,
                "aliases": img.aliases.iter().map(|a| json!({"name": a, "description": ""})).collect::<Vec<_>>(),
            })),
            None => error_response(404, "not found"),
        },
        ("DELETE", ["1.0", "images", fingerprint]) => {
            if state.images.remove(*fingerprint).is_none() {
                return error_response(404, "not found");
            }
            let fingerprint = fingerprint.to_string();
            state.aliases.retain(|_, target| *target != fingerprint);
            async_response(&mut state, success_op())
        }

        _ => error_response(404, "not found"),
    }
}

fn fnv_hash(input: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}
