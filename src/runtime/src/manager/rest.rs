//! Minimal HTTP/1.1 transport for the manager's UNIX-socket REST API.
//!
//! One connection per request (`Connection: close`), JSON bodies, and a
//! raw-stream upgrade path for exec channels. Wire failures and error
//! envelopes are classified into the shim error taxonomy here, so callers
//! only ever match on `ShimError` variants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use podlx_core::error::{Result, ShimError};

use super::types::ResponseEnvelope;

/// Parsed response from the manager.
#[derive(Debug)]
pub struct RestResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub envelope: ResponseEnvelope,
}

/// One-connection-per-request HTTP client over a UNIX socket.
#[derive(Debug, Clone)]
pub struct RestClient {
    socket_path: PathBuf,
}

impl RestClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Issue a JSON request and parse the manager's response envelope.
    ///
    /// `if_match` carries an ETag for optimistic-concurrency writes.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        if_match: Option<&str>,
    ) -> Result<RestResponse> {
        let mut stream = self.connect().await?;

        let payload = match body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };

        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: manager\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
            method,
            path,
            payload.len()
        );
        if let Some(etag) = if_match {
            request.push_str(&format!("If-Match: {}\r\n", etag));
        }
        request.push_str("\r\n");
        request.push_str(&payload);

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(connection_error)?;

        let mut raw = Vec::with_capacity(4096);
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(connection_error)?;

        let (status, headers, body) = parse_response(&raw)?;
        let etag = headers.get("etag").cloned();

        let envelope: ResponseEnvelope = if body.is_empty() {
            return Err(ShimError::Transient(format!(
                "empty response from manager for {} {}",
                method, path
            )));
        } else {
            serde_json::from_slice(body)?
        };

        if envelope.is_error() || status >= 400 {
            return Err(classify_error(status, &envelope));
        }

        Ok(RestResponse {
            status,
            etag,
            envelope,
        })
    }

    /// Upgrade a connection into a raw byte stream (exec channels).
    ///
    /// Sends the upgrade request for `path` and returns the socket once the
    /// manager has switched protocols; all subsequent bytes belong to the
    /// stream.
    pub async fn hijack(&self, path: &str) -> Result<UnixStream> {
        let mut stream = self.connect().await?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: manager\r\nConnection: Upgrade\r\nUpgrade: stream\r\n\r\n",
            path
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(connection_error)?;

        // Consume the response head byte-wise so no stream payload is lost.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.map_err(connection_error)?;
            if n == 0 {
                return Err(ShimError::Transient(
                    "manager closed connection during stream upgrade".to_string(),
                ));
            }
            head.push(byte[0]);
            if head.len() > 16 * 1024 {
                return Err(ShimError::Fatal(
                    "oversized upgrade response from manager".to_string(),
                ));
            }
        }

        let head_str = String::from_utf8_lossy(&head);
        let status_line = head_str.lines().next().unwrap_or("");
        if !status_line.contains("101") {
            return Err(ShimError::Fatal(format!(
                "stream upgrade rejected: {}",
                status_line
            )));
        }

        Ok(stream)
    }

    /// Send a raw (non-JSON) body, e.g. file content, and parse the JSON
    /// envelope that comes back.
    pub async fn upload(&self, method: &str, path: &str, content: &[u8]) -> Result<RestResponse> {
        let mut stream = self.connect().await?;

        let head = format!(
            "{} {} HTTP/1.1\r\nHost: manager\r\nConnection: close\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            method,
            path,
            content.len()
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(connection_error)?;
        stream.write_all(content).await.map_err(connection_error)?;

        let mut raw = Vec::with_capacity(1024);
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(connection_error)?;

        let (status, headers, body) = parse_response(&raw)?;
        let envelope: ResponseEnvelope = serde_json::from_slice(body)?;
        if envelope.is_error() || status >= 400 {
            return Err(classify_error(status, &envelope));
        }
        Ok(RestResponse {
            status,
            etag: headers.get("etag").cloned(),
            envelope,
        })
    }

    /// Fetch a raw body (file content) rather than a JSON envelope.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let mut stream = self.connect().await?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: manager\r\nConnection: close\r\n\r\n",
            path
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(connection_error)?;

        let mut raw = Vec::with_capacity(4096);
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(connection_error)?;

        let (status, _, body) = parse_response(&raw)?;
        if status >= 400 {
            // Error bodies are JSON envelopes even on the files endpoint.
            if let Ok(envelope) = serde_json::from_slice::<ResponseEnvelope>(body) {
                return Err(classify_error(status, &envelope));
            }
            return Err(ShimError::Fatal(format!(
                "file download failed with HTTP {}",
                status
            )));
        }
        Ok(body.to_vec())
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| {
                ShimError::Transient(format!(
                    "cannot reach manager at {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })
    }
}

fn connection_error(err: std::io::Error) -> ShimError {
    ShimError::Transient(format!("manager connection failed: {}", err))
}

/// Map an HTTP status plus error envelope onto the shim taxonomy.
fn classify_error(status: u16, envelope: &ResponseEnvelope) -> ShimError {
    let code = if envelope.error_code != 0 {
        envelope.error_code
    } else {
        status as i64
    };
    let message = if envelope.error.is_empty() {
        format!("manager returned HTTP {}", status)
    } else {
        envelope.error.clone()
    };

    match code {
        404 => ShimError::NotFound(message),
        400 => ShimError::Invalid(message),
        409 => ShimError::AlreadyInState(message),
        412 => ShimError::Conflict(message),
        403 => ShimError::Fatal(message),
        500 | 502 | 503 => ShimError::Transient(message),
        _ => ShimError::Fatal(message),
    }
}

/// Split a raw HTTP response into status, lowercase headers, and body.
fn parse_response(raw: &[u8]) -> Result<(u16, HashMap<String, String>, &[u8])> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ShimError::Transient("truncated response from manager".to_string()))?;
    let (head, rest) = raw.split_at(split);
    let body = &rest[4..];

    let head_str = String::from_utf8_lossy(head);
    let mut lines = head_str.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| ShimError::Transient("missing status line".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ShimError::Transient(format!("unparseable status line: {}", status_line))
        })?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    // Honor Content-Length when the manager sends trailing bytes.
    let body = match headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        Some(len) if len <= body.len() => &body[..len],
        _ => body,
    };

    Ok((status, headers, body))
}
