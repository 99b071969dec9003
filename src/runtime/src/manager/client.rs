//! High-level manager operations used by the CRI services.
//!
//! Wraps the REST transport with the submit-then-await pattern: every
//! mutation goes through [`ManagerClient::submit`] and an
//! [`OperationHandle::wait`], so retry, cancellation, and error
//! classification live in exactly one place.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;

use podlx_core::error::{Result, ShimError};

use super::operation::{exec_exit_code, OperationHandle};
use super::rest::RestClient;
use super::types::{
    Container, ContainerExecPost, ContainerPut, ContainerState, ContainerStatePut,
    ContainersPost, Image, ImagesPost, Operation,
};

/// Client for the machine-container manager.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    rest: RestClient,
    /// Default deadline for a single operation wait.
    op_timeout: Duration,
}

/// Byte streams of a running exec, plus the operation that owns them.
///
/// The operation handle is exposed alongside the streams so callers can
/// wire stdio before awaiting completion, and cancel the manager-side
/// process when their client goes away.
pub struct ExecSession {
    pub operation: OperationHandle,
    pub streams: ExecStreams,
    pub control: Option<UnixStream>,
}

/// Stream layout of an exec session.
pub enum ExecStreams {
    /// Interactive execs multiplex stdio over one PTY stream.
    Interactive { console: UnixStream },
    /// Non-interactive execs get one stream per stdio pipe.
    Pipes {
        stdin: UnixStream,
        stdout: UnixStream,
        stderr: UnixStream,
    },
}

impl ExecSession {
    /// Await process exit and return its exit code.
    pub async fn wait_exit(self, timeout: Duration) -> Result<i32> {
        let op = self.operation.wait(timeout).await?;
        Ok(exec_exit_code(&op.metadata).unwrap_or(-1))
    }
}

impl ManagerClient {
    pub fn new(socket_path: &Path, op_timeout: Duration) -> Self {
        Self {
            rest: RestClient::new(socket_path),
            op_timeout,
        }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Verify the manager answers on its socket.
    pub async fn ping(&self) -> Result<()> {
        self.rest.request("GET", "/1.0", None, None).await?;
        Ok(())
    }

    // ── Operation plumbing ───────────────────────────────────────────

    /// Submit a mutation and return its background operation.
    async fn submit(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        if_match: Option<&str>,
    ) -> Result<OperationHandle> {
        let response = self.rest.request(method, path, body, if_match).await?;
        if !response.envelope.is_async() {
            return Err(ShimError::Fatal(format!(
                "expected background operation from {} {}, got '{}' response",
                method, path, response.envelope.kind
            )));
        }
        OperationHandle::from_path(self.rest.clone(), &response.envelope.operation)
    }

    /// Submit a mutation and block until its operation completes.
    async fn run(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        if_match: Option<&str>,
    ) -> Result<Operation> {
        let handle = self.submit(method, path, body, if_match).await?;
        handle.wait(self.op_timeout).await
    }

    // ── Containers ───────────────────────────────────────────────────

    pub async fn list_containers(&self) -> Result<Vec<Container>> {
        let response = self
            .rest
            .request("GET", "/1.0/containers?recursion=1", None, None)
            .await?;
        Ok(serde_json::from_value(response.envelope.metadata)?)
    }

    /// Fetch a container record together with its ETag.
    pub async fn get_container(&self, name: &str) -> Result<(Container, String)> {
        let response = self
            .rest
            .request("GET", &format!("/1.0/containers/{}", name), None, None)
            .await?;
        let container = serde_json::from_value(response.envelope.metadata)?;
        Ok((container, response.etag.unwrap_or_default()))
    }

    pub async fn create_container(&self, request: &ContainersPost) -> Result<()> {
        tracing::debug!(name = %request.name, "Creating manager container");
        let body = serde_json::to_value(request)?;
        self.run("POST", "/1.0/containers", Some(&body), None)
            .await?;
        Ok(())
    }

    /// Replace a container's mutable configuration.
    ///
    /// `if_match` carries the ETag from a prior `get_container`; the
    /// manager answers 412 (classified `Conflict`) on concurrent writes.
    pub async fn update_container(
        &self,
        name: &str,
        request: &ContainerPut,
        if_match: Option<&str>,
    ) -> Result<()> {
        let body = serde_json::to_value(request)?;
        self.run(
            "PUT",
            &format!("/1.0/containers/{}", name),
            Some(&body),
            if_match,
        )
        .await?;
        Ok(())
    }

    /// Delete a container. Deleting one that is already gone succeeds.
    pub async fn delete_container(&self, name: &str) -> Result<()> {
        tracing::debug!(name = %name, "Deleting manager container");
        match self
            .run("DELETE", &format!("/1.0/containers/{}", name), None, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        let body = serde_json::to_value(ContainerStatePut {
            action: "start".to_string(),
            timeout: -1,
            force: false,
        })?;
        self.run(
            "PUT",
            &format!("/1.0/containers/{}/state", name),
            Some(&body),
            None,
        )
        .await?;
        Ok(())
    }

    /// Stop a container with the graceful-then-forced protocol.
    ///
    /// Up to `retries` state changes are issued; the final attempt sets
    /// `force`. The attempt counter always advances, even when the wait
    /// fails with an error that might have been transient, so `retries`
    /// is a hard upper bound. A missing container, at submission or
    /// mid-protocol, is success; so is an already-stopped one.
    pub async fn stop_container(&self, name: &str, timeout: i64, retries: u32) -> Result<()> {
        let retries = retries.max(1);
        let mut last_err: Option<ShimError> = None;

        for attempt in 1..=retries {
            let force = attempt == retries;
            tracing::debug!(
                name = %name,
                attempt,
                force,
                "Stopping manager container"
            );

            let body = serde_json::to_value(ContainerStatePut {
                action: "stop".to_string(),
                timeout,
                force,
            })?;
            let handle = match self
                .submit(
                    "PUT",
                    &format!("/1.0/containers/{}/state", name),
                    Some(&body),
                    None,
                )
                .await
            {
                Ok(handle) => handle,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => {
                    return Err(ShimError::Fatal(format!(
                        "failed to stop container {}: {}",
                        name, e
                    )))
                }
            };

            match handle.wait(self.op_timeout).await {
                Ok(_) => return Ok(()),
                Err(ShimError::AlreadyInState(_)) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ShimError::Fatal(format!("stop of container {} failed", name))
        }))
    }

    pub async fn container_state(&self, name: &str) -> Result<ContainerState> {
        let response = self
            .rest
            .request(
                "GET",
                &format!("/1.0/containers/{}/state", name),
                None,
                None,
            )
            .await?;
        Ok(serde_json::from_value(response.envelope.metadata)?)
    }

    // ── Exec ─────────────────────────────────────────────────────────

    /// Start an exec and connect its byte streams.
    ///
    /// The returned session carries the operation handle so the caller can
    /// wire stdio before awaiting completion.
    pub async fn exec(&self, name: &str, request: &ContainerExecPost) -> Result<ExecSession> {
        tracing::debug!(name = %name, command = ?request.command, "Starting exec");
        let body = serde_json::to_value(request)?;
        let handle = self
            .submit(
                "POST",
                &format!("/1.0/containers/{}/exec", name),
                Some(&body),
                None,
            )
            .await?;

        let op = handle.get().await?;
        let fds = op
            .metadata
            .get("fds")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ShimError::Fatal(format!(
                    "exec operation {} exposes no stream descriptors",
                    handle.id()
                ))
            })?;

        let connect = |secret: &str| {
            let path = format!(
                "/1.0/operations/{}/websocket?secret={}",
                handle.id(),
                secret
            );
            let rest = self.rest.clone();
            async move { rest.hijack(&path).await }
        };

        let secret = |key: &str| -> Result<String> {
            fds.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ShimError::Fatal(format!("exec stream '{}' missing from operation", key))
                })
        };

        let control = match fds.get("control").and_then(Value::as_str) {
            Some(sec) => Some(connect(sec).await?),
            None => None,
        };

        let streams = if request.interactive {
            ExecStreams::Interactive {
                console: connect(&secret("0")?).await?,
            }
        } else {
            ExecStreams::Pipes {
                stdin: connect(&secret("0")?).await?,
                stdout: connect(&secret("1")?).await?,
                stderr: connect(&secret("2")?).await?,
            }
        };

        Ok(ExecSession {
            operation: handle,
            streams,
            control,
        })
    }

    // ── Images ───────────────────────────────────────────────────────

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let response = self
            .rest
            .request("GET", "/1.0/images?recursion=1", None, None)
            .await?;
        Ok(serde_json::from_value(response.envelope.metadata)?)
    }

    pub async fn get_image(&self, fingerprint: &str) -> Result<Image> {
        let response = self
            .rest
            .request("GET", &format!("/1.0/images/{}", fingerprint), None, None)
            .await?;
        Ok(serde_json::from_value(response.envelope.metadata)?)
    }

    /// Resolve an alias to the fingerprint it points at.
    pub async fn resolve_alias(&self, alias: &str) -> Result<String> {
        let response = self
            .rest
            .request(
                "GET",
                &format!("/1.0/images/aliases/{}", alias),
                None,
                None,
            )
            .await?;
        response
            .envelope
            .metadata
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ShimError::Serialization(format!("alias {} record has no target", alias))
            })
    }

    /// Download an image into the manager's store, waiting up to
    /// `timeout`. Returns the fingerprint of the stored image.
    pub async fn pull_image(&self, request: &ImagesPost, timeout: Duration) -> Result<String> {
        let body = serde_json::to_value(request)?;
        let handle = self.submit("POST", "/1.0/images", Some(&body), None).await?;
        let op = handle.wait(timeout).await?;
        op.metadata
            .get("fingerprint")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ShimError::Serialization(
                    "image pull completed without a fingerprint".to_string(),
                )
            })
    }

    pub async fn delete_image(&self, fingerprint: &str) -> Result<()> {
        match self
            .run("DELETE", &format!("/1.0/images/{}", fingerprint), None, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Files ────────────────────────────────────────────────────────

    /// Write a file into a container's filesystem.
    pub async fn push_file(&self, name: &str, path: &str, content: &[u8]) -> Result<()> {
        self.rest
            .upload(
                "POST",
                &format!("/1.0/containers/{}/files?path={}", name, path),
                content,
            )
            .await?;
        Ok(())
    }

    /// Read a file out of a container's filesystem.
    pub async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        self.rest
            .download(&format!("/1.0/containers/{}/files?path={}", name, path))
            .await
    }
}
