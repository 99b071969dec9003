//! Submit-then-await handling for manager background operations.
//!
//! Every mutating endpoint answers with an operation reference; callers
//! block on [`OperationHandle::wait`] until the manager reports a terminal
//! status. Failure messages are classified here so stop/delete idempotence
//! can be decided from the error variant alone.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use podlx_core::error::{Result, ShimError};

use super::rest::RestClient;
use super::types::{operation_status, Operation};

/// Failure messages the manager emits for no-op state transitions.
const ALREADY_IN_STATE_MESSAGES: &[&str] = &[
    "The container is already stopped",
    "The container is already running",
    "The instance is already stopped",
    "The instance is already running",
];

/// Handle on a background operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    client: RestClient,
    id: String,
}

impl OperationHandle {
    /// Build a handle from the `operation` path of an async envelope.
    pub fn from_path(client: RestClient, operation_path: &str) -> Result<Self> {
        let id = operation_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ShimError::Serialization(format!(
                    "malformed operation path: '{}'",
                    operation_path
                ))
            })?;
        Ok(Self {
            client,
            id: id.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the operation reaches a terminal status or the deadline
    /// expires. On expiry the operation is cancelled manager-side before
    /// `Timeout` is returned.
    pub async fn wait(&self, timeout: Duration) -> Result<Operation> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = self.cancel().await;
                return Err(ShimError::Timeout(format!(
                    "operation {} did not complete within {:?}",
                    self.id, timeout
                )));
            }

            let wait_secs = remaining.as_secs().max(1);
            let path = format!("/1.0/operations/{}/wait?timeout={}", self.id, wait_secs);
            let response = self.client.request("GET", &path, None, None).await?;

            let op: Operation = serde_json::from_value(response.envelope.metadata.clone())?;
            if !op.is_final() {
                continue;
            }
            return classify_outcome(op);
        }
    }

    /// Ask the manager to abort the operation. Used when a caller's
    /// deadline expires or a streaming client disconnects.
    pub async fn cancel(&self) -> Result<()> {
        let path = format!("/1.0/operations/{}", self.id);
        match self.client.request("DELETE", &path, None, None).await {
            Ok(_) => Ok(()),
            // Already finished or reaped; nothing left to abort.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fetch the operation record without waiting.
    pub async fn get(&self) -> Result<Operation> {
        let path = format!("/1.0/operations/{}", self.id);
        let response = self.client.request("GET", &path, None, None).await?;
        Ok(serde_json::from_value(response.envelope.metadata)?)
    }
}

/// Turn a terminal operation into a success value or classified error.
fn classify_outcome(op: Operation) -> Result<Operation> {
    match op.status_code {
        operation_status::SUCCESS => Ok(op),
        operation_status::CANCELLED => Err(ShimError::Timeout(format!(
            "operation {} was cancelled",
            op.id
        ))),
        _ => Err(classify_failure_message(&op.err)),
    }
}

fn classify_failure_message(err: &str) -> ShimError {
    if err.to_lowercase().contains("not found") {
        return ShimError::NotFound(err.to_string());
    }
    if ALREADY_IN_STATE_MESSAGES.iter().any(|m| err.contains(m)) {
        return ShimError::AlreadyInState(err.to_string());
    }
    ShimError::Fatal(err.to_string())
}

/// Exit code recorded in an exec operation's result metadata.
pub fn exec_exit_code(metadata: &Value) -> Option<i32> {
    metadata
        .get("return")
        .and_then(Value::as_i64)
        .map(|code| code as i32)
}
