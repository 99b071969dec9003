//! Invocation of CNI plugin binaries.
//!
//! The CNI contract: exec the plugin named by the config's `type`, pass the
//! action and attachment identity through `CNI_*` environment variables,
//! feed the network config on stdin, and read the result from stdout.
//! The trait seam lets tests substitute a fake runner for the binary tree.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use podlx_core::error::{Result, ShimError};

use super::{NetworkList, RuntimeConf};

/// Executes CNI actions against a network list.
#[async_trait]
pub trait CniRunner: Send + Sync {
    /// Attach: run ADD through every plugin in order, chaining results.
    /// Returns the final plugin's result blob.
    async fn add(&self, network: &NetworkList, runtime: &RuntimeConf) -> Result<Value>;

    /// Detach: run DEL through every plugin in reverse order.
    async fn del(&self, network: &NetworkList, runtime: &RuntimeConf) -> Result<()>;
}

/// Default runner execing plugin binaries from the configured directory.
pub struct ExecRunner {
    bin_dir: PathBuf,
}

impl ExecRunner {
    pub fn new(bin_dir: PathBuf) -> Self {
        Self { bin_dir }
    }

    async fn invoke(
        &self,
        command: &str,
        network: &NetworkList,
        runtime: &RuntimeConf,
        plugin: &Value,
        prev_result: Option<&Value>,
    ) -> Result<Vec<u8>> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ShimError::NetworkSetup(format!(
                    "plugin entry in network '{}' has no type",
                    network.name
                ))
            })?;
        let binary = self.bin_dir.join(plugin_type);

        // Per-invocation config: the plugin entry plus list-level name and
        // version, and the previous plugin's result when chaining.
        let mut conf = plugin.clone();
        if let Value::Object(ref mut map) = conf {
            map.insert("name".to_string(), Value::String(network.name.clone()));
            map.insert(
                "cniVersion".to_string(),
                Value::String(network.cni_version.clone()),
            );
            if let Some(prev) = prev_result {
                map.insert("prevResult".to_string(), prev.clone());
            }
        }
        let stdin_payload = serde_json::to_vec(&conf)?;

        let args = runtime
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &runtime.container_id)
            .env("CNI_NETNS", &runtime.netns)
            .env("CNI_IFNAME", &runtime.ifname)
            .env("CNI_ARGS", args)
            .env("CNI_PATH", &self.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ShimError::NetworkSetup(format!(
                    "cannot exec CNI plugin {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_payload).await.map_err(|e| {
                ShimError::NetworkSetup(format!("failed writing CNI config to plugin: {}", e))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ShimError::NetworkSetup(format!("CNI plugin {} did not finish: {}", plugin_type, e))
        })?;

        if !output.status.success() {
            // Plugins report structured errors on stdout.
            let detail = plugin_error_message(&output.stdout)
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_string());
            return Err(ShimError::NetworkSetup(format!(
                "CNI {} failed for plugin {}: {}",
                command, plugin_type, detail
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl CniRunner for ExecRunner {
    async fn add(&self, network: &NetworkList, runtime: &RuntimeConf) -> Result<Value> {
        let mut prev: Option<Value> = None;
        for plugin in &network.plugins {
            let stdout = self
                .invoke("ADD", network, runtime, plugin, prev.as_ref())
                .await?;
            let result: Value = serde_json::from_slice(&stdout).map_err(|e| {
                ShimError::NetworkSetup(format!("plugin returned unparseable result: {}", e))
            })?;
            prev = Some(result);
        }
        prev.ok_or_else(|| {
            ShimError::NetworkSetup(format!("network '{}' has no plugins", network.name))
        })
    }

    async fn del(&self, network: &NetworkList, runtime: &RuntimeConf) -> Result<()> {
        let mut last_err = None;
        for plugin in network.plugins.iter().rev() {
            if let Err(e) = self.invoke("DEL", network, runtime, plugin, None).await {
                tracing::warn!(network = %network.name, error = %e, "CNI DEL failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn plugin_error_message(stdout: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(stdout).ok()?;
    let msg = value.get("msg").and_then(Value::as_str)?;
    Some(msg.to_string())
}
