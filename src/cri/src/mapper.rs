//! Map Kubernetes CRI specs to manager container specs and back.
//!
//! The manager models everything as flat config keys and named devices:
//! - Env var list → `environment.<KEY>` config keys
//! - Host mounts → `devices.<name>` of type disk
//! - CPU/memory limits → `limits.cpu` / `limits.memory`
//! - Privileged/security context → profile selection + `raw.lxc` overrides
//! - Labels/annotations → `user.*` keys under the shim's reserved prefix
//!
//! Shim-specific knobs ride on annotations:
//! - `podlx/profiles` → comma-separated manager profile list
//! - `podlx/pids-limit` → `limits.processes`

use std::collections::HashMap;

use podlx_core::error::{Result, ShimError};
use podlx_runtime::manager::types::{ContainerSource, ContainersPost};

use crate::container::{Container, ContainerState};
use crate::cri_api::{
    ContainerConfig, DnsConfig, Mount, MountPropagation, PodSandboxConfig,
};
use crate::sandbox::PodSandbox;

/// Annotation selecting the manager profiles a container is created with.
pub const ANN_PROFILES: &str = "podlx/profiles";

/// Annotation setting the pid limit (`limits.processes`).
pub const ANN_PIDS_LIMIT: &str = "podlx/pids-limit";

/// Prefix for environment variable config keys.
const ENV_PREFIX: &str = "environment.";

/// Prefix for mount device names.
const DISK_PREFIX: &str = "disk";

const DEFAULT_PROFILE: &str = "default";

/// Validate a CRI container config against the shim's edge policies.
pub fn validate_container_config(config: &ContainerConfig) -> Result<()> {
    let image_ref = config
        .image
        .as_ref()
        .map(|i| i.image.as_str())
        .unwrap_or_default();
    if image_ref.is_empty() {
        return Err(ShimError::Invalid(
            "container config has an empty image reference".to_string(),
        ));
    }

    for mount in &config.mounts {
        // Read-only mounts only support private propagation.
        if mount.readonly && mount.propagation != MountPropagation::PropagationPrivate as i32 {
            return Err(ShimError::Invalid(format!(
                "read-only mount {} requests unsupported propagation mode {}",
                mount.container_path, mount.propagation
            )));
        }
    }

    Ok(())
}

/// Build the manager spec for a pod's infra container.
///
/// The infra container holds the pod's network namespace and metadata; its
/// root process just sleeps so the namespace outlives individual
/// containers.
pub fn sandbox_to_manager(
    sandbox: &PodSandbox,
    config: &PodSandboxConfig,
    infra_image: &str,
) -> ContainersPost {
    let mut manager_config = sandbox.to_user_config();
    manager_config.insert("boot.autostart".to_string(), "false".to_string());
    manager_config.insert(
        "raw.lxc".to_string(),
        "lxc.init.cmd = /bin/sleep infinity".to_string(),
    );
    if !config.hostname.is_empty() {
        manager_config.insert("user.podlx.hostname".to_string(), config.hostname.clone());
    }

    ContainersPost {
        name: sandbox.id.clone(),
        source: ContainerSource::from_alias(infra_image),
        config: manager_config,
        devices: HashMap::new(),
        profiles: profiles_from_annotations(&sandbox.annotations),
    }
}

/// Build the manager spec for a CRI container inside a READY sandbox.
///
/// The container shares the sandbox's network namespace; its CRI command
/// becomes the manager init command.
pub fn container_to_manager(
    container: &Container,
    config: &ContainerConfig,
    sandbox: &PodSandbox,
    image_fingerprint: &str,
) -> Result<ContainersPost> {
    validate_container_config(config)?;

    let mut manager_config = container.to_user_config();

    for env in &config.envs {
        if env.key.is_empty() {
            return Err(ShimError::Invalid(
                "environment variable with empty name".to_string(),
            ));
        }
        manager_config.insert(format!("{}{}", ENV_PREFIX, env.key), env.value.clone());
    }

    if let Some(linux) = &config.linux {
        if let Some(resources) = &linux.resources {
            if resources.cpu_shares > 0 {
                manager_config.insert("limits.cpu".to_string(), resources.cpu_shares.to_string());
            }
            if resources.memory_limit_in_bytes > 0 {
                manager_config.insert(
                    "limits.memory".to_string(),
                    resources.memory_limit_in_bytes.to_string(),
                );
            }
        }
        if let Some(security) = &linux.security_context {
            if security.privileged {
                manager_config.insert("security.privileged".to_string(), "true".to_string());
            }
        }
    }

    if let Some(pids) = container.annotations.get(ANN_PIDS_LIMIT) {
        let value: u64 = pids.parse().map_err(|_| {
            ShimError::Invalid(format!("annotation {} is not a number: {}", ANN_PIDS_LIMIT, pids))
        })?;
        manager_config.insert("limits.processes".to_string(), value.to_string());
    }

    manager_config.insert("boot.autostart".to_string(), "false".to_string());
    manager_config.insert("raw.lxc".to_string(), raw_lxc_lines(config, sandbox));

    let mut devices = HashMap::new();
    for (index, mount) in config.mounts.iter().enumerate() {
        devices.insert(
            format!("{}{}", DISK_PREFIX, index),
            disk_device(mount),
        );
    }
    for (index, device) in config.devices.iter().enumerate() {
        let mut entry = HashMap::new();
        entry.insert("type".to_string(), "unix-char".to_string());
        entry.insert("source".to_string(), device.host_path.clone());
        entry.insert("path".to_string(), device.container_path.clone());
        devices.insert(format!("dev{}", index), entry);
    }

    Ok(ContainersPost {
        name: container.id.clone(),
        source: ContainerSource::from_fingerprint(image_fingerprint),
        config: manager_config,
        devices,
        profiles: profiles_from_annotations(&container.annotations),
    })
}

fn raw_lxc_lines(config: &ContainerConfig, sandbox: &PodSandbox) -> String {
    let mut lines = Vec::new();

    let mut init: Vec<String> = config.command.clone();
    init.extend(config.args.iter().cloned());
    if !init.is_empty() {
        lines.push(format!("lxc.init.cmd = {}", init.join(" ")));
    }
    if !config.working_dir.is_empty() {
        lines.push(format!("lxc.init.cwd = {}", config.working_dir));
    }

    // Join the sandbox's network namespace instead of getting our own.
    if !sandbox.network_namespace.is_empty() {
        lines.push("lxc.net.0.type = none".to_string());
        lines.push(format!(
            "lxc.namespace.share.net = {}",
            sandbox.network_namespace
        ));
    }

    if let Some(user) = config
        .linux
        .as_ref()
        .and_then(|l| l.security_context.as_ref())
        .and_then(|s| s.run_as_user.as_ref())
    {
        lines.push(format!("lxc.init.uid = {}", user.value));
    }

    lines.join("\n")
}

fn disk_device(mount: &Mount) -> HashMap<String, String> {
    let mut entry = HashMap::new();
    entry.insert("type".to_string(), "disk".to_string());
    entry.insert("source".to_string(), mount.host_path.clone());
    entry.insert("path".to_string(), mount.container_path.clone());
    if mount.readonly {
        entry.insert("readonly".to_string(), "true".to_string());
    }
    entry
}

fn profiles_from_annotations(annotations: &HashMap<String, String>) -> Vec<String> {
    annotations
        .get(ANN_PROFILES)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .filter(|profiles: &Vec<String>| !profiles.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_PROFILE.to_string()])
}

/// Infer a CRI container state from a manager status string.
pub fn state_from_manager(status: &str) -> ContainerState {
    match status {
        "Running" | "Starting" | "Stopping" | "Freezing" | "Frozen" => ContainerState::Running,
        "Stopped" => ContainerState::Exited,
        _ => ContainerState::Unknown,
    }
}

/// Recover the env mapping from manager config keys.
pub fn env_from_config(config: &HashMap<String, String>) -> HashMap<String, String> {
    config
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect()
}

/// Recover CRI mounts from manager disk devices.
pub fn mounts_from_devices(
    devices: &HashMap<String, HashMap<String, String>>,
) -> Vec<Mount> {
    let mut named: Vec<_> = devices
        .iter()
        .filter(|(name, entry)| {
            name.starts_with(DISK_PREFIX)
                && entry.get("type").map(String::as_str) == Some("disk")
        })
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));

    named
        .into_iter()
        .map(|(_, entry)| Mount {
            container_path: entry.get("path").cloned().unwrap_or_default(),
            host_path: entry.get("source").cloned().unwrap_or_default(),
            readonly: entry.get("readonly").map(String::as_str) == Some("true"),
            selinux_relabel: false,
            propagation: MountPropagation::PropagationPrivate as i32,
        })
        .collect()
}

/// Render a resolv.conf for the pod from its CRI DNS config.
pub fn resolv_conf(dns: &DnsConfig) -> String {
    let mut out = String::new();
    for server in &dns.servers {
        out.push_str(&format!("nameserver {}\n", server));
    }
    if !dns.searches.is_empty() {
        out.push_str(&format!("search {}\n", dns.searches.join(" ")));
    }
    for option in &dns.options {
        out.push_str(&format!("options {}\n", option));
    }
    out
}
