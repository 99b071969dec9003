//! CNI result parsing.
//!
//! Plugins report results as JSON tagged with `cniVersion`. Versions are
//! represented as a tagged variant rather than a class hierarchy; the only
//! consumer is IP extraction, so newer versions slot in as new variants
//! without touching callers.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use podlx_core::error::{Result, ShimError};

/// Result schema versions this shim understands. 0.3.x results are
/// structurally identical to 0.4.0 for the fields consumed here.
const COMPATIBLE_VERSIONS: &[&str] = &["0.4.0", "0.3.1", "0.3.0"];

/// A CNI result, discriminated on its `cniVersion`.
#[derive(Debug, Clone)]
pub enum VersionedResult {
    /// The 0.4.0 schema (also covers compatible 0.3.x results).
    V04(Result04),
}

/// CNI spec v0.4.0 result object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Result04 {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<ResultInterface>,
    #[serde(default)]
    pub ips: Vec<ResultIp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultInterface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub sandbox: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultIp {
    #[serde(default)]
    pub version: String,
    /// Index into the result's interface list.
    #[serde(default)]
    pub interface: Option<usize>,
    /// CIDR notation, e.g. `10.22.0.64/16`.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl VersionedResult {
    /// Parse a raw result blob, dispatching on its `cniVersion`.
    pub fn parse(raw: &str) -> Result<Self> {
        let probe: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ShimError::NetworkSetup(format!("unparseable CNI result: {}", e)))?;
        let version = probe
            .get("cniVersion")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("0.4.0");

        if !COMPATIBLE_VERSIONS.contains(&version) {
            return Err(ShimError::NetworkSetup(format!(
                "unsupported CNI result version '{}'",
                version
            )));
        }

        let result: Result04 = serde_json::from_value(probe)
            .map_err(|e| ShimError::NetworkSetup(format!("malformed CNI result: {}", e)))?;
        Ok(VersionedResult::V04(result))
    }

    /// Extract IP addresses (without prefix length), first IPv4 primary,
    /// remaining addresses in order of appearance.
    ///
    /// A result with no IPs is an error: a pod without an address is not
    /// reachable and its sandbox must not report ready.
    pub fn ips(&self) -> Result<Vec<IpAddr>> {
        let VersionedResult::V04(result) = self;

        let mut parsed = Vec::with_capacity(result.ips.len());
        for entry in &result.ips {
            if entry.address.is_empty() {
                return Err(ShimError::NetworkSetup(
                    "CNI result IP entry has no address".to_string(),
                ));
            }
            let address = entry.address.split('/').next().unwrap_or(&entry.address);
            let ip: IpAddr = address.parse().map_err(|_| {
                ShimError::NetworkSetup(format!(
                    "invalid IP address '{}' in CNI result",
                    entry.address
                ))
            })?;
            parsed.push(ip);
        }

        if parsed.is_empty() {
            return Err(ShimError::NetworkSetup(
                "CNI result contains no IP addresses".to_string(),
            ));
        }

        // The first IPv4 address is the pod's primary address.
        if let Some(primary) = parsed.iter().position(IpAddr::is_ipv4) {
            let ip = parsed.remove(primary);
            parsed.insert(0, ip);
        }
        Ok(parsed)
    }

    /// Names of the interfaces the plugins created, in result order.
    pub fn interface_names(&self) -> Vec<String> {
        let VersionedResult::V04(result) = self;
        result.interfaces.iter().map(|i| i.name.clone()).collect()
    }
}
