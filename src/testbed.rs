//! Testbed description: which VM backs each nested ESXi host.
//!
//! Read from the JSON file named by `TESTBEDINFO_JSON`:
//!
//! ```json
//! {
//!   "vcenter": "10.0.0.10",
//!   "esxHosts": [
//!     { "name": "esx-1", "ip": "10.0.0.11", "vmName": "vc-esxi-1" }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// One nested ESXi host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsxHost {
    #[serde(default)]
    pub name: String,
    pub ip: String,
    pub vm_name: String,
}

/// Testbed layout
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestbedInfo {
    #[serde(default)]
    pub vcenter: Option<String>,
    #[serde(default)]
    pub esx_hosts: Vec<EsxHost>,
}

impl TestbedInfo {
    pub fn parse(json: &str) -> Result<Self> {
        let info: Self = serde_json::from_str(json)?;
        if let Some(dup) = info
            .esx_hosts
            .iter()
            .enumerate()
            .find(|(i, h)| info.esx_hosts.iter().skip(i + 1).any(|o| o.ip == h.ip))
        {
            return Err(Error::Config(format!(
                "testbed lists host {} more than once",
                dup.1.ip
            )));
        }
        Ok(info)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        let info = Self::parse(&json)?;
        debug!(path = %path.display(), hosts = info.esx_hosts.len(), "Loaded testbed info");
        Ok(info)
    }

    /// Host registered in vCenter under `name_or_ip`
    pub fn host_by_ip(&self, name_or_ip: &str) -> Option<&EsxHost> {
        self.esx_hosts
            .iter()
            .find(|h| h.ip == name_or_ip || (!h.name.is_empty() && h.name == name_or_ip))
    }

    /// Host backed by the VM called `vm_name`
    pub fn host_by_vm_name(&self, vm_name: &str) -> Option<&EsxHost> {
        self.esx_hosts.iter().find(|h| h.vm_name == vm_name)
    }
}
