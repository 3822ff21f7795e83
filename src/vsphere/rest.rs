//! vSphere Automation REST API client.
//!
//! Authenticates with `POST /api/session` and sends the returned token in
//! the `vmware-api-session-id` header. Sessions expire after idle time, so a
//! `401` triggers one re-login and retry.

use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::VcenterCredentials;
use crate::error::{Error, Result};
use crate::vsphere::{HostSummary, Hypervisor, PowerState, VmSummary};

const SESSION_HEADER: &str = "vmware-api-session-id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Error body returned by the `/api` endpoints
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    default_message: String,
}

#[derive(Debug, Deserialize)]
struct ClusterSummary {
    cluster: String,
}

#[derive(Debug, Deserialize)]
struct VmPower {
    state: PowerState,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    #[serde(default)]
    identity: Option<VmIdentity>,
}

#[derive(Debug, Deserialize)]
struct VmIdentity {
    #[serde(default)]
    instance_uuid: Option<String>,
}

/// Datastore entry from the vCenter inventory
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DatastoreSummary {
    pub datastore: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct TagInfo {
    name: String,
    category_id: String,
}

#[derive(Debug, Deserialize)]
struct CategoryInfo {
    name: String,
}

#[derive(Debug, Serialize)]
struct ObjectId<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

/// Render an error response as a one-line message
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) if !err.messages.is_empty() => {
            let messages: Vec<&str> = err
                .messages
                .iter()
                .map(|m| m.default_message.as_str())
                .collect();
            match err.error_type {
                Some(kind) => format!("{}: {}", kind, messages.join("; ")),
                None => messages.join("; "),
            }
        }
        Ok(ApiError {
            error_type: Some(kind),
            ..
        }) => kind,
        _ => body.trim().to_string(),
    }
}

/// Client for one vCenter
pub struct VsphereClient {
    http: reqwest::Client,
    base_url: String,
    credentials: VcenterCredentials,
    session: RwLock<Option<String>>,
}

impl VsphereClient {
    /// Build the client and open a session
    pub async fn connect(credentials: VcenterCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(credentials.insecure)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let client = Self {
            http,
            base_url: format!("https://{}", credentials.host),
            credentials,
            session: RwLock::new(None),
        };
        client.login().await?;
        Ok(client)
    }

    /// vCenter address this client talks to
    pub fn host(&self) -> &str {
        &self.credentials.host
    }

    async fn login(&self) -> Result<String> {
        let url = format!("{}/api/session", self.base_url);
        debug!(url = %url, "Creating vCenter session");
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;
        let token: String = Self::decode(response).await?;
        *self.session.write().await = Some(token.clone());
        info!(vcenter = %self.credentials.host, "Logged in to vCenter");
        Ok(token)
    }

    /// End the session; later calls log in again
    pub async fn logout(&self) -> Result<()> {
        let Some(token) = self.session.write().await.take() else {
            return Ok(());
        };
        let response = self
            .http
            .delete(format!("{}/api/session", self.base_url))
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.session.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut relogged = false;
        loop {
            let token = self.token().await?;
            debug!(method = %method, url = %url, "vCenter request");
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(SESSION_HEADER, token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            if response.status() == StatusCode::UNAUTHORIZED && !relogged {
                debug!("vCenter session expired, logging in again");
                *self.session.write().await = None;
                relogged = true;
                continue;
            }
            return Ok(response);
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Vsphere {
                status: status.as_u16(),
                message: error_message(&body),
            })
        }
    }

    async fn check(response: Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Vsphere {
                status: status.as_u16(),
                message: error_message(&body),
            })
        }
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        Self::decode(self.send(Method::GET, path, query, None).await?).await
    }

    /// POST expecting an empty (`204`) response
    pub(crate) async fn post_action(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<()> {
        Self::check(self.send(Method::POST, path, query, body).await?).await
    }

    /// POST returning a JSON value (usually a new object's id)
    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        Self::decode(self.send(Method::POST, path, &[], Some(body)).await?).await
    }

    async fn cluster_id(&self, cluster: &str) -> Result<String> {
        let clusters: Vec<ClusterSummary> =
            self.get("/api/vcenter/cluster", &[("names", cluster)]).await?;
        clusters
            .into_iter()
            .next()
            .map(|c| c.cluster)
            .ok_or_else(|| Error::Vsphere {
                status: 404,
                message: format!("cluster {} not found", cluster),
            })
    }

    /// Datastores visible in the named cluster
    pub async fn cluster_datastores(&self, cluster: &str) -> Result<Vec<DatastoreSummary>> {
        let id = self.cluster_id(cluster).await?;
        let hosts: Vec<HostSummary> = self.get("/api/vcenter/host", &[("clusters", &id)]).await?;
        let mut datastores: Vec<DatastoreSummary> = Vec::new();
        for host in hosts {
            let on_host: Vec<DatastoreSummary> = self
                .get("/api/vcenter/datastore", &[("hosts", &host.host)])
                .await?;
            for ds in on_host {
                if !datastores.iter().any(|d| d.datastore == ds.datastore) {
                    datastores.push(ds);
                }
            }
        }
        Ok(datastores)
    }

    /// Find or create a tag category for datastores
    pub async fn ensure_tag_category(&self, name: &str) -> Result<String> {
        let ids: Vec<String> = self.get("/api/cis/tagging/category", &[]).await?;
        for id in ids {
            let info: CategoryInfo = self
                .get(&format!("/api/cis/tagging/category/{}", id), &[])
                .await?;
            if info.name == name {
                return Ok(id);
            }
        }
        let body = serde_json::json!({
            "name": name,
            "description": "",
            "cardinality": "MULTIPLE",
            "associable_types": ["Datastore"],
        });
        let id: String = self.post_json("/api/cis/tagging/category", &body).await?;
        info!(category = %name, id = %id, "Created tag category");
        Ok(id)
    }

    /// Find or create a tag within a category
    pub async fn ensure_tag(&self, category_id: &str, name: &str) -> Result<String> {
        let ids: Vec<String> = self.get("/api/cis/tagging/tag", &[]).await?;
        for id in ids {
            let info: TagInfo = self
                .get(&format!("/api/cis/tagging/tag/{}", id), &[])
                .await?;
            if info.name == name && info.category_id == category_id {
                return Ok(id);
            }
        }
        let body = serde_json::json!({
            "name": name,
            "description": "",
            "category_id": category_id,
        });
        let id: String = self.post_json("/api/cis/tagging/tag", &body).await?;
        info!(tag = %name, id = %id, "Created tag");
        Ok(id)
    }

    /// Attach a tag to a datastore
    pub async fn attach_tag(&self, tag_id: &str, datastore: &str) -> Result<()> {
        self.tag_association(tag_id, datastore, "attach").await
    }

    /// Detach a tag from a datastore
    pub async fn detach_tag(&self, tag_id: &str, datastore: &str) -> Result<()> {
        self.tag_association(tag_id, datastore, "detach").await
    }

    async fn tag_association(&self, tag_id: &str, datastore: &str, action: &str) -> Result<()> {
        let body = serde_json::json!({
            "object_id": ObjectId { id: datastore, kind: "Datastore" },
        });
        self.post_action(
            &format!("/api/cis/tagging/tag-association/{}", tag_id),
            &[("action", action)],
            Some(&body),
        )
        .await?;
        info!(tag = %tag_id, datastore = %datastore, action = %action, "Updated tag association");
        Ok(())
    }
}

impl Hypervisor for VsphereClient {
    async fn cluster_hosts(&self, cluster: &str) -> Result<Vec<HostSummary>> {
        let id = self.cluster_id(cluster).await?;
        let mut hosts: Vec<HostSummary> =
            self.get("/api/vcenter/host", &[("clusters", &id)]).await?;
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }

    async fn host_by_name(&self, name: &str) -> Result<Option<HostSummary>> {
        let hosts: Vec<HostSummary> = self.get("/api/vcenter/host", &[("names", name)]).await?;
        Ok(hosts.into_iter().next())
    }

    async fn vm_by_name(&self, name: &str) -> Result<Option<VmSummary>> {
        let vms: Vec<VmSummary> = self.get("/api/vcenter/vm", &[("names", name)]).await?;
        Ok(vms.into_iter().next())
    }

    async fn vm_by_instance_uuid(&self, uuid: &str) -> Result<Option<VmSummary>> {
        let vms: Vec<VmSummary> = self.get("/api/vcenter/vm", &[]).await?;
        for vm in vms {
            let info: VmInfo = self.get(&format!("/api/vcenter/vm/{}", vm.vm), &[]).await?;
            let matches = info
                .identity
                .and_then(|i| i.instance_uuid)
                .is_some_and(|id| id.eq_ignore_ascii_case(uuid));
            if matches {
                return Ok(Some(vm));
            }
        }
        Ok(None)
    }

    async fn vm_power_state(&self, vm: &str) -> Result<PowerState> {
        let power: VmPower = self
            .get(&format!("/api/vcenter/vm/{}/power", vm), &[])
            .await?;
        Ok(power.state)
    }

    async fn set_vm_power(&self, vm: &str, state: PowerState) -> Result<()> {
        let action = match state {
            PowerState::PoweredOn => "start",
            PowerState::PoweredOff => "stop",
            PowerState::Suspended => "suspend",
        };
        self.post_action(
            &format!("/api/vcenter/vm/{}/power", vm),
            &[("action", action)],
            None,
        )
        .await?;
        info!(vm = %vm, action = %action, "Requested VM power change");
        Ok(())
    }
}
