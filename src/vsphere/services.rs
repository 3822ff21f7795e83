//! vCenter appliance service lifecycle.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::poll::Poller;
use crate::vsphere::VsphereClient;

/// vCenter server daemon
pub const VPXD: &str = "vpxd";
/// vSAN health service, required for CNS volume operations on vSAN
pub const VSAN_HEALTH: &str = "vsan-health";
/// Storage policy service
pub const SPS: &str = "sps";

/// State of an appliance service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Started,
    Stopped,
    Starting,
    Stopping,
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    state: ServiceState,
}

impl VsphereClient {
    /// Current state of an appliance service
    pub async fn service_state(&self, service: &str) -> Result<ServiceState> {
        let info: ServiceInfo = self
            .get(&format!("/api/appliance/services/{}", service), &[])
            .await?;
        Ok(info.state)
    }

    async fn service_action(&self, service: &str, action: &str) -> Result<()> {
        self.post_action(
            &format!("/api/appliance/services/{}", service),
            &[("action", action)],
            None,
        )
        .await?;
        info!(service = %service, action = %action, "Requested service action");
        Ok(())
    }
}

async fn wait_for_service_state(
    client: &VsphereClient,
    service: &str,
    state: ServiceState,
    poller: &Poller,
) -> Result<()> {
    // vpxd restarts drop API requests; keep retrying until the deadline.
    poller
        .describe(format!("service {} {:?}", service, state))
        .poll_ignoring_errors(|| async { Ok(client.service_state(service).await? == state) })
        .await
}

/// Start a service unless it is already running.
///
/// Returns `true` when a start was issued.
pub async fn ensure_service_started(
    client: &VsphereClient,
    service: &str,
    poller: &Poller,
) -> Result<bool> {
    if client.service_state(service).await? == ServiceState::Started {
        return Ok(false);
    }
    client.service_action(service, "start").await?;
    wait_for_service_state(client, service, ServiceState::Started, poller).await?;
    Ok(true)
}

/// Stop a service unless it is already stopped.
///
/// Returns `true` when a stop was issued.
pub async fn ensure_service_stopped(
    client: &VsphereClient,
    service: &str,
    poller: &Poller,
) -> Result<bool> {
    if client.service_state(service).await? == ServiceState::Stopped {
        return Ok(false);
    }
    client.service_action(service, "stop").await?;
    wait_for_service_state(client, service, ServiceState::Stopped, poller).await?;
    Ok(true)
}

/// Longest a restart may take to bring the service down
const RESTART_LEAVE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Restart a service and wait for it to report started again.
///
/// The service must first be seen leaving `Started`, either through another
/// state or through failed state reads, so a read taken before the restart
/// takes effect does not count as completion.
pub async fn restart_service(client: &VsphereClient, service: &str, poller: &Poller) -> Result<()> {
    restart_and_wait(
        service,
        || client.service_action(service, "restart"),
        || client.service_state(service),
        poller,
    )
    .await
}

async fn restart_and_wait<R, RFut, S, SFut>(
    service: &str,
    request: R,
    mut state: S,
    poller: &Poller,
) -> Result<()>
where
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<()>>,
    S: FnMut() -> SFut,
    SFut: Future<Output = Result<ServiceState>>,
{
    request().await?;

    poller
        .describe(format!("service {} leaving Started", service))
        .with_timeout(RESTART_LEAVE_TIMEOUT.min(poller.timeout))
        .poll_immediate(|| {
            let read = state();
            async move {
                match read.await {
                    Ok(current) => Ok(current != ServiceState::Started),
                    Err(e) => {
                        debug!(service = %service, error = %e, "Service state unavailable");
                        Ok(true)
                    }
                }
            }
        })
        .await?;

    poller
        .describe(format!("service {} Started", service))
        .poll_ignoring_errors(|| {
            let read = state();
            async move { Ok(read.await? == ServiceState::Started) }
        })
        .await?;
    info!(service = %service, "Service restarted");
    Ok(())
}
