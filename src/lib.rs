//! vsphere-csi-e2e harness library
//!
//! Helpers for driving end-to-end scenarios against a Kubernetes cluster
//! running the vSphere CSI driver: bounded polling, parallel fan-out,
//! topology parsing and verification, Kubernetes object builders, the
//! vCenter REST client with idempotent power helpers, and remote shell
//! access to management hosts.

pub mod command;
pub mod config;
pub mod error;
pub mod fanout;
pub mod k8s;
pub mod poll;
pub mod remote;
pub mod testbed;
pub mod topology;
pub mod vsphere;

pub use config::E2eConfig;
pub use error::{Error, Result, TaskFailure};
pub use poll::Poller;
pub use testbed::TestbedInfo;
pub use topology::TopologyMap;
pub use vsphere::{Hypervisor, PowerChange, PowerState, VsphereClient};
