//! Kubernetes object builders and wait helpers.
//!
//! Builders produce plain `k8s-openapi` objects; the async helpers create,
//! scale, wait on and clean up those objects through `kube::Api`.

pub mod attachment;
pub mod common;
pub mod manifest;
pub mod nodes;
pub mod pod;
pub mod pvc;
pub mod service;
pub mod snapshot;
pub mod statefulset;
pub mod storage_class;

pub use common::{CSI_DRIVER_NAME, delete_if_exists, standard_labels};
pub use statefulset::{StatefulSetBuilder, pod_ordinal};
