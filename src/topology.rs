//! Topology map parsing and placement verification.
//!
//! The suite describes the zone hierarchy as `category:value,value;...`
//! (for example `k8s-region:region-1;k8s-zone:zone-1,zone-2,zone-3`). Each
//! category becomes a `topology.csi.vmware.com/<category>` label on nodes and
//! in PV node affinity.
//!
//! The pure checks below compare a PV's node affinity and a node's labels
//! against the allowed topologies; the async helpers fetch those objects for
//! every pod of a workload and report all violations at once.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Node, NodeSelectorRequirement, PersistentVolume, Pod, TopologySelectorLabelRequirement,
    TopologySelectorTerm,
};
use kube::api::Api;
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::k8s::pvc::pv_for_claim;
use crate::k8s::statefulset::statefulset_pods;

/// Label prefix the driver uses for topology categories
pub const TOPOLOGY_LABEL_PREFIX: &str = "topology.csi.vmware.com/";

/// Topology categories and their allowed values, in declaration order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyMap {
    categories: Vec<(String, Vec<String>)>,
}

impl TopologyMap {
    /// Parse `cat1:v1,v2;cat2:v3`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Config("topology map is empty".to_string()));
        }

        let mut categories: Vec<(String, Vec<String>)> = Vec::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (category, values) = entry.split_once(':').ok_or_else(|| {
                Error::Config(format!(
                    "topology entry {:?} is not in category:values form",
                    entry
                ))
            })?;
            let category = category.trim();
            if category.is_empty() {
                return Err(Error::Config(format!(
                    "topology entry {:?} has an empty category",
                    entry
                )));
            }
            if categories.iter().any(|(c, _)| c == category) {
                return Err(Error::Config(format!(
                    "topology category {:?} is listed twice",
                    category
                )));
            }
            let values: Vec<String> = values
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            if values.is_empty() {
                return Err(Error::Config(format!(
                    "topology category {:?} has no values",
                    category
                )));
            }
            categories.push((category.to_string(), values));
        }

        Ok(Self { categories })
    }

    /// Number of topology levels
    pub fn levels(&self) -> usize {
        self.categories.len()
    }

    /// Fail unless exactly `levels` categories are configured
    pub fn expect_levels(&self, levels: usize) -> Result<&Self> {
        if self.levels() == levels {
            Ok(self)
        } else {
            Err(Error::Config(format!(
                "expected a {}-level topology map, got {} levels ({})",
                levels,
                self.levels(),
                self.category_names().join(", ")
            )))
        }
    }

    /// Category names in declaration order
    pub fn category_names(&self) -> Vec<&str> {
        self.categories.iter().map(|(c, _)| c.as_str()).collect()
    }

    /// Allowed values for a category
    pub fn values(&self, category: &str) -> Option<&[String]> {
        self.categories
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, v)| v.as_slice())
    }

    /// Copy of this map with one category narrowed to `values`
    pub fn restricted(&self, category: &str, values: &[&str]) -> Result<Self> {
        let current = self.values(category).ok_or_else(|| {
            Error::Config(format!("unknown topology category {:?}", category))
        })?;
        if values.is_empty() {
            return Err(Error::Config(format!(
                "cannot restrict {:?} to an empty value list",
                category
            )));
        }
        if let Some(unknown) = values.iter().find(|v| !current.iter().any(|c| c == *v)) {
            return Err(Error::Config(format!(
                "{:?} is not a configured value of {:?}",
                unknown, category
            )));
        }

        let categories = self
            .categories
            .iter()
            .map(|(c, v)| {
                if c == category {
                    (c.clone(), values.iter().map(|s| s.to_string()).collect())
                } else {
                    (c.clone(), v.clone())
                }
            })
            .collect();
        Ok(Self { categories })
    }

    /// Copy of this map keeping only the outermost `levels` categories
    pub fn truncated(&self, levels: usize) -> Result<Self> {
        if levels == 0 || levels > self.levels() {
            return Err(Error::Config(format!(
                "cannot keep {} of {} topology levels",
                levels,
                self.levels()
            )));
        }
        Ok(Self {
            categories: self.categories[..levels].to_vec(),
        })
    }

    /// One label requirement per category
    pub fn allowed_topologies(&self) -> Vec<TopologySelectorLabelRequirement> {
        self.categories
            .iter()
            .map(|(category, values)| TopologySelectorLabelRequirement {
                key: topology_key(category),
                values: values.clone(),
            })
            .collect()
    }

    /// Selector term for a storage class `allowedTopologies` entry
    pub fn selector_term(&self) -> TopologySelectorTerm {
        TopologySelectorTerm {
            match_label_expressions: Some(self.allowed_topologies()),
        }
    }
}

/// Full label key for a topology category
pub fn topology_key(category: &str) -> String {
    format!("{}{}", TOPOLOGY_LABEL_PREFIX, category)
}

/// Check that a PV's node affinity stays within the allowed topologies.
///
/// Every node selector term must name every allowed key, and every value it
/// lists for an allowed key must be one of the allowed values.
pub fn verify_pv_node_affinity(
    pv: &PersistentVolume,
    allowed: &[TopologySelectorLabelRequirement],
) -> Result<()> {
    let pv_name = pv.name_any();
    let terms = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
        .map(|r| r.node_selector_terms.as_slice())
        .unwrap_or_default();

    if terms.is_empty() {
        return Err(Error::Assertion(format!(
            "PV {} has no required node affinity",
            pv_name
        )));
    }

    let mut violations = Vec::new();
    for (index, term) in terms.iter().enumerate() {
        let expressions = term.match_expressions.as_deref().unwrap_or_default();
        for requirement in allowed {
            let matching: Vec<&NodeSelectorRequirement> = expressions
                .iter()
                .filter(|e| e.key == requirement.key)
                .collect();
            if matching.is_empty() {
                violations.push(format!(
                    "term {} does not constrain {}",
                    index, requirement.key
                ));
                continue;
            }
            for expression in matching {
                for value in expression.values.as_deref().unwrap_or_default() {
                    if !requirement.values.contains(value) {
                        violations.push(format!(
                            "term {} allows {}={} outside {:?}",
                            index, requirement.key, value, requirement.values
                        ));
                    }
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "PV {} node affinity violates allowed topologies: {}",
            pv_name,
            violations.join("; ")
        )))
    }
}

/// Check that a node's topology labels are all within the allowed values
pub fn verify_node_in_topology(
    node_name: &str,
    labels: &BTreeMap<String, String>,
    allowed: &[TopologySelectorLabelRequirement],
) -> Result<()> {
    let violations: Vec<String> = allowed
        .iter()
        .filter_map(|requirement| match labels.get(&requirement.key) {
            None => Some(format!("missing label {}", requirement.key)),
            Some(value) if !requirement.values.contains(value) => Some(format!(
                "{}={} outside {:?}",
                requirement.key, value, requirement.values
            )),
            Some(_) => None,
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "node {} is outside the allowed topologies: {}",
            node_name,
            violations.join("; ")
        )))
    }
}

/// Whether a node with `labels` satisfies at least one PV node selector term
pub fn node_satisfies_pv(labels: &BTreeMap<String, String>, pv: &PersistentVolume) -> bool {
    let Some(terms) = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
        .map(|r| &r.node_selector_terms)
    else {
        // No affinity means any node can use the volume
        return true;
    };

    terms.iter().any(|term| {
        term.match_expressions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|e| requirement_matches(labels, e))
    })
}

fn requirement_matches(labels: &BTreeMap<String, String>, req: &NodeSelectorRequirement) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let label = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => label.is_some_and(|v| values.contains(v)),
        "NotIn" => label.is_none_or(|v| !values.contains(v)),
        "Exists" => label.is_some(),
        "DoesNotExist" => label.is_none(),
        // Gt/Lt never appear in topology affinity
        _ => false,
    }
}

/// Number of nodes per value of label `key`; unlabeled nodes are skipped
pub fn zone_distribution<'a, I>(nodes: I, key: &str) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a Node>,
{
    let mut counts = BTreeMap::new();
    for node in nodes {
        if let Some(value) = node.labels().get(key) {
            *counts.entry(value.clone()).or_insert(0) += 1;
        }
    }
    counts
}

// ============================================================
// Cluster-backed verification
// ============================================================

/// Verify PV node affinity and pod placement for every pod of a StatefulSet.
///
/// For each pod: the node it runs on lies within `allowed`, and every PV it
/// claims stays within `allowed` and admits that node.
pub async fn verify_statefulset_topology(
    client: &Client,
    statefulset: &StatefulSet,
    allowed: &[TopologySelectorLabelRequirement],
) -> Result<()> {
    let pods = statefulset_pods(client, statefulset).await?;
    if pods.is_empty() {
        return Err(Error::Assertion(format!(
            "StatefulSet {} has no pods to verify",
            statefulset.name_any()
        )));
    }

    let mut violations = Vec::new();
    for pod in &pods {
        if let Err(e) = verify_pod_topology(client, pod, allowed).await {
            violations.push(e.to_string());
        }
    }

    info!(
        statefulset = %statefulset.name_any(),
        pods = pods.len(),
        violations = violations.len(),
        "Verified PV node affinity and pod placement"
    );

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Assertion(violations.join("\n")))
    }
}

/// Verify PV node affinity and placement for one pod
pub async fn verify_pod_topology(
    client: &Client,
    pod: &Pod,
    allowed: &[TopologySelectorLabelRequirement],
) -> Result<()> {
    let pod_name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .ok_or_else(|| Error::Assertion(format!("pod {} is not scheduled", pod_name)))?;

    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes.get(&node_name).await?;
    let labels = node.labels();

    let mut violations = Vec::new();
    if let Err(e) = verify_node_in_topology(&node_name, labels, allowed) {
        violations.push(e.to_string());
    }

    let claims: BTreeSet<String> = pod
        .spec
        .iter()
        .flat_map(|s| s.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|c| c.claim_name.clone())
        .collect();

    for claim in &claims {
        let pv = pv_for_claim(client, &namespace, claim).await?;
        debug!(pod = %pod_name, claim = %claim, pv = %pv.name_any(), "Checking PV affinity");
        if let Err(e) = verify_pv_node_affinity(&pv, allowed) {
            violations.push(e.to_string());
        }
        if !node_satisfies_pv(labels, &pv) {
            violations.push(format!(
                "pod {} runs on {} which does not satisfy PV {} node affinity",
                pod_name,
                node_name,
                pv.name_any()
            ));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "pod {}: {}",
            pod_name,
            violations.join("; ")
        )))
    }
}
