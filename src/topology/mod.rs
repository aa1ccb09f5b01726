use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::models::Node;

/// Fatal topology-stage errors. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The node directory could not be queried
    #[error("Node directory unavailable: {0}")]
    TopologyUnavailable(String),

    /// The node directory answered with no nodes
    #[error("No nodes found")]
    NoNodesFound,

    /// The local node is not a member of the cluster
    #[error("Master node '{0}' not found in node list")]
    MasterNotInTopology(String),
}

/// NodeDirectory returns every cluster node, in directory order
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, TopologyError>;
}

/// Split the directory into the local master node and the workers
pub async fn resolve(
    directory: &dyn NodeDirectory,
    local_name: &str,
) -> Result<(Node, Vec<Node>), TopologyError> {
    let mut nodes = directory.list_nodes().await?;
    if nodes.is_empty() {
        return Err(TopologyError::NoNodesFound);
    }

    let index = nodes
        .iter()
        .position(|n| n.name == local_name)
        .ok_or_else(|| TopologyError::MasterNotInTopology(local_name.to_string()))?;
    let master = nodes.remove(index);

    Ok((master, nodes))
}

/// Identity of the machine the sweep runs on
pub fn local_node_name() -> anyhow::Result<String> {
    let hostname = nix::unistd::gethostname()?;
    hostname
        .into_string()
        .map_err(|h| anyhow::anyhow!("Hostname is not valid UTF-8: {:?}", h))
}

// --- kubectl node list types ---

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    metadata: NodeMetadata,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct NodeMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

/// Parse `kubectl get nodes -o json` output into nodes with their InternalIP.
/// Nodes without an InternalIP are skipped.
pub fn parse_node_list(json: &str) -> Result<Vec<Node>, TopologyError> {
    let list: NodeList = serde_json::from_str(json)
        .map_err(|e| TopologyError::TopologyUnavailable(format!("Invalid node list: {}", e)))?;

    let mut nodes = Vec::with_capacity(list.items.len());
    for item in list.items {
        match item.status.addresses.into_iter().find(|a| a.kind == "InternalIP") {
            Some(addr) => nodes.push(Node::new(item.metadata.name, addr.address)),
            None => {
                tracing::warn!("Node {} has no InternalIP, skipping", item.metadata.name);
            }
        }
    }
    Ok(nodes)
}

/// Node directory backed by kubectl
pub struct KubectlDirectory {
    kubectl: String,
}

impl KubectlDirectory {
    pub fn new(kubectl: String) -> Self {
        Self { kubectl }
    }
}

#[async_trait]
impl NodeDirectory for KubectlDirectory {
    async fn list_nodes(&self) -> Result<Vec<Node>, TopologyError> {
        tracing::debug!("Running {} get nodes -o json", self.kubectl);
        let output = Command::new(&self.kubectl)
            .args(["get", "nodes", "-o", "json"])
            .output()
            .await
            .map_err(|e| TopologyError::TopologyUnavailable(format!("Failed to run {}: {}", self.kubectl, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TopologyError::TopologyUnavailable(format!(
                "{} exited with {}: {}",
                self.kubectl,
                output.status,
                stderr.trim()
            )));
        }

        parse_node_list(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse a `NAME=ADDRESS` node entry
pub fn parse_node_spec(spec: &str) -> Result<Node, String> {
    match spec.split_once('=') {
        Some((name, address)) if !name.trim().is_empty() && !address.trim().is_empty() => {
            Ok(Node::new(name.trim(), address.trim()))
        }
        _ => Err(format!("Expected NAME=ADDRESS, got '{}'", spec)),
    }
}

/// Fixed node list, given on the command line instead of kubectl
pub struct StaticDirectory {
    nodes: Vec<Node>,
}

impl StaticDirectory {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl NodeDirectory for StaticDirectory {
    async fn list_nodes(&self) -> Result<Vec<Node>, TopologyError> {
        Ok(self.nodes.clone())
    }
}
