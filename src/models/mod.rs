use serde::{Deserialize, Serialize};
use std::fmt;

/// Node is a cluster member reachable over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Which end of a tunnel a command was run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Master,
    Worker,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Master => "master",
            Endpoint::Worker => "worker",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TeardownTask is one (worker, bridge) tunnel to remove on both ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownTask {
    pub node: Node,
    pub bridge: String,
    pub key: u16,
    pub port_name: String,
}

/// Why a remote execution was recorded as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Authentication, network, timeout or SSH protocol fault
    RemoteConnectionFailed,
    /// The command ran but reported a failure other than an absent port
    RemoteCommandFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::RemoteConnectionFailed => f.write_str("remote connection failed"),
            FailureKind::RemoteCommandFailed => f.write_str("remote command failed"),
        }
    }
}

/// TaskOutcome records the result of one endpoint of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: TeardownTask,
    pub endpoint: Endpoint,
    pub address: String,
    pub succeeded: bool,
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(task: &TeardownTask, endpoint: Endpoint, address: &str, output: String) -> Self {
        Self {
            task: task.clone(),
            endpoint,
            address: address.to_string(),
            succeeded: true,
            output,
            failure: None,
            error: None,
        }
    }

    pub fn failure(
        task: &TeardownTask,
        endpoint: Endpoint,
        address: &str,
        kind: FailureKind,
        output: String,
        error: String,
    ) -> Self {
        Self {
            task: task.clone(),
            endpoint,
            address: address.to_string(),
            succeeded: false,
            output,
            failure: Some(kind),
            error: Some(error),
        }
    }
}
