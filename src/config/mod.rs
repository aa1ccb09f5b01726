use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Bridges swept when neither OVS_BRIDGES nor --ovs-bridges is given
pub const DEFAULT_BRIDGES: &[&str] = &["n2br", "n3br", "n4br"];

/// How failed remote executions affect the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExitPolicy {
    /// Exit non-zero when any endpoint failed
    Strict,
    /// Exit zero once every task was attempted, whatever the outcomes
    BestEffort,
}

impl FromStr for ExitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(ExitPolicy::Strict),
            "best-effort" | "best_effort" => Ok(ExitPolicy::BestEffort),
            other => Err(format!("Unknown exit policy: {}", other)),
        }
    }
}

/// Config holds all run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bridges: Vec<String>,
    pub ssh_port: u16,
    pub ssh_timeout_secs: u64,
    pub parallelism: usize,
    pub exit_policy: ExitPolicy,
    pub kubectl: String,
    pub master_node_name: Option<String>,
    pub ssh_user: Option<String>,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let exit_policy = get("TEARDOWN_EXIT_POLICY", "strict");
        let exit_policy = exit_policy.parse::<ExitPolicy>().unwrap_or_else(|e| {
            tracing::warn!("{}, using strict", e);
            ExitPolicy::Strict
        });

        Self {
            bridges: parse_list(&get("OVS_BRIDGES", &DEFAULT_BRIDGES.join(","))),
            ssh_port: get("SSH_PORT", "22").parse().unwrap_or(22),
            ssh_timeout_secs: get("SSH_TIMEOUT_SECS", "30").parse().unwrap_or(30),
            parallelism: get("TEARDOWN_PARALLELISM", "1").parse::<usize>().unwrap_or(1).max(1),
            exit_policy,
            kubectl: get("KUBECTL", "kubectl"),
            master_node_name: lookup("MASTER_NODE_NAME").filter(|s| !s.is_empty()),
            ssh_user: lookup("SSH_USER").filter(|s| !s.is_empty()),
        }
    }

    /// Per-command deadline, never below one second
    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs.max(1))
    }
}

/// Split a comma-separated list, dropping blanks
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
