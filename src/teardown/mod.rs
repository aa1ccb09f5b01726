use std::sync::{Arc, OnceLock};

use crate::credentials::Credential;
use crate::models::{Endpoint, FailureKind, Node, TaskOutcome, TeardownTask};
use crate::ssh::{CommandOutput, RemoteCommand, RemoteError, RemoteExecutor};

/// Tool used to remove tunnel ports
pub const OVS_VSCTL: &str = "ovs-vsctl";

/// ovs-vsctl messages meaning the port was already gone
const ABSENT_PORT_PATTERN: &str = r"(?i)(no port named|no row .* in table port)";

/// `ovs-vsctl --if-exists del-port <bridge> <port>`, run with sudo
pub fn del_port_command(task: &TeardownTask) -> RemoteCommand {
    RemoteCommand::new(OVS_VSCTL)
        .arg("--if-exists")
        .arg("del-port")
        .arg(&task.bridge)
        .arg(&task.port_name)
        .elevated()
}

/// True when the output says the port did not exist
pub fn is_absent_port(text: &str) -> bool {
    static RE: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    RE.get_or_init(|| regex_lite::Regex::new(ABSENT_PORT_PATTERN).ok())
        .as_ref()
        .map_or(false, |re| re.is_match(text))
}

/// Turn a transport result into an outcome. An absent port counts as removed.
pub fn classify(
    task: &TeardownTask,
    endpoint: Endpoint,
    address: &str,
    result: Result<CommandOutput, RemoteError>,
) -> TaskOutcome {
    match result {
        Ok(out) => {
            let text = combined_output(&out);
            if out.success() || is_absent_port(&text) {
                TaskOutcome::success(task, endpoint, address, text)
            } else {
                let error = format!("{} exited with status {}", OVS_VSCTL, out.exit_status);
                TaskOutcome::failure(task, endpoint, address, FailureKind::RemoteCommandFailed, text, error)
            }
        }
        Err(e) => TaskOutcome::failure(
            task,
            endpoint,
            address,
            FailureKind::RemoteConnectionFailed,
            String::new(),
            e.to_string(),
        ),
    }
}

fn combined_output(out: &CommandOutput) -> String {
    let stdout = out.stdout.trim();
    let stderr = out.stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}

/// TunnelRemover deletes a task's port on the master and on the worker
pub struct TunnelRemover {
    executor: Arc<dyn RemoteExecutor>,
    credential: Credential,
    master: Node,
}

impl TunnelRemover {
    pub fn new(executor: Arc<dyn RemoteExecutor>, credential: Credential, master: Node) -> Self {
        Self {
            executor,
            credential,
            master,
        }
    }

    /// Remove the port on both endpoints. Both are always attempted; the
    /// results are independent, so one side may succeed while the other fails.
    pub async fn remove(&self, task: &TeardownTask) -> [TaskOutcome; 2] {
        let master = self.remove_endpoint(task, Endpoint::Master).await;
        let worker = self.remove_endpoint(task, Endpoint::Worker).await;
        [master, worker]
    }

    async fn remove_endpoint(&self, task: &TeardownTask, endpoint: Endpoint) -> TaskOutcome {
        let address = match endpoint {
            Endpoint::Master => &self.master.address,
            Endpoint::Worker => &task.node.address,
        };

        let command = del_port_command(task);
        let result = self.executor.execute(address, &self.credential, &command).await;
        let outcome = classify(task, endpoint, address, result);

        if outcome.succeeded {
            tracing::debug!("Removed {} on {} ({})", task.port_name, endpoint, address);
        } else {
            tracing::warn!(
                "Failed to remove {} on {} ({}): {}",
                task.port_name,
                endpoint,
                address,
                outcome.error.as_deref().unwrap_or_default()
            );
        }
        outcome
    }
}
