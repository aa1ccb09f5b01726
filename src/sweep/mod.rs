//! Run coordinator: topology, task expansion, fan-out and summary.
//!
//! With a parallelism above one, progress lines are printed in completion
//! order, which is not deterministic. The summary is always in task order.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::ExitPolicy;
use crate::credentials::Credential;
use crate::models::{Node, TaskOutcome, TeardownTask};
use crate::ssh::RemoteExecutor;
use crate::teardown::TunnelRemover;
use crate::topology::{self, NodeDirectory, TopologyError};
use crate::tunnel;

/// Exit code when topology resolution aborts the run
pub const EXIT_ABORTED: i32 = 1;

/// Exit code for a completed sweep with failures under [`ExitPolicy::Strict`]
pub const EXIT_PARTIAL_FAILURE: i32 = 2;

/// Lifecycle of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    TopologyResolved,
    TasksExpanded,
    Executing,
    Summarized,
    Aborted,
}

/// Plan is the resolved topology and the tasks derived from it
#[derive(Debug, Clone)]
pub struct Plan {
    pub master: Node,
    pub workers: Vec<Node>,
    pub bridges: Vec<String>,
    pub tasks: Vec<TeardownTask>,
}

impl Plan {
    /// Table of the tasks a sweep would run. The node header is printed
    /// separately, before the credential prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Tasks ({}):", self.tasks.len());
        for task in &self.tasks {
            let _ = writeln!(
                out,
                "  {} bridge={} key={} port={}",
                task.node, task.bridge, task.key, task.port_name
            );
        }
        out
    }
}

/// RunSummary aggregates every outcome of a sweep
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub master: Node,
    pub bridges: Vec<String>,
    pub task_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded)
    }

    pub fn exit_code(&self, policy: ExitPolicy) -> i32 {
        match policy {
            ExitPolicy::Strict if self.failed > 0 => EXIT_PARTIAL_FAILURE,
            _ => 0,
        }
    }

    /// Human-readable final report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", "*".repeat(50));
        let _ = writeln!(
            out,
            "Teardown finished: {} task(s), {} endpoint(s) succeeded, {} failed",
            self.task_count, self.succeeded, self.failed
        );
        for outcome in &self.outcomes {
            let status = if outcome.succeeded { "ok" } else { "FAILED" };
            let _ = writeln!(
                out,
                "  [{}] {} bridge={} port={} on {} ({})",
                status,
                outcome.task.node.name,
                outcome.task.bridge,
                outcome.task.port_name,
                outcome.endpoint,
                outcome.address
            );
        }
        if self.failed > 0 {
            let _ = writeln!(out, "Failures:");
            for outcome in self.failures() {
                let kind = outcome.failure.map(|k| k.to_string()).unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {} {} on {} ({}): {}: {}",
                    outcome.task.node.name,
                    outcome.task.bridge,
                    outcome.endpoint,
                    outcome.address,
                    kind,
                    outcome.error.as_deref().unwrap_or_default()
                );
            }
        }
        out
    }
}

/// Sweeper drives one teardown run
pub struct Sweeper {
    directory: Arc<dyn NodeDirectory>,
    executor: Arc<dyn RemoteExecutor>,
    local_name: String,
    bridges: Vec<String>,
    parallelism: usize,
    state: RunState,
}

impl Sweeper {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        executor: Arc<dyn RemoteExecutor>,
        local_name: String,
        bridges: Vec<String>,
        parallelism: usize,
    ) -> Self {
        Self {
            directory,
            executor,
            local_name,
            bridges,
            parallelism: parallelism.max(1),
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Resolve the topology and expand the tasks
    pub async fn plan(&mut self) -> Result<Plan, TopologyError> {
        let (master, workers) = match topology::resolve(self.directory.as_ref(), &self.local_name).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.state = RunState::Aborted;
                return Err(e);
            }
        };
        self.state = RunState::TopologyResolved;
        tracing::info!("Master node: {}", master);
        for worker in &workers {
            tracing::info!("Worker node: {}", worker);
        }

        for (key, bridges) in tunnel::key_collisions(&self.bridges) {
            tracing::warn!("Bridges {} share tunnel key {}", bridges.join(", "), key);
        }

        let tasks = tunnel::expand_tasks(&workers, &self.bridges);
        self.state = RunState::TasksExpanded;
        tracing::info!(
            "Expanded {} task(s) for {} worker(s) x {} bridge(s)",
            tasks.len(),
            workers.len(),
            self.bridges.len()
        );

        Ok(Plan {
            master,
            workers,
            bridges: self.bridges.clone(),
            tasks,
        })
    }

    /// Run every task of the plan on both endpoints and summarize.
    /// Per-endpoint failures are recorded, never returned.
    pub async fn execute(&mut self, plan: Plan, credential: Credential) -> RunSummary {
        self.state = RunState::Executing;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%run_id, "Starting teardown of {} task(s), parallelism {}", plan.tasks.len(), self.parallelism);

        let remover = TunnelRemover::new(self.executor.clone(), credential, plan.master.clone());
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let total = plan.tasks.len();

        let mut futs = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let semaphore = semaphore.clone();
                let remover = &remover;
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    let outcomes = remover.remove(task).await;
                    (index, outcomes)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut collected: Vec<(usize, [TaskOutcome; 2])> = Vec::with_capacity(total);
        while let Some((index, outcomes)) = futs.next().await {
            let task = &plan.tasks[index];
            let status: Vec<String> = outcomes
                .iter()
                .map(|o| format!("{} {}", o.endpoint, if o.succeeded { "ok" } else { "FAILED" }))
                .collect();
            println!(
                "[{}/{}] Removing VXLAN tunnel to {} on {}: {}",
                collected.len() + 1,
                total,
                task.node,
                task.bridge,
                status.join(", ")
            );
            collected.push((index, outcomes));
        }
        drop(futs);

        collected.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<TaskOutcome> = collected.into_iter().flat_map(|(_, o)| o).collect();
        let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
        let failed = outcomes.len() - succeeded;

        self.state = RunState::Summarized;
        tracing::info!(%run_id, succeeded, failed, "Teardown finished");

        RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            master: plan.master,
            bridges: plan.bridges,
            task_count: total,
            succeeded,
            failed,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Endpoint, FailureKind};
    use crate::ssh::{CommandOutput, RemoteCommand, RemoteError};
    use crate::topology::StaticDirectory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Simulated cluster: hosts in `unreachable` refuse connections, every
    /// other host answers as if the port had never existed
    struct FakeCluster {
        unreachable: Vec<String>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl FakeCluster {
        fn new(unreachable: &[&str]) -> Arc<Self> {
            Self::build(unreachable, Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Self::build(&[], delay)
        }

        fn build(unreachable: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                unreachable: unreachable.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteExecutor for FakeCluster {
        async fn execute(
            &self,
            host: &str,
            _credential: &Credential,
            command: &RemoteCommand,
        ) -> Result<CommandOutput, RemoteError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(host.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.unreachable.iter().any(|h| h == host) {
                return Err(RemoteError::Connect {
                    host: host.to_string(),
                    reason: "No route to host".to_string(),
                });
            }
            let port = command.args.last().cloned().unwrap_or_default();
            Ok(CommandOutput {
                stdout: format!("ovs-vsctl: no port named {}", port),
                stderr: String::new(),
                exit_status: 1,
            })
        }
    }

    fn directory(workers: &[(&str, &str)]) -> Arc<StaticDirectory> {
        let mut nodes = vec![Node::new("master", "10.0.0.254")];
        nodes.extend(workers.iter().map(|(n, a)| Node::new(*n, *a)));
        Arc::new(StaticDirectory::new(nodes))
    }

    fn sweeper(
        directory: Arc<StaticDirectory>,
        executor: Arc<FakeCluster>,
        bridges: &[&str],
        parallelism: usize,
    ) -> Sweeper {
        Sweeper::new(
            directory,
            executor,
            "master".to_string(),
            bridges.iter().map(|s| s.to_string()).collect(),
            parallelism,
        )
    }

    fn credential() -> Credential {
        Credential::new("ops", "secret")
    }

    #[tokio::test]
    async fn test_partial_failure_is_summarized() {
        let cluster = FakeCluster::new(&["10.0.0.254"]);
        let mut sweep = sweeper(directory(&[("w1", "10.0.0.1")]), cluster.clone(), &["n2br"], 1);

        let plan = sweep.plan().await.unwrap();
        assert_eq!(sweep.state(), RunState::TasksExpanded);
        assert_eq!(plan.tasks.len(), 1);

        let summary = sweep.execute(plan, credential()).await;
        assert_eq!(sweep.state(), RunState::Summarized);
        assert_eq!(cluster.call_count(), 2);
        assert_eq!(summary.task_count, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let failures: Vec<&TaskOutcome> = summary.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].endpoint, Endpoint::Master);
        assert_eq!(failures[0].failure, Some(FailureKind::RemoteConnectionFailed));

        assert_eq!(summary.exit_code(ExitPolicy::Strict), EXIT_PARTIAL_FAILURE);
        assert_eq!(summary.exit_code(ExitPolicy::BestEffort), 0);

        let report = summary.render();
        assert!(report.contains("1 endpoint(s) succeeded, 1 failed"));
        assert!(report.contains("[FAILED] w1 bridge=n2br port=vxlan-w1-n2br on master"));
        assert!(report.contains("w1 n2br on master (10.0.0.254): remote connection failed: TCP connection"));
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_when_ports_are_absent() {
        let cluster = FakeCluster::new(&[]);
        let dir = directory(&[("w1", "10.0.0.1"), ("w2", "10.0.0.2")]);

        for _ in 0..2 {
            let mut sweep = sweeper(dir.clone(), cluster.clone(), &["n2br", "n3br", "n4br"], 1);
            let plan = sweep.plan().await.unwrap();
            let summary = sweep.execute(plan, credential()).await;
            assert_eq!(summary.task_count, 6);
            assert_eq!(summary.succeeded, 12);
            assert_eq!(summary.failed, 0);
            assert_eq!(summary.exit_code(ExitPolicy::Strict), 0);
        }
        assert_eq!(cluster.call_count(), 24);
    }

    #[tokio::test]
    async fn test_topology_failure_aborts_before_any_execution() {
        let cluster = FakeCluster::new(&[]);
        let dir = Arc::new(StaticDirectory::new(vec![Node::new("w1", "10.0.0.1")]));
        let mut sweep = sweeper(dir, cluster.clone(), &["n2br"], 1);

        let err = sweep.plan().await.unwrap_err();
        assert!(matches!(err, TopologyError::MasterNotInTopology(_)));
        assert_eq!(sweep.state(), RunState::Aborted);
        assert_eq!(cluster.call_count(), 0);
    }

    #[tokio::test]
    async fn test_parallel_execution_is_bounded_and_ordered() {
        let cluster = FakeCluster::with_delay(Duration::from_millis(20));
        let workers: Vec<(String, String)> = (0..8)
            .map(|i| (format!("w{i}"), format!("10.0.1.{i}")))
            .collect();
        let workers: Vec<(&str, &str)> = workers.iter().map(|(n, a)| (n.as_str(), a.as_str())).collect();
        let mut sweep = sweeper(directory(&workers), cluster.clone(), &["n2br", "n3br"], 3);

        let plan = sweep.plan().await.unwrap();
        let expected: Vec<(String, String)> = plan
            .tasks
            .iter()
            .map(|t| (t.node.name.clone(), t.bridge.clone()))
            .collect();

        let summary = sweep.execute(plan, credential()).await;
        assert_eq!(summary.outcomes.len(), 32);
        assert!(cluster.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(cluster.max_in_flight.load(Ordering::SeqCst) >= 2);

        let order: Vec<(String, String)> = summary
            .outcomes
            .chunks(2)
            .map(|pair| {
                assert_eq!(pair[0].endpoint, Endpoint::Master);
                assert_eq!(pair[1].endpoint, Endpoint::Worker);
                (pair[0].task.node.name.clone(), pair[0].task.bridge.clone())
            })
            .collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_no_workers_means_nothing_to_do() {
        let cluster = FakeCluster::new(&[]);
        let mut sweep = sweeper(directory(&[]), cluster.clone(), &["n2br"], 1);
        let plan = sweep.plan().await.unwrap();
        let summary = sweep.execute(plan, credential()).await;
        assert_eq!(summary.task_count, 0);
        assert_eq!(summary.exit_code(ExitPolicy::Strict), 0);
        assert_eq!(cluster.call_count(), 0);
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let cluster = FakeCluster::new(&["10.0.0.1"]);
        let mut sweep = sweeper(directory(&[("w1", "10.0.0.1")]), cluster, &["n2br"], 1);
        let plan = sweep.plan().await.unwrap();
        let summary = sweep.execute(plan, credential()).await;

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["task_count"], 1);
        assert_eq!(json["outcomes"][1]["endpoint"], "worker");
        assert_eq!(json["outcomes"][1]["failure"], "remote_connection_failed");
        assert_eq!(json["outcomes"][0]["task"]["key"], 0x12b4);
        assert!(!json.to_string().contains("secret"));
    }

    #[test]
    fn test_plan_render() {
        let workers = vec![Node::new("w1", "10.0.0.1")];
        let bridges = vec!["n2br".to_string()];
        let plan = Plan {
            master: Node::new("master", "10.0.0.254"),
            tasks: tunnel::expand_tasks(&workers, &bridges),
            workers,
            bridges,
        };
        let text = plan.render();
        assert!(!text.contains("Master node"));
        assert!(!text.contains("Worker nodes"));
        assert!(text.starts_with("Tasks (1):"));
        assert!(text.contains("w1 (10.0.0.1) bridge=n2br key=4788 port=vxlan-w1-n2br"));
    }
}
